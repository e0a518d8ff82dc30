//! Memory Region data model (spec.md §3) and symbol resolution.

use serde::{Deserialize, Serialize};

use crate::config::{MemRegionKind, MemRegionSpec};
use crate::driver::SymbolTable;
use crate::error::{GqfiError, Result};

/// A resolved `(start, end, kind)` triple. Invariant: `start <= end` and
/// `(end - start)` is a multiple of `pointer_size`; any unaligned suffix is
/// split off into its own `NoAnalysis` region by [`resolve_regions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    pub start: u64,
    pub end: u64,
    pub kind: MemRegionKind,
}

impl MemoryRegion {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

fn resolve_bound(literal: &str, symbols: &dyn SymbolTable) -> Result<u64> {
    if let Some(hex) = literal.strip_prefix("0x").or_else(|| literal.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16)
            .map_err(|_| GqfiError::Configuration(format!("bad hex literal: {literal}")));
    }
    if let Ok(v) = literal.parse::<u64>() {
        return Ok(v);
    }
    symbols
        .resolve(literal)
        .ok_or_else(|| GqfiError::Configuration(format!("unresolved symbol: {literal}")))
}

/// Resolve every declared region against the target's symbol table,
/// splitting the unaligned tail of a misaligned region into a `NoAnalysis`
/// region (spec.md §3 invariant).
pub fn resolve_regions(
    specs: &[MemRegionSpec],
    symbols: &dyn SymbolTable,
    pointer_size: u64,
) -> Result<Vec<MemoryRegion>> {
    let mut out = Vec::with_capacity(specs.len());
    for spec in specs {
        let start = resolve_bound(&spec.start, symbols)?;
        let end = resolve_bound(&spec.end, symbols)?;
        if start > end {
            return Err(GqfiError::Configuration(format!(
                "region start {start:#x} > end {end:#x}"
            )));
        }
        let len = end - start;
        let aligned_len = len - (len % pointer_size);
        let aligned_end = start + aligned_len;

        out.push(MemoryRegion {
            start,
            end: aligned_end,
            kind: spec.kind,
        });
        if aligned_end < end {
            out.push(MemoryRegion {
                start: aligned_end,
                end,
                kind: MemRegionKind::NoAnalysis,
            });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeSymbols(HashMap<&'static str, u64>);
    impl SymbolTable for FakeSymbols {
        fn resolve(&self, symbol: &str) -> Option<u64> {
            self.0.get(symbol).copied()
        }
    }

    #[test]
    fn splits_unaligned_suffix_into_no_analysis() {
        let symbols = FakeSymbols(HashMap::new());
        let specs = vec![MemRegionSpec {
            start: "0x1000".into(),
            end: "0x1009".into(), // 9 bytes, not a multiple of 8
            kind: MemRegionKind::StackAnalysis,
        }];
        let regions = resolve_regions(&specs, &symbols, 8).unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].kind, MemRegionKind::StackAnalysis);
        assert_eq!(regions[0].start, 0x1000);
        assert_eq!(regions[0].end, 0x1008);
        assert_eq!(regions[1].kind, MemRegionKind::NoAnalysis);
        assert_eq!(regions[1].start, 0x1008);
        assert_eq!(regions[1].end, 0x1009);
    }

    #[test]
    fn resolves_symbol_bounds() {
        let mut map = HashMap::new();
        map.insert("stack_top", 0x2000u64);
        map.insert("stack_bottom", 0x1000u64);
        let symbols = FakeSymbols(map);
        let specs = vec![MemRegionSpec {
            start: "stack_bottom".into(),
            end: "stack_top".into(),
            kind: MemRegionKind::CompleteAnalysis,
        }];
        let regions = resolve_regions(&specs, &symbols, 4).unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].start, 0x1000);
        assert_eq!(regions[0].end, 0x2000);
    }
}
