//! ELF symbol table resolution for `marker_*` configuration keys and
//! `mem_regions` bounds given as symbol names (spec.md §3, §6).
//!
//! Grounded in the pack's `zhalvorsen-caliptra-mcu-sw/emulator/app/src/elf.rs`,
//! the only example in the retrieved pack that parses ELF files; this
//! module is the one place that crate's `elf` dependency earns its keep
//! here, since the Emulator Driver is deliberately kept ignorant of ELF
//! layout (see [`crate::driver::SymbolTable`]'s doc comment).

use std::collections::HashMap;
use std::path::Path;

use elf::endian::AnyEndian;
use elf::ElfBytes;

use crate::driver::SymbolTable;
use crate::error::{GqfiError, Result};

/// A symbol table resolved once from a target's ELF image and held for
/// the lifetime of a campaign run.
pub struct ElfSymbolTable {
    symbols: HashMap<String, u64>,
}

impl ElfSymbolTable {
    /// Parse `path`'s `.symtab`/`.strtab` pair into a name-to-address map.
    /// A target with no symbol table (stripped binary) yields an empty
    /// table; resolution of any marker then fails with
    /// `GqfiError::Emulator` at first use, per spec.md §7 ("Target
    /// unreadable / symbol not found — fatal for that target only").
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let elf_file = ElfBytes::<AnyEndian>::minimal_parse(&bytes)
            .map_err(|e| GqfiError::Configuration(format!("failed to parse {path:?}: {e}")))?;

        let mut symbols = HashMap::new();
        if let Some((table, strings)) = elf_file
            .symbol_table()
            .map_err(|e| GqfiError::Configuration(format!("malformed symbol table in {path:?}: {e}")))?
        {
            for sym in table.iter() {
                if sym.st_name == 0 {
                    continue;
                }
                let name = strings
                    .get(sym.st_name as usize)
                    .map_err(|e| {
                        GqfiError::Configuration(format!("bad symbol name offset in {path:?}: {e}"))
                    })?;
                if !name.is_empty() {
                    symbols.insert(name.to_string(), sym.st_value);
                }
            }
        }

        Ok(Self { symbols })
    }
}

impl SymbolTable for ElfSymbolTable {
    fn resolve(&self, symbol: &str) -> Option<u64> {
        self.symbols.get(symbol).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_surfaces_as_io_error() {
        let err = ElfSymbolTable::load(Path::new("/nonexistent/kernel.elf")).unwrap_err();
        assert!(matches!(err, GqfiError::Io(_)));
    }
}
