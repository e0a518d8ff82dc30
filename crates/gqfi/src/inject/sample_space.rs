//! Sample-space preparation: drawing `(address, bit)` and `time` (spec.md
//! §4.3, invariant 1 in §8).

use rand::Rng;

use crate::analyze::mem_region::MemoryRegion;
use crate::error::{GqfiError, Result};

/// One addressable bit: `region[byte_offset]` bit `bit_in_byte`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitAddress {
    pub addr: u64,
    pub bit: u8,
}

/// Cumulative bit-width table over a set of effective memory regions,
/// built once per target and reused for every draw (original:
/// `get_bit_to_flip`'s cumulative-width computation).
pub struct SampleSpace {
    /// `(region_index, cumulative_bits_before_this_region)`.
    regions: Vec<(MemoryRegion, u64)>,
    total_bits: u64,
}

impl SampleSpace {
    pub fn new(regions: &[MemoryRegion]) -> Result<Self> {
        let mut built = Vec::with_capacity(regions.len());
        let mut cumulative = 0u64;
        for region in regions {
            built.push((*region, cumulative));
            cumulative += region.len() * 8;
        }
        if cumulative == 0 {
            return Err(GqfiError::Injection(
                "effective memory regions contain no bits to flip".into(),
            ));
        }
        Ok(Self {
            regions: built,
            total_bits: cumulative,
        })
    }

    pub fn total_bits(&self) -> u64 {
        self.total_bits
    }

    /// Map a uniform integer in `[0, total_bits)` to a concrete
    /// `(address, bit)`. Returns an error for an out-of-range index — a
    /// caller bug, not a runtime condition, since [`Self::draw`] always
    /// supplies an in-range value.
    pub fn map_index(&self, index: u64) -> Result<BitAddress> {
        if index >= self.total_bits {
            return Err(GqfiError::Injection(format!(
                "bit index {index} out of range [0, {})",
                self.total_bits
            )));
        }
        // Regions are in ascending cumulative order; find the last region
        // whose start offset is <= index.
        let region_entry = self
            .regions
            .iter()
            .rev()
            .find(|(_, offset)| *offset <= index)
            .expect("total_bits > 0 implies at least one region");
        let (region, offset) = region_entry;
        let within = index - offset;
        let byte_offset = within / 8;
        let bit = (within % 8) as u8;
        Ok(BitAddress {
            addr: region.start + byte_offset,
            bit,
        })
    }

    /// Draw a uniform random `(address, bit)` from the sample space.
    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<BitAddress> {
        let index = rng.gen_range(0..self.total_bits);
        self.map_index(index)
    }
}

/// Draw a uniform fault instant in `[0, runtime)` (spec.md §4.3).
pub fn draw_time<R: Rng + ?Sized>(rng: &mut R, runtime: u64) -> u64 {
    if runtime == 0 {
        0
    } else {
        rng.gen_range(0..runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemRegionKind;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn region(start: u64, end: u64) -> MemoryRegion {
        MemoryRegion {
            start,
            end,
            kind: MemRegionKind::StackAnalysis,
        }
    }

    #[test]
    fn maps_index_within_first_region() {
        let space = SampleSpace::new(&[region(0x1000, 0x1002), region(0x2000, 0x2004)]).unwrap();
        assert_eq!(space.total_bits(), (2 + 4) * 8);
        let addr = space.map_index(0).unwrap();
        assert_eq!(addr, BitAddress { addr: 0x1000, bit: 0 });
        let addr = space.map_index(9).unwrap();
        assert_eq!(addr, BitAddress { addr: 0x1001, bit: 1 });
    }

    #[test]
    fn maps_index_into_second_region() {
        let space = SampleSpace::new(&[region(0x1000, 0x1002), region(0x2000, 0x2004)]).unwrap();
        // first region is 16 bits (2 bytes); index 16 is the first bit of
        // the second region.
        let addr = space.map_index(16).unwrap();
        assert_eq!(addr, BitAddress { addr: 0x2000, bit: 0 });
    }

    #[test]
    fn out_of_range_index_errors() {
        let space = SampleSpace::new(&[region(0x1000, 0x1001)]).unwrap();
        assert!(space.map_index(8).is_err());
    }

    #[test]
    fn empty_regions_reject_construction() {
        assert!(SampleSpace::new(&[]).is_err());
    }

    #[test]
    fn draws_are_within_range() {
        let space = SampleSpace::new(&[region(0x1000, 0x1010)]).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let addr = space.draw(&mut rng).unwrap();
            assert!(addr.addr >= 0x1000 && addr.addr < 0x1010);
            assert!(addr.bit < 8);
        }
    }

    #[test]
    fn draw_time_zero_runtime_is_zero() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(draw_time(&mut rng, 0), 0);
    }
}
