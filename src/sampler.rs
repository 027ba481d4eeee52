//! Target selection for the probe loop
//!
//! The server buffer is a `row_count x column_count` grid of `msg_size`
//! cells. Sequential mode walks every cell column by column; random mode
//! draws cache lines without replacement, tracking drawn lines in a
//! bitmap that is cleared once every line has been used; fixed mode always
//! returns the base address.

use crate::config::ProbeMode;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

/// Granularity of random sampling
pub const CACHE_LINE_SIZE: usize = 64;

/// Geometry of the remote buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressSpace {
    /// Remote virtual address of cell (0, 0)
    pub base: u64,
    pub row_count: usize,
    pub column_count: usize,
    pub msg_size: usize,
}

impl AddressSpace {
    pub fn total_bytes(&self) -> usize {
        self.row_count * self.column_count * self.msg_size
    }

    /// Whole cache lines in the buffer
    pub fn line_count(&self) -> usize {
        self.total_bytes() / CACHE_LINE_SIZE
    }

    /// Address of the cell at `row`, `column`
    pub fn cell_addr(&self, row: usize, column: usize) -> u64 {
        let row_stride = (self.column_count * self.msg_size) as u64;
        self.base + row as u64 * row_stride + (column * self.msg_size) as u64
    }

    pub fn line_addr(&self, line: usize) -> u64 {
        self.base + (line * CACHE_LINE_SIZE) as u64
    }
}

/// One flag per cache line: drawn in the current epoch or not.
#[derive(Clone, Debug)]
pub struct SamplingBitmap {
    words: Vec<u64>,
    len: usize,
    marked: usize,
}

impl SamplingBitmap {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
            marked: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_set(&self, bit: usize) -> bool {
        bit < self.len && self.words[bit / 64] & (1u64 << (bit % 64)) != 0
    }

    /// Mark `bit`; returns false if it was already marked or is out of range.
    pub fn set(&mut self, bit: usize) -> bool {
        if bit >= self.len || self.is_set(bit) {
            return false;
        }
        self.words[bit / 64] |= 1u64 << (bit % 64);
        self.marked += 1;
        true
    }

    /// Number of marked bits
    pub fn count(&self) -> usize {
        self.marked
    }

    pub fn is_full(&self) -> bool {
        self.marked == self.len
    }

    /// Start a new epoch.
    pub fn clear(&mut self) {
        self.words.fill(0);
        self.marked = 0;
    }
}

/// Uniform draws of line indices without replacement within an epoch
#[derive(Clone, Debug)]
pub struct RandomLineSampler {
    bitmap: SamplingBitmap,
    rng: StdRng,
    epoch: u64,
}

impl RandomLineSampler {
    /// `line_count` must be non-zero.
    pub fn new(line_count: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            bitmap: SamplingBitmap::new(line_count),
            rng,
            epoch: 0,
        }
    }

    pub fn bitmap(&self) -> &SamplingBitmap {
        &self.bitmap
    }

    /// Completed epochs so far
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn next_line(&mut self) -> usize {
        if self.bitmap.is_full() {
            self.bitmap.clear();
            self.epoch += 1;
            debug!("All {} lines drawn; starting epoch {}", self.bitmap.len(), self.epoch);
        }
        loop {
            let line = self.rng.random_range(0..self.bitmap.len());
            if self.bitmap.set(line) {
                return line;
            }
        }
    }
}

/// Produces the probe targets of one run, in order.
#[derive(Clone, Debug)]
pub enum AddressSampler {
    Sequential {
        space: AddressSpace,
        row: usize,
        column: usize,
    },
    Random {
        space: AddressSpace,
        lines: RandomLineSampler,
        remaining: u64,
    },
    Fixed {
        base: u64,
        remaining: u64,
    },
}

impl AddressSampler {
    /// `iterations` is ignored in sequential mode. Random mode needs at
    /// least one whole cache line in `space`.
    pub fn new(mode: ProbeMode, space: AddressSpace, iterations: u64, seed: Option<u64>) -> Self {
        match mode {
            ProbeMode::Sequential => AddressSampler::Sequential {
                space,
                row: 0,
                column: 0,
            },
            ProbeMode::Random => AddressSampler::Random {
                space,
                lines: RandomLineSampler::new(space.line_count(), seed),
                remaining: iterations,
            },
            ProbeMode::FixedFlush => AddressSampler::Fixed {
                base: space.base,
                remaining: iterations,
            },
        }
    }

    /// Probes the sampler will yield from the start
    pub fn planned_probes(mode: ProbeMode, space: &AddressSpace, iterations: u64) -> u64 {
        match mode {
            ProbeMode::Sequential => (space.row_count * space.column_count) as u64,
            ProbeMode::Random | ProbeMode::FixedFlush => iterations,
        }
    }
}

impl Iterator for AddressSampler {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        match self {
            AddressSampler::Sequential { space, row, column } => {
                if *column >= space.column_count || space.row_count == 0 {
                    return None;
                }
                let addr = space.cell_addr(*row, *column);
                *row += 1;
                if *row == space.row_count {
                    *row = 0;
                    *column += 1;
                }
                Some(addr)
            }
            AddressSampler::Random {
                space,
                lines,
                remaining,
            } => {
                if *remaining == 0 || space.line_count() == 0 {
                    return None;
                }
                *remaining -= 1;
                Some(space.line_addr(lines.next_line()))
            }
            AddressSampler::Fixed { base, remaining } => {
                if *remaining == 0 {
                    return None;
                }
                *remaining -= 1;
                Some(*base)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn space(rows: usize, columns: usize, msg_size: usize) -> AddressSpace {
        AddressSpace {
            base: 0x1000,
            row_count: rows,
            column_count: columns,
            msg_size,
        }
    }

    #[test]
    fn test_sequential_order() {
        let space = space(2, 3, 8);
        let addrs: Vec<u64> = AddressSampler::new(ProbeMode::Sequential, space, 1, None).collect();
        let expected: Vec<u64> = [0, 24, 8, 32, 16, 40].iter().map(|o| 0x1000 + o).collect();
        assert_eq!(addrs, expected);
        assert_eq!(
            AddressSampler::planned_probes(ProbeMode::Sequential, &space, 1),
            6
        );
    }

    #[test]
    fn test_random_no_duplicates_within_epoch() {
        let space = space(16, 64, 8); // 8192 bytes, 128 lines
        let lines = space.line_count();
        assert_eq!(lines, 128);

        let addrs: Vec<u64> =
            AddressSampler::new(ProbeMode::Random, space, lines as u64, Some(7)).collect();
        assert_eq!(addrs.len(), lines);
        let unique: HashSet<u64> = addrs.iter().copied().collect();
        assert_eq!(unique.len(), lines);
        for addr in addrs {
            assert_eq!((addr - space.base) % CACHE_LINE_SIZE as u64, 0);
            assert!(addr + 8 <= space.base + space.total_bytes() as u64);
        }
    }

    #[test]
    fn test_random_wraps_into_new_epoch() {
        let mut sampler = RandomLineSampler::new(4, Some(1));
        let first: HashSet<usize> = (0..4).map(|_| sampler.next_line()).collect();
        assert_eq!(first.len(), 4);
        assert!(sampler.bitmap().is_full());

        let second: HashSet<usize> = (0..4).map(|_| sampler.next_line()).collect();
        assert_eq!(second.len(), 4);
        assert_eq!(sampler.epoch(), 1);
    }

    #[test]
    fn test_seeded_random_is_reproducible() {
        let space = space(8, 64, 8);
        let a: Vec<u64> = AddressSampler::new(ProbeMode::Random, space, 20, Some(42)).collect();
        let b: Vec<u64> = AddressSampler::new(ProbeMode::Random, space, 20, Some(42)).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_fixed_targets_base() {
        let addrs: Vec<u64> =
            AddressSampler::new(ProbeMode::FixedFlush, space(4, 4, 8), 3, None).collect();
        assert_eq!(addrs, vec![0x1000; 3]);
    }

    #[test]
    fn test_bitmap() {
        let mut bitmap = SamplingBitmap::new(70);
        assert!(bitmap.set(0));
        assert!(bitmap.set(69));
        assert!(!bitmap.set(69));
        assert!(!bitmap.set(70));
        assert!(bitmap.is_set(69));
        assert!(!bitmap.is_set(68));
        assert_eq!(bitmap.count(), 2);
        bitmap.clear();
        assert_eq!(bitmap.count(), 0);
        assert!(!bitmap.is_set(0));
    }
}
