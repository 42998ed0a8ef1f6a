//! Hyper-log-log sketch for unique-key estimation.
//!
//! Each node carries a sketch folded from the sketches of its kvsets. The
//! sampling engine uses the cardinality estimate to scale raw write lengths
//! down to their unique-key equivalent, which is what a full kv-compaction
//! of the node would actually write.

use crc::{Crc, CRC_64_ECMA_182};

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Register-index precision. 2^12 registers = 4 KiB per sketch.
pub const HLOG_PRECISION: u32 = 12;

const REGISTERS: usize = 1 << HLOG_PRECISION;

/// A fixed-precision hyper-log-log cardinality sketch.
#[derive(Clone)]
pub struct Hlog {
    registers: Box<[u8; REGISTERS]>,
}

impl Default for Hlog {
    fn default() -> Self {
        Self::new()
    }
}

impl Hlog {
    pub fn new() -> Self {
        Self {
            registers: Box::new([0u8; REGISTERS]),
        }
    }

    /// Fold a key into the sketch.
    pub fn add(&mut self, key: &[u8]) {
        let hash = CRC64.checksum(key);
        let idx = (hash >> (64 - HLOG_PRECISION)) as usize;
        let rest = hash << HLOG_PRECISION;
        let rank = (rest.leading_zeros() + 1).min(64 - HLOG_PRECISION) as u8;
        if rank > self.registers[idx] {
            self.registers[idx] = rank;
        }
    }

    /// Merge another sketch into this one (register-wise max).
    pub fn union(&mut self, other: &Hlog) {
        for (a, b) in self.registers.iter_mut().zip(other.registers.iter()) {
            if *b > *a {
                *a = *b;
            }
        }
    }

    /// Estimate the number of distinct keys folded in.
    pub fn card(&self) -> u64 {
        let m = REGISTERS as f64;
        let mut sum = 0.0;
        let mut zeros = 0u64;
        for &r in self.registers.iter() {
            sum += 1.0 / f64::from(1u32 << u32::from(r.min(31)));
            if r == 0 {
                zeros += 1;
            }
        }

        let alpha = 0.7213 / (1.0 + 1.079 / m);
        let raw = alpha * m * m / sum;

        // Linear counting for the small-cardinality regime.
        if raw <= 2.5 * m && zeros > 0 {
            return (m * (m / zeros as f64).ln()) as u64;
        }
        raw as u64
    }

    /// Clear the sketch.
    pub fn reset(&mut self) {
        self.registers.fill(0);
    }
}

impl std::fmt::Debug for Hlog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hlog").field("card", &self.card()).finish()
    }
}
