//! Per-id Mersenne Twister generators for the `rand_*`/`set_seed` syscalls.
//!
//! Generator id 0 (or any id never explicitly seeded) falls back to a single
//! shared, entropy-seeded default generator, matching the source's
//! `random_mgr::get_gen` behavior.

use std::collections::HashMap;

use rand::{Rng, SeedableRng};
use rand_mt::Mt19937GenRand32;

pub struct RngRegistry {
    default_gen: Mt19937GenRand32,
    seeded: HashMap<u32, Mt19937GenRand32>,
}

impl Default for RngRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RngRegistry {
    pub fn new() -> Self {
        Self {
            default_gen: Mt19937GenRand32::from_seed(rand::random()),
            seeded: HashMap::new(),
        }
    }

    pub fn set_seed(&mut self, id: u32, seed: u32) {
        self.seeded.insert(id, Mt19937GenRand32::seed_from_u64(seed as u64));
    }

    fn gen_mut(&mut self, id: u32) -> &mut Mt19937GenRand32 {
        self.seeded.get_mut(&id).unwrap_or(&mut self.default_gen)
    }

    pub fn next_u32(&mut self, id: u32) -> u32 {
        self.gen_mut(id).gen()
    }

    /// Inclusive-low, inclusive-high range (the source samples `[lo, hi]`).
    pub fn next_u32_range(&mut self, id: u32, lo: i32, hi: i32) -> i32 {
        if lo >= hi {
            return lo;
        }
        self.gen_mut(id).gen_range(lo..=hi)
    }

    pub fn next_f32(&mut self, id: u32) -> f32 {
        self.gen_mut(id).gen()
    }

    /// Unlike the source (which feeds `rand_double` through the same
    /// single-precision generator and truncates it back into a 32-bit
    /// register), this draws a genuine double-precision sample.
    pub fn next_f64(&mut self, id: u32) -> f64 {
        self.gen_mut(id).gen()
    }
}
