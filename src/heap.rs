//! The `sbrk` bump allocator backing the heap segment.
//!
//! The source hands out a fixed 48MB arena and never reclaims it; `sbrk`
//! only ever grows the break. We keep that model: `Segment::bytes` for the
//! heap grows in place and `SbrkAllocator` just tracks how much of the
//! reserved capacity has been claimed.

use crate::error::VmFatalError;
use crate::segment::{SBRK_HEAP_START, HEAP_CAPACITY};

/// Tracks the current break point within the heap's reserved capacity.
#[derive(Debug, Clone, Copy)]
pub struct SbrkAllocator {
    used: u32,
}

impl Default for SbrkAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SbrkAllocator {
    pub fn new() -> Self {
        Self { used: 0 }
    }

    pub fn break_addr(&self) -> u32 {
        SBRK_HEAP_START + self.used
    }

    /// Grows the break by `requested` bytes and returns the address of the
    /// break *before* the grow (the value `sbrk` returns on success).
    /// `requested` of zero is legal and just reports the current break.
    pub fn sbrk(&mut self, requested: i32) -> Result<u32, VmFatalError> {
        if requested < 0 {
            return Err(VmFatalError::NegativeSbrk(requested));
        }
        let requested = requested as u32;
        let remaining = HEAP_CAPACITY - self.used;
        if requested > remaining {
            return Err(VmFatalError::HeapExhausted {
                requested: requested as i32,
                remaining,
            });
        }
        let prior_break = self.break_addr();
        self.used += requested;
        Ok(prior_break)
    }
}
