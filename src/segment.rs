//! The segmented address space: `.text`/`.data`/`.ktext`/`.kdata`, the sbrk
//! heap, the fixed-size stack, and the MMIO block.
//!
//! Each segment is a flat byte buffer anchored at a base address, tagged
//! with protection bits. Resolution walks a fixed list rather than a sorted
//! map — there are never more than seven segments, so a linear scan is both
//! simpler and faster than anything fancier.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        const EXECUTABLE = 1;
        const MUTABLE = 2;
        const KERNEL = 4;
    }
}

/// Size of the fixed backing stack, matching the source's `STACK_SIZE`.
pub const STACK_SIZE: u32 = 0x2000_0000;
/// Top-of-stack address; `$sp` starts four bytes below this.
pub const STACK_TOP: u32 = 0x7FFF_EFFF;
pub const STACK_BASE: u32 = STACK_TOP - STACK_SIZE;

pub const SBRK_HEAP_START: u32 = 0x0100_0000;
pub const SBRK_HEAP_END: u32 = 0x0400_0000;
pub const HEAP_CAPACITY: u32 = SBRK_HEAP_END - SBRK_HEAP_START;

pub const MMIO_BASE: u32 = 0xFFFF_0000;
pub const MMIO_WORDS: usize = 8;

pub const EXCEPTION_HANDLER_ADDR: u32 = 0x8000_0180;

/// One contiguous, flag-tagged region of guest memory.
#[derive(Debug, Clone)]
pub struct Segment {
    pub base: u32,
    pub bytes: Vec<u8>,
    pub flags: SegmentFlags,
}

impl Segment {
    pub fn new(base: u32, bytes: Vec<u8>, flags: SegmentFlags) -> Self {
        Self { base, bytes, flags }
    }

    pub fn len(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The address one past the last byte of the segment.
    pub fn end(&self) -> u32 {
        self.base.wrapping_add(self.len())
    }

    /// Whether `[addr, addr+size)` lies fully within this segment without
    /// wraparound, mirroring the source's bounds+overflow check.
    pub fn contains_range(&self, addr: u32, size: u32) -> bool {
        if size == 0 {
            return addr >= self.base && addr < self.end();
        }
        match addr.checked_add(size) {
            Some(upper) => addr >= self.base && upper <= self.end() && upper >= addr,
            None => false,
        }
    }
}

/// The complete set of segments backing one running program.
#[derive(Debug, Clone)]
pub struct SegmentTable {
    pub text: Segment,
    pub data: Segment,
    pub ktext: Segment,
    pub kdata: Segment,
    pub heap: Segment,
    pub stack: Segment,
    pub mmio: Segment,
}

impl SegmentTable {
    /// Resolves a virtual address to the segment that backs it, respecting
    /// kernel/user visibility: `.ktext`/`.kdata` are invisible in user mode.
    pub fn resolve(&self, addr: u32, kernel_mode: bool) -> Option<&Segment> {
        if kernel_mode {
            if self.ktext.contains_range(addr, 0) {
                return Some(&self.ktext);
            }
            if self.kdata.contains_range(addr, 0) {
                return Some(&self.kdata);
            }
        }
        if self.text.contains_range(addr, 0) {
            return Some(&self.text);
        }
        if self.data.contains_range(addr, 0) {
            return Some(&self.data);
        }
        if self.heap.contains_range(addr, 0) {
            return Some(&self.heap);
        }
        if self.stack.contains_range(addr, 0) {
            return Some(&self.stack);
        }
        if self.mmio.contains_range(addr, 0) {
            return Some(&self.mmio);
        }
        None
    }

    pub fn resolve_mut(&mut self, addr: u32, kernel_mode: bool) -> Option<&mut Segment> {
        if kernel_mode && self.ktext.contains_range(addr, 0) {
            return Some(&mut self.ktext);
        }
        if kernel_mode && self.kdata.contains_range(addr, 0) {
            return Some(&mut self.kdata);
        }
        if self.text.contains_range(addr, 0) {
            return Some(&mut self.text);
        }
        if self.data.contains_range(addr, 0) {
            return Some(&mut self.data);
        }
        if self.heap.contains_range(addr, 0) {
            return Some(&mut self.heap);
        }
        if self.stack.contains_range(addr, 0) {
            return Some(&mut self.stack);
        }
        if self.mmio.contains_range(addr, 0) {
            return Some(&mut self.mmio);
        }
        None
    }

    /// True if any segment currently resolves `addr` as executable in
    /// kernel mode — used once at load time to detect an installed
    /// exception handler.
    pub fn has_kernel_handler_at(&self, addr: u32) -> bool {
        self.resolve(addr, true)
            .map(|seg| seg.flags.contains(SegmentFlags::EXECUTABLE))
            .unwrap_or(false)
    }
}
