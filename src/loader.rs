//! Loads a program's `.text`/`.data`/`.ktext`/`.kdata` blobs from disk into
//! a [`SegmentTable`].
//!
//! Each blob's first four bytes are a little-endian base address; the rest
//! is the segment body. `.text` is mandatory, the other three are optional
//! and simply absent (empty, zero-based) if their file doesn't exist.

use std::fs;
use std::path::Path;

use tracing::warn;

use crate::error::VmFatalError;
use crate::segment::{
    Segment, SegmentFlags, SegmentTable, MMIO_BASE, MMIO_WORDS, SBRK_HEAP_START, STACK_BASE,
    STACK_SIZE,
};

struct SuffixSpec {
    suffix: &'static str,
    flags: SegmentFlags,
}

const SUFFIXES: [SuffixSpec; 4] = [
    SuffixSpec { suffix: ".text", flags: SegmentFlags::EXECUTABLE },
    SuffixSpec { suffix: ".data", flags: SegmentFlags::MUTABLE },
    SuffixSpec {
        suffix: ".ktext",
        flags: SegmentFlags::from_bits_truncate(SegmentFlags::EXECUTABLE.bits() | SegmentFlags::KERNEL.bits()),
    },
    SuffixSpec {
        suffix: ".kdata",
        flags: SegmentFlags::from_bits_truncate(SegmentFlags::MUTABLE.bits() | SegmentFlags::KERNEL.bits()),
    },
];

/// Reads one `P<suffix>` blob, returning `None` (not an error) if the file
/// is missing, unreadable, or fails the size/alignment checks — the loader
/// drops malformed optional segments and keeps going.
fn load_segment(base_name: &str, spec: &SuffixSpec) -> Option<Segment> {
    let path = format!("{base_name}{}", spec.suffix);
    let bytes = match fs::read(&path) {
        Ok(b) => b,
        Err(_) => return None,
    };
    if bytes.len() <= 4 {
        warn!(path, "segment blob too small, dropping");
        return None;
    }
    let base = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let body = bytes[4..].to_vec();
    if spec.flags.contains(SegmentFlags::EXECUTABLE) && body.len() % 4 != 0 {
        warn!(path, len = body.len(), "executable segment length not a multiple of 4, dropping");
        return None;
    }
    Some(Segment::new(base, body, spec.flags))
}

/// Loads the program rooted at `base_name` (e.g. `programs/fib` resolves
/// `programs/fib.text` etc.), failing only if `.text` can't be loaded.
pub fn load(base_name: &str) -> Result<SegmentTable, VmFatalError> {
    let mut loaded: Vec<Option<Segment>> = SUFFIXES.iter().map(|spec| load_segment(base_name, spec)).collect();

    let text = loaded[0]
        .take()
        .ok_or_else(|| VmFatalError::MissingTextSegment(base_name.to_string()))?;
    let data = loaded[1].take().unwrap_or_else(|| Segment::new(0, vec![], SegmentFlags::MUTABLE));
    let ktext = loaded[2].take().unwrap_or_else(|| {
        Segment::new(
            0,
            vec![],
            SegmentFlags::EXECUTABLE | SegmentFlags::KERNEL,
        )
    });
    let kdata = loaded[3]
        .take()
        .unwrap_or_else(|| Segment::new(0, vec![], SegmentFlags::MUTABLE | SegmentFlags::KERNEL));

    Ok(SegmentTable {
        text,
        data,
        ktext,
        kdata,
        heap: Segment::new(SBRK_HEAP_START, vec![], SegmentFlags::MUTABLE),
        stack: Segment::new(STACK_BASE, vec![0; STACK_SIZE as usize], SegmentFlags::MUTABLE),
        mmio: Segment::new(MMIO_BASE, vec![0; MMIO_WORDS * 4], SegmentFlags::MUTABLE),
    })
}

/// True if `path` (as a `.text`/`.data`/etc base name) names an existing,
/// loadable program — used by the CLI to validate the positional argument
/// before constructing a [`crate::vm::Vm`].
pub fn can_load(base_name: &str) -> bool {
    Path::new(&format!("{base_name}.text")).exists()
}
