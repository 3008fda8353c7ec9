//! Error and termination types.
//!
//! The interpreter's failure model has three tiers: guest-deliverable
//! architectural exceptions ([`crate::trap::VmException`]), fatal interpreter
//! errors ([`VmFatalError`]), and the `Exit`/`Exit2` termination signal
//! ([`crate::vm::Stop::Exit`]). This module only carries the fatal tier;
//! the other two live next to the subsystems that raise them.

use std::path::PathBuf;

/// Errors that abort the interpreter outright rather than being delivered to
/// a guest-installed exception handler.
#[derive(thiserror::Error, Debug)]
pub enum VmFatalError {
    #[error(".text segment for program '{0}' could not be loaded")]
    MissingTextSegment(String),

    #[error("failed to read segment blob {path:?}: {source}")]
    SegmentIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid program counter 0x{pc:08X}: no executable segment resolves it")]
    InvalidProgramCounter { pc: u32 },

    #[error("misaligned instruction fetch at 0x{pc:08X}")]
    MisalignedFetch { pc: u32 },

    #[error("kernel mode attempted to execute user .text at 0x{pc:08X}")]
    KernelFallthrough { pc: u32 },

    #[error("heap exhausted: sbrk({requested}) does not fit in {remaining} remaining bytes")]
    HeapExhausted { requested: i32, remaining: u32 },

    #[error("sbrk requested negative size {0}")]
    NegativeSbrk(i32),

    #[error("invalid coprocessor-0 register index {0} (valid: 8, 12, 13, 14)")]
    InvalidCoprocessor0Register(u32),

    #[error("invalid coprocessor move operation (rs field {0}, expected 0 or 4)")]
    InvalidCoprocessorMove(u32),

    #[error("unresolved syscall number {0} (no custom handler registered)")]
    UnresolvedSyscall(u32),

    #[error("reserved instruction: opcode 0x{opcode:02X} funct 0x{funct:02X} at 0x{pc:08X}")]
    ReservedInstruction { opcode: u32, funct: u32, pc: u32 },

    #[error("no architectural exception handler installed to deliver {kind:?}: {message}")]
    UndeliveredException {
        kind: crate::trap::ExceptionKind,
        message: String,
    },
}
