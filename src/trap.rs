//! Architectural exceptions, the `Exit` termination signal, and the
//! guest-managed syscall frame stack used by the custom-syscall path.
//!
//! Three distinct things live here even though they all start life as a
//! `Result::Err` from a dispatch method:
//! - [`ExceptionKind`]/[`VmException`]: tier-1, guest-deliverable.
//! - [`Trap::Exit`]: tier-3, a termination signal, never delivered to a
//!   guest handler even if one is installed (see [`crate::error`]'s module
//!   doc for the three-tier split).
//! - [`SyscallFrame`]/[`CustomSyscallTable`]: not a trap at all, but the
//!   save/restore state the trap controller pushes/pops around a custom
//!   syscall dispatch.

use std::collections::HashMap;

/// The 5-bit exception code shifted into `cause`, before the shift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    Interrupt = 0,
    LoadAddress = 4,
    StoreAddress = 5,
    Syscall = 8,
    Breakpoint = 9,
    ReservedInstruction = 10,
    ArithmeticOverflow = 12,
    Trap = 13,
    DivideByZero = 15,
    FloatOverflow = 16,
    FloatUnderflow = 17,
}

impl ExceptionKind {
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// A guest-deliverable architectural exception: redirected to the kernel
/// exception vector when a handler is installed and the fault happened in
/// user mode, otherwise escalated to a fatal abort.
#[derive(Debug, Clone)]
pub struct VmException {
    pub kind: ExceptionKind,
    /// The faulting virtual address, for exceptions that carry one
    /// (Load/StoreAddress, Interrupt's data word is not a vaddr so this
    /// stays `None` there).
    pub vaddr: Option<u32>,
    pub message: String,
}

impl VmException {
    pub fn new(kind: ExceptionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            vaddr: None,
            message: message.into(),
        }
    }

    pub fn with_vaddr(mut self, vaddr: u32) -> Self {
        self.vaddr = Some(vaddr);
        self
    }
}

/// What a dispatch step can raise: a guest exception that attempts delivery
/// to the kernel handler, an unconditional termination signal, or a fatal
/// interpreter error that aborts immediately regardless of whether a handler
/// is installed (§7: invalid pc, misaligned fetch, kernel-fallthrough, heap
/// exhaustion, invalid coprocessor operand — never guest-catchable).
#[derive(Debug)]
pub enum Trap {
    Exception(VmException),
    Exit { status: i32 },
    Fatal(crate::error::VmFatalError),
}

impl From<VmException> for Trap {
    fn from(exc: VmException) -> Self {
        Trap::Exception(exc)
    }
}

impl From<crate::error::VmFatalError> for Trap {
    fn from(err: crate::error::VmFatalError) -> Self {
        Trap::Fatal(err)
    }
}

/// State saved on custom-syscall entry and restored on return: `status`/
/// `cause` are a snapshot of those coprocessor-0 registers so a handler can
/// itself issue syscalls without clobbering the state of the fault it's
/// handling, and `epc` holds the return address (the instruction after the
/// invoking `SYSCALL`), not a coprocessor-0 register snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyscallFrame {
    pub status: u32,
    pub cause: u32,
    pub epc: u32,
}

/// Custom syscall registrations (`#49`) plus the frame stack used to enter
/// and return from them.
#[derive(Default)]
pub struct CustomSyscallTable {
    handlers: HashMap<u32, u32>,
    frames: Vec<SyscallFrame>,
}

impl CustomSyscallTable {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            frames: Vec::new(),
        }
    }

    pub fn register(&mut self, code: u32, address: u32) {
        self.handlers.insert(code, address);
    }

    pub fn address_for(&self, code: u32) -> Option<u32> {
        self.handlers.get(&code).copied()
    }

    pub fn push_frame(&mut self, frame: SyscallFrame) {
        self.frames.push(frame);
    }

    pub fn pop_frame(&mut self) -> Option<SyscallFrame> {
        self.frames.pop()
    }
}
