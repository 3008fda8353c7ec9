//! The top-level interpreter state and run loop.

use tracing::{info, warn};

use crate::error::VmFatalError;
use crate::files::FileTable;
use crate::heap::SbrkAllocator;
use crate::registers::RegisterFile;
use crate::rng::RngRegistry;
use crate::segment::{SegmentTable, EXCEPTION_HANDLER_ADDR};
use crate::terminal::Terminal;
use crate::trap::{CustomSyscallTable, ExceptionKind, Trap, VmException};

/// Why the run loop stopped.
#[derive(Debug)]
pub enum Stop {
    /// Guest-requested exit (`exit`/`exit2` syscalls), carrying the status
    /// the guest supplied.
    Exit { status: i32 },
    /// `pc` ran off the end of `.text` (or `.ktext`) without an explicit
    /// exit — a normal, if sloppy, way for a guest program to finish.
    RanOffEnd,
    /// A fatal interpreter error, or a guest exception with nowhere to go.
    Fatal(VmFatalError),
}

pub struct Vm {
    pub regs: RegisterFile,
    pub segments: SegmentTable,
    pub heap: SbrkAllocator,
    pub files: FileTable,
    pub rng: RngRegistry,
    pub custom_syscalls: CustomSyscallTable,
    pub terminal: Terminal,

    pub kernel_mode: bool,
    pub has_exception_handler: bool,
    pub tick: u64,
}

impl Vm {
    pub fn new(segments: SegmentTable, regs: RegisterFile) -> Self {
        let has_exception_handler = segments.has_kernel_handler_at(EXCEPTION_HANDLER_ADDR);
        Self {
            regs,
            segments,
            heap: SbrkAllocator::new(),
            files: FileTable::new(),
            rng: RngRegistry::new(),
            custom_syscalls: CustomSyscallTable::new(),
            terminal: Terminal::default(),
            kernel_mode: false,
            has_exception_handler,
            tick: 0,
        }
    }

    /// Runs until termination, returning the reason.
    pub fn run(&mut self) -> Stop {
        loop {
            match self.step() {
                Ok(StepOutcome::Continue) => {}
                Ok(StepOutcome::RanOffEnd) => {
                    info!("program counter ran off segment end, terminating normally");
                    return Stop::RanOffEnd;
                }
                Err(Trap::Exit { status }) => {
                    info!(status, "guest exit");
                    return Stop::Exit { status };
                }
                Err(Trap::Exception(exc)) => {
                    if let Err(fatal) = self.deliver_or_escalate(exc) {
                        return Stop::Fatal(fatal);
                    }
                }
                Err(Trap::Fatal(err)) => {
                    warn!(%err, "fatal interpreter error");
                    return Stop::Fatal(err);
                }
            }
        }
    }

    /// Executes one instruction. Returns `Ok` on ordinary progress (or a
    /// clean end-of-segment termination), or the trap a dispatch step
    /// raised.
    fn step(&mut self) -> Result<StepOutcome, Trap> {
        let pc = self.regs.pc;

        if self.at_segment_end() {
            return Ok(StepOutcome::RanOffEnd);
        }

        if pc % 4 != 0 {
            return Err(Trap::Fatal(VmFatalError::MisalignedFetch { pc }));
        }

        let (seg_executable, seg_is_user_text, word) = {
            let segment = self
                .segments
                .resolve(pc, self.kernel_mode)
                .ok_or(VmFatalError::InvalidProgramCounter { pc })?;
            let is_user_text = std::ptr::eq(segment, &self.segments.text);
            let offset = (pc - segment.base) as usize;
            let word = u32::from_le_bytes([
                segment.bytes[offset],
                segment.bytes[offset + 1],
                segment.bytes[offset + 2],
                segment.bytes[offset + 3],
            ]);
            (
                segment.flags.contains(crate::segment::SegmentFlags::EXECUTABLE),
                is_user_text,
                word,
            )
        };

        if !seg_executable {
            return Err(Trap::Fatal(VmFatalError::InvalidProgramCounter { pc }));
        }
        if self.kernel_mode && seg_is_user_text {
            return Err(Trap::Fatal(VmFatalError::KernelFallthrough { pc }));
        }

        let inst = crate::instruction::Instruction::new(word);

        let advance = self.dispatch(inst)?;
        if advance {
            self.regs.pc = self.regs.pc.wrapping_add(4);
        }
        self.regs.reset_zero_register();

        self.poll_keyboard()?;
        self.tick += 1;

        Ok(StepOutcome::Continue)
    }

    fn at_segment_end(&self) -> bool {
        if self.regs.pc == self.segments.text.end() {
            return true;
        }
        if !self.segments.ktext.is_empty() && self.regs.pc == self.segments.ktext.end() {
            return true;
        }
        false
    }

    /// Delivers a guest exception to the kernel handler, or escalates to a
    /// fatal abort if no handler is installed or the fault happened in
    /// kernel mode already.
    fn deliver_or_escalate(&mut self, exc: VmException) -> Result<(), VmFatalError> {
        if self.has_exception_handler && !self.kernel_mode {
            let mut cause = exc.kind.code() << 2;
            if matches!(exc.kind, ExceptionKind::Interrupt) {
                cause |= crate::registers::CAUSE_INTERRUPT_PENDING;
            }
            self.regs.cause = cause;
            self.regs.status |= crate::registers::STATUS_EXCEPTION_LEVEL;
            self.regs.epc = self.regs.pc;
            if let Some(vaddr) = exc.vaddr {
                self.regs.vaddr = vaddr;
            }
            self.kernel_mode = true;
            self.regs.pc = EXCEPTION_HANDLER_ADDR;
            Ok(())
        } else {
            warn!(kind = ?exc.kind, message = %exc.message, "undelivered architectural exception");
            Err(VmFatalError::UndeliveredException {
                kind: exc.kind,
                message: exc.message,
            })
        }
    }

    fn poll_keyboard(&mut self) -> Result<(), Trap> {
        let control = self.read_mmio_word(crate::terminal::mmio::CONTROL);
        let enabled = control & crate::terminal::mmio::ENABLE_BIT != 0;
        self.terminal.set_raw(enabled);

        if enabled && !self.kernel_mode && self.tick % crate::terminal::POLL_INTERVAL_TICKS == 0 {
            if let Some(byte) = self.terminal.try_read_byte() {
                self.write_mmio_word(crate::terminal::mmio::DATA, byte as u32);
                return Err(VmException::new(ExceptionKind::Interrupt, "keyboard interrupt").into());
            }
        }
        Ok(())
    }

    fn read_mmio_word(&self, offset: u32) -> u32 {
        let base = (offset) as usize;
        let bytes = &self.segments.mmio.bytes;
        u32::from_le_bytes([bytes[base], bytes[base + 1], bytes[base + 2], bytes[base + 3]])
    }

    fn write_mmio_word(&mut self, offset: u32, value: u32) {
        let base = offset as usize;
        self.segments.mmio.bytes[base..base + 4].copy_from_slice(&value.to_le_bytes());
    }
}

enum StepOutcome {
    Continue,
    RanOffEnd,
}
