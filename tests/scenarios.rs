//! End-to-end scenarios run against a hand-built [`Vm`] rather than a
//! program loaded from disk — each test assembles its own tiny instruction
//! stream and drives the machine through `run()`.

use mipsvm::instruction::{funct, opcode, reg};
use mipsvm::registers::RegisterFile;
use mipsvm::segment::{
    Segment, SegmentFlags, SegmentTable, MMIO_BASE, MMIO_WORDS, SBRK_HEAP_START, STACK_BASE,
    STACK_SIZE,
};
use mipsvm::trap::ExceptionKind;
use mipsvm::vm::{Stop, Vm};

const TEXT_BASE: u32 = 0x0040_0000;

fn encode_r(rs: usize, rt: usize, rd: usize, shamt: u32, f: u32) -> u32 {
    ((rs as u32) << 21) | ((rt as u32) << 16) | ((rd as u32) << 11) | (shamt << 6) | f
}

fn encode_i(op: u32, rs: usize, rt: usize, imm: u16) -> u32 {
    (op << 26) | ((rs as u32) << 21) | ((rt as u32) << 16) | imm as u32
}

/// `target` must share the current 256MB-aligned region with `pc`; every
/// test program here lives entirely within one, so the high bits never
/// need to come from anywhere but the shift-left-2 pseudo-address.
fn encode_j(op: u32, target: u32) -> u32 {
    (op << 26) | ((target >> 2) & 0x03FF_FFFF)
}

/// `opcode::COP0` instructions: `rs` selects the move direction (0 = c0->gp,
/// 4 = gp->c0) or, with `funct == ERET`, is the ERET encoding instead.
fn encode_cop0(rs: usize, rt: usize, rd: usize, f: u32) -> u32 {
    (opcode::COP0 << 26) | ((rs as u32) << 21) | ((rt as u32) << 16) | ((rd as u32) << 11) | f
}

fn assemble(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

fn vm_with_text(words: &[u32]) -> Vm {
    let table = SegmentTable {
        text: Segment::new(TEXT_BASE, assemble(words), SegmentFlags::EXECUTABLE),
        data: Segment::new(0x1001_0000, vec![0; 0x100], SegmentFlags::MUTABLE),
        ktext: Segment::new(0x8000_0000, vec![], SegmentFlags::EXECUTABLE | SegmentFlags::KERNEL),
        kdata: Segment::new(0x9000_0000, vec![], SegmentFlags::MUTABLE | SegmentFlags::KERNEL),
        heap: Segment::new(SBRK_HEAP_START, vec![0; 0x100], SegmentFlags::MUTABLE),
        stack: Segment::new(STACK_BASE, vec![0; STACK_SIZE as usize], SegmentFlags::MUTABLE),
        mmio: Segment::new(MMIO_BASE, vec![0; MMIO_WORDS * 4], SegmentFlags::MUTABLE),
    };
    let mut regs = RegisterFile::new();
    regs.pc = TEXT_BASE;
    Vm::new(table, regs)
}

/// SW the contents of a register at the sbrk-returned heap pointer, LW it
/// back into a different register.
#[test]
fn store_and_load_round_trip_through_the_heap() {
    let words = [
        encode_i(opcode::ADDIU, reg::ZERO, reg::V0, 9),  // v0 = 9 (SBRK)
        encode_i(opcode::ADDIU, reg::ZERO, reg::A0, 4),  // a0 = 4
        encode_r(0, 0, 0, 0, funct::SYSCALL),
        encode_i(opcode::ADDIU, reg::ZERO, 9, 0xDEAD),   // $t1 = 0x0000DEAD
        encode_i(opcode::SW, reg::V0, 9, 0),             // SW $t1, 0($v0)
        encode_i(opcode::LW, reg::V0, 10, 0),            // LW $t2, 0($v0)
    ];
    let mut vm = vm_with_text(&words);

    let stop = vm.run();
    assert!(matches!(stop, Stop::RanOffEnd));
    assert_eq!(vm.regs.gpr[10], vm.regs.gpr[9]);
}

/// LUI/ORI build `0x7FFFFFFF`, then ADDI 1 overflows — with no kernel
/// handler installed, this escalates to a fatal abort.
#[test]
fn addi_overflow_escalates_without_a_handler() {
    let words = [
        encode_i(opcode::LUI, 0, 8, 0x7FFF),
        encode_i(opcode::ORI, 8, 8, 0xFFFF),
        encode_i(opcode::ADDI, 8, 8, 1),
    ];
    let mut vm = vm_with_text(&words);
    let stop = vm.run();
    assert!(matches!(stop, Stop::Fatal(_)));
}

/// DIV by zero with no handler installed also escalates.
#[test]
fn divide_by_zero_escalates_without_a_handler() {
    let words = [
        encode_i(opcode::ADDIU, 0, 8, 10),
        encode_r(8, 0, 0, 0, funct::DIV), // regs[rt]=regs[0]=0
    ];
    let mut vm = vm_with_text(&words);
    let stop = vm.run();
    assert!(matches!(stop, Stop::Fatal(_)));
}

/// JAL into a callee that immediately JRs back via $ra lands on the
/// instruction right after the JAL.
#[test]
fn jal_then_jr_returns_past_the_call_site() {
    // layout: JAL callee; NOP; callee: JR $ra
    let words = [
        (opcode::JAL << 26) | 0x0010_0002, // target = 0x00400008 (see jump_target math)
        0,                                 // delay-slot-equivalent NOP (this ISA has none, just padding)
        encode_r(reg::RA, 0, 0, 0, funct::JR),
    ];
    let mut vm = vm_with_text(&words);
    vm.run();
    assert_eq!(vm.regs.gpr[reg::RA], TEXT_BASE + 4);
}

/// A registered custom syscall is entered with a saved frame, and the
/// dedicated return syscall pops it and resumes the caller.
///
/// The handler lives before the registration/invoke sequence, reached only
/// via the initial unconditional jump and the custom-syscall invoke itself
/// — never by straight-line fallthrough — so the continuation instruction
/// right after the invoking `SYSCALL` runs exactly once, on return, with
/// nothing left to execute afterward but the end of the segment.
#[test]
fn custom_syscall_registration_round_trips() {
    let callee_addr = TEXT_BASE + 4; // handler body, word index 1
    let main_addr = TEXT_BASE + 12; // word index 3
    let words = [
        encode_j(opcode::J, main_addr),
        encode_i(opcode::ADDIU, 0, reg::V0, 50), // handler: v0 = 50 (syscall_return)
        encode_r(0, 0, 0, 0, funct::SYSCALL),    // handler: syscall_return
        encode_i(opcode::ADDIU, 0, reg::V0, 49), // main: v0 = 49 (register_syscall)
        encode_i(opcode::ADDIU, 0, reg::A0, 77), // a0 = 77 (the syscall number to register)
        encode_i(opcode::LUI, 0, reg::A1, (callee_addr >> 16) as u16),
        encode_i(opcode::ORI, reg::A1, reg::A1, (callee_addr & 0xFFFF) as u16),
        encode_r(0, 0, 0, 0, funct::SYSCALL),    // register_syscall
        encode_i(opcode::ADDIU, 0, reg::V0, 77),
        encode_r(0, 0, 0, 0, funct::SYSCALL),    // invoke custom syscall 77
        encode_i(opcode::ADDIU, 0, 8, 0x1234),   // continuation, reached only on return
    ];
    let mut vm = vm_with_text(&words);
    let stop = vm.run();
    assert!(matches!(stop, Stop::RanOffEnd));
    assert_eq!(vm.regs.gpr[8], 0x1234);
}

/// Installing a `.ktext` handler at the exception vector makes
/// arithmetic overflow deliver into kernel mode instead of aborting, and
/// `ERET` returns cleanly.
#[test]
fn exception_handler_catches_overflow_and_eret_returns() {
    let user_words = [
        encode_i(opcode::LUI, 0, 8, 0x7FFF),
        encode_i(opcode::ORI, 8, 8, 0xFFFF),
        encode_i(opcode::ADDI, 8, 8, 1), // overflows, traps to 0x80000180
    ];
    // Skip past the faulting instruction before returning, or ERET would
    // land right back on it and re-trap forever: MFC0 $t1,$14; ADDIU
    // $t1,$t1,4; MTC0 $t1,$14; ERET.
    let handler_words = [
        encode_cop0(0, 9, 14, 0),          // MFC0 $t1, $14 (epc)
        encode_i(opcode::ADDIU, 9, 9, 4),  // $t1 += 4
        encode_cop0(4, 9, 14, 0),          // MTC0 $t1, $14
        encode_cop0(0, 0, 0, funct::ERET), // ERET
    ];

    let table = SegmentTable {
        text: Segment::new(TEXT_BASE, assemble(&user_words), SegmentFlags::EXECUTABLE),
        data: Segment::new(0x1001_0000, vec![0; 0x10], SegmentFlags::MUTABLE),
        ktext: Segment::new(0x8000_0180, assemble(&handler_words), SegmentFlags::EXECUTABLE | SegmentFlags::KERNEL),
        kdata: Segment::new(0x9000_0000, vec![], SegmentFlags::MUTABLE | SegmentFlags::KERNEL),
        heap: Segment::new(SBRK_HEAP_START, vec![], SegmentFlags::MUTABLE),
        stack: Segment::new(STACK_BASE, vec![0; STACK_SIZE as usize], SegmentFlags::MUTABLE),
        mmio: Segment::new(MMIO_BASE, vec![0; MMIO_WORDS * 4], SegmentFlags::MUTABLE),
    };
    let mut regs = RegisterFile::new();
    regs.pc = TEXT_BASE;
    let mut vm = Vm::new(table, regs);
    assert!(vm.has_exception_handler);

    let stop = vm.run();
    // The handler advances epc past the faulting ADDI and ERETs; pc then
    // lands exactly on the end of `.text`, a clean drop-off rather than an
    // escalation to Fatal.
    assert!(matches!(stop, Stop::RanOffEnd));
    assert!(!vm.kernel_mode);
    assert_eq!(vm.regs.epc, TEXT_BASE + 12);
}

#[test]
fn exception_kind_drives_cause_register_shift() {
    assert_eq!(ExceptionKind::ArithmeticOverflow.code() << 2, 48);
}
