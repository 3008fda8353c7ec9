//! Opcode/funct/trapi/coprocessor dispatch — the architectural effect of
//! every required instruction.
//!
//! Each handler returns `Ok(true)` to let the run loop advance `pc` by 4,
//! `Ok(false)` when it already wrote `pc` itself (branches, jumps, ERET),
//! or `Err(Trap)` to raise an architectural exception.

use crate::error::VmFatalError;
use crate::instruction::{funct, opcode, reg, trapi, Instruction};
use crate::segment::SegmentFlags;
use crate::trap::{ExceptionKind, Trap, VmException};
use crate::vm::Vm;

impl Vm {
    pub(crate) fn dispatch(&mut self, inst: Instruction) -> Result<bool, Trap> {
        match inst.opcode() {
            opcode::R_FORMAT => self.dispatch_funct(inst),
            opcode::TRAPI => self.dispatch_trapi(inst),
            opcode::J => {
                self.regs.pc = jump_target(inst, self.regs.pc);
                Ok(false)
            }
            opcode::JAL => {
                self.regs.gpr[reg::RA] = self.regs.pc.wrapping_add(4);
                self.regs.pc = jump_target(inst, self.regs.pc);
                Ok(false)
            }
            opcode::BEQ => self.dispatch_branch(inst, |a, b| a == b),
            opcode::BNE => self.dispatch_branch(inst, |a, b| a != b),
            opcode::BLEZ => self.dispatch_branch_rs_only(inst, |a| (a as i32) <= 0),
            opcode::BGTZ => self.dispatch_branch_rs_only(inst, |a| (a as i32) > 0),
            opcode::ADDI => {
                let a = self.regs.gpr[inst.rs()] as i32;
                let (result, overflow) = a.overflowing_add(inst.simm16());
                if overflow {
                    return Err(self.overflow_trap());
                }
                self.regs.gpr[inst.rt()] = result as u32;
                Ok(true)
            }
            opcode::ADDIU => {
                self.regs.gpr[inst.rt()] = self.regs.gpr[inst.rs()].wrapping_add(inst.imm16());
                Ok(true)
            }
            opcode::SLTI => {
                let a = self.regs.gpr[inst.rs()] as i32;
                self.regs.gpr[inst.rt()] = (a < inst.simm16()) as u32;
                Ok(true)
            }
            opcode::SLTIU => {
                self.regs.gpr[inst.rt()] = (self.regs.gpr[inst.rs()] < inst.imm16()) as u32;
                Ok(true)
            }
            opcode::ANDI => {
                self.regs.gpr[inst.rt()] = self.regs.gpr[inst.rs()] & inst.imm16();
                Ok(true)
            }
            opcode::ORI => {
                self.regs.gpr[inst.rt()] = self.regs.gpr[inst.rs()] | inst.imm16();
                Ok(true)
            }
            opcode::LUI => {
                self.regs.gpr[inst.rt()] = inst.imm16() << 16;
                Ok(true)
            }
            opcode::COP0 => self.dispatch_cop0(inst),
            opcode::COP1 => {
                let fp_index = inst.rd();
                match inst.rs() {
                    0 => self.regs.gpr[inst.rt()] = self.regs.f32(fp_index).to_bits(),
                    4 => self.regs.set_f32(fp_index, f32::from_bits(self.regs.gpr[inst.rt()])),
                    other => return Err(Trap::Fatal(VmFatalError::InvalidCoprocessorMove(other as u32))),
                }
                Ok(true)
            }
            opcode::MUL => {
                self.regs.gpr[inst.rd()] =
                    self.regs.gpr[inst.rs()].wrapping_mul(self.regs.gpr[inst.rt()]);
                Ok(true)
            }
            opcode::LB => self.load(inst, 1, true),
            opcode::LH => self.load(inst, 2, true),
            opcode::LW => self.load(inst, 4, true),
            opcode::LBU => self.load(inst, 1, false),
            opcode::LHU => self.load(inst, 2, false),
            opcode::SB => self.store(inst, 1),
            opcode::SH => self.store(inst, 2),
            opcode::SW => self.store(inst, 4),
            other => Err(self.reserved_opcode(other, 0, inst)),
        }
    }

    fn dispatch_funct(&mut self, inst: Instruction) -> Result<bool, Trap> {
        let a = self.regs.gpr[inst.rs()];
        let b = self.regs.gpr[inst.rt()];
        match inst.funct() {
            funct::SLL => {
                self.regs.gpr[inst.rd()] = b << inst.shift();
                Ok(true)
            }
            funct::SRL => {
                self.regs.gpr[inst.rd()] = b >> inst.shift();
                Ok(true)
            }
            funct::SRA => {
                self.regs.gpr[inst.rd()] = ((b as i32) >> inst.shift()) as u32;
                Ok(true)
            }
            funct::JR => {
                self.regs.pc = a;
                Ok(false)
            }
            funct::JALR => {
                self.regs.gpr[reg::RA] = self.regs.pc.wrapping_add(4);
                self.regs.pc = a;
                Ok(false)
            }
            funct::SYSCALL => self.dispatch_syscall(),
            funct::BREAK => Err(VmException::new(ExceptionKind::Breakpoint, "BREAK").into()),
            funct::MFHI => {
                self.regs.gpr[inst.rd()] = self.regs.hi;
                Ok(true)
            }
            funct::MTHI => {
                self.regs.hi = a;
                Ok(true)
            }
            funct::MFLO => {
                self.regs.gpr[inst.rd()] = self.regs.lo;
                Ok(true)
            }
            funct::MTLO => {
                self.regs.lo = a;
                Ok(true)
            }
            funct::MULT => {
                let product = (a as i32 as i64).wrapping_mul(b as i32 as i64);
                self.regs.lo = product as u32;
                self.regs.hi = (product >> 32) as u32;
                Ok(true)
            }
            funct::MULTU => {
                let product = (a as u64).wrapping_mul(b as u64);
                self.regs.lo = product as u32;
                self.regs.hi = (product >> 32) as u32;
                Ok(true)
            }
            funct::DIV => {
                if b == 0 {
                    return Err(VmException::new(ExceptionKind::DivideByZero, "DIV by zero").into());
                }
                let (a, b) = (a as i32, b as i32);
                self.regs.lo = a.wrapping_div(b) as u32;
                self.regs.hi = a.wrapping_rem(b) as u32;
                Ok(true)
            }
            funct::DIVU => {
                if b == 0 {
                    return Err(VmException::new(ExceptionKind::DivideByZero, "DIVU by zero").into());
                }
                self.regs.lo = a / b;
                self.regs.hi = a % b;
                Ok(true)
            }
            funct::ADD => {
                let (result, overflow) = (a as i32).overflowing_add(b as i32);
                if overflow {
                    return Err(self.overflow_trap());
                }
                self.regs.gpr[inst.rd()] = result as u32;
                Ok(true)
            }
            funct::ADDU => {
                self.regs.gpr[inst.rd()] = a.wrapping_add(b);
                Ok(true)
            }
            funct::SUB => {
                let (result, overflow) = (a as i32).overflowing_sub(b as i32);
                if overflow {
                    return Err(self.overflow_trap());
                }
                self.regs.gpr[inst.rd()] = result as u32;
                Ok(true)
            }
            funct::SUBU => {
                self.regs.gpr[inst.rd()] = a.wrapping_sub(b);
                Ok(true)
            }
            funct::AND => {
                self.regs.gpr[inst.rd()] = a & b;
                Ok(true)
            }
            funct::OR => {
                self.regs.gpr[inst.rd()] = a | b;
                Ok(true)
            }
            funct::XOR => {
                self.regs.gpr[inst.rd()] = a ^ b;
                Ok(true)
            }
            funct::NOR => {
                self.regs.gpr[inst.rd()] = !(a | b);
                Ok(true)
            }
            funct::SLT => {
                self.regs.gpr[inst.rd()] = ((a as i32) < (b as i32)) as u32;
                Ok(true)
            }
            funct::SLTU => {
                self.regs.gpr[inst.rd()] = (a < b) as u32;
                Ok(true)
            }
            funct::TGE => self.trap_if(a as i32 >= b as i32),
            funct::TGEU => self.trap_if(a >= b),
            funct::TLT => self.trap_if((a as i32) < (b as i32)),
            funct::TLTU => self.trap_if(a < b),
            funct::TEQ => self.trap_if(a == b),
            funct::TNE => self.trap_if(a != b),
            other => Err(self.reserved_opcode(opcode::R_FORMAT, other, inst)),
        }
    }

    fn dispatch_trapi(&mut self, inst: Instruction) -> Result<bool, Trap> {
        let a = self.regs.gpr[inst.rs()];
        let simm = inst.simm16();
        let imm = inst.imm16();
        match inst.rt() as u32 {
            trapi::TGEI => self.trap_if(a as i32 >= simm),
            trapi::TGEIU => self.trap_if(a >= imm),
            trapi::TLTI => self.trap_if((a as i32) < simm),
            trapi::TLTIU => self.trap_if(a < imm),
            trapi::TEQI => self.trap_if(a as i32 == simm),
            trapi::TNEI => self.trap_if(a as i32 != simm),
            other => Err(self.reserved_opcode(opcode::TRAPI, other, inst)),
        }
    }

    fn dispatch_cop0(&mut self, inst: Instruction) -> Result<bool, Trap> {
        if inst.funct() == funct::ERET {
            self.regs.pc = self.regs.epc;
            self.kernel_mode = false;
            return Ok(false);
        }
        let cop0_index = inst.rd() as u32;
        match inst.rs() {
            0 => {
                let value = self
                    .regs
                    .cop0_get(cop0_index)
                    .ok_or(VmFatalError::InvalidCoprocessor0Register(cop0_index))?;
                self.regs.gpr[inst.rt()] = value;
            }
            4 => {
                if !self.regs.cop0_set(cop0_index, self.regs.gpr[inst.rt()]) {
                    return Err(Trap::Fatal(VmFatalError::InvalidCoprocessor0Register(cop0_index)));
                }
            }
            other => return Err(Trap::Fatal(VmFatalError::InvalidCoprocessorMove(other as u32))),
        }
        Ok(true)
    }

    fn dispatch_branch(&mut self, inst: Instruction, cond: impl Fn(u32, u32) -> bool) -> Result<bool, Trap> {
        let a = self.regs.gpr[inst.rs()];
        let b = self.regs.gpr[inst.rt()];
        if cond(a, b) {
            self.regs.pc = self.regs.pc.wrapping_add(4).wrapping_add((inst.simm16() * 4) as u32);
        } else {
            self.regs.pc = self.regs.pc.wrapping_add(4);
        }
        Ok(false)
    }

    fn dispatch_branch_rs_only(&mut self, inst: Instruction, cond: impl Fn(u32) -> bool) -> Result<bool, Trap> {
        let a = self.regs.gpr[inst.rs()];
        if cond(a) {
            self.regs.pc = self.regs.pc.wrapping_add(4).wrapping_add((inst.simm16() * 4) as u32);
        } else {
            self.regs.pc = self.regs.pc.wrapping_add(4);
        }
        Ok(false)
    }

    fn trap_if(&self, condition: bool) -> Result<bool, Trap> {
        if condition {
            Err(VmException::new(ExceptionKind::Trap, "T-family trap condition held").into())
        } else {
            Ok(true)
        }
    }

    fn overflow_trap(&self) -> Trap {
        VmException::new(ExceptionKind::ArithmeticOverflow, "signed result overflowed 32 bits").into()
    }

    fn reserved(&self, inst: Instruction, err: VmFatalError) -> Trap {
        tracing::warn!(pc = self.regs.pc, %inst, %err, "reserved/invalid instruction");
        VmException::new(ExceptionKind::ReservedInstruction, err.to_string()).into()
    }

    fn reserved_opcode(&self, opcode: u32, funct: u32, inst: Instruction) -> Trap {
        self.reserved(
            inst,
            VmFatalError::ReservedInstruction {
                opcode,
                funct,
                pc: self.regs.pc,
            },
        )
    }

    fn load(&mut self, inst: Instruction, size: u32, sign_extend: bool) -> Result<bool, Trap> {
        let addr = self.regs.gpr[inst.rs()].wrapping_add(inst.simm16() as u32);
        let value = self.read_memory(addr, size).map_err(|_| {
            VmException::new(ExceptionKind::LoadAddress, format!("bad load at 0x{addr:08X}")).with_vaddr(addr)
        })?;
        let extended = match (size, sign_extend) {
            (1, true) => value as u8 as i8 as i32 as u32,
            (1, false) => value as u8 as u32,
            (2, true) => value as u16 as i16 as i32 as u32,
            (2, false) => value as u16 as u32,
            _ => value,
        };
        self.regs.gpr[inst.rt()] = extended;
        Ok(true)
    }

    fn store(&mut self, inst: Instruction, size: u32) -> Result<bool, Trap> {
        let addr = self.regs.gpr[inst.rs()].wrapping_add(inst.simm16() as u32);
        let value = self.regs.gpr[inst.rt()];
        self.write_memory(addr, size, value).map_err(|_| {
            VmException::new(ExceptionKind::StoreAddress, format!("bad store at 0x{addr:08X}")).with_vaddr(addr)
        })?;
        Ok(true)
    }

    /// Reads `size` little-endian bytes at `addr` from whichever segment
    /// resolves it, failing if the segment can't be found or the range
    /// doesn't fully fit.
    pub(crate) fn read_memory(&self, addr: u32, size: u32) -> Result<u32, ()> {
        if addr == 0 {
            return Err(());
        }
        let segment = self.segments.resolve(addr, self.kernel_mode).ok_or(())?;
        if !segment.contains_range(addr, size) {
            return Err(());
        }
        let offset = (addr - segment.base) as usize;
        let mut buf = [0u8; 4];
        buf[..size as usize].copy_from_slice(&segment.bytes[offset..offset + size as usize]);
        Ok(u32::from_le_bytes(buf))
    }

    pub(crate) fn write_memory(&mut self, addr: u32, size: u32, value: u32) -> Result<(), ()> {
        if addr == 0 {
            return Err(());
        }
        let segment = self.segments.resolve_mut(addr, self.kernel_mode).ok_or(())?;
        if !segment.flags.contains(SegmentFlags::MUTABLE) || !segment.contains_range(addr, size) {
            return Err(());
        }
        let offset = (addr - segment.base) as usize;
        let bytes = value.to_le_bytes();
        segment.bytes[offset..offset + size as usize].copy_from_slice(&bytes[..size as usize]);
        Ok(())
    }
}

fn jump_target(inst: Instruction, pc: u32) -> u32 {
    (inst.jump_pseudo_addr() << 2) | (pc.wrapping_add(4) & 0xF000_0000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::RegisterFile;
    use crate::segment::{Segment, SegmentTable, MMIO_BASE, MMIO_WORDS, SBRK_HEAP_START, STACK_BASE, STACK_SIZE};

    fn test_vm(text: Vec<u8>) -> Vm {
        let table = SegmentTable {
            text: Segment::new(0x0040_0000, text, SegmentFlags::EXECUTABLE),
            data: Segment::new(0x1001_0000, vec![0; 0x1000], SegmentFlags::MUTABLE),
            ktext: Segment::new(0x8000_0000, vec![], SegmentFlags::EXECUTABLE | SegmentFlags::KERNEL),
            kdata: Segment::new(0x9000_0000, vec![], SegmentFlags::MUTABLE | SegmentFlags::KERNEL),
            heap: Segment::new(SBRK_HEAP_START, vec![], SegmentFlags::MUTABLE),
            stack: Segment::new(STACK_BASE, vec![0; STACK_SIZE as usize], SegmentFlags::MUTABLE),
            mmio: Segment::new(MMIO_BASE, vec![0; MMIO_WORDS * 4], SegmentFlags::MUTABLE),
        };
        let mut regs = RegisterFile::new();
        regs.pc = 0x0040_0000;
        Vm::new(table, regs)
    }

    fn encode_i(op: u32, rs: usize, rt: usize, imm: u16) -> u32 {
        (op << 26) | ((rs as u32) << 21) | ((rt as u32) << 16) | imm as u32
    }

    fn encode_r(rs: usize, rt: usize, rd: usize, shamt: u32, f: u32) -> u32 {
        ((rs as u32) << 21) | ((rt as u32) << 16) | ((rd as u32) << 11) | (shamt << 6) | f
    }

    #[test]
    fn addiu_then_add_overflow_detects_signed_wraparound() {
        let mut words = Vec::new();
        // LUI $t0, 0x7FFF
        words.extend_from_slice(&encode_i(opcode::LUI, 0, 8, 0x7FFF).to_le_bytes());
        // ORI $t0, $t0, 0xFFFF
        words.extend_from_slice(&encode_i(opcode::ORI, 8, 8, 0xFFFF).to_le_bytes());
        // ADDI $t0, $t0, 1
        words.extend_from_slice(&encode_i(opcode::ADDI, 8, 8, 1).to_le_bytes());
        let mut vm = test_vm(words);

        assert!(vm.dispatch(Instruction::new(u32::from_le_bytes([
            vm.segments.text.bytes[0],
            vm.segments.text.bytes[1],
            vm.segments.text.bytes[2],
            vm.segments.text.bytes[3],
        ]))).unwrap());
        vm.regs.pc += 4;
        assert!(vm.dispatch(Instruction::new(u32::from_le_bytes([
            vm.segments.text.bytes[4],
            vm.segments.text.bytes[5],
            vm.segments.text.bytes[6],
            vm.segments.text.bytes[7],
        ]))).unwrap());
        vm.regs.pc += 4;
        assert_eq!(vm.regs.gpr[8], 0x7FFF_FFFF);

        let result = vm.dispatch(Instruction::new(u32::from_le_bytes([
            vm.segments.text.bytes[8],
            vm.segments.text.bytes[9],
            vm.segments.text.bytes[10],
            vm.segments.text.bytes[11],
        ])));
        assert!(matches!(
            result,
            Err(Trap::Exception(crate::trap::VmException {
                kind: ExceptionKind::ArithmeticOverflow,
                ..
            }))
        ));
    }

    #[test]
    fn divu_by_zero_raises_divide_by_zero() {
        let mut vm = test_vm(vec![0; 4]);
        vm.regs.gpr[9] = 0;
        let inst = Instruction::new(encode_r(8, 9, 0, 0, funct::DIVU));
        let result = vm.dispatch(inst);
        assert!(matches!(
            result,
            Err(Trap::Exception(crate::trap::VmException {
                kind: ExceptionKind::DivideByZero,
                ..
            }))
        ));
    }

    #[test]
    fn sw_then_lw_round_trips_through_the_heap_segment() {
        let mut vm = test_vm(vec![0; 4]);
        vm.segments.heap.bytes = vec![0; 16];
        vm.regs.gpr[8] = SBRK_HEAP_START;
        vm.regs.gpr[9] = 0xDEAD_BEEF;
        let sw = Instruction::new(encode_i(opcode::SW, 8, 9, 0));
        vm.dispatch(sw).unwrap();
        let lw = Instruction::new(encode_i(opcode::LW, 8, 10, 0));
        vm.dispatch(lw).unwrap();
        assert_eq!(vm.regs.gpr[10], 0xDEAD_BEEF);
    }

    #[test]
    fn jal_sets_return_address_and_target() {
        let mut vm = test_vm(vec![0; 4]);
        vm.regs.pc = 0x0040_0000;
        let inst = Instruction::new((opcode::JAL << 26) | 0x0010_0000);
        let advance = vm.dispatch(inst).unwrap();
        assert!(!advance);
        assert_eq!(vm.regs.gpr[reg::RA], 0x0040_0004);
        assert_eq!(vm.regs.pc, 0x0040_0000);
    }

    proptest::proptest! {
        /// ADD raises ArithmeticOverflow iff the true signed sum escapes i32,
        /// and otherwise wraps exactly like a native `i32` add.
        #[test]
        fn add_overflows_iff_true_sum_escapes_i32(a: i32, b: i32) {
            let mut vm = test_vm(vec![0; 4]);
            vm.regs.gpr[8] = a as u32;
            vm.regs.gpr[9] = b as u32;
            let inst = Instruction::new(encode_r(8, 9, 10, 0, funct::ADD));
            let result = vm.dispatch(inst);
            let true_sum_escapes = a.checked_add(b).is_none();

            if true_sum_escapes {
                prop_assert!(matches!(
                    result,
                    Err(Trap::Exception(VmException { kind: ExceptionKind::ArithmeticOverflow, .. }))
                ));
            } else {
                prop_assert_eq!(result.unwrap(), true);
                prop_assert_eq!(vm.regs.gpr[10], a.wrapping_add(b) as u32);
            }
        }

        /// ADDU never overflows and always obeys 32-bit wraparound.
        #[test]
        fn addu_never_overflows(a: u32, b: u32) {
            let mut vm = test_vm(vec![0; 4]);
            vm.regs.gpr[8] = a;
            vm.regs.gpr[9] = b;
            let inst = Instruction::new(encode_r(8, 9, 10, 0, funct::ADDU));
            let result = vm.dispatch(inst);
            prop_assert_eq!(result.unwrap(), true);
            prop_assert_eq!(vm.regs.gpr[10], a.wrapping_add(b));
        }

        /// `SB`/`LBU`/`LB` round-trip any byte at any in-range heap offset,
        /// with the expected zero- and sign-extension on the way back in.
        #[test]
        fn store_byte_then_load_round_trips(byte: u8, offset in 0u32..0x80) {
            let mut vm = test_vm(vec![0; 4]);
            vm.segments.heap.bytes = vec![0; 0x100];
            vm.regs.gpr[reg::V0] = SBRK_HEAP_START + offset;
            vm.regs.gpr[9] = byte as u32;

            let sb = Instruction::new(encode_i(opcode::SB, reg::V0, 9, 0));
            vm.dispatch(sb).unwrap();

            let lbu = Instruction::new(encode_i(opcode::LBU, reg::V0, 10, 0));
            vm.dispatch(lbu).unwrap();
            prop_assert_eq!(vm.regs.gpr[10], byte as u32);

            let lb = Instruction::new(encode_i(opcode::LB, reg::V0, 11, 0));
            vm.dispatch(lb).unwrap();
            prop_assert_eq!(vm.regs.gpr[11], byte as i8 as i32 as u32);
        }
    }
}
