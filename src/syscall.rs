//! Environment services dispatched by `regs[v0]` (§4.7).
//!
//! Every handler reads its arguments from `a0`/`a1`/`a2` and returns
//! `Ok(true)` so the run loop advances past the `syscall` instruction, or
//! `Err(Trap)` for the handful of syscalls that can fault or terminate.

use std::io::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::files::open_mode;
use crate::instruction::reg;
use crate::trap::{ExceptionKind, SyscallFrame, Trap, VmException};
use crate::vm::Vm;

mod num {
    pub const PRINT_INT: u32 = 1;
    pub const PRINT_FLOAT: u32 = 2;
    pub const PRINT_DOUBLE: u32 = 3;
    pub const PRINT_STRING: u32 = 4;
    pub const READ_INT: u32 = 5;
    pub const READ_FLOAT: u32 = 6;
    pub const READ_DOUBLE: u32 = 7;
    pub const READ_STRING: u32 = 8;
    pub const SBRK: u32 = 9;
    pub const EXIT: u32 = 10;
    pub const PRINT_CHAR: u32 = 11;
    pub const READ_CHAR: u32 = 12;
    pub const OPEN_FILE: u32 = 13;
    pub const READ_FILE: u32 = 14;
    pub const WRITE_FILE: u32 = 15;
    pub const CLOSE_FILE: u32 = 16;
    pub const EXIT2: u32 = 17;
    pub const TIME: u32 = 30;
    pub const SLEEP: u32 = 32;
    pub const PRINT_HEX: u32 = 34;
    pub const PRINT_BINARY: u32 = 35;
    pub const PRINT_UNSIGNED: u32 = 36;
    pub const SET_SEED: u32 = 40;
    pub const RAND_INT: u32 = 41;
    pub const RAND_INT_RANGE: u32 = 42;
    pub const RAND_FLOAT: u32 = 43;
    pub const RAND_DOUBLE: u32 = 44;
    pub const REGISTER_SYSCALL: u32 = 49;
    pub const SYSCALL_RETURN: u32 = 50;
}

impl Vm {
    pub(crate) fn dispatch_syscall(&mut self) -> Result<bool, Trap> {
        let code = self.regs.gpr[reg::V0];
        let a0 = self.regs.gpr[reg::A0];
        let a1 = self.regs.gpr[reg::A1];
        let a2 = self.regs.gpr[reg::A2];

        match code {
            num::PRINT_INT => {
                print!("{}", a0 as i32);
                let _ = std::io::stdout().flush();
                Ok(true)
            }
            num::PRINT_FLOAT => {
                print!("{}", self.regs.f32(12));
                let _ = std::io::stdout().flush();
                Ok(true)
            }
            num::PRINT_DOUBLE => {
                print!("{}", self.regs.f64(6));
                let _ = std::io::stdout().flush();
                Ok(true)
            }
            num::PRINT_STRING => {
                let s = self.read_c_string(a0)?;
                print!("{s}");
                let _ = std::io::stdout().flush();
                Ok(true)
            }
            num::READ_INT => {
                let line = read_stdin_line();
                self.regs.gpr[reg::V0] = line.trim().parse::<i32>().unwrap_or(0) as u32;
                Ok(true)
            }
            num::READ_FLOAT => {
                let line = read_stdin_line();
                self.regs.set_f32(0, line.trim().parse::<f32>().unwrap_or(0.0));
                Ok(true)
            }
            num::READ_DOUBLE => {
                let line = read_stdin_line();
                self.regs.set_f64(0, line.trim().parse::<f64>().unwrap_or(0.0));
                Ok(true)
            }
            num::READ_STRING => self.syscall_read_string(a0, a1),
            num::SBRK => {
                let addr = self.heap.sbrk(a0 as i32)?;
                self.regs.gpr[reg::V0] = addr;
                self.grow_heap_backing();
                Ok(true)
            }
            num::EXIT => Err(Trap::Exit { status: 0 }),
            num::PRINT_CHAR => {
                print!("{}", a0 as u8 as char);
                let _ = std::io::stdout().flush();
                Ok(true)
            }
            num::READ_CHAR => {
                let mut byte = [0u8; 1];
                let _ = std::io::stdin().read_exact_compat(&mut byte);
                self.regs.gpr[reg::V0] = byte[0] as u32;
                Ok(true)
            }
            num::OPEN_FILE => {
                let path = self.read_c_string(a0)?;
                let fd = self.files.open(&path, a1 as i32);
                let _ = a2; // advisory permission mode, unused by the host open
                self.regs.gpr[reg::V0] = fd as u32;
                Ok(true)
            }
            num::READ_FILE => {
                let fd = a0 as i32;
                let len = a2 as usize;
                let mut buf = vec![0u8; len];
                let n = self.files.read(fd, &mut buf);
                if n > 0 {
                    self.write_bytes(a1, &buf[..n as usize])
                        .map_err(|_| self.memory_trap(ExceptionKind::StoreAddress, a1))?;
                }
                self.regs.gpr[reg::V0] = n as u32;
                Ok(true)
            }
            num::WRITE_FILE => {
                let fd = a0 as i32;
                let len = a2 as usize;
                let mut buf = vec![0u8; len];
                self.read_bytes(a1, &mut buf)
                    .map_err(|_| self.memory_trap(ExceptionKind::LoadAddress, a1))?;
                let n = self.files.write(fd, &buf);
                self.regs.gpr[reg::V0] = n as u32;
                Ok(true)
            }
            num::CLOSE_FILE => {
                self.regs.gpr[reg::V0] = self.files.close(a0 as i32) as u32;
                Ok(true)
            }
            num::EXIT2 => Err(Trap::Exit { status: a0 as i32 }),
            num::TIME => {
                let millis = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis())
                    .unwrap_or(0);
                self.regs.gpr[reg::A0] = millis as u32;
                self.regs.gpr[reg::A1] = (millis >> 32) as u32;
                Ok(true)
            }
            num::SLEEP => {
                std::thread::sleep(std::time::Duration::from_millis(a0 as u64));
                Ok(true)
            }
            num::PRINT_HEX => {
                print!("0x{a0:08X}");
                let _ = std::io::stdout().flush();
                Ok(true)
            }
            num::PRINT_BINARY => {
                print!("{a0:032b}");
                let _ = std::io::stdout().flush();
                Ok(true)
            }
            num::PRINT_UNSIGNED => {
                print!("{a0}");
                let _ = std::io::stdout().flush();
                Ok(true)
            }
            num::SET_SEED => {
                self.rng.set_seed(a0, a1);
                Ok(true)
            }
            num::RAND_INT => {
                let v = self.rng.next_u32(a0);
                self.regs.gpr[reg::A0] = v;
                Ok(true)
            }
            num::RAND_INT_RANGE => {
                let v = self.rng.next_u32_range(a0, a1 as i32, a2 as i32);
                self.regs.gpr[reg::A0] = v as u32;
                Ok(true)
            }
            num::RAND_FLOAT => {
                let v = self.rng.next_f32(a0);
                self.regs.set_f32(0, v);
                Ok(true)
            }
            num::RAND_DOUBLE => {
                let v = self.rng.next_f64(a0);
                self.regs.set_f64(0, v);
                Ok(true)
            }
            num::REGISTER_SYSCALL => {
                self.custom_syscalls.register(a0, a1);
                Ok(true)
            }
            num::SYSCALL_RETURN => {
                let frame = self
                    .custom_syscalls
                    .pop_frame()
                    .ok_or_else(|| VmException::new(ExceptionKind::Syscall, "no custom syscall frame to return to"))?;
                self.regs.status = frame.status;
                self.regs.cause = frame.cause;
                self.regs.pc = frame.epc;
                Ok(false)
            }
            other => {
                if let Some(target) = self.custom_syscalls.address_for(other) {
                    self.custom_syscalls.push_frame(SyscallFrame {
                        status: self.regs.status,
                        cause: self.regs.cause,
                        epc: self.regs.pc.wrapping_add(4),
                    });
                    self.regs.pc = target;
                    Ok(false)
                } else {
                    Err(VmException::new(ExceptionKind::Syscall, format!("unrecognized syscall {other}")).into())
                }
            }
        }
    }

    fn syscall_read_string(&mut self, dest: u32, max_len: u32) -> Result<bool, Trap> {
        if max_len == 0 {
            return Ok(true);
        }
        let segment = self
            .segments
            .resolve(dest, self.kernel_mode)
            .filter(|s| s.flags.contains(crate::segment::SegmentFlags::MUTABLE) && s.contains_range(dest, max_len))
            .ok_or_else(|| self.memory_trap(ExceptionKind::StoreAddress, dest))?;
        let _ = segment;

        let mut line = read_stdin_line();
        let capacity = (max_len - 1) as usize;
        if line.len() > capacity {
            line.truncate(capacity);
        } else if (line.len() as u32) < max_len {
            line.push('\n');
            line.truncate(capacity);
        }
        line.push('\0');
        self.write_bytes(dest, line.as_bytes())
            .map_err(|_| self.memory_trap(ExceptionKind::StoreAddress, dest))?;
        Ok(true)
    }

    fn read_c_string(&self, addr: u32) -> Result<String, Trap> {
        let segment = self
            .segments
            .resolve(addr, self.kernel_mode)
            .ok_or_else(|| self.memory_trap(ExceptionKind::LoadAddress, addr))?;
        let start = (addr - segment.base) as usize;
        let nul = segment.bytes[start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| self.memory_trap(ExceptionKind::LoadAddress, addr))?;
        Ok(String::from_utf8_lossy(&segment.bytes[start..start + nul]).into_owned())
    }

    fn read_bytes(&self, addr: u32, out: &mut [u8]) -> Result<(), ()> {
        let segment = self.segments.resolve(addr, self.kernel_mode).ok_or(())?;
        if !segment.contains_range(addr, out.len() as u32) {
            return Err(());
        }
        let start = (addr - segment.base) as usize;
        out.copy_from_slice(&segment.bytes[start..start + out.len()]);
        Ok(())
    }

    fn write_bytes(&mut self, addr: u32, data: &[u8]) -> Result<(), ()> {
        let segment = self.segments.resolve_mut(addr, self.kernel_mode).ok_or(())?;
        if !segment.flags.contains(crate::segment::SegmentFlags::MUTABLE)
            || !segment.contains_range(addr, data.len() as u32)
        {
            return Err(());
        }
        let start = (addr - segment.base) as usize;
        segment.bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn memory_trap(&self, kind: ExceptionKind, addr: u32) -> Trap {
        VmException::new(kind, format!("syscall memory fault at 0x{addr:08X}"))
            .with_vaddr(addr)
            .into()
    }

    /// The heap `Segment` backing the sbrk arena grows lazily in step with
    /// the allocator's break so loads/stores see zero-initialized bytes
    /// without pre-reserving the full 48MB up front.
    fn grow_heap_backing(&mut self) {
        let needed = (self.heap.break_addr() - crate::segment::SBRK_HEAP_START) as usize;
        if self.segments.heap.bytes.len() < needed {
            self.segments.heap.bytes.resize(needed, 0);
        }
    }
}

fn read_stdin_line() -> String {
    let mut line = String::new();
    let _ = std::io::stdin().read_line(&mut line);
    line.trim_end_matches(['\n', '\r']).to_string()
}

trait ReadExactCompat {
    fn read_exact_compat(&self, buf: &mut [u8]) -> std::io::Result<()>;
}

impl ReadExactCompat for std::io::Stdin {
    fn read_exact_compat(&self, buf: &mut [u8]) -> std::io::Result<()> {
        use std::io::Read;
        self.lock().read_exact(buf)
    }
}
