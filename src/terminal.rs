//! Host terminal mode toggling and the non-blocking stdin poll behind the
//! keyboard interrupt source (§4.8).
//!
//! Raw/cooked mode switching is real only on unix, mirroring the termios
//! dance the reference testing harness does around its serial backend; on
//! other platforms this degrades to a no-op so the crate still builds, but
//! the interpreter's *logic* (poll cadence, MMIO word semantics) is
//! identical on every target.

#[cfg(unix)]
mod imp {
    use nix::poll::{poll, PollFd, PollFlags};
    use nix::sys::termios::{self, SetArg};
    use std::io::Read;
    use std::os::fd::{AsFd, BorrowedFd};

    pub struct Terminal {
        raw: bool,
        original: Option<termios::Termios>,
    }

    impl Terminal {
        pub fn new() -> Self {
            Self {
                raw: false,
                original: termios::tcgetattr(std::io::stdin().as_fd()).ok(),
            }
        }

        pub fn set_raw(&mut self, raw: bool) {
            if raw == self.raw {
                return;
            }
            let stdin = std::io::stdin();
            let fd = stdin.as_fd();
            if raw {
                if let Ok(mut attrs) = termios::tcgetattr(fd) {
                    termios::cfmakeraw(&mut attrs);
                    let _ = termios::tcsetattr(fd, SetArg::TCSANOW, &attrs);
                }
            } else if let Some(ref original) = self.original {
                let _ = termios::tcsetattr(fd, SetArg::TCSANOW, original);
            }
            self.raw = raw;
        }

        /// Non-blocking single-byte read; `Ok(None)` if nothing is pending.
        pub fn try_read_byte(&mut self) -> Option<u8> {
            let stdin = std::io::stdin();
            let fd: BorrowedFd = stdin.as_fd();
            let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
            match poll(&mut fds, 0u16) {
                Ok(n) if n > 0 => {
                    let mut byte = [0u8; 1];
                    std::io::stdin().lock().read_exact(&mut byte).ok()?;
                    Some(byte[0])
                }
                _ => None,
            }
        }

        pub fn restore(&mut self) {
            self.set_raw(false);
        }
    }

    impl Default for Terminal {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Drop for Terminal {
        fn drop(&mut self) {
            self.restore();
        }
    }
}

#[cfg(not(unix))]
mod imp {
    pub struct Terminal {
        raw: bool,
    }

    impl Terminal {
        pub fn new() -> Self {
            Self { raw: false }
        }

        pub fn set_raw(&mut self, raw: bool) {
            self.raw = raw;
        }

        pub fn try_read_byte(&mut self) -> Option<u8> {
            None
        }

        pub fn restore(&mut self) {
            self.raw = false;
        }
    }

    impl Default for Terminal {
        fn default() -> Self {
            Self::new()
        }
    }
}

pub use imp::Terminal;

/// MMIO word offsets within the keyboard device block at `0xFFFF0000`.
pub mod mmio {
    pub const CONTROL: u32 = 0;
    pub const DATA: u32 = 4;
    pub const ENABLE_BIT: u32 = 1 << 1;
}

/// How often (in ticks) the keyboard device is sampled while enabled.
pub const POLL_INTERVAL_TICKS: u64 = 5;
