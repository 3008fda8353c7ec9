//! Guest-visible file descriptor table.
//!
//! File descriptors 0/1/2 always alias host stdin/stdout/stderr; anything
//! `open`ed gets the next number starting at 3. Reads and writes are
//! all-or-nothing, matching the source's `fread`/`fwrite`-based semantics:
//! a short read below the requested count (but not EOF) or a short write is
//! reported as a hard failure rather than a partial transfer.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};

const FIRST_USER_FD: i32 = 3;

/// Mode byte as passed by the guest to the `open_file` syscall.
pub mod open_mode {
    pub const READ: i32 = 0;
    pub const WRITE: i32 = 1;
    pub const APPEND: i32 = 9;
}

struct OpenFile {
    fd: i32,
    handle: File,
}

/// The guest's open-file table, independent of the host process's own fds.
#[derive(Default)]
pub struct FileTable {
    next_fd: i32,
    files: Vec<OpenFile>,
}

impl FileTable {
    pub fn new() -> Self {
        Self {
            next_fd: FIRST_USER_FD,
            files: Vec::new(),
        }
    }

    /// Opens `path` with the given guest mode, returning the new fd or -1.
    pub fn open(&mut self, path: &str, mode: i32) -> i32 {
        let opened = match mode {
            open_mode::READ => OpenOptions::new().read(true).open(path),
            open_mode::WRITE => OpenOptions::new().write(true).create(true).truncate(true).open(path),
            open_mode::APPEND => OpenOptions::new().append(true).create(true).open(path),
            _ => return -1,
        };
        match opened {
            Ok(handle) => {
                let fd = self.next_fd;
                self.next_fd += 1;
                self.files.push(OpenFile { fd, handle });
                fd
            }
            Err(_) => -1,
        }
    }

    /// Reads exactly `len` bytes into `buf`; returns the count read on a
    /// full read, `0` on a clean EOF, or `-1` on any other failure.
    pub fn read(&mut self, fd: i32, buf: &mut [u8]) -> i32 {
        if fd == 0 {
            return match std::io::stdin().read(buf) {
                Ok(n) if n == buf.len() => n as i32,
                Ok(0) => 0,
                Ok(_) => -1,
                Err(_) => -1,
            };
        }
        let Some(entry) = self.files.iter_mut().find(|f| f.fd == fd) else {
            return -1;
        };
        let mut total = 0usize;
        while total < buf.len() {
            match entry.handle.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(_) => return -1,
            }
        }
        if total == buf.len() {
            total as i32
        } else if total == 0 {
            0
        } else {
            -1
        }
    }

    /// Writes exactly `buf`; returns the byte count on success, `-1` on a
    /// short write or any error.
    pub fn write(&mut self, fd: i32, buf: &[u8]) -> i32 {
        let result = if fd == 1 {
            std::io::stdout().write_all(buf).map(|_| buf.len())
        } else if fd == 2 {
            std::io::stderr().write_all(buf).map(|_| buf.len())
        } else {
            match self.files.iter_mut().find(|f| f.fd == fd) {
                Some(entry) => entry.handle.write_all(buf).map(|_| buf.len()),
                None => return -1,
            }
        };
        match result {
            Ok(n) if n == buf.len() => n as i32,
            _ => -1,
        }
    }

    /// Closes a user-opened fd; closing 0/1/2 or an unknown fd is a no-op
    /// that reports failure, matching the source (stdio handles are never
    /// tracked in the closeable table).
    pub fn close(&mut self, fd: i32) -> i32 {
        if fd < FIRST_USER_FD {
            return -1;
        }
        let before = self.files.len();
        self.files.retain(|f| f.fd != fd);
        if self.files.len() < before {
            0
        } else {
            -1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn open_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scratch.txt");
        let mut table = FileTable::new();

        let wfd = table.open(path.to_str().unwrap(), open_mode::WRITE);
        assert!(wfd >= FIRST_USER_FD);
        assert_eq!(table.write(wfd, b"hello"), 5);
        assert_eq!(table.close(wfd), 0);

        let rfd = table.open(path.to_str().unwrap(), open_mode::READ);
        let mut buf = [0u8; 5];
        assert_eq!(table.read(rfd, &mut buf), 5);
        assert_eq!(&buf, b"hello");

        // a second read past EOF is a clean zero, not an error
        let mut tail = [0u8; 1];
        assert_eq!(table.read(rfd, &mut tail), 0);
    }

    #[test]
    fn short_read_below_eof_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.txt");
        std::fs::File::create(&path).unwrap().write_all(b"ab").unwrap();

        let mut table = FileTable::new();
        let rfd = table.open(path.to_str().unwrap(), open_mode::READ);
        let mut buf = [0u8; 4];
        assert_eq!(table.read(rfd, &mut buf), -1);
    }

    #[test]
    fn close_rejects_stdio_handles() {
        let mut table = FileTable::new();
        assert_eq!(table.close(1), -1);
    }
}
