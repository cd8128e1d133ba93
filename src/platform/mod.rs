//! Operating system glue: raw writes, early memory and the logger.

use core::fmt;

pub mod logger;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;

#[cfg(not(target_os = "linux"))]
mod unsupported;
#[cfg(not(target_os = "linux"))]
pub use self::unsupported::*;

pub const STDERR_FILENO: i32 = 2;

/// Unbuffered writer over a raw file descriptor.
pub struct FileWriter(pub i32);

impl FileWriter {
    pub fn new(fd: i32) -> Self {
        Self(fd)
    }

    pub fn write(&mut self, buf: &[u8]) -> isize {
        write(self.0, buf)
    }
}

impl fmt::Write for FileWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut rest = s.as_bytes();
        while !rest.is_empty() {
            let written = self.write(rest);
            if written <= 0 {
                return Err(fmt::Error);
            }
            rest = &rest[written as usize..];
        }
        Ok(())
    }
}

/// Sink for `generic_rt::write_notls`, usable before and without TLS.
pub fn stderr_sink(bytes: &[u8]) {
    let _ = fmt::Write::write_str(
        &mut FileWriter::new(STDERR_FILENO),
        // Diagnostics are produced from `fmt::Arguments`, so this is always UTF-8.
        core::str::from_utf8(bytes).unwrap_or("<invalid utf-8>\n"),
    );
}
