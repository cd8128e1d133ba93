//! Architecture glue shared by code that runs before, or underneath, thread-local storage.
//!
//! Nothing in here may touch a `#[thread_local]` or anything that could: the functions are
//! called while the thread pointer is still unset, and from the TLS resolution slow path.

#![no_std]

#[cfg(test)]
extern crate std;

use core::{
    fmt::{self, Write},
    sync::atomic::{AtomicUsize, Ordering},
};

/// Read the current value of the architecture thread pointer.
///
/// On x86 and x86_64 this is the word at `fs:0`/`gs:0`, which the ABI requires to hold the
/// thread pointer itself.
#[inline(always)]
#[cfg(target_arch = "x86_64")]
pub unsafe fn thread_pointer() -> usize {
    let value;
    core::arch::asm!(
        "mov {}, qword ptr fs:[0]",
        out(reg) value,
        options(nostack, readonly, preserves_flags),
    );
    value
}

#[inline(always)]
#[cfg(target_arch = "x86")]
pub unsafe fn thread_pointer() -> usize {
    let value;
    core::arch::asm!(
        "mov {}, dword ptr gs:[0]",
        out(reg) value,
        options(nostack, readonly, preserves_flags),
    );
    value
}

#[inline(always)]
#[cfg(target_arch = "aarch64")]
pub unsafe fn thread_pointer() -> usize {
    let value;
    core::arch::asm!(
        "mrs {}, tpidr_el0",
        out(reg) value,
        options(nomem, nostack, preserves_flags),
    );
    value
}

#[inline(always)]
#[cfg(target_arch = "riscv64")]
pub unsafe fn thread_pointer() -> usize {
    let value;
    core::arch::asm!(
        "mv {}, tp",
        out(reg) value,
        options(nomem, nostack, preserves_flags),
    );
    value
}

/// Stop the process without unwinding and without any runtime support.
#[inline(always)]
#[allow(unreachable_code)]
pub fn trap() -> ! {
    unsafe {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        core::arch::asm!("ud2", options(noreturn, nomem, nostack));
        #[cfg(target_arch = "aarch64")]
        core::arch::asm!("brk #1", options(noreturn, nomem, nostack));
        #[cfg(target_arch = "riscv64")]
        core::arch::asm!("unimp", options(noreturn, nomem, nostack));
    }
    loop {
        core::hint::spin_loop();
    }
}

// 0 means no sink installed. Otherwise a `fn(&[u8])`.
static NOTLS_SINK: AtomicUsize = AtomicUsize::new(0);

/// Install the raw byte sink used for diagnostics on fatal paths, typically a direct `write(2)`
/// on stderr.
pub fn set_notls_sink(sink: fn(&[u8])) {
    NOTLS_SINK.store(sink as usize, Ordering::Release);
}

struct SinkWriter(fn(&[u8]));

impl Write for SinkWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        (self.0)(s.as_bytes());
        Ok(())
    }
}

/// Write a diagnostic line through the installed sink, if any.
pub fn write_notls(args: fmt::Arguments<'_>) {
    let raw = NOTLS_SINK.load(Ordering::Acquire);
    if raw == 0 {
        return;
    }
    // SAFETY: only `set_notls_sink` stores non-zero values, and it stores `fn(&[u8])` pointers.
    let sink = unsafe { core::mem::transmute::<usize, fn(&[u8])>(raw) };
    let _ = writeln!(SinkWriter(sink), "{}", args);
}

pub fn panic_notls(msg: impl fmt::Display) -> ! {
    write_notls(format_args!("panicked in tlsboot: {}", msg));

    trap();
}

pub trait ExpectTlsFree {
    type Unwrapped;

    fn expect_notls(self, msg: &str) -> Self::Unwrapped;
}
impl<T, E: fmt::Debug> ExpectTlsFree for Result<T, E> {
    type Unwrapped = T;

    fn expect_notls(self, msg: &str) -> T {
        match self {
            Ok(t) => t,
            Err(err) => panic_notls(format_args!(
                "{}: expect failed for Result with err: {:?}",
                msg, err
            )),
        }
    }
}
impl<T> ExpectTlsFree for Option<T> {
    type Unwrapped = T;

    fn expect_notls(self, msg: &str) -> T {
        match self {
            Some(t) => t,
            None => panic_notls(format_args!("{}: expect failed for Option", msg)),
        }
    }
}
