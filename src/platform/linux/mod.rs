use core::ptr::NonNull;

use sc::syscall;

const PROT_READ: usize = 0x1;
const PROT_WRITE: usize = 0x2;
const MAP_PRIVATE: usize = 0x02;
const MAP_ANONYMOUS: usize = 0x20;

#[cfg(target_arch = "x86_64")]
const ARCH_SET_FS: usize = 0x1002;

fn e(sys: usize) -> Result<usize, isize> {
    if (sys as isize) < 0 && (sys as isize) >= -4095 {
        Err(-(sys as isize))
    } else {
        Ok(sys)
    }
}

pub fn write(fd: i32, buf: &[u8]) -> isize {
    match e(unsafe { syscall!(WRITE, fd, buf.as_ptr(), buf.len()) }) {
        Ok(written) => written as isize,
        Err(errno) => -errno,
    }
}

/// Move the program break. Returns the new break, or the current one when `addr` is not
/// acceptable to the kernel.
pub fn brk(addr: usize) -> usize {
    unsafe { syscall!(BRK, addr) }
}

/// Map `len` bytes of private, zero-filled, read-write memory.
pub fn mmap_anonymous(len: usize) -> Option<NonNull<u8>> {
    let addr = e(unsafe {
        syscall!(
            MMAP,
            0usize,
            len,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1isize,
            0usize
        )
    })
    .ok()?;
    NonNull::new(addr as *mut u8)
}

#[cfg(target_arch = "x86_64")]
pub unsafe fn set_thread_pointer(tp: usize) -> Result<(), isize> {
    e(syscall!(ARCH_PRCTL, ARCH_SET_FS, tp)).map(|_| ())
}

#[cfg(target_arch = "aarch64")]
pub unsafe fn set_thread_pointer(tp: usize) -> Result<(), isize> {
    core::arch::asm!("msr tpidr_el0, {}", in(reg) tp, options(nostack, preserves_flags));
    Ok(())
}

#[cfg(target_arch = "riscv64")]
pub unsafe fn set_thread_pointer(tp: usize) -> Result<(), isize> {
    core::arch::asm!("mv tp, {}", in(reg) tp, options(nostack, preserves_flags));
    Ok(())
}

#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "aarch64",
    target_arch = "riscv64"
)))]
pub unsafe fn set_thread_pointer(_tp: usize) -> Result<(), isize> {
    Err(-38)
}
