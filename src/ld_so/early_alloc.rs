//! Memory for the initial thread's static TLS block, obtained before any heap exists.

use core::ptr::NonNull;

/// A startup-only allocator.
///
/// # Safety
///
/// Implementations must return memory that is zero filled, valid for reads and writes of `size`
/// bytes, and never handed out again. No alignment beyond 1 is promised. Callers over-allocate
/// and align up themselves. There is no error-reporting state: failure is `None`.
pub unsafe trait EarlyAllocator {
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>>;
}

unsafe impl<A: EarlyAllocator + ?Sized> EarlyAllocator for &mut A {
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        (**self).allocate(size)
    }
}

/// Bump allocation out of a fixed region that starts out zeroed.
#[derive(Debug)]
pub struct BumpAllocator {
    base: NonNull<u8>,
    len: usize,
    next: usize,
}

impl BumpAllocator {
    /// # Safety
    ///
    /// `region` must be entirely zero.
    pub unsafe fn new(region: &'static mut [u8]) -> Self {
        Self {
            base: NonNull::new_unchecked(region.as_mut_ptr()),
            len: region.len(),
            next: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.len - self.next
    }
}

unsafe impl EarlyAllocator for BumpAllocator {
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size > self.remaining() {
            return None;
        }
        let ptr = unsafe { self.base.add(self.next) };
        self.next += size;
        Some(ptr)
    }
}

/// Grows the program break, falling back to an anonymous mapping when the break cannot move
/// (for instance because something is already mapped right after it).
#[cfg(target_os = "linux")]
#[derive(Debug, Default)]
pub struct SbrkAllocator;

#[cfg(target_os = "linux")]
unsafe impl EarlyAllocator for SbrkAllocator {
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        use crate::platform;

        let current = platform::brk(0);
        if let Some(wanted) = current.checked_add(size) {
            if current != 0 && platform::brk(wanted) == wanted {
                return NonNull::new(current as *mut u8);
            }
        }
        platform::mmap_anonymous(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::{boxed::Box, vec};

    fn leaked(len: usize) -> &'static mut [u8] {
        Box::leak(vec![0u8; len].into_boxed_slice())
    }

    #[test]
    fn bump_is_sequential_and_bounded() {
        let region = leaked(64);
        let start = region.as_ptr() as usize;
        let mut bump = unsafe { BumpAllocator::new(region) };

        let a = bump.allocate(40).unwrap();
        let b = bump.allocate(24).unwrap();
        assert_eq!(a.as_ptr() as usize, start);
        assert_eq!(b.as_ptr() as usize, start + 40);
        assert_eq!(bump.remaining(), 0);
        assert!(bump.allocate(1).is_none());
    }

    #[test]
    fn bump_failure_keeps_state() {
        let mut bump = unsafe { BumpAllocator::new(leaked(16)) };
        assert!(bump.allocate(17).is_none());
        assert_eq!(bump.remaining(), 16);
    }
}
