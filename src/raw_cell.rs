use core::cell::UnsafeCell;

/// Wrapper over `UnsafeCell` that can directly be used in statics, where all modifications require
/// unsafe.
///
/// Startup state of the initial thread (the static DTV, the fallback early arena) lives in these:
/// it is written once, single threaded, before anything else can observe it.
#[repr(transparent)]
pub struct RawCell<T> {
    inner: UnsafeCell<T>,
}
impl<T> RawCell<T> {
    #[inline]
    pub const fn new(t: T) -> Self {
        Self {
            inner: UnsafeCell::new(t),
        }
    }
    #[inline]
    pub fn as_mut_ptr(&self) -> *mut T {
        self.inner.get()
    }
    #[inline]
    pub unsafe fn unsafe_ref(&self) -> &T {
        &*self.inner.get()
    }
    #[inline]
    pub unsafe fn unsafe_set(&self, t: T) {
        *self.inner.get() = t;
    }
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn unsafe_mut(&self) -> &mut T {
        &mut *self.inner.get()
    }
}

// SAFETY: every access to the contents goes through an unsafe method, whose callers guarantee
// the absence of concurrent access.
unsafe impl<T> Sync for RawCell<T> {}

#[cfg(test)]
mod tests {
    use super::RawCell;

    static COUNTER: RawCell<usize> = RawCell::new(0);
    static SLOT: RawCell<Option<*mut u8>> = RawCell::new(None);

    #[test]
    fn set_then_read() {
        unsafe {
            COUNTER.unsafe_set(41);
            *COUNTER.unsafe_mut() += 1;
            assert_eq!(*COUNTER.unsafe_ref(), 42);
            assert_eq!(*COUNTER.as_mut_ptr(), 42);
        }
    }

    #[test]
    fn holds_raw_pointers() {
        let mut byte = 7u8;
        unsafe {
            SLOT.unsafe_set(Some(&mut byte as *mut u8));
            let ptr = SLOT.unsafe_ref().unwrap();
            *ptr += 1;
        }
        assert_eq!(byte, 8);
    }
}
