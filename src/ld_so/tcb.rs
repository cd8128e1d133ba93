use core::{ffi::c_void, mem, ptr, ptr::NonNull, slice};

use static_assertions::{assert_eq_align, assert_eq_size, const_assert_eq};

use super::{
    dtv::Dtv,
    early_alloc::EarlyAllocator,
    layout::{StaticLayout, TlsLayout},
    segment::TlsSegment,
};
use crate::{Result, TlsError};

/// Control block of the TLS-below-the-thread-pointer ABI (x86, x86_64).
///
/// The first word must be the thread pointer itself, `fs:0` reads are how code finds it.
#[repr(C, align(64))]
#[derive(Debug)]
pub struct TcbHeader {
    pub tcb: *mut TcbHeader,
    pub dtv: *mut Dtv,
    pub self_ptr: *mut TcbHeader,
}

/// Control block of the TLS-above-the-thread-pointer ABI (aarch64, riscv64).
#[repr(C)]
#[derive(Debug)]
pub struct TcbHead {
    pub dtv: *mut Dtv,
    pub private: *mut c_void,
}

const_assert_eq!(mem::size_of::<TcbHeader>(), crate::config::TCB_ALIGNMENT);
const_assert_eq!(mem::offset_of!(TcbHeader, dtv), mem::size_of::<usize>());
assert_eq_size!(TcbHead, [usize; 2]);
assert_eq_align!(TcbHead, usize);

/// Sets the architecture thread pointer.
pub trait ThreadPointer {
    unsafe fn set(&mut self, tp: usize) -> Result<()>;
}

/// The real register, written through the platform.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeThreadPointer;

impl ThreadPointer for NativeThreadPointer {
    unsafe fn set(&mut self, tp: usize) -> Result<()> {
        crate::platform::set_thread_pointer(tp).map_err(TlsError::ThreadPointer)
    }
}

/// Remembers the value instead of installing it, for hosted use where the process already owns
/// its thread pointer.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecordingThreadPointer {
    pub tp: Option<usize>,
}

impl ThreadPointer for RecordingThreadPointer {
    unsafe fn set(&mut self, tp: usize) -> Result<()> {
        self.tp = Some(tp);
        Ok(())
    }
}

/// The initial thread's static TLS block.
#[derive(Debug)]
pub struct StaticBlock {
    base: NonNull<u8>,
    layout: StaticLayout,
}

impl StaticBlock {
    /// Obtain the block from `allocator`, align it, and copy module 1's template into it.
    ///
    /// Only `file_size` bytes are written, the rest of the block is already zero.
    pub fn allocate<A: EarlyAllocator + ?Sized>(
        layout: StaticLayout,
        allocator: &mut A,
        segment: &TlsSegment,
    ) -> Result<Self> {
        let raw = allocator
            .allocate(layout.alloc_size)
            .ok_or(TlsError::EarlyAllocFailed(layout.alloc_size))?;
        let misalignment = raw.as_ptr().align_offset(layout.max_align);
        if misalignment >= layout.max_align {
            return Err(TlsError::EarlyAllocFailed(layout.alloc_size));
        }
        let base = unsafe { raw.add(misalignment) };
        let block = Self { base, layout };

        if segment.file_size > 0 {
            unsafe {
                ptr::copy_nonoverlapping(
                    segment.image,
                    block.primary_ptr(),
                    segment.file_size.min(block.layout.primary.len()),
                );
            }
        }
        Ok(block)
    }

    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn layout(&self) -> &StaticLayout {
        &self.layout
    }

    pub fn thread_pointer(&self) -> usize {
        self.layout.thread_pointer(self.base.as_ptr() as usize)
    }

    pub fn primary_ptr(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.layout.primary.start) }
    }

    /// Module 1's data.
    pub unsafe fn primary(&self) -> &mut [u8] {
        slice::from_raw_parts_mut(self.primary_ptr(), self.layout.primary.len())
    }
}

/// Write the control block at `tp`, record `dtv` in it and make `tp` the thread pointer.
pub unsafe fn install_for_thread<L, T>(
    layout: &L,
    tp: usize,
    dtv: *mut Dtv,
    thread_pointer: &mut T,
) -> Result<()>
where
    L: TlsLayout,
    T: ThreadPointer + ?Sized,
{
    layout.write_control_block(tp, dtv);
    thread_pointer.set(tp)
}
