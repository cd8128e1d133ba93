//! Static TLS for threads created after startup.

use alloc::{
    alloc::{alloc_zeroed, dealloc, Layout},
    boxed::Box,
};
use core::ptr::NonNull;

use super::{
    dtv::Dtv,
    layout::{round_up, TlsLayout},
    registry::Registry,
    tcb::ThreadPointer,
};
use crate::{
    config::{DTV_SURPLUS, TCB_ALIGNMENT},
    Result, TlsError,
};

/// A thread's static TLS block, control block and DTV, freed together on drop.
#[derive(Debug)]
pub struct ThreadTls {
    base: NonNull<u8>,
    layout: Layout,
    tp: usize,
    dtv: Box<Dtv>,
}

unsafe impl Send for ThreadTls {}

impl ThreadTls {
    /// Allocate a block shaped like the initial thread's and fill it from the registry.
    pub fn allocate<L: TlsLayout>(registry: &Registry, tls_layout: &L) -> Result<Self> {
        let mut params = registry.static_params();
        params.align = params.align.max(TCB_ALIGNMENT);
        params.size = params.size.max(round_up(L::TCB_SIZE, params.align)?);
        let mut dtv = Box::new(Dtv::with_capacity(registry.max_dtv_idx() + DTV_SURPLUS)?);

        let layout = Layout::from_size_align(params.size, params.align)
            .map_err(|_| TlsError::Overflow)?;
        let base = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or(TlsError::OutOfMemory(layout.size()))?;
        let tp = tls_layout.block_thread_pointer(base.as_ptr() as usize, &params);

        if let Err(err) = unsafe { registry.init_thread_tls(tls_layout, tp, &mut dtv) } {
            unsafe { dealloc(base.as_ptr(), layout) };
            return Err(err);
        }
        unsafe { tls_layout.write_control_block(tp, &mut *dtv) };
        let thread = Self {
            base,
            layout,
            tp,
            dtv,
        };

        #[cfg(feature = "trace")]
        log::trace!(
            "thread TLS at {:p}, tp {:#x}, {} DTV slots",
            base,
            tp,
            thread.dtv.capacity()
        );
        Ok(thread)
    }

    pub fn thread_pointer(&self) -> usize {
        self.tp
    }

    pub fn dtv(&mut self) -> &mut Dtv {
        &mut self.dtv
    }

    /// Make this block the calling thread's TLS.
    pub unsafe fn install<T: ThreadPointer + ?Sized>(&self, thread_pointer: &mut T) -> Result<()> {
        thread_pointer.set(self.tp)
    }
}

impl Drop for ThreadTls {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}
