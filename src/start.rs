use core::{
    ffi::{c_char, CStr},
    fmt::Debug,
    iter,
};

use spin::Once;

use crate::{
    config::TlsConfig,
    ld_so::{
        dtv::{Dtv, DtvPointer},
        early_alloc::EarlyAllocator,
        layout::{ExtraTls, LayoutRequest, TlsLayout},
        registry::{ModuleTls, Registry, StaticTlsParams},
        segment::TlsSegment,
        tcb::{install_for_thread, StaticBlock, ThreadPointer},
    },
    Result,
};

#[repr(C)]
pub struct Stack {
    pub argc: isize,
    pub argv0: *const c_char,
}

impl Stack {
    pub fn argv(&self) -> *const *const c_char {
        &self.argv0 as *const _
    }

    pub fn envp(&self) -> *const *const c_char {
        unsafe { self.argv().offset(self.argc + 1) }
    }

    pub fn auxv(&self) -> *const (usize, usize) {
        unsafe {
            let mut envp = self.envp();
            while !(*envp).is_null() {
                envp = envp.add(1);
            }
            envp.add(1) as *const (usize, usize)
        }
    }

    /// The environment block as `NAME=value` byte strings.
    pub fn env(&self) -> impl Iterator<Item = &'static [u8]> {
        let mut envp = self.envp();
        iter::from_fn(move || unsafe {
            let entry = *envp;
            if entry.is_null() {
                return None;
            }
            envp = envp.add(1);
            Some(CStr::from_ptr(entry).to_bytes())
        })
    }
}

impl Debug for Stack {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Stack")
            .field("argc", &self.argc)
            .field("argv0", &self.argv0)
            .finish()
    }
}

/// The collaborators of initial-thread TLS setup.
#[derive(Debug, Default)]
pub struct Bootstrap<L, A, X, T> {
    pub layout: L,
    pub allocator: A,
    pub extra: X,
    pub thread_pointer: T,
}

/// What startup produced for the initial thread.
#[derive(Debug)]
pub struct InitialTls {
    pub block: StaticBlock,
    pub primary: &'static ModuleTls,
}

impl InitialTls {
    pub fn thread_pointer(&self) -> usize {
        self.block.thread_pointer()
    }
}

impl<L, A, X, T> Bootstrap<L, A, X, T>
where
    L: TlsLayout,
    A: EarlyAllocator,
    X: ExtraTls,
    T: ThreadPointer,
{
    /// Lay out, allocate and install the initial thread's static TLS, then seed `registry` with
    /// module 1.
    ///
    /// Runs once, single threaded, before anything touches TLS. `dtv` becomes the initial
    /// thread's DTV and `primary` receives module 1's metadata.
    pub unsafe fn setup_tls(
        &mut self,
        segment: &TlsSegment,
        config: &TlsConfig,
        registry: &'static Registry,
        primary: &'static Once<ModuleTls>,
        dtv: &'static mut Dtv,
    ) -> Result<InitialTls> {
        let surplus = config.static_surplus();
        let request = LayoutRequest::new(segment, surplus, &self.extra);
        let layout = self.layout.compute(&request)?;
        if request.extra_size > 0 {
            self.extra.set_offset(layout.extra_tp_offset);
        }

        let block = StaticBlock::allocate(layout, &mut self.allocator, segment)?;
        let tp = block.thread_pointer();
        dtv.set(1, DtvPointer::fixed(block.primary_ptr()))?;
        install_for_thread(&self.layout, tp, dtv, &mut self.thread_pointer)?;

        let layout = block.layout();
        let primary = primary.call_once(|| ModuleTls::primary(segment, layout.module_offset));
        registry.initialize(
            primary,
            StaticTlsParams {
                size: layout.static_size,
                used: layout.static_used,
                align: layout.static_align,
                nelem: 1,
                surplus,
                optional: config.optional_static_tls,
            },
        );

        log::debug!(
            "static TLS: {:#x} bytes at {:p}, tp {:#x}, module 1 offset {:#x}",
            layout.static_size,
            block.base(),
            tp,
            layout.module_offset
        );
        Ok(InitialTls { block, primary })
    }
}
