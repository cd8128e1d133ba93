//! Address resolution for TLS accesses.

use core::sync::atomic::{AtomicUsize, Ordering};

use super::{
    dtv::{self, Dtv, DtvPointer},
    layout::TlsLayout,
    registry::Registry,
};
use crate::{config::DTV_SURPLUS, Result, TlsError};

/// Argument of `__tls_get_addr` style lookups.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsIndex {
    pub ti_module: usize,
    pub ti_offset: usize,
}

/// Argument of a dynamic TLS descriptor. `gen_count` caches the generation the descriptor was
/// last validated against.
#[repr(C)]
#[derive(Debug)]
pub struct TlsDescDynamicArg {
    pub tlsinfo: TlsIndex,
    pub gen_count: AtomicUsize,
}

impl TlsDescDynamicArg {
    pub const fn new(module: usize, offset: usize, generation: usize) -> Self {
        Self {
            tlsinfo: TlsIndex {
                ti_module: module,
                ti_offset: offset,
            },
            gen_count: AtomicUsize::new(generation),
        }
    }
}

/// What a TLS descriptor resolves through.
#[derive(Debug, Clone, Copy)]
pub enum TlsDescriptor<'a> {
    /// Fixed thread-pointer relative offset.
    Static(isize),
    /// Undefined weak symbol, resolves to the addend as an absolute address.
    UndefWeak(usize),
    Dynamic(&'a TlsDescDynamicArg),
}

/// Resolves TLS addresses against one registry using one layout.
#[derive(Debug, Clone, Copy)]
pub struct Resolver<'r, L> {
    registry: &'r Registry,
    layout: L,
}

impl<'r, L: TlsLayout> Resolver<'r, L> {
    pub fn new(registry: &'r Registry, layout: L) -> Self {
        Self { registry, layout }
    }

    pub fn registry(&self) -> &'r Registry {
        self.registry
    }

    /// The static path: one add or subtract, never touching the registry.
    #[inline]
    pub fn static_address(&self, tp: usize, offset: usize) -> usize {
        self.layout.static_address(tp, offset)
    }

    pub fn resolve(&self, dtv: &mut Dtv, tp: usize, desc: TlsDescriptor<'_>) -> Result<*mut u8> {
        match desc {
            TlsDescriptor::Static(offset) => Ok(tp.wrapping_add_signed(offset) as *mut u8),
            TlsDescriptor::UndefWeak(addend) => Ok(addend as *mut u8),
            TlsDescriptor::Dynamic(arg) => self.resolve_dynamic(dtv, tp, arg),
        }
    }

    /// Build the argument of a dynamic descriptor for `offset` inside module `module`.
    pub fn make_dynamic_descriptor(&self, module: usize, offset: usize) -> TlsDescDynamicArg {
        TlsDescDynamicArg::new(module, offset, self.registry.current_generation())
    }

    /// Resolve a dynamic descriptor for the thread owning `dtv`.
    pub fn resolve_dynamic(
        &self,
        dtv: &mut Dtv,
        tp: usize,
        arg: &TlsDescDynamicArg,
    ) -> Result<*mut u8> {
        let TlsIndex {
            ti_module: module,
            ti_offset: offset,
        } = arg.tlsinfo;

        let current = self.registry.current_generation();
        if arg.gen_count.load(Ordering::Relaxed) == current && dtv.generation() == current {
            if let Some(entry) = dtv.get(module).filter(DtvPointer::is_allocated) {
                return Ok(entry.val.wrapping_add(offset));
            }
        }

        #[cfg(feature = "trace")]
        log::trace!(
            "slow TLS descriptor path for module {} offset {:#x} (dtv gen {}, current {})",
            module,
            offset,
            dtv.generation(),
            current
        );

        self.update_slotinfo(dtv)?;
        let block = self.module_block(dtv, tp, module)?;
        arg.gen_count.store(dtv.generation(), Ordering::Relaxed);
        Ok(block.wrapping_add(offset))
    }

    /// `__tls_get_addr`.
    pub fn tls_get_addr(&self, dtv: &mut Dtv, tp: usize, index: &TlsIndex) -> Result<*mut u8> {
        if dtv.generation() != self.registry.current_generation() {
            self.update_slotinfo(dtv)?;
        }
        let block = self.module_block(dtv, tp, index.ti_module)?;
        Ok(block.wrapping_add(index.ti_offset))
    }

    /// Bring `dtv` up to the current generation: release the block of every module whose slot
    /// changed since the last update and make room for the highest id. Returns the generation.
    pub fn update_slotinfo(&self, dtv: &mut Dtv) -> Result<usize> {
        let current = self.registry.current_generation();
        let seen = dtv.generation();
        if seen == current {
            return Ok(current);
        }

        let max = self.registry.max_dtv_idx();
        if max > dtv.capacity() {
            dtv.resize(max + DTV_SURPLUS)?;
        }

        let capacity = dtv.capacity();
        for (id, entry) in self.registry.slots().skip(1).take(capacity) {
            let generation = entry.generation();
            if generation <= seen || generation > current {
                continue;
            }
            dtv.release_entry(id);
        }
        dtv.set_generation(current);

        #[cfg(feature = "trace")]
        log::trace!("DTV updated from generation {} to {}", seen, current);
        Ok(current)
    }

    fn module_block(&self, dtv: &mut Dtv, tp: usize, module: usize) -> Result<*mut u8> {
        if let Some(entry) = dtv.get(module).filter(DtvPointer::is_allocated) {
            return Ok(entry.val);
        }

        let tls = self
            .registry
            .module(module)
            .ok_or(TlsError::UnknownModule(module))?;
        let entry = match tls.tls_offset() {
            Some(offset) => DtvPointer::fixed(self.layout.static_address(tp, offset) as *mut u8),
            None => {
                let entry = dtv::allocate_block(tls)?;
                #[cfg(feature = "trace")]
                log::trace!(
                    "allocated {:#x} bytes of TLS for module {} at {:p}",
                    tls.block_size,
                    module,
                    entry.val
                );
                entry
            }
        };
        dtv.set(module, entry)?;
        Ok(entry.val)
    }
}
