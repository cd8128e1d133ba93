//! Process-wide TLS module registry.
//!
//! Module ids index an append-only list of slotinfo segments. Writers serialize on the load lock,
//! fill in a slot and only then publish the new generation with `Release`. Readers load the
//! generation with `Acquire` before trusting any slot stamped with a generation up to it.

use alloc::{boxed::Box, vec::Vec};
use core::{
    fmt, iter, ptr, slice,
    sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering},
};

use generic_rt::{panic_notls, ExpectTlsFree};
use spin::Mutex;

use super::{
    dtv::{Dtv, DtvPointer},
    layout::TlsLayout,
    segment::TlsSegment,
};
use crate::{config::TLS_SLOTINFO_SURPLUS, Result, TlsError};

/// `ModuleTls::tls_offset` of a module without a static TLS slot.
pub const NO_TLS_OFFSET: usize = usize::MAX;

/// TLS metadata of one loaded module.
#[derive(Debug)]
pub struct ModuleTls {
    module_id: AtomicUsize,
    tls_offset: AtomicUsize,
    pub align: usize,
    pub block_size: usize,
    pub init_image: *const u8,
    pub init_image_size: usize,
}

// The template is read-only load data, the mutable fields are atomics.
unsafe impl Send for ModuleTls {}
unsafe impl Sync for ModuleTls {}

impl ModuleTls {
    pub const fn new(
        block_size: usize,
        align: usize,
        init_image: *const u8,
        init_image_size: usize,
    ) -> Self {
        Self {
            module_id: AtomicUsize::new(0),
            tls_offset: AtomicUsize::new(NO_TLS_OFFSET),
            align,
            block_size,
            init_image,
            init_image_size,
        }
    }

    /// Module 1, the executable, already placed at `tls_offset` in the static block.
    pub fn primary(segment: &TlsSegment, tls_offset: usize) -> Self {
        let module = Self::new(
            segment.mem_size,
            segment.align,
            segment.image,
            segment.file_size,
        );
        module.tls_offset.store(tls_offset, Ordering::Relaxed);
        module
    }

    /// Zero until registered.
    pub fn module_id(&self) -> usize {
        self.module_id.load(Ordering::Relaxed)
    }

    pub fn tls_offset(&self) -> Option<usize> {
        match self.tls_offset.load(Ordering::Acquire) {
            NO_TLS_OFFSET => None,
            offset => Some(offset),
        }
    }

    pub unsafe fn init_image(&self) -> &[u8] {
        if self.init_image_size == 0 {
            return &[];
        }
        slice::from_raw_parts(self.init_image, self.init_image_size)
    }
}

#[derive(Debug)]
pub struct SlotinfoEntry {
    map: AtomicPtr<ModuleTls>,
    gen: AtomicUsize,
}

impl SlotinfoEntry {
    pub const fn new() -> Self {
        Self {
            map: AtomicPtr::new(ptr::null_mut()),
            gen: AtomicUsize::new(0),
        }
    }

    pub fn module(&self) -> Option<&'static ModuleTls> {
        // Only `&'static ModuleTls` values are ever stored.
        unsafe { self.map.load(Ordering::Acquire).as_ref() }
    }

    /// Generation of the last change to this slot.
    pub fn generation(&self) -> usize {
        self.gen.load(Ordering::Acquire)
    }
}

impl Default for SlotinfoEntry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct SlotinfoSegment {
    slots: &'static [SlotinfoEntry],
    next: AtomicPtr<SlotinfoSegment>,
}

impl SlotinfoSegment {
    const fn new(slots: &'static [SlotinfoEntry]) -> Self {
        Self {
            slots,
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Static TLS bookkeeping, guarded by the load lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaticTlsParams {
    /// Bytes per thread of static TLS, control block included.
    pub size: usize,
    /// Bytes already claimed, counted in the layout's growth direction.
    pub used: usize,
    pub align: usize,
    /// Number of modules placed at startup.
    pub nelem: usize,
    pub surplus: usize,
    /// Bytes of `surplus` still available to optional requests.
    pub optional: usize,
}

impl StaticTlsParams {
    pub const fn new() -> Self {
        Self {
            size: 0,
            used: 0,
            align: 0,
            nelem: 0,
            surplus: 0,
            optional: 0,
        }
    }
}

pub struct Registry {
    head: SlotinfoSegment,
    generation: AtomicUsize,
    max_dtv_idx: AtomicUsize,
    gaps: AtomicBool,
    initialized: AtomicBool,
    load: Mutex<StaticTlsParams>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Registry")
            .field("generation", &self.current_generation())
            .field("max_dtv_idx", &self.max_dtv_idx())
            .field("gaps", &self.has_gaps())
            .finish()
    }
}

impl Registry {
    /// `head` is the first slotinfo segment, usable before any heap exists. Entry 0 is never used.
    pub const fn new(head: &'static [SlotinfoEntry]) -> Self {
        Self {
            head: SlotinfoSegment::new(head),
            generation: AtomicUsize::new(0),
            max_dtv_idx: AtomicUsize::new(0),
            gaps: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            load: Mutex::new(StaticTlsParams::new()),
        }
    }

    /// Record the startup state: module 1 at generation 0 and the static block geometry.
    ///
    /// Runs exactly once, before any other thread exists.
    pub fn initialize(&self, primary: &'static ModuleTls, params: StaticTlsParams) {
        if self.initialized.swap(true, Ordering::AcqRel) {
            panic_notls("TLS registry initialized twice");
        }
        let entry = self
            .slot(1)
            .expect_notls("slotinfo head segment has no room for module 1");

        primary.module_id.store(1, Ordering::Relaxed);
        entry.gen.store(0, Ordering::Relaxed);
        entry
            .map
            .store(primary as *const ModuleTls as *mut ModuleTls, Ordering::Release);
        self.max_dtv_idx.store(1, Ordering::Release);
        *self.load.lock() = StaticTlsParams { nelem: 1, ..params };
    }

    /// Latest published generation.
    pub fn current_generation(&self) -> usize {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn generation_counter(&self) -> &AtomicUsize {
        &self.generation
    }

    /// Highest module id currently in use.
    pub fn max_dtv_idx(&self) -> usize {
        self.max_dtv_idx.load(Ordering::Acquire)
    }

    pub fn has_gaps(&self) -> bool {
        self.gaps.load(Ordering::Acquire)
    }

    pub fn static_params(&self) -> StaticTlsParams {
        *self.load.lock()
    }

    pub fn slot(&self, id: usize) -> Option<&SlotinfoEntry> {
        let mut index = id;
        let mut segment = &self.head;
        loop {
            if index < segment.slots.len() {
                return Some(&segment.slots[index]);
            }
            index -= segment.slots.len();
            segment = unsafe { segment.next.load(Ordering::Acquire).as_ref()? };
        }
    }

    /// The slotinfo segments, head first.
    pub fn segments(&self) -> impl Iterator<Item = &SlotinfoSegment> {
        iter::successors(Some(&self.head), |segment| unsafe {
            segment.next.load(Ordering::Acquire).as_ref()
        })
    }

    /// Every slot with its module id.
    pub fn slots(&self) -> impl Iterator<Item = (usize, &SlotinfoEntry)> {
        self.segments()
            .flat_map(|segment| segment.slots.iter())
            .enumerate()
    }

    /// Total number of slotinfo entries across segments.
    pub fn slotinfo_len(&self) -> usize {
        self.segments().map(SlotinfoSegment::len).sum()
    }

    pub fn module(&self, id: usize) -> Option<&'static ModuleTls> {
        if id == 0 {
            return None;
        }
        self.slot(id)?.module()
    }

    /// Assign `module` an id and publish it. Returns the id.
    pub fn register_module(&self, module: &'static ModuleTls) -> usize {
        let params = self.load.lock();

        let id = self.next_module_id(&params);
        let generation = self.next_generation();
        module.module_id.store(id, Ordering::Relaxed);

        let entry = self.slot_or_grow(id);
        entry
            .map
            .store(module as *const ModuleTls as *mut ModuleTls, Ordering::Release);
        entry.gen.store(generation, Ordering::Release);
        if id > self.max_dtv_idx.load(Ordering::Relaxed) {
            self.max_dtv_idx.store(id, Ordering::Release);
        }
        self.generation.store(generation, Ordering::Release);

        log::debug!(
            "registered TLS module {} ({:#x} bytes, align {:#x}) at generation {}",
            id,
            module.block_size,
            module.align,
            generation
        );
        id
    }

    /// Remove module `id`. Threads release their block for it the next time they synchronize.
    pub fn unregister_module(&self, id: usize) -> Result<()> {
        let params = self.load.lock();

        let entry = self.slot(id).filter(|_| id != 0).ok_or(TlsError::UnknownModule(id))?;
        let module = entry.module().ok_or(TlsError::UnknownModule(id))?;
        if id <= params.nelem {
            return Err(TlsError::StaticModule(id));
        }

        let generation = self.next_generation();
        entry.map.store(ptr::null_mut(), Ordering::Release);
        entry.gen.store(generation, Ordering::Release);
        module.module_id.store(0, Ordering::Relaxed);

        let max = self.max_dtv_idx.load(Ordering::Relaxed);
        if id == max {
            let mut new_max = id - 1;
            while new_max > params.nelem && self.module(new_max).is_none() {
                new_max -= 1;
            }
            self.max_dtv_idx.store(new_max, Ordering::Release);
        } else {
            self.gaps.store(true, Ordering::Release);
        }
        self.generation.store(generation, Ordering::Release);

        log::debug!("unregistered TLS module {} at generation {}", id, generation);
        Ok(())
    }

    /// Give `module` a slot in the static TLS surplus.
    ///
    /// Must run before `register_module`, while no thread can hold a dynamic block for the
    /// module. Optional requests only draw from the optional budget.
    pub fn allocate_static_tls<L: TlsLayout>(
        &self,
        layout: &L,
        module: &ModuleTls,
        optional: bool,
    ) -> Result<usize> {
        let mut params = self.load.lock();
        if let Some(offset) = module.tls_offset() {
            return Ok(offset);
        }
        let id = module.module_id();
        if id != 0 {
            return Err(TlsError::AlreadyRegistered(id));
        }

        let exhausted = TlsError::StaticTlsExhausted(module.block_size);
        let (offset, used) = layout
            .allocate_static(&params, module.block_size, module.align.max(1))
            .ok_or(exhausted)?;
        let grown = used.saturating_sub(params.used);
        if optional {
            if grown > params.optional {
                return Err(exhausted);
            }
            params.optional -= grown;
        }
        params.used = used;
        module.tls_offset.store(offset, Ordering::Release);

        log::debug!(
            "static TLS offset {:#x} for {:#x} bytes, {:#x} of {:#x} used",
            offset,
            module.block_size,
            params.used,
            params.size
        );
        Ok(offset)
    }

    /// Set up a new thread: copy every static module's template into the block at `tp` and
    /// point `dtv` at it. Dynamic modules are left for lazy allocation.
    pub unsafe fn init_thread_tls<L: TlsLayout>(
        &self,
        layout: &L,
        tp: usize,
        dtv: &mut Dtv,
    ) -> Result<()> {
        let _load = self.load.lock();
        let generation = self.generation.load(Ordering::Acquire);
        let max = self.max_dtv_idx.load(Ordering::Acquire);
        dtv.resize(max)?;

        for (id, entry) in self.slots().skip(1).take(max) {
            let Some(module) = entry.module() else {
                continue;
            };
            if let Some(offset) = module.tls_offset() {
                let dest = layout.static_address(tp, offset) as *mut u8;
                let image = module.init_image();
                ptr::copy_nonoverlapping(image.as_ptr(), dest, image.len().min(module.block_size));
                dtv.set(id, DtvPointer::fixed(dest))?;
            }
        }
        dtv.set_generation(generation);
        Ok(())
    }

    // Under the load lock.
    fn next_generation(&self) -> usize {
        self.generation
            .load(Ordering::Relaxed)
            .checked_add(1)
            .expect_notls("TLS generation counter overflow")
    }

    // Under the load lock.
    fn next_module_id(&self, params: &StaticTlsParams) -> usize {
        let max = self.max_dtv_idx.load(Ordering::Relaxed);
        if self.gaps.load(Ordering::Relaxed) {
            if let Some(id) = ((params.nelem + 1)..=max).find(|&id| self.module(id).is_none()) {
                return id;
            }
            self.gaps.store(false, Ordering::Release);
        }
        max + 1
    }

    // Under the load lock.
    fn slot_or_grow(&self, id: usize) -> &SlotinfoEntry {
        let mut index = id;
        let mut segment = &self.head;
        loop {
            if index < segment.slots.len() {
                return &segment.slots[index];
            }
            index -= segment.slots.len();
            let next = segment.next.load(Ordering::Acquire);
            segment = match unsafe { next.as_ref() } {
                Some(next) => next,
                None => {
                    let len = TLS_SLOTINFO_SURPLUS.max(index + 1);
                    let slots: &'static [SlotinfoEntry] = Box::leak(
                        (0..len)
                            .map(|_| SlotinfoEntry::new())
                            .collect::<Vec<_>>()
                            .into_boxed_slice(),
                    );
                    let grown: &'static SlotinfoSegment =
                        Box::leak(Box::new(SlotinfoSegment::new(slots)));
                    segment.next.store(
                        grown as *const SlotinfoSegment as *mut SlotinfoSegment,
                        Ordering::Release,
                    );
                    log::debug!("slotinfo list extended by {} entries", len);
                    grown
                }
            };
        }
    }
}

/// Copy `module`'s template into its static slot of the thread whose pointer is `tp`.
pub unsafe fn init_static_tls<L: TlsLayout>(layout: &L, tp: usize, module: &ModuleTls) -> Result<()> {
    let offset = module
        .tls_offset()
        .ok_or(TlsError::UnknownModule(module.module_id()))?;
    let dest = layout.static_address(tp, offset) as *mut u8;
    let image = module.init_image();
    let copied = image.len().min(module.block_size);
    ptr::copy_nonoverlapping(image.as_ptr(), dest, copied);
    ptr::write_bytes(dest.add(copied), 0, module.block_size - copied);
    Ok(())
}
