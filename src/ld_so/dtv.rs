//! The per-thread dynamic thread vector.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use core::{
    mem,
    ptr::{self, NonNull},
};

use generic_rt::panic_notls;
use static_assertions::const_assert_eq;

use super::{layout::round_up, registry::ModuleTls};
use crate::{config::TLS_SLOTINFO_SURPLUS, Result, TlsError};

/// Marks a module slot whose block has not been set up for this thread yet.
pub const TLS_DTV_UNALLOCATED: *mut u8 = usize::MAX as *mut u8;

/// Length of the statically allocated DTV used by the initial thread.
pub const STATIC_DTV_LEN: usize = 2 + TLS_SLOTINFO_SURPLUS;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtvPointer {
    pub val: *mut u8,
    /// Start of the allocation backing `val` when the runtime owns it, null otherwise.
    pub to_free: *mut u8,
}

impl DtvPointer {
    pub const UNALLOCATED: Self = Self {
        val: TLS_DTV_UNALLOCATED,
        to_free: ptr::null_mut(),
    };

    /// A block the DTV does not own, such as one inside the static TLS block.
    pub const fn fixed(val: *mut u8) -> Self {
        Self {
            val,
            to_free: ptr::null_mut(),
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.val != TLS_DTV_UNALLOCATED
    }

    pub fn is_freeable(&self) -> bool {
        !self.to_free.is_null()
    }
}

/// Slot 0 holds the capacity, slot 1 the generation, the rest are module pointers.
#[repr(C)]
#[derive(Clone, Copy)]
pub union DtvSlot {
    pub counter: usize,
    pub pointer: DtvPointer,
}

impl DtvSlot {
    pub const EMPTY: Self = Self {
        pointer: DtvPointer::UNALLOCATED,
    };
}

#[derive(Debug)]
enum Storage {
    Static,
    Heap(Layout),
}

/// One thread's module id to TLS block map.
///
/// Module `m` lives at slot `m + 1`. Blocks the runtime allocated are freed when their entry is
/// released, and all remaining ones when the vector is dropped at thread exit. Static storage
/// itself is never freed.
///
/// `slots` stays the first field: the x86_64 descriptor fast path reads it directly.
#[repr(C)]
#[derive(Debug)]
pub struct Dtv {
    slots: NonNull<DtvSlot>,
    storage: Storage,
}

const_assert_eq!(mem::size_of::<DtvSlot>(), 2 * mem::size_of::<usize>());
const_assert_eq!(mem::offset_of!(Dtv, slots), 0);

// A DTV is private to the thread that owns it; moving it along with that thread is fine.
unsafe impl Send for Dtv {}

impl Dtv {
    /// Use preallocated storage, for the initial thread before any heap exists.
    pub fn from_static(storage: &'static mut [DtvSlot]) -> Self {
        if storage.len() < 2 {
            panic_notls("static DTV storage needs at least the header slots");
        }
        let capacity = storage.len() - 2;
        storage[0] = DtvSlot { counter: capacity };
        storage[1] = DtvSlot { counter: 0 };
        storage[2..].fill(DtvSlot::EMPTY);
        Self {
            // A slice pointer is never null.
            slots: NonNull::from(storage).cast(),
            storage: Storage::Static,
        }
    }

    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let (slots, layout) = Self::allocate_slots(capacity)?;
        unsafe {
            slots.as_ptr().write(DtvSlot { counter: capacity });
            slots.as_ptr().add(1).write(DtvSlot { counter: 0 });
            for i in 0..capacity {
                slots.as_ptr().add(2 + i).write(DtvSlot::EMPTY);
            }
        }
        Ok(Self {
            slots,
            storage: Storage::Heap(layout),
        })
    }

    fn allocate_slots(capacity: usize) -> Result<(NonNull<DtvSlot>, Layout)> {
        let len = capacity.checked_add(2).ok_or(TlsError::Overflow)?;
        let layout = Layout::array::<DtvSlot>(len).map_err(|_| TlsError::Overflow)?;
        let raw = unsafe { alloc_zeroed(layout) };
        let slots = NonNull::new(raw.cast::<DtvSlot>()).ok_or(TlsError::OutOfMemory(layout.size()))?;
        Ok((slots, layout))
    }

    /// Number of module slots.
    pub fn capacity(&self) -> usize {
        unsafe { self.slots.as_ptr().read().counter }
    }

    /// The registry generation this vector was last brought up to date with.
    pub fn generation(&self) -> usize {
        unsafe { self.slots.as_ptr().add(1).read().counter }
    }

    pub fn set_generation(&mut self, generation: usize) {
        unsafe {
            self.slots
                .as_ptr()
                .add(1)
                .write(DtvSlot { counter: generation })
        }
    }

    pub fn get(&self, module: usize) -> Option<DtvPointer> {
        if module == 0 || module > self.capacity() {
            return None;
        }
        Some(unsafe { self.slots.as_ptr().add(module + 1).read().pointer })
    }

    /// Store `pointer` for `module`, growing the vector when needed.
    pub fn set(&mut self, module: usize, pointer: DtvPointer) -> Result<()> {
        if module == 0 {
            return Err(TlsError::UnknownModule(0));
        }
        if module > self.capacity() {
            self.resize(module)?;
        }
        unsafe {
            self.slots
                .as_ptr()
                .add(module + 1)
                .write(DtvSlot { pointer });
        }
        Ok(())
    }

    /// Grow to at least `capacity` module slots, keeping every entry.
    pub fn resize(&mut self, capacity: usize) -> Result<()> {
        let old_capacity = self.capacity();
        if capacity <= old_capacity {
            return Ok(());
        }
        let (slots, layout) = Self::allocate_slots(capacity)?;
        unsafe {
            ptr::copy_nonoverlapping(self.slots.as_ptr(), slots.as_ptr(), old_capacity + 2);
            for i in old_capacity..capacity {
                slots.as_ptr().add(2 + i).write(DtvSlot::EMPTY);
            }
            slots.as_ptr().write(DtvSlot { counter: capacity });
        }
        log::debug!("DTV grown from {} to {} slots", old_capacity, capacity);

        let old = mem::replace(&mut self.storage, Storage::Heap(layout));
        let old_slots = mem::replace(&mut self.slots, slots);
        if let Storage::Heap(old_layout) = old {
            unsafe { dealloc(old_slots.as_ptr().cast(), old_layout) };
        }
        Ok(())
    }

    /// Forget `module`'s block, freeing it when the runtime allocated it.
    pub fn release_entry(&mut self, module: usize) {
        let Some(entry) = self.get(module) else {
            return;
        };
        if entry.is_freeable() {
            unsafe { free_block(entry.to_free) };
        }
        unsafe {
            self.slots.as_ptr().add(module + 1).write(DtvSlot::EMPTY);
        }
    }

    /// Thread exit: free every runtime-allocated block and the vector itself.
    pub fn release(self) {
        drop(self)
    }

    pub fn is_static(&self) -> bool {
        matches!(self.storage, Storage::Static)
    }
}

impl Drop for Dtv {
    fn drop(&mut self) {
        for module in 1..=self.capacity() {
            self.release_entry(module);
        }
        if let Storage::Heap(layout) = self.storage {
            unsafe { dealloc(self.slots.as_ptr().cast(), layout) };
        }
    }
}

/// Allocate a zeroed block for `module` and copy its template in.
///
/// The allocation layout is stored in front of the block so the entry can be freed from its
/// `to_free` pointer alone.
pub(crate) fn allocate_block(module: &ModuleTls) -> Result<DtvPointer> {
    let align = module.align.max(mem::align_of::<Layout>());
    let header = round_up(mem::size_of::<Layout>(), align)?;
    let size = header
        .checked_add(module.block_size.max(1))
        .ok_or(TlsError::Overflow)?;
    let layout = Layout::from_size_align(size, align).map_err(|_| TlsError::Overflow)?;

    let raw = unsafe { alloc_zeroed(layout) };
    if raw.is_null() {
        return Err(TlsError::OutOfMemory(size));
    }
    unsafe {
        raw.cast::<Layout>().write(layout);
        let val = raw.add(header);
        let image = module.init_image();
        ptr::copy_nonoverlapping(image.as_ptr(), val, image.len().min(module.block_size));
        Ok(DtvPointer { val, to_free: raw })
    }
}

unsafe fn free_block(to_free: *mut u8) {
    let layout = to_free.cast::<Layout>().read();
    dealloc(to_free, layout);
}
