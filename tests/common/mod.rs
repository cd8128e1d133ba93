#![allow(dead_code)]

use spin::Once;
use tlsboot::ld_so::{
    dtv::{Dtv, DtvSlot},
    early_alloc::BumpAllocator,
    layout::ExtraTls,
    registry::{ModuleTls, Registry, SlotinfoEntry, StaticTlsParams},
    segment::TlsSegment,
};

pub fn registry(slots: usize) -> &'static Registry {
    let head: &'static [SlotinfoEntry] = Box::leak(
        (0..slots)
            .map(|_| SlotinfoEntry::new())
            .collect::<Vec<_>>()
            .into_boxed_slice(),
    );
    Box::leak(Box::new(Registry::new(head)))
}

/// A registry seeded with an empty module 1, for tests that never touch static TLS.
pub fn started_registry(slots: usize) -> &'static Registry {
    let registry = registry(slots);
    let primary = Box::leak(Box::new(ModuleTls::primary(&TlsSegment::EMPTY, 0)));
    registry.initialize(primary, StaticTlsParams::default());
    registry
}

pub fn static_dtv(len: usize) -> &'static mut Dtv {
    let slots = Box::leak(vec![DtvSlot::EMPTY; len].into_boxed_slice());
    Box::leak(Box::new(Dtv::from_static(slots)))
}

pub fn bump(len: usize) -> BumpAllocator {
    unsafe { BumpAllocator::new(Box::leak(vec![0u8; len].into_boxed_slice())) }
}

pub fn primary_slot() -> &'static Once<ModuleTls> {
    Box::leak(Box::new(Once::new()))
}

/// A dynamic module whose template is `len` copies of `marker`.
pub fn module(marker: u8, len: usize) -> &'static ModuleTls {
    let image: &'static [u8] = Box::leak(vec![marker; len].into_boxed_slice());
    Box::leak(Box::new(ModuleTls::new(len * 2, 16, image.as_ptr(), image.len())))
}

#[derive(Debug, Default)]
pub struct RecordingExtra {
    pub size: usize,
    pub align: usize,
    pub offsets: Vec<isize>,
}

impl ExtraTls for RecordingExtra {
    fn size(&self) -> usize {
        self.size
    }
    fn align(&self) -> usize {
        self.align
    }
    fn set_offset(&mut self, offset: isize) {
        self.offsets.push(offset);
    }
}
