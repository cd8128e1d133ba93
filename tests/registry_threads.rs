mod common;

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Barrier,
    },
    thread,
};

use common::{module, registry, started_registry};
use tlsboot::{
    config::TLS_SLOTINFO_SURPLUS,
    ld_so::{
        dtv::Dtv,
        layout::DtvAtTp,
        registry::{ModuleTls, SlotinfoEntry, StaticTlsParams},
        resolve::{Resolver, TlsDescDynamicArg},
        segment::TlsSegment,
    },
    TlsError,
};

#[test]
fn reused_id_gets_a_fresh_block() {
    let registry = started_registry(8);
    let resolver = Resolver::new(registry, DtvAtTp);

    let first = registry.register_module(module(0x11, 4));
    assert_eq!(first, 2);
    let arg: &'static TlsDescDynamicArg =
        Box::leak(Box::new(resolver.make_dynamic_descriptor(first, 1)));

    let mut dtv = Dtv::with_capacity(4).unwrap();
    let old = resolver.resolve_dynamic(&mut dtv, 0, arg).unwrap();
    assert_eq!(unsafe { *old }, 0x11);
    let generation = registry.current_generation();

    registry.unregister_module(first).unwrap();
    assert!(registry.current_generation() > generation);
    let second = registry.register_module(module(0x22, 4));
    assert_eq!(second, first);
    assert!(registry.current_generation() > generation + 1);

    let new = resolver.resolve_dynamic(&mut dtv, 0, arg).unwrap();
    assert_eq!(unsafe { *new }, 0x22);
    assert_eq!(dtv.generation(), registry.current_generation());
    assert_eq!(
        arg.gen_count.load(Ordering::Relaxed),
        registry.current_generation()
    );
}

#[test]
fn unregistered_module_is_unknown() {
    let registry = started_registry(8);
    let resolver = Resolver::new(registry, DtvAtTp);
    let id = registry.register_module(module(1, 8));
    registry.register_module(module(2, 8));
    let arg = resolver.make_dynamic_descriptor(id, 0);

    registry.unregister_module(id).unwrap();
    let mut dtv = Dtv::with_capacity(4).unwrap();
    assert_eq!(
        resolver.resolve_dynamic(&mut dtv, 0, &arg),
        Err(TlsError::UnknownModule(id))
    );
}

#[test]
fn slotinfo_grows_past_head_segment() {
    // Entry 0 is unused, so the head holds modules 1 to 4.
    let registry = registry(5);
    let primary = Box::leak(Box::new(ModuleTls::primary(&TlsSegment::EMPTY, 0)));
    registry.initialize(primary, StaticTlsParams::default());

    let mut head_slots = Vec::new();
    for expected in 2..=4 {
        assert_eq!(registry.register_module(module(expected as u8, 4)), expected);
    }
    for id in 1..=4 {
        head_slots.push(registry.slot(id).unwrap() as *const SlotinfoEntry);
    }
    assert_eq!(registry.segments().count(), 1);

    assert_eq!(registry.register_module(module(5, 4)), 5);
    assert_eq!(registry.segments().count(), 2);
    for (id, slot) in (1..=4).zip(&head_slots) {
        assert_eq!(registry.slot(id).unwrap() as *const SlotinfoEntry, *slot);
        assert_eq!(registry.module(id).unwrap().module_id(), id);
    }

    let head = registry.segments().next().unwrap();
    assert_eq!(head.len(), 5);
    let tail = registry.segments().nth(1).unwrap();
    assert_eq!(tail.len(), TLS_SLOTINFO_SURPLUS);
    let fifth = registry.slot(5).unwrap() as *const SlotinfoEntry;
    assert!(!head_slots.contains(&fifth));
    assert_eq!(registry.module(5).unwrap().module_id(), 5);

    let resolver = Resolver::new(registry, DtvAtTp);
    let mut dtv = Dtv::with_capacity(2).unwrap();
    let arg = resolver.make_dynamic_descriptor(5, 0);
    let addr = resolver.resolve_dynamic(&mut dtv, 0, &arg).unwrap();
    assert_eq!(unsafe { *addr }, 5);
}

#[test]
fn readers_race_with_registration() {
    const READERS: usize = 4;
    const PRELOADED: usize = 6;
    const LOADED_DURING: usize = 40;

    let registry = started_registry(8);
    let resolver = Resolver::new(registry, DtvAtTp);

    let mut descriptors = Vec::new();
    for i in 0..PRELOADED {
        let marker = 0x40 + i as u8;
        let id = registry.register_module(module(marker, 8));
        let arg: &'static TlsDescDynamicArg =
            Box::leak(Box::new(resolver.make_dynamic_descriptor(id, 3)));
        descriptors.push((arg, marker));
    }
    let descriptors: &'static [(&'static TlsDescDynamicArg, u8)] =
        Box::leak(descriptors.into_boxed_slice());

    let barrier = Arc::new(Barrier::new(READERS + 1));
    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let barrier = barrier.clone();
            let done = done.clone();
            thread::spawn(move || {
                let resolver = Resolver::new(registry, DtvAtTp);
                let mut dtv = Dtv::with_capacity(2).unwrap();
                let mut last_generation = 0;
                barrier.wait();
                loop {
                    let finished = done.load(Ordering::Acquire);
                    for (arg, marker) in descriptors {
                        let addr = resolver.resolve_dynamic(&mut dtv, 0, arg).unwrap();
                        assert_eq!(unsafe { *addr }, *marker);
                    }
                    let generation = registry.current_generation();
                    assert!(generation >= last_generation);
                    last_generation = generation;
                    if finished {
                        break;
                    }
                }
                assert!(dtv.generation() <= registry.current_generation());
                dtv.capacity()
            })
        })
        .collect();

    barrier.wait();
    let mut ids = HashSet::new();
    for i in 0..LOADED_DURING {
        let id = registry.register_module(module(i as u8, 8));
        assert!(ids.insert(id), "module id {id} handed out twice");
    }
    done.store(true, Ordering::Release);

    for reader in readers {
        let capacity = reader.join().unwrap();
        assert!(capacity >= 1 + PRELOADED);
    }
    assert_eq!(registry.current_generation(), PRELOADED + LOADED_DURING);
    assert_eq!(registry.max_dtv_idx(), 1 + PRELOADED + LOADED_DURING);
}

#[test]
fn concurrent_writers_get_distinct_ids() {
    let registry = started_registry(4);
    let writers: Vec<_> = (0..4)
        .map(|t| {
            thread::spawn(move || {
                (0..25)
                    .map(|i| registry.register_module(module((t * 25 + i) as u8, 4)))
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for writer in writers {
        for id in writer.join().unwrap() {
            assert!(ids.insert(id));
        }
    }
    assert_eq!(ids.len(), 100);
    assert_eq!(ids, (2..=101).collect());
    assert_eq!(registry.current_generation(), 100);
    for id in 2..=101 {
        assert_eq!(registry.module(id).unwrap().module_id(), id);
    }
}

#[test]
fn readers_race_with_unregistration() {
    const READERS: usize = 3;
    const STABLE: usize = 4;
    const ROUNDS: usize = 50;

    let registry = started_registry(4);
    let resolver = Resolver::new(registry, DtvAtTp);

    let mut descriptors = Vec::new();
    for i in 0..STABLE {
        let marker = 0x70 + i as u8;
        let id = registry.register_module(module(marker, 8));
        let arg: &'static TlsDescDynamicArg =
            Box::leak(Box::new(resolver.make_dynamic_descriptor(id, 5)));
        descriptors.push((arg, marker));
    }
    let descriptors: &'static [(&'static TlsDescDynamicArg, u8)] =
        Box::leak(descriptors.into_boxed_slice());
    let top = 1 + STABLE;

    let barrier = Arc::new(Barrier::new(READERS + 1));
    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let barrier = barrier.clone();
            let done = done.clone();
            thread::spawn(move || {
                let resolver = Resolver::new(registry, DtvAtTp);
                let mut dtv = Dtv::with_capacity(2).unwrap();
                let mut blocks = Vec::new();
                barrier.wait();
                loop {
                    let finished = done.load(Ordering::Acquire);
                    blocks.clear();
                    for (arg, marker) in descriptors {
                        let addr = resolver.resolve_dynamic(&mut dtv, 0, arg).unwrap();
                        assert_eq!(unsafe { *addr }, *marker);
                        blocks.push(addr);
                    }
                    if finished {
                        break;
                    }
                }
                // Churn never touches the stable modules, so their blocks stay put.
                for ((arg, _), block) in descriptors.iter().zip(&blocks) {
                    let again = resolver.resolve_dynamic(&mut dtv, 0, arg).unwrap();
                    assert_eq!(again, *block);
                }
                dtv.generation()
            })
        })
        .collect();

    barrier.wait();
    for round in 0..ROUNDS {
        let marker = round as u8;
        let first = registry.register_module(module(marker, 8));
        let second = registry.register_module(module(marker, 8));
        assert_eq!((first, second), (top + 1, top + 2));

        registry.unregister_module(first).unwrap();
        assert!(registry.has_gaps());
        let reused = registry.register_module(module(marker, 8));
        assert_eq!(reused, first);

        registry.unregister_module(second).unwrap();
        assert_eq!(registry.max_dtv_idx(), reused);
        registry.unregister_module(reused).unwrap();
        assert_eq!(registry.max_dtv_idx(), top);
        assert_eq!(
            registry.unregister_module(reused),
            Err(TlsError::UnknownModule(reused))
        );
    }
    done.store(true, Ordering::Release);

    for reader in readers {
        let generation = reader.join().unwrap();
        assert!(generation <= registry.current_generation());
    }
    assert_eq!(registry.current_generation(), STABLE + 5 * ROUNDS);
    for id in 2..=top {
        assert_eq!(registry.module(id).unwrap().module_id(), id);
    }
    assert!(registry.module(top + 1).is_none());
}
