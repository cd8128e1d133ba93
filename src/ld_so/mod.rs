//! Static TLS bootstrap and the module registry behind dynamic TLS.

use core::ffi::CStr;
#[cfg(target_os = "linux")]
use core::sync::atomic::{AtomicIsize, Ordering};

use generic_rt::ExpectTlsFree;
use spin::Once;

use self::{
    dtv::{Dtv, DtvSlot, STATIC_DTV_LEN},
    layout::NativeLayout,
    registry::{ModuleTls, Registry, SlotinfoEntry},
    segment::TlsSegment,
    tcb::NativeThreadPointer,
};
use crate::{
    config::TlsConfig,
    platform,
    raw_cell::RawCell,
    start::{Bootstrap, Stack},
};

pub mod dtv;
pub mod early_alloc;
pub mod layout;
pub mod registry;
pub mod resolve;
pub mod segment;
pub mod tcb;
pub mod thread;
pub mod tlsdesc;

static STATIC_SLOTINFO: [SlotinfoEntry; STATIC_DTV_LEN] =
    [const { SlotinfoEntry::new() }; STATIC_DTV_LEN];
static REGISTRY: Registry = Registry::new(&STATIC_SLOTINFO);
static PRIMARY_TLS: Once<ModuleTls> = Once::new();

static STATIC_DTV: RawCell<[DtvSlot; STATIC_DTV_LEN]> =
    RawCell::new([DtvSlot::EMPTY; STATIC_DTV_LEN]);
static INITIAL_DTV: RawCell<Option<Dtv>> = RawCell::new(None);

/// Thread-pointer relative offset of the rseq area, 0 until TLS is set up.
#[cfg(target_os = "linux")]
pub static RSEQ_OFFSET: AtomicIsize = AtomicIsize::new(0);

#[cfg(not(target_os = "linux"))]
const EARLY_ARENA_SIZE: usize = 64 * 1024;
#[cfg(not(target_os = "linux"))]
static EARLY_ARENA: RawCell<[u8; EARLY_ARENA_SIZE]> = RawCell::new([0; EARLY_ARENA_SIZE]);

/// The process registry, seeded by [`static_init`].
pub fn registry() -> &'static Registry {
    &REGISTRY
}

/// Set up TLS for the initial thread of a statically linked program. Returns the thread pointer.
///
/// Failures here are fatal: the process has no usable TLS and cannot continue.
pub unsafe fn static_init(sp: &'static Stack) -> usize {
    generic_rt::set_notls_sink(platform::stderr_sink);

    let config = TlsConfig::from_env(sp.env());
    let segment = TlsSegment::from_auxv(sp.auxv()).expect_notls("failed to read the TLS segment");

    INITIAL_DTV.unsafe_set(Some(Dtv::from_static(STATIC_DTV.unsafe_mut())));
    let dtv = INITIAL_DTV
        .unsafe_mut()
        .as_mut()
        .expect_notls("initial DTV missing");

    #[cfg(target_os = "linux")]
    let mut bootstrap = Bootstrap {
        layout: NativeLayout,
        allocator: early_alloc::SbrkAllocator,
        extra: layout::RseqArea::new(),
        thread_pointer: NativeThreadPointer,
    };
    #[cfg(not(target_os = "linux"))]
    let mut bootstrap = Bootstrap {
        layout: NativeLayout,
        allocator: early_alloc::BumpAllocator::new(EARLY_ARENA.unsafe_mut()),
        extra: layout::NoExtraTls,
        thread_pointer: NativeThreadPointer,
    };

    let tls = bootstrap
        .setup_tls(&segment, &config, &REGISTRY, &PRIMARY_TLS, dtv)
        .expect_notls("failed to set up static TLS");

    #[cfg(target_os = "linux")]
    if let Some(offset) = bootstrap.extra.offset() {
        RSEQ_OFFSET.store(offset, Ordering::Relaxed);
    }

    tlsdesc::install_context(&REGISTRY);
    let program = (!sp.argv0.is_null())
        .then(|| CStr::from_ptr(sp.argv0).to_bytes())
        .and_then(|bytes| core::str::from_utf8(bytes).ok());
    platform::logger::init(program, sp.env());
    log::debug!("TLS ready, tunables {:?}", config);

    tls.thread_pointer()
}
