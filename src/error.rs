use thiserror::Error;

pub type Result<T, E = TlsError> = core::result::Result<T, E>;

/// Failures of TLS layout, registration and resolution.
///
/// `EarlyAllocFailed` and `UnknownModule` are fatal where they happen on the startup and ABI
/// paths; callers there turn them into `panic_notls`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TlsError {
    #[error("TLS segment file size {file_size:#x} exceeds its memory size {mem_size:#x}")]
    MalformedSegment { file_size: usize, mem_size: usize },
    #[error("TLS alignment {0:#x} is not a power of two")]
    InvalidAlignment(usize),
    #[error("static TLS size computation overflowed")]
    Overflow,
    #[error("early allocator could not provide {0:#x} bytes")]
    EarlyAllocFailed(usize),
    #[error("extra TLS block at thread pointer offset {offset} does not fit the static block")]
    ExtraBlockOutOfRange { offset: isize },
    #[error("no TLS registered for module {0}")]
    UnknownModule(usize),
    #[error("module {0} lives in static TLS and cannot be unregistered")]
    StaticModule(usize),
    #[error("out of memory allocating {0:#x} bytes of TLS")]
    OutOfMemory(usize),
    #[error("module {0} is already registered, static TLS must be assigned before registration")]
    AlreadyRegistered(usize),
    #[error("not enough static TLS surplus left for {0:#x} bytes")]
    StaticTlsExhausted(usize),
    #[error("auxiliary vector has no {0}")]
    MissingAuxv(&'static str),
    #[error("unsupported program header entry size {0}")]
    UnsupportedPhent(usize),
    #[error("thread pointer could not be installed (error {0})")]
    ThreadPointer(isize),
}
