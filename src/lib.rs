//! Thread-local storage bootstrap and resolution for a Rust process runtime.
//!
//! Startup discovers the `PT_TLS` segment, lays out the initial thread's static TLS block,
//! installs the thread pointer and seeds the module registry. Afterwards the [`ld_so::resolve`]
//! module answers "where is this TLS variable for this thread" for both statically placed and
//! lazily allocated modules.

#![no_std]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::new_without_default)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod config;
pub mod error;
pub mod ld_so;
pub mod platform;
pub mod raw_cell;
pub mod start;

pub use crate::error::{Result, TlsError};
