//! Conditional logging macros.
//!
//! With the `defmt` feature enabled on a non-std build these re-export the
//! `defmt` macros directly; otherwise they are thin wrappers over the `log`
//! crate. All crate-internal logging goes through this module.

#![allow(unused_macros)]

#[allow(unused_imports)]
#[cfg(all(feature = "defmt", not(feature = "std")))]
pub(crate) use defmt::{debug, error, info, trace, warn};

#[cfg(not(all(feature = "defmt", not(feature = "std"))))]
macro_rules! trace {
    ($($arg:tt)+) => (log::trace!($($arg)+))
}

#[cfg(not(all(feature = "defmt", not(feature = "std"))))]
macro_rules! debug {
    ($($arg:tt)+) => (log::debug!($($arg)+))
}

#[cfg(not(all(feature = "defmt", not(feature = "std"))))]
macro_rules! info {
    ($($arg:tt)+) => (log::info!($($arg)+))
}

// Named `_warn` internally: a macro re-exported as `warn` is ambiguous
// with the builtin `#[warn]` attribute.
#[cfg(not(all(feature = "defmt", not(feature = "std"))))]
macro_rules! _warn {
    ($($arg:tt)+) => (log::warn!($($arg)+))
}

#[cfg(not(all(feature = "defmt", not(feature = "std"))))]
macro_rules! error {
    ($($arg:tt)+) => (log::error!($($arg)+))
}

#[allow(unused_imports)]
#[cfg(not(all(feature = "defmt", not(feature = "std"))))]
pub(crate) use {_warn as warn, debug, error, info, trace};
