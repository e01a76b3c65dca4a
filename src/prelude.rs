//! Platform glue. The logging macros used throughout the crate resolve to
//! `log` when the `std` feature is enabled and to `defmt` on bare-metal ARM
//! targets, so the same call sites work both under `cargo test` on a
//! workstation and cross-compiled onto a microcontroller.

pub use core::fmt::Debug;

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        #[cfg(feature = "std")]
        { log::info!($($arg)*); }
        #[cfg(all(not(feature = "std"), target_arch = "arm"))]
        { defmt::info!($($arg)*); }
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        #[cfg(feature = "std")]
        { log::debug!($($arg)*); }
        #[cfg(all(not(feature = "std"), target_arch = "arm"))]
        { defmt::debug!($($arg)*); }
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        #[cfg(feature = "std")]
        { log::warn!($($arg)*); }
        #[cfg(all(not(feature = "std"), target_arch = "arm"))]
        { defmt::warn!($($arg)*); }
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        #[cfg(feature = "std")]
        { log::error!($($arg)*); }
        #[cfg(all(not(feature = "std"), target_arch = "arm"))]
        { defmt::error!($($arg)*); }
    };
}
