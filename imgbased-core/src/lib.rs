#![deny(clippy::disallowed_methods)]

pub mod bootloader;
pub mod check;
pub mod config;
pub mod error;
pub mod firstboot;
pub mod fs;
pub mod gc;
pub mod hooks;
pub mod imgbase;
pub mod layout;
pub mod lvm;
pub mod meta;
pub mod migrate;
pub mod naming;
pub mod recover;
pub mod rollback;
pub mod rpmdb;
pub mod runner;
pub mod update;
pub mod volume;

#[cfg(any(test, feature = "testutils"))]
pub mod testutils;

pub use error::Error;
pub use imgbase::{HostPaths, Imgbase};

/// A macro like scopeguard::defer! but can defer a future.
///
/// Note that other code running concurrently in the same task will be suspended
/// due to the call to block_in_place, until the future is finished.
///
/// # Examples
///
/// ```ignore
/// async_defer!(async {
///     // Do some cleanup
/// });
/// ```
///
/// # Panics
///
/// This macro should only be used in tokio multi-thread runtime, and will panics
/// if called from a [`current_thread`] runtime.
///
#[macro_export]
macro_rules! async_defer {
    ($future:expr) => {
        $crate::scopeguard::defer! {
            tokio::task::block_in_place(|| {
                tokio::runtime::Handle::current().block_on(async {
                    let _ = $future.await;
                });
            });
        }
    };
}

#[doc(hidden)]
pub use scopeguard;
