//! Engine logging over `log` and `env_logger`.
//!
//! Logging is muted while other threads of the process are suspended, one of
//! them may hold the logger's lock or the allocator's.

use std::sync::atomic::{AtomicUsize, Ordering};

static MUTED: AtomicUsize = AtomicUsize::new(0);

#[inline(always)]
pub fn is_enabled() -> bool {
    MUTED.load(Ordering::Acquire) == 0
}

/// Engine logging stays muted until every [`Mute`] is dropped.
#[must_use]
pub struct Mute(());

pub fn mute() -> Mute {
    MUTED.fetch_add(1, Ordering::AcqRel);
    Mute(())
}

impl Drop for Mute {
    fn drop(&mut self) {
        MUTED.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Initialize `env_logger` once per process. `PYSTALKER_LOG` overrides `default_filter`.
pub fn init(default_filter: Option<&str>) {
    let env = env_logger::Env::default().filter_or("PYSTALKER_LOG", default_filter.unwrap_or("off"));
    _ = env_logger::Builder::from_env(env).format_timestamp_micros().try_init();
}

#[doc(hidden)]
#[macro_export]
macro_rules! _ps_log {
    ($level:ident, $target:expr, $($arg:tt)+) => {
        if $crate::log::is_enabled() {
            log::$level!(target: $target, $($arg)+)
        }
    };
}

#[macro_export]
macro_rules! ps_info {
    (target: $target:expr, $($arg:tt)+) => {
        $crate::_ps_log!(info, $target, $($arg)+)
    };
}

#[macro_export]
macro_rules! ps_warn {
    (target: $target:expr, $($arg:tt)+) => {
        $crate::_ps_log!(warn, $target, $($arg)+)
    };
}

#[macro_export]
macro_rules! ps_error {
    (target: $target:expr, $($arg:tt)+) => {
        $crate::_ps_log!(error, $target, $($arg)+)
    };
}

#[macro_export]
macro_rules! ps_debug {
    (target: $target:expr, $($arg:tt)+) => {
        $crate::_ps_log!(debug, $target, $($arg)+)
    };
}
