//! Supporting utility macros shared across the crate.

/// Trace when the `log` feature is enabled. No-op (and no formatting cost) otherwise.
macro_rules! trace {
    ($($tt:tt)*) => {
        #[cfg(feature = "log")]
        log::trace!($($tt)*)
    };
}

/// Log an error when the `log` feature is enabled.
macro_rules! error {
    ($($tt:tt)*) => {
        #[cfg(feature = "log")]
        log::error!($($tt)*)
    };
}

/// Create and enter a `tracing` span when the `verbose` feature is enabled.
macro_rules! span {
    ($($tt:tt)*) => {
        #[cfg(feature = "verbose")]
        let s = tracing::trace_span!($($tt)*);
        #[cfg(feature = "verbose")]
        let _s = s.enter();
    };
}

pub(crate) use trace;
pub(crate) use error;
pub(crate) use span;
