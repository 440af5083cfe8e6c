//! Structured logging wrappers that compile whether or not the `tracing`
//! feature is enabled, so the worker and archiver loops can log
//! unconditionally without a hard dependency on the crate.

#[cfg(feature = "tracing")]
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        tracing::debug!($($arg)*)
    };
}
#[cfg(not(feature = "tracing"))]
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "tracing")]
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        tracing::warn!($($arg)*)
    };
}
#[cfg(not(feature = "tracing"))]
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "tracing")]
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        tracing::error!($($arg)*)
    };
}
#[cfg(not(feature = "tracing"))]
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {};
}
