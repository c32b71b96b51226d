//! Conditional tracing for load, verify and inference paths
//!
//! With the `tracing` feature enabled the macros expand to `tracing` spans
//! and debug events. Without it they compile to nothing.
//!
//! ```rust,ignore
//! fn forward_pass() {
//!     let _guard = trace_enter!("forward");
//!     trace_event!(layers = 3, "running layers");
//! }
//! ```

/// Create a tracing span (no-op when tracing feature is disabled)
#[macro_export]
#[cfg(feature = "tracing")]
macro_rules! trace_span {
    ($name:expr) => {
        tracing::span!(tracing::Level::DEBUG, $name)
    };
    ($name:expr, $($field:tt)*) => {
        tracing::span!(tracing::Level::DEBUG, $name, $($field)*)
    };
}

/// Create a tracing span (no-op when tracing feature is disabled)
#[macro_export]
#[cfg(not(feature = "tracing"))]
macro_rules! trace_span {
    ($name:expr) => {
        ()
    };
    ($name:expr, $($field:tt)*) => {
        ()
    };
}

/// Guard returned by `trace_enter!` when tracing is compiled out
#[cfg(not(feature = "tracing"))]
pub struct NoopSpanGuard;

/// Enter a span for the rest of the enclosing scope
#[macro_export]
#[cfg(feature = "tracing")]
macro_rules! trace_enter {
    ($name:expr) => {
        tracing::span!(tracing::Level::DEBUG, $name).entered()
    };
    ($name:expr, $($field:tt)*) => {
        tracing::span!(tracing::Level::DEBUG, $name, $($field)*).entered()
    };
}

/// Enter a span for the rest of the enclosing scope
#[macro_export]
#[cfg(not(feature = "tracing"))]
macro_rules! trace_enter {
    ($name:expr) => {
        $crate::trace::NoopSpanGuard
    };
    ($name:expr, $($field:tt)*) => {
        $crate::trace::NoopSpanGuard
    };
}

/// Emit a debug event
#[macro_export]
#[cfg(feature = "tracing")]
macro_rules! trace_event {
    ($($arg:tt)*) => {
        tracing::debug!($($arg)*)
    };
}

/// Emit a debug event
#[macro_export]
#[cfg(not(feature = "tracing"))]
macro_rules! trace_event {
    ($($arg:tt)*) => {};
}

/// Emit a warning event
#[macro_export]
#[cfg(feature = "tracing")]
macro_rules! trace_warn {
    ($($arg:tt)*) => {
        tracing::warn!($($arg)*)
    };
}

/// Emit a warning event
#[macro_export]
#[cfg(not(feature = "tracing"))]
macro_rules! trace_warn {
    ($($arg:tt)*) => {};
}

pub use trace_enter;
pub use trace_event;
pub use trace_span;
pub use trace_warn;

#[cfg(test)]
mod tests {

    #[test]
    fn test_trace_macros_compile() {
        let _span = trace_span!("test_span");
        let _span = trace_span!("test_span", layer = 2);
        let _guard = trace_enter!("test_enter");
        let _guard = trace_enter!("test_enter", tokens = 7);
        trace_event!("test event");
        trace_event!(bits = 4, "with fields");
        trace_warn!("test warning");
    }
}
