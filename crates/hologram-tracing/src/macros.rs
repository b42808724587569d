//! Convenience macros for collective instrumentation.

/// Start a [`crate::CollectiveTimer`] for a collective call.
///
/// # Syntax
///
/// ```text
/// collective_span!("op", bytes)
/// collective_span!("op", bytes, field1 = value1, ...)
/// ```
///
/// Extra fields are emitted once on a debug event when the timer starts.
///
/// # Example
///
/// ```rust
/// use hologram_tracing::collective_span;
///
/// {
///     let _timer = collective_span!("all_max", 1024, count = 256, peer = 1);
///     // ... operation code ...
/// }
/// ```
#[macro_export]
macro_rules! collective_span {
    ($op:expr, $bytes:expr) => {{
        $crate::collective::CollectiveTimer::new($op, $bytes)
    }};
    ($op:expr, $bytes:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        let timer = $crate::collective::CollectiveTimer::new($op, $bytes);
        {
            let _enter = timer.span().enter();
            tracing::debug!($($field = $value),+, "collective_start");
        }
        timer
    }};
}
