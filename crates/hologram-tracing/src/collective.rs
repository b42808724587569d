//! Timing guard for collective operations.
//!
//! A collective blocks its stream worker until every participating rank has
//! entered it, so wall time per call is the first thing to look at when a
//! job stalls. [`CollectiveTimer`] records it along with payload size.
//!
//! ```rust
//! use hologram_tracing::CollectiveTimer;
//!
//! {
//!     let _timer = CollectiveTimer::new("all_sum", 4096);
//!     // ... blocking backend call ...
//! } // duration and bandwidth logged at debug
//! ```

use std::time::{Duration, Instant};

/// RAII guard that logs the duration of one collective call when dropped.
pub struct CollectiveTimer {
    operation: &'static str,
    bytes: usize,
    start: Instant,
    span: tracing::Span,
}

impl CollectiveTimer {
    /// Start timing `operation` moving `bytes` bytes from this rank.
    pub fn new(operation: &'static str, bytes: usize) -> Self {
        let span = tracing::debug_span!("collective", op = operation, bytes = bytes);
        Self {
            operation,
            bytes,
            start: Instant::now(),
            span,
        }
    }

    /// Time elapsed since the guard was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// The span the guard records into, for entering around the backend call.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }
}

impl Drop for CollectiveTimer {
    fn drop(&mut self) {
        let duration_us = self.start.elapsed().as_micros() as u64;
        let bandwidth_mb_s = bandwidth_mb_per_s(self.bytes, duration_us);
        let _enter = self.span.enter();
        tracing::debug!(
            op = self.operation,
            bytes = self.bytes,
            duration_us = duration_us,
            bandwidth_mb_s = bandwidth_mb_s,
            "collective_complete"
        );
    }
}

/// Payload throughput in MB/s; zero when no time elapsed.
pub fn bandwidth_mb_per_s(bytes: usize, duration_us: u64) -> f64 {
    if duration_us == 0 {
        return 0.0;
    }
    bytes as f64 / duration_us as f64
}
