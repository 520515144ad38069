//! Wall-clock timing for transfers.

use std::time::{Duration, Instant};
use tracing::info;

/// Measures a named operation and reports it exactly once, either when
/// [`TransferTimer::finish`] is called or when the timer is dropped (so an
/// early return or panic inside the timed block still produces a line).
#[derive(Debug)]
pub struct TransferTimer {
    label: String,
    started: Instant,
    reported: bool,
}

impl TransferTimer {
    pub fn start(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            started: Instant::now(),
            reported: false,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Stop the timer, emit the timing line and return the elapsed seconds.
    pub fn finish(mut self) -> f64 {
        self.report()
    }

    fn report(&mut self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if !self.reported {
            self.reported = true;
            info!(target: "dropbridge::timing", "{}", format_timing(&self.label, secs));
        }
        secs
    }
}

impl Drop for TransferTimer {
    fn drop(&mut self) {
        self.report();
    }
}

/// `Total elapsed time for <label>: <seconds>` with millisecond precision.
pub fn format_timing(label: &str, seconds: f64) -> String {
    format!("Total elapsed time for {}: {:.3}", label, seconds)
}
