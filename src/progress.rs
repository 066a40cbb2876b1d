//! Speed and ETA over a task's current run.

use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ProgressSample {
    /// Bytes per second.
    pub speed: f64,
    /// `None` while the speed is zero.
    pub eta: Option<Duration>,
}

/// Cumulative average since `bytes_since_start` began counting.
pub fn compute_progress(
    bytes_since_start: u64,
    elapsed_secs: f64,
    total_bytes: u64,
    bytes_transferred: u64,
) -> ProgressSample {
    let speed = if elapsed_secs > 0.0 {
        bytes_since_start as f64 / elapsed_secs
    } else {
        0.0
    };
    let remaining = total_bytes.saturating_sub(bytes_transferred) as f64;
    let eta = (speed > 0.0 && speed.is_finite())
        .then(|| Duration::try_from_secs_f64(remaining / speed).ok())
        .flatten();
    ProgressSample { speed, eta }
}

/// Clock for one run of a task. Bytes already done when the run started
/// (resumed parts) do not count toward the speed.
#[derive(Debug, Clone, Copy)]
pub struct ProgressTracker {
    total_bytes: u64,
    baseline: u64,
    started: Instant,
}

impl ProgressTracker {
    pub fn start(total_bytes: u64, already_transferred: u64) -> Self {
        Self {
            total_bytes,
            baseline: already_transferred,
            started: Instant::now(),
        }
    }

    pub fn sample(&self, bytes_transferred: u64) -> ProgressSample {
        compute_progress(
            bytes_transferred.saturating_sub(self.baseline),
            self.started.elapsed().as_secs_f64(),
            self.total_bytes,
            bytes_transferred,
        )
    }
}
