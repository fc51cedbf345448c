//! Transfer counters and windowed throughput.

use std::time::{Duration, Instant};

/// Throughput of one window of `queue_depth` completions.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowReport {
    /// 1-based window number.
    pub window: u64,
    /// Cumulative successful transfers.
    pub success_count: u64,
    /// Cumulative failed transfers.
    pub failure_count: u64,
    /// Bytes of the completion that closed the window.
    pub last_transfer_len: usize,
    /// Bytes received in this window.
    pub window_bytes: u64,
    pub elapsed: Duration,
    pub bytes_per_sec: f64,
}

/// Totals reported once the session is drained.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSummary {
    pub success_count: u64,
    pub failure_count: u64,
    pub total_bytes: u64,
    pub windows_reported: u64,
    /// Slots left idle after a rejected submission.
    pub slots_dropped: usize,
    pub elapsed: Duration,
}

impl SessionSummary {
    /// Average rate over the whole session.
    pub fn bytes_per_sec(&self) -> f64 {
        rate(self.total_bytes, self.elapsed)
    }
}

fn rate(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 { bytes as f64 / secs } else { 0.0 }
}

/// Success and failure counts run for the whole session. The window counters
/// reset every `queue_depth` completions.
#[derive(Debug, Clone)]
pub struct StreamingStatistics {
    queue_depth: usize,
    success_count: u64,
    failure_count: u64,
    window_bytes: u64,
    window_count: usize,
    window_start: Instant,
    total_bytes: u64,
    windows_reported: u64,
}

impl StreamingStatistics {
    pub fn new(queue_depth: usize, now: Instant) -> Self {
        Self {
            queue_depth: queue_depth.max(1),
            success_count: 0,
            failure_count: 0,
            window_bytes: 0,
            window_count: 0,
            window_start: now,
            total_bytes: 0,
            windows_reported: 0,
        }
    }

    /// Start a fresh window at `now` without touching the counters.
    pub fn restart_window(&mut self, now: Instant) {
        self.window_bytes = 0;
        self.window_count = 0;
        self.window_start = now;
    }

    pub fn record_success(&mut self, actual_len: usize, now: Instant) -> Option<WindowReport> {
        self.success_count += 1;
        self.window_bytes += actual_len as u64;
        self.total_bytes += actual_len as u64;
        self.advance(actual_len, now)
    }

    pub fn record_failure(&mut self, now: Instant) -> Option<WindowReport> {
        self.failure_count += 1;
        self.advance(0, now)
    }

    fn advance(&mut self, last_transfer_len: usize, now: Instant) -> Option<WindowReport> {
        self.window_count += 1;
        if self.window_count < self.queue_depth {
            return None;
        }

        let elapsed = now.saturating_duration_since(self.window_start);
        self.windows_reported += 1;
        let report = WindowReport {
            window: self.windows_reported,
            success_count: self.success_count,
            failure_count: self.failure_count,
            last_transfer_len,
            window_bytes: self.window_bytes,
            elapsed,
            bytes_per_sec: rate(self.window_bytes, elapsed),
        };
        self.restart_window(now);
        Some(report)
    }

    pub fn success_count(&self) -> u64 {
        self.success_count
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count
    }

    pub fn window_bytes(&self) -> u64 {
        self.window_bytes
    }

    pub fn window_count(&self) -> usize {
        self.window_count
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn windows_reported(&self) -> u64 {
        self.windows_reported
    }
}
