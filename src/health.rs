//! Link health and performance bookkeeping.
//!
//! Pure counters over command outcomes: a rolling latency window, the
//! cumulative success/failure tally, a bounded error log, and the derived
//! 0–100 health score. The monitor lives inside the command channel's
//! exclusive section, so it carries no lock of its own.

use heapless::HistoryBuffer;
use serde::Serialize;

use crate::app::channel::ConnectionState;
use crate::config::HealthWeights;
use crate::events::unix_now;

/// Most recent latency samples retained for the rolling average.
pub const LATENCY_WINDOW: usize = 100;

/// Most recent error log entries retained.
pub const ERROR_LOG_CAP: usize = 50;

/// One entry in the bounded error log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEntry {
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    pub message: String,
    pub context: String,
    pub state: ConnectionState,
}

/// Read-only copy of the counters, for status snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HealthCounters {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub errors: u64,
    pub average_latency: f32,
}

pub struct HealthMonitor {
    weights: HealthWeights,
    total: u64,
    successful: u64,
    failed: u64,
    /// Every error recorded, including ones already evicted from the log.
    errors: u64,
    latencies: HistoryBuffer<f32, LATENCY_WINDOW>,
    average_latency: f32,
    error_log: HistoryBuffer<ErrorEntry, ERROR_LOG_CAP>,
}

impl HealthMonitor {
    pub fn new(weights: HealthWeights) -> Self {
        Self {
            weights,
            total: 0,
            successful: 0,
            failed: 0,
            errors: 0,
            latencies: HistoryBuffer::new(),
            average_latency: 0.0,
            error_log: HistoryBuffer::new(),
        }
    }

    /// Count one command outcome.
    pub fn record_outcome(&mut self, success: bool) {
        self.total += 1;
        if success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
    }

    /// Push a round-trip sample (seconds); the oldest sample is evicted once
    /// the window is full.
    pub fn record_latency(&mut self, secs: f32) {
        self.latencies.write(secs);
        let window = self.latencies.as_slice();
        self.average_latency = window.iter().sum::<f32>() / window.len() as f32;
    }

    /// Append to the error log, evicting the oldest entry when full.
    pub fn record_error(&mut self, message: &str, context: &str, state: ConnectionState) {
        self.errors += 1;
        self.error_log.write(ErrorEntry {
            timestamp: unix_now(),
            message: message.to_owned(),
            context: context.to_owned(),
            state,
        });
    }

    /// Derived 0–100 score.
    ///
    /// With no commands issued yet the score is 100 while connected and 0
    /// otherwise.
    pub fn health_score(&self, state: ConnectionState) -> f32 {
        if self.total == 0 {
            return if state == ConnectionState::Connected {
                100.0
            } else {
                0.0
            };
        }

        let w = &self.weights;
        let success_rate = self.successful as f32 / self.total as f32;
        let latency_penalty = ((self.average_latency - w.latency_threshold_secs) * w.latency_slope)
            .max(0.0)
            .min(w.latency_cap);
        let error_penalty = (self.errors as f32 / self.total.max(1) as f32) * w.error_weight;

        (success_rate * w.success_weight - latency_penalty - error_penalty).clamp(0.0, 100.0)
    }

    pub fn counters(&self) -> HealthCounters {
        HealthCounters {
            total: self.total,
            successful: self.successful,
            failed: self.failed,
            errors: self.errors,
            average_latency: self.average_latency,
        }
    }

    pub fn average_latency(&self) -> f32 {
        self.average_latency
    }

    pub fn latency_samples(&self) -> usize {
        self.latencies.len()
    }

    /// Error log, oldest first.
    pub fn error_log(&self) -> Vec<ErrorEntry> {
        self.error_log.oldest_ordered().cloned().collect()
    }
}
