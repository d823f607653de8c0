//! System status snapshot and crash reporting.
//!
//! [`SystemStatus`] is the one-call view of the backend that dashboards and
//! the CLI `status` command render. The panic hook makes sure a crash on
//! any worker thread (dispatch loop, program run, position poller) leaves a
//! line in the log instead of vanishing with the thread.

use std::any::Any;
use std::collections::BTreeMap;

use serde::Serialize;

use crate::app::channel::ConnectionState;
use crate::health::ErrorEntry;

/// Point-in-time view of the link, health counters and session caches.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatus {
    pub state: ConnectionState,
    pub endpoint: Option<String>,
    /// Seconds since the Unix epoch.
    pub connected_at: Option<f64>,
    pub last_command_at: Option<f64>,
    pub health_score: f32,
    /// Seconds.
    pub average_latency: f32,
    pub total_commands: u64,
    pub failed_commands: u64,
    pub error_count: u64,
    pub active_programs: Vec<String>,
    pub pin_states: BTreeMap<u8, u8>,
    /// Smoothed values.
    pub analog_values: BTreeMap<String, f32>,
    pub positions: Vec<f32>,
    /// Handlers registered by callers.
    pub subscriber_count: usize,
    pub recent_errors: Vec<ErrorEntry>,
}

impl SystemStatus {
    /// One-line summary for logs and the CLI.
    pub fn summary(&self) -> String {
        format!(
            "state={:?} health={:.1} latency={:.1}ms commands={} failed={} errors={} running={}",
            self.state,
            self.health_score,
            self.average_latency * 1000.0,
            self.total_commands,
            self.failed_commands,
            self.error_count,
            self.active_programs.len(),
        )
    }
}

// ───────────────────────────────────────────────────────────────
// Panic hook
// ───────────────────────────────────────────────────────────────

fn panic_reason(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        *msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}

/// Install a panic hook that routes panics through the logger.
///
/// Call once from the binary after the logger is initialised.
pub fn install_panic_handler() {
    std::panic::set_hook(Box::new(|info| {
        let reason = panic_reason(info.payload());
        let thread = std::thread::current();
        let name = thread.name().unwrap_or("<unnamed>");
        match info.location() {
            Some(loc) => log::error!(
                "PANIC | thread '{name}' at {}:{}: {reason}",
                loc.file(),
                loc.line()
            ),
            None => log::error!("PANIC | thread '{name}': {reason}"),
        }
    }));
}
