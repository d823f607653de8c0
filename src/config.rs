//! Backend configuration parameters
//!
//! All tunable parameters for the arm control backend. Every section
//! deserialises with defaults, so a partial `settings` block in the
//! persisted document only overrides what it names.

use serde::{Deserialize, Serialize};

use crate::app::program::MotionParams;

/// Core backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub channel: ChannelConfig,
    pub health: HealthWeights,
    pub smoothing: SmoothingConfig,
    pub pins: PinDefaults,
    pub automation: AutomationLimits,
    /// Motion parameters pushed to the controller before each waypoint task
    pub motion: MotionParams,
    /// Real-time position poll period (milliseconds)
    pub realtime_interval_ms: u64,
    pub bus: BusConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            health: HealthWeights::default(),
            smoothing: SmoothingConfig::default(),
            pins: PinDefaults::default(),
            automation: AutomationLimits::default(),
            motion: MotionParams::default(),
            realtime_interval_ms: 50, // 20 Hz
            bus: BusConfig::default(),
        }
    }
}

/// Command channel timing and liveness probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Settling delay after opening the port, while the controller reboots
    pub boot_delay_ms: u64,
    /// Per-command read timeout
    pub read_timeout_ms: u64,
    /// Command sent right after opening the link
    pub probe_command: String,
    /// Prefix the probe reply must start with
    pub probe_prefix: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            boot_delay_ms: 2000,
            read_timeout_ms: 1000,
            probe_command: "GET_STATUS".into(),
            probe_prefix: "STATUS:".into(),
        }
    }
}

/// Health score weighting.
///
/// `score = success_weight × successRate − latencyPenalty − errorPenalty`,
/// where `latencyPenalty = min(latency_cap, max(0, (avg − latency_threshold_secs) × latency_slope))`
/// and `errorPenalty = errors / max(1, total) × error_weight`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthWeights {
    pub success_weight: f32,
    pub latency_threshold_secs: f32,
    pub latency_slope: f32,
    pub latency_cap: f32,
    pub error_weight: f32,
}

impl Default for HealthWeights {
    fn default() -> Self {
        Self {
            success_weight: 100.0,
            latency_threshold_secs: 0.1,
            latency_slope: 100.0,
            latency_cap: 20.0,
            error_weight: 30.0,
        }
    }
}

/// Exponential smoothing of analog samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothingConfig {
    pub enabled: bool,
    /// Weight of the new raw sample; the previous smoothed value gets `1 − weight`
    pub sample_weight: f32,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_weight: 0.3,
        }
    }
}

/// Digital pin layout of the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinDefaults {
    /// Pin reported at index 0 of a `STATUS:` reply
    pub status_first_pin: u8,
    /// Pins configured as `OUTPUT` after every successful connect
    pub default_outputs: Vec<u8>,
}

impl Default for PinDefaults {
    fn default() -> Self {
        Self {
            status_first_pin: 2,
            default_outputs: (2..=13).collect(),
        }
    }
}

/// Authoring limits and motion timing for the automation engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationLimits {
    /// Maximum number of waypoint tasks held at once
    pub max_tasks: usize,
    /// Maximum waypoints per task
    pub max_waypoints: usize,
    /// Lower bound on the per-waypoint motion-completion wait (seconds)
    pub min_motion_secs: f32,
}

impl Default for AutomationLimits {
    fn default() -> Self {
        Self {
            max_tasks: 6,
            max_waypoints: 250,
            min_motion_secs: 0.5,
        }
    }
}

/// Event dispatch loop timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// How long the dispatch loop blocks on an empty queue before re-checking shutdown
    pub poll_interval_ms: u64,
    /// Upper bound on how long `stop()` waits for the loop to drain
    pub stop_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            stop_timeout_ms: 1000,
        }
    }
}

impl BackendConfig {
    /// Settings suited to an in-memory controller: no boot delay, short
    /// timeouts, no default pin fan-out.
    pub fn simulated() -> Self {
        Self {
            channel: ChannelConfig {
                boot_delay_ms: 0,
                read_timeout_ms: 200,
                ..ChannelConfig::default()
            },
            pins: PinDefaults {
                default_outputs: Vec::new(),
                ..PinDefaults::default()
            },
            bus: BusConfig {
                poll_interval_ms: 10,
                stop_timeout_ms: 500,
            },
            ..Self::default()
        }
    }
}
