//! Program data model: pin-step sequences and multi-axis waypoint tasks.
//!
//! Both kinds share one namespace in the automation engine, so a name
//! identifies at most one program and at most one run.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::events::unix_now;
use crate::protocol::validate_channel;

// ───────────────────────────────────────────────────────────────
// Pin-step sequences
// ───────────────────────────────────────────────────────────────

/// A step as authored and persisted. Parsed into a [`Step`] before it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDef {
    /// `DIGITAL_WRITE`, `DIGITAL_READ`, `ANALOG_READ` or `WAIT`.
    pub action: String,
    /// Digital pin number or analog channel name; unused by `WAIT`.
    #[serde(default)]
    pub pin: String,
    /// Output level for writes, seconds for `WAIT`.
    #[serde(default)]
    pub value: f64,
    /// Extra pause after the step, in seconds.
    #[serde(default)]
    pub delay: f64,
}

impl StepDef {
    pub fn digital_write(pin: u8, value: u8) -> Self {
        Self::new("DIGITAL_WRITE", pin.to_string(), f64::from(value))
    }

    pub fn digital_read(pin: u8) -> Self {
        Self::new("DIGITAL_READ", pin.to_string(), 0.0)
    }

    pub fn analog_read(channel: &str) -> Self {
        Self::new("ANALOG_READ", channel.to_owned(), 0.0)
    }

    pub fn wait(secs: f64) -> Self {
        Self::new("WAIT", String::new(), secs)
    }

    fn new(action: &str, pin: String, value: f64) -> Self {
        Self {
            action: action.to_owned(),
            pin,
            value,
            delay: 0.0,
        }
    }

    pub fn with_delay(mut self, secs: f64) -> Self {
        self.delay = secs;
        self
    }

    /// Validate the definition into an executable step.
    pub fn parse(&self) -> Result<Step, String> {
        let action = match self.action.trim().to_ascii_uppercase().as_str() {
            "DIGITAL_WRITE" => {
                let pin = parse_pin(&self.pin)?;
                let value = match self.value {
                    v if v == 0.0 => 0,
                    v if v == 1.0 => 1,
                    v => return Err(format!("digital value must be 0 or 1, got {v}")),
                };
                StepAction::DigitalWrite { pin, value }
            }
            "DIGITAL_READ" => StepAction::DigitalRead {
                pin: parse_pin(&self.pin)?,
            },
            "ANALOG_READ" => {
                let channel = self.pin.trim();
                validate_channel(channel).map_err(|e| e.to_string())?;
                StepAction::AnalogRead {
                    channel: channel.to_owned(),
                }
            }
            "WAIT" => StepAction::Wait(secs_to_duration(self.value, "wait")?),
            other => return Err(format!("unknown action {other:?}")),
        };
        Ok(Step {
            action,
            delay: secs_to_duration(self.delay, "delay")?,
        })
    }
}

fn parse_pin(pin: &str) -> Result<u8, String> {
    let pin = pin.trim();
    if pin.is_empty() || !pin.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("invalid digital pin {pin:?}"));
    }
    pin.parse().map_err(|_| format!("invalid digital pin {pin:?}"))
}

fn secs_to_duration(secs: f64, what: &str) -> Result<Duration, String> {
    if secs.is_finite() && secs >= 0.0 {
        Ok(Duration::from_secs_f64(secs))
    } else {
        Err(format!("{what} must be a non-negative number of seconds, got {secs}"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepAction {
    DigitalWrite { pin: u8, value: u8 },
    DigitalRead { pin: u8 },
    AnalogRead { channel: String },
    Wait(Duration),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub action: StepAction,
    pub delay: Duration,
}

/// Named, ordered pin program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    pub name: String,
    pub steps: Vec<StepDef>,
    /// Wrap to the first step after the last one.
    #[serde(rename = "loop", default)]
    pub looping: bool,
    /// Pause between consecutive steps, in seconds.
    #[serde(rename = "interval", default = "default_interval")]
    pub interval_secs: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_interval() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

impl Sequence {
    pub fn new(name: &str, steps: Vec<StepDef>, looping: bool, interval_secs: f64) -> Self {
        Self {
            name: name.to_owned(),
            steps,
            looping,
            interval_secs,
            enabled: true,
        }
    }

    /// Reject the whole definition if any part of it is malformed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_name(&self.name)?;
        if !(self.interval_secs.is_finite() && self.interval_secs >= 0.0) {
            return Err(ConfigError::InvalidProgram(format!(
                "interval must be a non-negative number of seconds, got {}",
                self.interval_secs
            )));
        }
        for (index, step) in self.steps.iter().enumerate() {
            step.parse()
                .map_err(|reason| ConfigError::InvalidStep { index, reason })?;
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        secs_to_duration(self.interval_secs, "interval").unwrap_or_default()
    }
}

pub(crate) fn validate_name(name: &str) -> Result<(), ConfigError> {
    if name.trim().is_empty() {
        return Err(ConfigError::InvalidProgram("program name must not be empty".into()));
    }
    if name.contains(['/', '\\']) {
        return Err(ConfigError::InvalidProgram(format!(
            "program name {name:?} must not contain path separators"
        )));
    }
    Ok(())
}

// ───────────────────────────────────────────────────────────────
// Waypoint tasks
// ───────────────────────────────────────────────────────────────

/// Interpolation hint forwarded to the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrajectoryType {
    #[default]
    Smooth,
    Linear,
    Cpg,
}

/// Speed/accuracy trade-off hint forwarded to the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MotionProfile {
    Fast,
    #[default]
    Normal,
    Slow,
    Precise,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    /// One target angle per axis, axis 1 first.
    pub positions: Vec<f32>,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u32,
    #[serde(default)]
    pub trajectory_type: TrajectoryType,
    #[serde(default)]
    pub motion_profile: MotionProfile,
}

fn default_delay_ms() -> u32 {
    500
}

impl Waypoint {
    pub fn new(positions: Vec<f32>) -> Self {
        Self {
            positions,
            delay_ms: default_delay_ms(),
            trajectory_type: TrajectoryType::default(),
            motion_profile: MotionProfile::default(),
        }
    }

    pub fn with_delay_ms(mut self, delay_ms: u32) -> Self {
        self.delay_ms = delay_ms;
        self
    }
}

/// Named list of waypoints played back in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub waypoints: Vec<Waypoint>,
    #[serde(rename = "loop", default)]
    pub looping: bool,
    /// Completed passes of a looping run.
    #[serde(default)]
    pub loop_count: u32,
    #[serde(default = "unix_now")]
    pub created_at: f64,
    #[serde(default = "unix_now")]
    pub modified_at: f64,
}

impl Task {
    pub fn new(name: &str, description: &str) -> Self {
        let now = unix_now();
        Self {
            name: name.to_owned(),
            description: description.to_owned(),
            waypoints: Vec::new(),
            looping: false,
            loop_count: 0,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            name: self.name.clone(),
            description: self.description.clone(),
            waypoint_count: self.waypoints.len(),
            looping: self.looping,
            loop_count: self.loop_count,
            created_at: self.created_at,
            modified_at: self.modified_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskInfo {
    pub name: String,
    pub description: String,
    pub waypoint_count: usize,
    pub looping: bool,
    pub loop_count: u32,
    pub created_at: f64,
    pub modified_at: f64,
}

/// Controller-side motion settings pushed before a waypoint task runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionParams {
    /// Degrees per second.
    pub speed: f32,
    /// Per-move duration; also the motion-completion wait.
    pub duration_ms: u32,
    pub precision: f32,
    pub cpg_enabled: bool,
    pub cpg_alpha: f32,
    pub interpolation: String,
    pub backlash: f32,
    pub smoothness: u32,
}

impl Default for MotionParams {
    fn default() -> Self {
        Self {
            speed: 30.0,
            duration_ms: 1200,
            precision: 1.0,
            cpg_enabled: false,
            cpg_alpha: 0.25,
            interpolation: "quintic".into(),
            backlash: 0.5,
            smoothness: 6,
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Program
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Program {
    Steps(Sequence),
    Waypoints(Task),
}

impl Program {
    pub fn name(&self) -> &str {
        match self {
            Self::Steps(s) => &s.name,
            Self::Waypoints(t) => &t.name,
        }
    }

    /// Steps or waypoints.
    pub fn len(&self) -> usize {
        match self {
            Self::Steps(s) => s.steps.len(),
            Self::Waypoints(t) => t.waypoints.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn enabled(&self) -> bool {
        match self {
            Self::Steps(s) => s.enabled,
            Self::Waypoints(_) => true,
        }
    }
}
