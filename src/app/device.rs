//! Device service: pin configuration, digital/analog I/O and arm motion.
//!
//! Translates typed requests into wire commands on the shared
//! [`CommandChannel`], keeps the per-session caches (pin states, analog
//! values, smoothing history, positions) and publishes change events.
//!
//! The cache lock is never held across a command round-trip, so a slow
//! device only ever blocks on the channel's own mutex.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use heapless::HistoryBuffer;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::SmoothingConfig;
use crate::error::{ConfigError, Error, Result};
use crate::events::{EventBus, EventKind, PinKind};
use crate::protocol::{self, Command, PinMode};

use super::channel::CommandChannel;
use super::program::MotionParams;

const SOURCE: &str = "device";

/// Smoothed samples kept per analog channel.
pub const SMOOTHING_WINDOW: usize = 5;

/// Debounce applied to pins configured implicitly.
const DEFAULT_DEBOUNCE_MS: u32 = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinConfig {
    pub mode: PinMode,
    #[serde(default = "default_debounce")]
    pub debounce_ms: u32,
}

fn default_debounce() -> u32 {
    DEFAULT_DEBOUNCE_MS
}

impl PinConfig {
    pub fn new(mode: PinMode) -> Self {
        Self {
            mode,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
        }
    }
}

/// Smoothing settings for one analog channel, overriding the backend-wide
/// [`SmoothingConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalogConfig {
    #[serde(default = "default_smoothing")]
    pub smoothing_enabled: bool,
    /// Weight of the new raw sample; `None` keeps the backend-wide weight
    #[serde(default)]
    pub smoothing_factor: Option<f32>,
}

fn default_smoothing() -> bool {
    true
}

/// Latest analog reading for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AnalogReading {
    pub value: f32,
    pub raw: u16,
}

/// Exponential smoother over a short history of filtered values.
///
/// The first sample seeds the history unchanged; every later sample yields
/// `(1 − weight) × previous + weight × raw`.
#[derive(Default)]
pub struct Smoother {
    history: HistoryBuffer<f32, SMOOTHING_WINDOW>,
}

impl Smoother {
    pub fn next(&mut self, raw: f32, weight: f32) -> f32 {
        let smoothed = match self.history.recent() {
            Some(prev) => (1.0 - weight) * prev + weight * raw,
            None => raw,
        };
        self.history.write(smoothed);
        smoothed
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

#[derive(Default)]
struct Session {
    pins: BTreeMap<u8, PinConfig>,
    pin_states: BTreeMap<u8, u8>,
    analog_configs: BTreeMap<String, AnalogConfig>,
    analog: BTreeMap<String, AnalogReading>,
    smoothers: HashMap<String, Smoother>,
    positions: Vec<f32>,
}

pub struct DeviceService {
    channel: Arc<CommandChannel>,
    bus: EventBus,
    smoothing: SmoothingConfig,
    status_first_pin: u8,
    session: Mutex<Session>,
}

impl DeviceService {
    pub fn new(
        channel: Arc<CommandChannel>,
        bus: EventBus,
        smoothing: SmoothingConfig,
        status_first_pin: u8,
    ) -> Self {
        Self {
            channel,
            bus,
            smoothing,
            status_first_pin,
            session: Mutex::new(Session::default()),
        }
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Round-trip on the channel. A lost link drops the session caches
    /// before the error is returned.
    fn request<T>(&self, command: &str, parse: impl FnOnce(&str) -> Option<T>) -> Result<T> {
        let result = self.channel.request(command, parse);
        if matches!(&result, Err(Error::Command(e)) if e.cause.is_link_lost()) {
            debug!("DEV | link lost, dropping session caches");
            self.clear_session();
        }
        result
    }

    // ── Pin configuration ─────────────────────────────────────

    /// Set `pin`'s mode on the device; the configuration is kept only if the
    /// device accepts it.
    pub fn configure_pin(&self, pin: u8, config: PinConfig) -> Result<()> {
        let command = Command::PinMode { pin, mode: config.mode }.to_string();
        self.request(&command, ok_reply)?;
        debug!("DEV | pin {pin} configured as {}", config.mode);
        self.session().pins.insert(pin, config);
        Ok(())
    }

    pub fn pin_config(&self, pin: u8) -> Option<PinConfig> {
        self.session().pins.get(&pin).cloned()
    }

    pub fn pin_configs(&self) -> BTreeMap<u8, PinConfig> {
        self.session().pins.clone()
    }

    /// Record configurations without touching the device; they are applied
    /// by the next [`reapply_configurations`](Self::reapply_configurations).
    pub fn register_configs(&self, configs: BTreeMap<u8, PinConfig>) {
        self.session().pins.extend(configs);
    }

    /// Push every known configuration to a freshly connected device.
    /// Returns how many were accepted; rejections are logged.
    pub fn reapply_configurations(&self) -> usize {
        let configs = self.pin_configs();
        let mut applied = 0;
        for (pin, config) in configs {
            match self.configure_pin(pin, config) {
                Ok(()) => applied += 1,
                Err(e) => warn!("DEV | could not re-apply pin {pin} configuration: {e}"),
            }
        }
        if applied > 0 {
            info!("DEV | re-applied {applied} pin configuration(s)");
        }
        applied
    }

    /// Override smoothing for one analog channel. Nothing is sent to the
    /// device; the override applies from the next sample on.
    pub fn configure_analog(&self, channel: &str, config: AnalogConfig) -> Result<()> {
        protocol::validate_channel(channel)?;
        let out_of_range = |f: &f32| !(0.0..=1.0).contains(f);
        if let Some(factor) = config.smoothing_factor.filter(out_of_range) {
            return Err(ConfigError::InvalidSmoothingFactor(factor.to_string()).into());
        }
        debug!("DEV | analog {channel} smoothing {config:?}");
        self.session().analog_configs.insert(channel.to_owned(), config);
        Ok(())
    }

    pub fn analog_configs(&self) -> BTreeMap<String, AnalogConfig> {
        self.session().analog_configs.clone()
    }

    /// Record channel overrides loaded from storage.
    pub fn register_analog_configs(&self, configs: BTreeMap<String, AnalogConfig>) {
        self.session().analog_configs.extend(configs);
    }

    // ── Digital I/O ───────────────────────────────────────────

    /// Drive `pin` to `value` (0 or 1). An unconfigured pin is configured as
    /// `OUTPUT` first.
    pub fn write_digital(&self, pin: u8, value: u8) -> Result<()> {
        if value > 1 {
            return Err(ConfigError::InvalidDigitalValue(value).into());
        }
        let known = self.session().pins.contains_key(&pin);
        if !known {
            self.configure_pin(pin, PinConfig::new(PinMode::Output))?;
        }

        let command = Command::DigitalWrite { pin, value }.to_string();
        self.request(&command, ok_reply)?;
        self.session().pin_states.insert(pin, value);
        self.publish_pin(pin, value);
        Ok(())
    }

    /// Read `pin` as-is; an unconfigured pin is not configured first.
    pub fn read_digital(&self, pin: u8) -> Result<u8> {
        let command = Command::DigitalRead { pin }.to_string();
        let value = self.request(&command, protocol::parse_digital)?;
        self.session().pin_states.insert(pin, value);
        self.publish_pin(pin, value);
        Ok(value)
    }

    fn publish_pin(&self, pin: u8, state: u8) {
        self.bus.emit(
            SOURCE,
            EventKind::PinStateChanged {
                pin,
                state,
                kind: PinKind::Digital,
            },
        );
    }

    // ── Analog I/O ────────────────────────────────────────────

    /// Sample `channel`, returning the smoothed value.
    pub fn read_analog(&self, channel: &str) -> Result<f32> {
        protocol::validate_channel(channel)?;
        let command = Command::AnalogRead { channel }.to_string();
        let raw = self.request(&command, protocol::parse_analog)?;

        let value = {
            let mut session = self.session();
            let (enabled, weight) = match session.analog_configs.get(channel) {
                Some(c) => (
                    c.smoothing_enabled,
                    c.smoothing_factor.unwrap_or(self.smoothing.sample_weight),
                ),
                None => (self.smoothing.enabled, self.smoothing.sample_weight),
            };
            let value = if enabled {
                session
                    .smoothers
                    .entry(channel.to_owned())
                    .or_default()
                    .next(f32::from(raw), weight)
            } else {
                f32::from(raw)
            };
            session
                .analog
                .insert(channel.to_owned(), AnalogReading { value, raw });
            value
        };

        self.bus.emit(
            SOURCE,
            EventKind::AnalogValueChanged {
                channel: channel.to_owned(),
                value,
                raw,
            },
        );
        Ok(value)
    }

    // ── Status ────────────────────────────────────────────────

    /// Poll the device's pin map, refresh the cache and publish a
    /// `SystemStatus` event.
    pub fn get_status(&self) -> Result<BTreeMap<u8, u8>> {
        let first_pin = self.status_first_pin;
        let command = Command::GetStatus.to_string();
        let pins = self.request(&command, |reply| protocol::parse_status(reply, first_pin))?;

        self.session()
            .pin_states
            .extend(pins.iter().map(|(p, s)| (*p, *s)));

        self.bus.emit(
            SOURCE,
            EventKind::SystemStatus {
                pin_states: pins.clone(),
                health_score: self.channel.health_score(),
                average_latency: self.channel.average_latency(),
            },
        );
        Ok(pins)
    }

    // ── Motion ────────────────────────────────────────────────

    /// Command every axis to its target angle; axis 1 takes `positions[0]`.
    pub fn move_to(&self, positions: &[f32]) -> Result<()> {
        for (i, angle) in positions.iter().enumerate() {
            let command = Command::MoveAxis {
                axis: i + 1,
                angle: *angle,
            }
            .to_string();
            self.request(&command, ack_reply)?;
        }
        Ok(())
    }

    /// Query actual axis positions and publish `PositionsUpdated`.
    pub fn read_positions(&self) -> Result<Vec<f32>> {
        let command = Command::ReadAll.to_string();
        let positions = self.request(&command, protocol::parse_positions)?;
        self.session().positions.clone_from(&positions);
        self.bus.emit(
            SOURCE,
            EventKind::PositionsUpdated {
                positions: positions.clone(),
            },
        );
        Ok(positions)
    }

    pub fn apply_motion_params(&self, params: &MotionParams) -> Result<()> {
        let mut commands = vec![
            Command::Speed(params.speed),
            Command::Duration(params.duration_ms),
            Command::Precision(params.precision),
        ];
        if params.cpg_enabled {
            commands.push(Command::CpgAlpha(params.cpg_alpha));
            commands.push(Command::Cpg(true));
        } else {
            commands.push(Command::Cpg(false));
        }
        commands.extend([
            Command::Interp(&params.interpolation),
            Command::Backlash(params.backlash),
            Command::Smooth(params.smoothness),
        ]);

        for command in commands {
            self.request(&command.to_string(), ack_reply)?;
        }
        Ok(())
    }

    // ── Session caches ────────────────────────────────────────

    pub fn pin_states(&self) -> BTreeMap<u8, u8> {
        self.session().pin_states.clone()
    }

    pub fn analog_values(&self) -> BTreeMap<String, AnalogReading> {
        self.session().analog.clone()
    }

    pub fn positions(&self) -> Vec<f32> {
        self.session().positions.clone()
    }

    /// Drop everything learned from the last device session. Pin and analog
    /// configurations are kept so they can be re-applied on reconnect.
    pub fn clear_session(&self) {
        let mut session = self.session();
        session.smoothers.clear();
        session.analog.clear();
        session.pin_states.clear();
        session.positions.clear();
    }
}

fn ok_reply(reply: &str) -> Option<()> {
    protocol::is_ok(reply).then_some(())
}

fn ack_reply(reply: &str) -> Option<()> {
    protocol::is_ack(reply).then_some(())
}
