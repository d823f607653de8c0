//! Simulated arm controller.
//!
//! An in-memory [`Transport`] that answers the full wire protocol the way
//! the controller firmware does, for tests and for running the CLI without
//! hardware. A cloneable [`SimHandle`] shares the device state so a test can
//! inject analog readings, make the device stop answering, or pull the
//! cable while the backend owns the transport.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::app::ports::Transport;
use crate::error::TransportError;
use crate::protocol::PinMode;

/// Axes driven by the simulated controller.
pub const AXES: usize = 6;

/// Digital pins reported by `GET_STATUS`.
const STATUS_PINS: std::ops::RangeInclusive<u8> = 2..=13;

/// Analog channels the simulated board exposes.
const ANALOG_CHANNELS: [&str; 6] = ["A0", "A1", "A2", "A3", "A4", "A5"];

const HOME_ANGLE: f32 = 90.0;

struct SimState {
    open: bool,
    link_up: bool,
    responsive: bool,
    pending: Option<String>,
    received: Vec<String>,
    modes: BTreeMap<u8, PinMode>,
    levels: BTreeMap<u8, u8>,
    analog: BTreeMap<String, u16>,
    positions: [f32; AXES],
    motion: BTreeMap<String, String>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            open: false,
            link_up: true,
            responsive: true,
            pending: None,
            received: Vec::new(),
            modes: BTreeMap::new(),
            levels: BTreeMap::new(),
            analog: BTreeMap::new(),
            positions: [HOME_ANGLE; AXES],
            motion: BTreeMap::new(),
        }
    }
}

impl SimState {
    fn reply(&mut self, command: &str) -> String {
        let command = command.trim();
        if command == "GET_STATUS" {
            let levels: Vec<String> = STATUS_PINS
                .map(|p| self.level(p).to_string())
                .collect();
            return format!("STATUS:{}", levels.join(","));
        }
        if command == "readall" {
            let positions: Vec<String> = self.positions.iter().map(f32::to_string).collect();
            return format!("fb {}", positions.join(","));
        }
        if let Some(rest) = command.strip_prefix("PIN_MODE:") {
            return match rest.split_once(':') {
                Some((pin, mode)) => match (pin.parse::<u8>(), mode.parse::<PinMode>()) {
                    (Ok(pin), Ok(mode)) => {
                        self.modes.insert(pin, mode);
                        "OK".into()
                    }
                    _ => "ERROR:INVALID_PIN_MODE".into(),
                },
                None => "ERROR:INVALID_PIN_MODE".into(),
            };
        }
        if let Some(rest) = command.strip_prefix("DIGITAL_WRITE:") {
            return match rest.split_once(':') {
                Some((pin, value @ ("0" | "1"))) => match pin.parse::<u8>() {
                    Ok(pin) => {
                        self.levels.insert(pin, u8::from(value == "1"));
                        "OK".into()
                    }
                    Err(_) => "ERROR:INVALID_PIN".into(),
                },
                _ => "ERROR:INVALID_VALUE".into(),
            };
        }
        if let Some(pin) = command.strip_prefix("DIGITAL_READ:") {
            return match pin.parse::<u8>() {
                Ok(pin) => self.level(pin).to_string(),
                Err(_) => "ERROR:INVALID_PIN".into(),
            };
        }
        if let Some(channel) = command.strip_prefix("ANALOG_READ:") {
            if !ANALOG_CHANNELS.contains(&channel) {
                return "ERROR:INVALID_CHANNEL".into();
            }
            return self.analog.get(channel).copied().unwrap_or(0).to_string();
        }

        let Some((verb, arg)) = command.split_once(' ') else {
            return "ERROR:UNKNOWN_COMMAND".into();
        };
        if let Ok(axis) = verb.parse::<usize>() {
            return match (axis, arg.parse::<f32>()) {
                (1..=AXES, Ok(angle)) => {
                    self.positions[axis - 1] = angle;
                    format!("Servo {axis} moving to: {angle}\u{00b0}")
                }
                _ => "ERROR:BAD_AXIS".into(),
            };
        }
        match verb {
            "speed" | "dur" | "precision" | "cpg" | "cpgalpha" | "interp" | "backlash"
            | "smooth" => {
                self.motion.insert(verb.to_owned(), arg.to_owned());
                format!("{verb} set to {arg}")
            }
            _ => "ERROR:UNKNOWN_COMMAND".into(),
        }
    }

    /// Unset pins read low, or high with the pull-up enabled.
    fn level(&self, pin: u8) -> u8 {
        self.levels.get(&pin).copied().unwrap_or_else(|| {
            u8::from(self.modes.get(&pin) == Some(&PinMode::InputPullUp))
        })
    }
}

/// Shared view of the simulated device.
#[derive(Clone, Default)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Value the next `ANALOG_READ` of `channel` returns.
    pub fn set_analog(&self, channel: &str, raw: u16) {
        self.lock().analog.insert(channel.to_owned(), raw);
    }

    /// Drive an input pin from the outside.
    pub fn set_level(&self, pin: u8, level: u8) {
        self.lock().levels.insert(pin, level.min(1));
    }

    /// An unresponsive device accepts commands but never answers.
    pub fn set_responsive(&self, responsive: bool) {
        self.lock().responsive = responsive;
    }

    /// Simulate the cable being pulled (`false`) or plugged back in.
    pub fn set_link(&self, up: bool) {
        let mut s = self.lock();
        s.link_up = up;
        if !up {
            s.open = false;
            s.pending = None;
        }
    }

    pub fn level(&self, pin: u8) -> u8 {
        self.lock().level(pin)
    }

    pub fn mode(&self, pin: u8) -> Option<PinMode> {
        self.lock().modes.get(&pin).copied()
    }

    pub fn positions(&self) -> [f32; AXES] {
        self.lock().positions
    }

    /// Last value received for a motion setter (`speed`, `dur`, ...).
    pub fn motion_setting(&self, verb: &str) -> Option<String> {
        self.lock().motion.get(verb).cloned()
    }

    /// Every command line received, oldest first.
    pub fn received(&self) -> Vec<String> {
        self.lock().received.clone()
    }

    pub fn clear_received(&self) {
        self.lock().received.clear();
    }
}

/// In-memory controller speaking the wire protocol.
#[derive(Default)]
pub struct SimulatedArm {
    handle: SimHandle,
}

impl SimulatedArm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> SimHandle {
        self.handle.clone()
    }
}

impl Transport for SimulatedArm {
    fn open(&mut self, endpoint: &str, _baud_rate: u32) -> Result<(), TransportError> {
        let mut s = self.handle.lock();
        if !s.link_up {
            return Err(TransportError::Io(format!("no device at {endpoint}")));
        }
        s.open = true;
        s.pending = None;
        // The controller resets when the port opens.
        s.modes.clear();
        s.levels.clear();
        s.positions = [HOME_ANGLE; AXES];
        Ok(())
    }

    fn close(&mut self) {
        let mut s = self.handle.lock();
        s.open = false;
        s.pending = None;
    }

    fn is_open(&self) -> bool {
        self.handle.lock().open
    }

    fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        let mut s = self.handle.lock();
        if !s.link_up {
            return Err(TransportError::LinkLost("device disconnected".into()));
        }
        if !s.open {
            return Err(TransportError::Io("port is not open".into()));
        }
        s.received.push(line.to_owned());
        let reply = s.reply(line);
        s.pending = s.responsive.then_some(reply);
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> Result<String, TransportError> {
        let pending = {
            let mut s = self.handle.lock();
            if !s.link_up {
                return Err(TransportError::LinkLost("device disconnected".into()));
            }
            s.pending.take()
        };
        pending.ok_or_else(|| {
            thread::sleep(timeout);
            TransportError::Timeout
        })
    }
}
