//! Line-oriented text protocol spoken by the arm controller.
//!
//! Every command is one ASCII line; every reply is one ASCII line.
//!
//! | Command                   | Reply                               |
//! |---------------------------|-------------------------------------|
//! | `GET_STATUS`              | `STATUS:<csv of pin states>`        |
//! | `PIN_MODE:<pin>:<mode>`   | `OK` or an error line               |
//! | `DIGITAL_WRITE:<pin>:<v>` | `OK` or an error line               |
//! | `DIGITAL_READ:<pin>`      | `0` or `1`                          |
//! | `ANALOG_READ:<channel>`   | decimal sample                      |
//! | `<axis> <angle>`          | free-form acknowledgement           |
//! | `readall`                 | `fb <csv of positions>`             |
//! | motion setters            | free-form acknowledgement           |

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const STATUS_PREFIX: &str = "STATUS:";
pub const OK_REPLY: &str = "OK";

/// Longest analog channel name accepted (e.g. `A0`).
const MAX_CHANNEL_LEN: usize = 8;

// ---------------------------------------------------------------------------
// Pin modes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PinMode {
    #[serde(rename = "INPUT")]
    Input,
    #[serde(rename = "OUTPUT")]
    Output,
    #[serde(rename = "INPUT_PULLUP")]
    InputPullUp,
}

impl PinMode {
    pub const fn as_wire(self) -> &'static str {
        match self {
            Self::Input => "INPUT",
            Self::Output => "OUTPUT",
            Self::InputPullUp => "INPUT_PULLUP",
        }
    }
}

impl fmt::Display for PinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

impl FromStr for PinMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INPUT" => Ok(Self::Input),
            "OUTPUT" => Ok(Self::Output),
            "INPUT_PULLUP" => Ok(Self::InputPullUp),
            _ => Err(ConfigError::InvalidPinMode(s.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// One outbound command. `Display` yields the wire text without terminator.
#[derive(Debug, Clone, PartialEq)]
pub enum Command<'a> {
    GetStatus,
    PinMode { pin: u8, mode: PinMode },
    DigitalWrite { pin: u8, value: u8 },
    DigitalRead { pin: u8 },
    AnalogRead { channel: &'a str },
    /// `axis` is 1-based on the wire.
    MoveAxis { axis: usize, angle: f32 },
    ReadAll,
    Speed(f32),
    Duration(u32),
    Precision(f32),
    Cpg(bool),
    CpgAlpha(f32),
    Interp(&'a str),
    Backlash(f32),
    Smooth(u32),
}

impl fmt::Display for Command<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GetStatus => f.write_str("GET_STATUS"),
            Self::PinMode { pin, mode } => write!(f, "PIN_MODE:{pin}:{mode}"),
            Self::DigitalWrite { pin, value } => write!(f, "DIGITAL_WRITE:{pin}:{value}"),
            Self::DigitalRead { pin } => write!(f, "DIGITAL_READ:{pin}"),
            Self::AnalogRead { channel } => write!(f, "ANALOG_READ:{channel}"),
            Self::MoveAxis { axis, angle } => write!(f, "{axis} {angle}"),
            Self::ReadAll => f.write_str("readall"),
            Self::Speed(v) => write!(f, "speed {v}"),
            Self::Duration(ms) => write!(f, "dur {ms}"),
            Self::Precision(v) => write!(f, "precision {v}"),
            Self::Cpg(on) => write!(f, "cpg {}", if *on { "on" } else { "off" }),
            Self::CpgAlpha(v) => write!(f, "cpgalpha {v}"),
            Self::Interp(method) => write!(f, "interp {method}"),
            Self::Backlash(v) => write!(f, "backlash {v}"),
            Self::Smooth(v) => write!(f, "smooth {v}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Analog channel names go on the wire verbatim, so they must not carry
/// separators or whitespace.
pub fn validate_channel(channel: &str) -> Result<(), ConfigError> {
    let ok = !channel.is_empty()
        && channel.len() <= MAX_CHANNEL_LEN
        && channel.bytes().all(|b| b.is_ascii_alphanumeric());
    if ok {
        Ok(())
    } else {
        Err(ConfigError::InvalidChannel(channel.to_owned()))
    }
}

// ---------------------------------------------------------------------------
// Reply parsing
// ---------------------------------------------------------------------------

pub fn is_ok(reply: &str) -> bool {
    reply.trim() == OK_REPLY
}

/// `0` or `1`.
pub fn parse_digital(reply: &str) -> Option<u8> {
    match reply.trim() {
        "0" => Some(0),
        "1" => Some(1),
        _ => None,
    }
}

/// Non-negative decimal sample.
pub fn parse_analog(reply: &str) -> Option<u16> {
    let reply = reply.trim();
    if reply.is_empty() || !reply.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    reply.parse().ok()
}

/// `STATUS:<csv>` into a pin → state map; index 0 maps to `first_pin`.
///
/// An empty body yields an empty map. Any non-numeric entry rejects the
/// whole reply.
pub fn parse_status(reply: &str, first_pin: u8) -> Option<BTreeMap<u8, u8>> {
    let body = reply.trim().strip_prefix(STATUS_PREFIX)?.trim();
    let mut pins = BTreeMap::new();
    if body.is_empty() {
        return Some(pins);
    }
    for (i, field) in body.split(',').enumerate() {
        let state: u8 = field.trim().parse().ok()?;
        let pin = u8::try_from(usize::from(first_pin) + i).ok()?;
        pins.insert(pin, state);
    }
    Some(pins)
}

/// `readall` reply: optional `fb `/`rt ` tag, then comma-separated positions.
pub fn parse_positions(reply: &str) -> Option<Vec<f32>> {
    let reply = reply.trim();
    let body = reply
        .strip_prefix("fb ")
        .or_else(|| reply.strip_prefix("rt "))
        .unwrap_or(reply);
    let positions: Option<Vec<f32>> = body
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<f32>().ok().filter(|v| v.is_finite()))
        .collect();
    positions.filter(|p| !p.is_empty())
}

/// Free-form acknowledgements (axis moves, motion setters) succeed unless
/// empty or an error line.
pub fn is_ack(reply: &str) -> bool {
    let reply = reply.trim();
    !reply.is_empty() && !reply.to_ascii_uppercase().starts_with("ERR")
}
