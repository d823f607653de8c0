//! Port traits: the hexagonal boundary between the backend core and the outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ Backend (domain)
//! ```
//!
//! Driven adapters (serial link, simulated controller, file store) implement
//! these traits. The [`Backend`](super::service::Backend) receives them as
//! boxed trait objects, so the domain core never touches a serial port or
//! the filesystem directly.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::BackendConfig;
use crate::error::{StorageError, TransportError};

use super::device::{AnalogConfig, PinConfig};
use super::program::Sequence;

// ───────────────────────────────────────────────────────────────
// Transport port (driven adapter: domain ↔ controller link)
// ───────────────────────────────────────────────────────────────

/// Byte link to the arm controller, framed as newline-terminated lines.
///
/// Implementations need no locking of their own: the
/// [`CommandChannel`](super::channel::CommandChannel) owns the transport
/// behind its mutex, so at most one caller touches it at a time.
pub trait Transport: Send {
    /// Open `endpoint` at `baud_rate`. Re-opening an open transport closes
    /// the previous link first.
    fn open(&mut self, endpoint: &str, baud_rate: u32) -> Result<(), TransportError>;

    /// Close the link. Closing a closed transport is a no-op.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Write `line` followed by the line terminator.
    fn write_line(&mut self, line: &str) -> Result<(), TransportError>;

    /// Read one terminated line, without the terminator.
    ///
    /// Returns [`TransportError::Timeout`] if no full line arrives within
    /// `timeout`.
    fn read_line(&mut self, timeout: Duration) -> Result<String, TransportError>;
}

// ───────────────────────────────────────────────────────────────
// Configuration port (driven adapter: domain ↔ persistent config)
// ───────────────────────────────────────────────────────────────

/// Everything the backend persists between sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigDocument {
    pub pin_configs: BTreeMap<u8, PinConfig>,
    pub analog_configs: BTreeMap<String, AnalogConfig>,
    pub sequences: BTreeMap<String, Sequence>,
    pub settings: BackendConfig,
}

/// Loads and persists the [`ConfigDocument`].
pub trait ConfigPort: Send + Sync {
    /// Returns `None` if nothing has been stored yet.
    fn load(&self) -> Result<Option<ConfigDocument>, StorageError>;

    fn save(&self, doc: &ConfigDocument) -> Result<(), StorageError>;
}
