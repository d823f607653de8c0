//! Unified error types for the arm control backend.
//!
//! A single `Error` enum that every subsystem converts into, keeping the
//! coordinator's error handling uniform. Command-level failures are
//! returned, never panicked, so callers always receive either a value or a
//! typed failure.

use core::fmt;

// ---------------------------------------------------------------------------
// Top-level backend error
// ---------------------------------------------------------------------------

/// Every fallible operation in the backend funnels into this type.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// An I/O operation was attempted while the link is not `Connected`.
    NotConnected,
    /// Opening the link or the liveness probe failed.
    Connection(ConnectionError),
    /// A command failed on an established link (I/O error or timeout).
    Command(CommandError),
    /// The device answered, but not in the expected shape.
    Protocol(ProtocolError),
    /// Invalid pin, mode, or program definition.
    Config(ConfigError),
    /// A sequence/task lifecycle request was rejected.
    Program(ProgramError),
    /// Persisted configuration or task files could not be read or written.
    Storage(StorageError),
    /// A background worker could not be started.
    Startup(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "hardware not connected"),
            Self::Connection(e) => write!(f, "connection: {e}"),
            Self::Command(e) => write!(f, "command: {e}"),
            Self::Protocol(e) => write!(f, "protocol: {e}"),
            Self::Config(e) => write!(f, "config: {e}"),
            Self::Program(e) => write!(f, "program: {e}"),
            Self::Storage(e) => write!(f, "storage: {e}"),
            Self::Startup(msg) => write!(f, "startup: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Connection errors
// ---------------------------------------------------------------------------

/// Opening the link failed. Recoverable by retrying with another port/rate.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// The transport could not open the endpoint.
    OpenFailed { endpoint: String, reason: String },
    /// The link opened but the probe reply did not carry the expected prefix.
    ProbeFailed { endpoint: String, response: String },
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenFailed { endpoint, reason } => {
                write!(f, "failed to open {endpoint}: {reason}")
            }
            Self::ProbeFailed { endpoint, response } => {
                write!(f, "probe on {endpoint} got unexpected reply {response:?}")
            }
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<ConnectionError> for Error {
    fn from(e: ConnectionError) -> Self {
        Self::Connection(e)
    }
}

// ---------------------------------------------------------------------------
// Command errors
// ---------------------------------------------------------------------------

/// A single command failed on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandError {
    pub command: String,
    pub cause: TransportError,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} failed: {}", self.command, self.cause)
    }
}

impl From<CommandError> for Error {
    fn from(e: CommandError) -> Self {
        Self::Command(e)
    }
}

/// Failure reported by a [`Transport`](crate::app::ports::Transport).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No terminated line arrived within the read timeout.
    Timeout,
    /// The link went away (device unplugged, port closed underneath us).
    LinkLost(String),
    /// Any other I/O failure.
    Io(String),
}

impl TransportError {
    /// Whether this failure means the link can no longer be used.
    pub fn is_link_lost(&self) -> bool {
        matches!(self, Self::LinkLost(_))
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timed out waiting for response"),
            Self::LinkLost(msg) => write!(f, "link lost: {msg}"),
            Self::Io(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => Self::Timeout,
            ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::UnexpectedEof => Self::LinkLost(e.to_string()),
            _ => Self::Io(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Protocol errors
// ---------------------------------------------------------------------------

/// The device replied, but the reply does not match the verb's contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    pub command: String,
    pub response: String,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unexpected reply {:?} to {:?}",
            self.response, self.command
        )
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Rejected at the call that introduced it; no partial state is committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidPinMode(String),
    InvalidChannel(String),
    InvalidDigitalValue(u8),
    InvalidSmoothingFactor(String),
    InvalidStep { index: usize, reason: String },
    InvalidProgram(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPinMode(m) => write!(f, "invalid pin mode {m:?}"),
            Self::InvalidChannel(c) => write!(f, "invalid analog channel {c:?}"),
            Self::InvalidDigitalValue(v) => write!(f, "digital value must be 0 or 1, got {v}"),
            Self::InvalidSmoothingFactor(v) => {
                write!(f, "smoothing factor must be within 0..=1, got {v}")
            }
            Self::InvalidStep { index, reason } => write!(f, "step {index}: {reason}"),
            Self::InvalidProgram(msg) => write!(f, "{msg}"),
        }
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

// ---------------------------------------------------------------------------
// Program lifecycle errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramError {
    AlreadyExists(String),
    NotFound(String),
    Disabled(String),
    NotRunning(String),
    Empty(String),
    TooManyPrograms(usize),
    TooManyWaypoints { task: String, limit: usize },
    WrongKind(String),
}

impl fmt::Display for ProgramError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyExists(n) => write!(f, "'{n}' already exists"),
            Self::NotFound(n) => write!(f, "'{n}' not found"),
            Self::Disabled(n) => write!(f, "'{n}' is disabled"),
            Self::NotRunning(n) => write!(f, "'{n}' is not running"),
            Self::Empty(n) => write!(f, "'{n}' has nothing to run"),
            Self::TooManyPrograms(limit) => write!(f, "maximum tasks ({limit}) reached"),
            Self::TooManyWaypoints { task, limit } => {
                write!(f, "maximum waypoints ({limit}) reached for '{task}'")
            }
            Self::WrongKind(n) => write!(f, "'{n}' is not a waypoint task"),
        }
    }
}

impl From<ProgramError> for Error {
    fn from(e: ProgramError) -> Self {
        Self::Program(e)
    }
}

// ---------------------------------------------------------------------------
// Storage errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    Io(String),
    /// Stored document failed to deserialise.
    Corrupted(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "I/O error: {msg}"),
            Self::Corrupted(msg) => write!(f, "corrupted document: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            Self::Io(e.to_string())
        } else {
            Self::Corrupted(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Backend-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
