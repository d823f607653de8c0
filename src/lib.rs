//! Armlink: hardware control backend for a 6-axis arm.
//!
//! Drives an arm controller over a newline-framed serial protocol and
//! exposes pin I/O, health telemetry, an event bus and a program sequencer.
//! Serial-port access is behind the `serial` feature so the core builds
//! (and fuzzes) without platform serial support.

#![deny(unused_must_use)]

pub mod adapters;
pub mod app;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod health;
pub mod protocol;

pub use app::channel::ConnectionState;
pub use app::service::Backend;
pub use config::BackendConfig;
pub use error::{Error, Result};
