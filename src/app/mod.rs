//! Application core: backend domain logic behind port traits.
//!
//! This module contains the business rules for the arm backend: the
//! serialized command channel, pin and motion I/O, and program
//! sequencing. All interaction with the controller happens through the
//! [`ports::Transport`] trait, keeping this layer fully testable without a
//! serial port.

pub mod automation;
pub mod channel;
pub mod device;
pub mod ports;
pub mod program;
pub mod service;
