//! Adapters: concrete implementations of the hexagonal port traits.
//!
//! | Adapter    | Implements  | Connects to                    |
//! |------------|-------------|--------------------------------|
//! | `serial`   | Transport   | Host serial port (`serialport`)|
//! | `sim`      | Transport   | In-memory simulated controller |
//! | `store`    | ConfigPort  | JSON file / memory             |
//! | `log_sink` | -           | Event bus → `log` output       |

pub mod log_sink;
#[cfg(feature = "serial")]
pub mod serial;
pub mod sim;
pub mod store;
