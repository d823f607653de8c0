//! Serial-port transport and endpoint discovery.
//!
//! Implements [`Transport`] over the `serialport` crate. Replies are read
//! one byte at a time until the newline, so a reply never leaves trailing
//! bytes of the next line buffered in this adapter.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use log::debug;
use serde::Serialize;
use serialport::{ClearBuffer, SerialPort, SerialPortType};

use crate::app::ports::Transport;
use crate::error::TransportError;

/// Longest reply accepted before the line is abandoned.
const MAX_LINE: usize = 1024;

/// An endpoint the platform reports as a serial port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub name: String,
    /// `usb`, `bluetooth`, `pci` or `unknown`.
    pub kind: &'static str,
    pub description: Option<String>,
}

/// Enumerate serial endpoints available on this machine.
pub fn list_ports() -> Result<Vec<PortInfo>, TransportError> {
    let ports = serialport::available_ports().map_err(|e| TransportError::Io(e.to_string()))?;
    Ok(ports
        .into_iter()
        .map(|p| {
            let (kind, description) = match p.port_type {
                SerialPortType::UsbPort(usb) => ("usb", usb.product.or(usb.manufacturer)),
                SerialPortType::BluetoothPort => ("bluetooth", None),
                SerialPortType::PciPort => ("pci", None),
                SerialPortType::Unknown => ("unknown", None),
            };
            PortInfo {
                name: p.port_name,
                kind,
                description,
            }
        })
        .collect())
}

/// Line transport over a host serial port.
#[derive(Default)]
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, TransportError> {
        self.port
            .as_mut()
            .ok_or_else(|| TransportError::LinkLost("port is not open".into()))
    }
}

impl Transport for SerialTransport {
    fn open(&mut self, endpoint: &str, baud_rate: u32) -> Result<(), TransportError> {
        self.close();
        let port = serialport::new(endpoint, baud_rate)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        debug!("SERIAL | opened {endpoint} @ {baud_rate}");
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("SERIAL | closed");
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        let port = self.port()?;
        // Drop anything left over from a reply that arrived after its timeout.
        if let Err(e) = port.clear(ClearBuffer::Input) {
            debug!("SERIAL | input flush failed: {e}");
        }
        port.write_all(line.as_bytes())?;
        port.write_all(b"\n")?;
        port.flush()?;
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> Result<String, TransportError> {
        let port = self.port()?;
        let deadline = Instant::now() + timeout;
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout);
            }
            port.set_timeout(remaining)
                .map_err(|e| TransportError::Io(e.to_string()))?;

            match port.read(&mut byte) {
                Ok(0) => continue,
                Ok(_) if byte[0] == b'\n' => break,
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.len() > MAX_LINE {
                        return Err(TransportError::Io(format!(
                            "reply exceeds {MAX_LINE} bytes without a newline"
                        )));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let line = String::from_utf8_lossy(&buf);
        Ok(line.trim_end_matches('\r').to_owned())
    }
}
