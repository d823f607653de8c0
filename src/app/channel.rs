//! Command channel: the serialized request/response link to the controller.
//!
//! Exactly one command is in flight at a time. The transport, the health
//! monitor and the connection state all sit behind one mutex, so every
//! latency sample and outcome is recorded inside the same exclusive section
//! that performed the I/O.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;

use crate::config::{ChannelConfig, HealthWeights};
use crate::error::{CommandError, ConnectionError, Error, ProtocolError, Result, TransportError};
use crate::events::{EventBus, EventKind, unix_now};
use crate::health::{ErrorEntry, HealthCounters, HealthMonitor};

use super::ports::Transport;

const SOURCE: &str = "channel";

/// Link lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
    Reconnecting,
}

/// Point-in-time copy of the link bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkInfo {
    pub state: ConnectionState,
    pub endpoint: Option<String>,
    pub baud_rate: Option<u32>,
    pub connected_at: Option<f64>,
    pub last_command_at: Option<f64>,
    pub health_score: f32,
    pub counters: HealthCounters,
    pub recent_errors: Vec<ErrorEntry>,
}

struct Link {
    transport: Box<dyn Transport>,
    health: HealthMonitor,
    state: ConnectionState,
    endpoint: Option<(String, u32)>,
    connected_at: Option<f64>,
    last_command_at: Option<f64>,
}

pub struct CommandChannel {
    config: ChannelConfig,
    link: Mutex<Link>,
    bus: EventBus,
}

impl CommandChannel {
    pub fn new(
        transport: Box<dyn Transport>,
        config: ChannelConfig,
        weights: HealthWeights,
        bus: EventBus,
    ) -> Self {
        Self {
            config,
            link: Mutex::new(Link {
                transport,
                health: HealthMonitor::new(weights),
                state: ConnectionState::Disconnected,
                endpoint: None,
                connected_at: None,
                last_command_at: None,
            }),
            bus,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Open the link, wait out the controller's boot, then require the
    /// liveness probe reply to carry the configured prefix.
    ///
    /// On failure the link is closed and the state is `Error`.
    pub fn open(&self, endpoint: &str, baud_rate: u32) -> Result<()> {
        let mut link = self.lock();
        if link.state != ConnectionState::Reconnecting {
            link.state = ConnectionState::Connecting;
        }
        link.transport.close();

        if let Err(e) = link.transport.open(endpoint, baud_rate) {
            link.state = ConnectionState::Error;
            return Err(ConnectionError::OpenFailed {
                endpoint: endpoint.to_owned(),
                reason: e.to_string(),
            }
            .into());
        }

        if self.config.boot_delay_ms > 0 {
            debug!("CHAN | waiting {} ms for controller boot", self.config.boot_delay_ms);
            thread::sleep(Duration::from_millis(self.config.boot_delay_ms));
        }

        let timeout = self.read_timeout();
        let probe = link
            .transport
            .write_line(&self.config.probe_command)
            .and_then(|()| link.transport.read_line(timeout));
        let response = match probe {
            Ok(r) if r.trim().starts_with(&self.config.probe_prefix) => r,
            Ok(r) => {
                link.transport.close();
                link.state = ConnectionState::Error;
                return Err(ConnectionError::ProbeFailed {
                    endpoint: endpoint.to_owned(),
                    response: r,
                }
                .into());
            }
            Err(e) => {
                link.transport.close();
                link.state = ConnectionState::Error;
                return Err(ConnectionError::ProbeFailed {
                    endpoint: endpoint.to_owned(),
                    response: e.to_string(),
                }
                .into());
            }
        };

        link.state = ConnectionState::Connected;
        link.endpoint = Some((endpoint.to_owned(), baud_rate));
        link.connected_at = Some(unix_now());
        info!("CHAN | connected to {endpoint} @ {baud_rate} (probe: {})", response.trim());
        Ok(())
    }

    /// Close the link; state becomes `Disconnected`. The last endpoint is
    /// remembered for [`reconnect`](super::service::Backend::reconnect).
    pub fn close(&self) {
        let mut link = self.lock();
        link.transport.close();
        link.state = ConnectionState::Disconnected;
        link.connected_at = None;
    }

    pub fn is_open(&self) -> bool {
        let link = self.lock();
        link.state == ConnectionState::Connected && link.transport.is_open()
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.lock().state = state;
    }

    /// Endpoint and baud rate of the last successful open.
    pub fn last_endpoint(&self) -> Option<(String, u32)> {
        self.lock().endpoint.clone()
    }

    // ── Commands ──────────────────────────────────────────────

    /// Send `command` and return the raw reply line.
    pub fn execute(&self, command: &str) -> Result<String> {
        self.request(command, |reply| Some(reply.to_owned()))
    }

    /// Send `command` and decode the reply with `parse`.
    ///
    /// A reply `parse` rejects is a protocol mismatch and is counted as a
    /// failed command. Latency and outcome are recorded exactly once per
    /// command actually written to the link.
    pub fn request<T>(&self, command: &str, parse: impl FnOnce(&str) -> Option<T>) -> Result<T> {
        let mut link = self.lock();
        if link.state != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }

        let timeout = self.read_timeout();
        let started = Instant::now();
        let io = link
            .transport
            .write_line(command)
            .and_then(|()| link.transport.read_line(timeout));
        link.health.record_latency(started.elapsed().as_secs_f32());
        link.last_command_at = Some(unix_now());

        let reply = match io {
            Ok(reply) => reply,
            Err(cause) => {
                link.health.record_outcome(false);
                let state = link.state;
                link.health.record_error(&cause.to_string(), command, state);
                warn!("CHAN | {command:?} failed: {cause}");
                if cause.is_link_lost() {
                    self.escalate_link_loss(&mut link, &cause);
                }
                return Err(CommandError {
                    command: command.to_owned(),
                    cause,
                }
                .into());
            }
        };

        match parse(&reply) {
            Some(value) => {
                link.health.record_outcome(true);
                debug!("CHAN | {command:?} -> {reply:?}");
                Ok(value)
            }
            None => {
                link.health.record_outcome(false);
                let state = link.state;
                link.health
                    .record_error(&format!("unexpected reply {reply:?}"), command, state);
                warn!("CHAN | {command:?} got unexpected reply {reply:?}");
                Err(ProtocolError {
                    command: command.to_owned(),
                    response: reply,
                }
                .into())
            }
        }
    }

    fn escalate_link_loss(&self, link: &mut Link, cause: &TransportError) {
        link.transport.close();
        link.state = ConnectionState::Error;
        link.connected_at = None;
        let port = link.endpoint.as_ref().map(|(p, _)| p.clone());
        warn!("CHAN | link lost, connection marked as failed");
        self.bus.emit(
            SOURCE,
            EventKind::HardwareError {
                message: cause.to_string(),
                port,
            },
        );
        self.bus.emit(SOURCE, EventKind::ConnectionLost);
    }

    fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.config.read_timeout_ms.max(1))
    }

    // ── Health ────────────────────────────────────────────────

    pub fn health_score(&self) -> f32 {
        let link = self.lock();
        link.health.health_score(link.state)
    }

    pub fn average_latency(&self) -> f32 {
        self.lock().health.average_latency()
    }

    pub fn counters(&self) -> HealthCounters {
        self.lock().health.counters()
    }

    /// Log a failure that happened outside a command round-trip.
    pub fn record_error(&self, message: &str, context: &str) {
        let mut link = self.lock();
        let state = link.state;
        link.health.record_error(message, context, state);
    }

    pub fn info(&self) -> LinkInfo {
        let link = self.lock();
        LinkInfo {
            state: link.state,
            endpoint: link.endpoint.as_ref().map(|(p, _)| p.clone()),
            baud_rate: link.endpoint.as_ref().map(|(_, b)| *b),
            connected_at: link.connected_at,
            last_command_at: link.last_command_at,
            health_score: link.health.health_score(link.state),
            counters: link.health.counters(),
            recent_errors: link.health.error_log(),
        }
    }
}
