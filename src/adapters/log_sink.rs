//! Log-based event sink adapter.
//!
//! Subscribes to every topic on the [`EventBus`] and writes one structured
//! line per event through the `log` facade. A dashboard or socket bridge
//! would subscribe the same way.

use log::{info, warn};

use crate::events::{Event, EventBus, EventKind, SubscriptionId};

/// Adapter that logs every [`Event`].
#[derive(Default, Clone, Copy)]
pub struct LogEventSink;

impl LogEventSink {
    pub fn new() -> Self {
        Self
    }

    /// Subscribe to every topic on `bus`.
    pub fn attach(self, bus: &EventBus) -> Vec<SubscriptionId> {
        bus.subscribe_all(move |event| {
            self.emit(event);
            Ok(())
        })
    }

    pub fn emit(&self, event: &Event) {
        let src = event.source;
        match &event.kind {
            EventKind::ConnectionEstablished { port, baud_rate } => {
                info!("LINK | up | port={port} baud={baud_rate} | src={src}");
            }
            EventKind::ConnectionLost => {
                warn!("LINK | down | src={src}");
            }
            EventKind::HardwareError { message, port } => {
                warn!(
                    "HWERR | {message} | port={} | src={src}",
                    port.as_deref().unwrap_or("-")
                );
            }
            EventKind::PinStateChanged { pin, state, kind } => {
                info!("PIN | {pin}={state} ({kind:?})");
            }
            EventKind::AnalogValueChanged {
                channel,
                value,
                raw,
            } => {
                info!("ANALOG | {channel}={value:.1} raw={raw}");
            }
            EventKind::SequenceStarted { name, step_count } => {
                info!("SEQ | '{name}' started, {step_count} steps");
            }
            EventKind::SequenceCompleted { name, outcome } => {
                info!("SEQ | '{name}' ended: {outcome:?}");
            }
            EventKind::SystemStatus {
                pin_states,
                health_score,
                average_latency,
            } => {
                let pins: Vec<String> = pin_states.iter().map(|(p, s)| format!("{p}:{s}")).collect();
                info!(
                    "STATUS | health={health_score:.1} latency={:.1}ms | pins=[{}]",
                    average_latency * 1000.0,
                    pins.join(" ")
                );
            }
            EventKind::PositionsUpdated { positions } => {
                let angles: Vec<String> = positions.iter().map(|a| format!("{a:.1}")).collect();
                info!("POS | {}", angles.join(","));
            }
        }
    }
}
