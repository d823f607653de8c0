//! Typed events and the in-process event bus.
//!
//! Events are produced by:
//! - the command channel (link lost)
//! - the device service (pin / analog changes, status polls)
//! - the automation engine (program lifecycle)
//! - the backend coordinator (connect / disconnect, position polling)
//!
//! Events are consumed by any subscriber (GUI, logger, health dashboard)
//! on a single background dispatch thread.
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌──────────────────┐
//! │ Channel     │────▶│              │     │                  │
//! │ Device      │────▶│  FIFO queue  │────▶│  Dispatch loop   │──▶ handlers
//! │ Automation  │────▶│   (mpsc)     │     │  (one thread)    │    (per topic,
//! │ Backend     │────▶│              │     │                  │     in order)
//! └─────────────┘     └──────────────┘     └──────────────────┘
//! ```
//!
//! Publishers never block on handler execution. A handler that returns an
//! error or panics is logged and skipped; delivery to the remaining
//! handlers and to later events continues.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, error, warn};
use serde::Serialize;

use crate::config::BusConfig;
use crate::error::{Error, Result};

/// Seconds since the Unix epoch.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Topics and payloads
// ---------------------------------------------------------------------------

/// Subscription key. One per [`EventKind`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Topic {
    ConnectionEstablished,
    ConnectionLost,
    HardwareError,
    PinStateChanged,
    AnalogValueChanged,
    SequenceStarted,
    SequenceCompleted,
    SystemStatus,
    PositionsUpdated,
}

impl Topic {
    pub const ALL: [Topic; 9] = [
        Topic::ConnectionEstablished,
        Topic::ConnectionLost,
        Topic::HardwareError,
        Topic::PinStateChanged,
        Topic::AnalogValueChanged,
        Topic::SequenceStarted,
        Topic::SequenceCompleted,
        Topic::SystemStatus,
        Topic::PositionsUpdated,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PinKind {
    Digital,
}

/// How a program run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Completion {
    /// Ran out of steps without looping.
    Completed,
    /// Cancelled by `stop`, a restart, or disconnect.
    Stopped,
    /// A waypoint could not be sent; the run was aborted.
    Failed,
}

/// Typed payload, one variant per topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EventKind {
    ConnectionEstablished { port: String, baud_rate: u32 },
    ConnectionLost,
    HardwareError { message: String, port: Option<String> },
    PinStateChanged { pin: u8, state: u8, kind: PinKind },
    AnalogValueChanged { channel: String, value: f32, raw: u16 },
    SequenceStarted { name: String, step_count: usize },
    SequenceCompleted { name: String, outcome: Completion },
    SystemStatus {
        pin_states: BTreeMap<u8, u8>,
        health_score: f32,
        average_latency: f32,
    },
    PositionsUpdated { positions: Vec<f32> },
}

impl EventKind {
    pub fn topic(&self) -> Topic {
        match self {
            Self::ConnectionEstablished { .. } => Topic::ConnectionEstablished,
            Self::ConnectionLost => Topic::ConnectionLost,
            Self::HardwareError { .. } => Topic::HardwareError,
            Self::PinStateChanged { .. } => Topic::PinStateChanged,
            Self::AnalogValueChanged { .. } => Topic::AnalogValueChanged,
            Self::SequenceStarted { .. } => Topic::SequenceStarted,
            Self::SequenceCompleted { .. } => Topic::SequenceCompleted,
            Self::SystemStatus { .. } => Topic::SystemStatus,
            Self::PositionsUpdated { .. } => Topic::PositionsUpdated,
        }
    }
}

/// Immutable once constructed; ownership moves to the bus on publish.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    pub source: &'static str,
    pub kind: EventKind,
}

impl Event {
    pub fn new(source: &'static str, kind: EventKind) -> Self {
        Self {
            timestamp: unix_now(),
            source,
            kind,
        }
    }

    pub fn topic(&self) -> Topic {
        self.kind.topic()
    }
}

// ---------------------------------------------------------------------------
// Event bus
// ---------------------------------------------------------------------------

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

struct Inner {
    config: BusConfig,
    subscribers: RwLock<BTreeMap<Topic, Vec<(SubscriptionId, Handler)>>>,
    next_id: AtomicU64,
    tx: Mutex<Sender<Event>>,
    /// Parked here while the dispatch thread is not running.
    rx: Mutex<Option<Receiver<Event>>>,
    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<Receiver<Event>>>>,
}

/// Cheap to clone; all clones share one queue and subscriber table.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            inner: Arc::new(Inner {
                config,
                subscribers: RwLock::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
                tx: Mutex::new(tx),
                rx: Mutex::new(Some(rx)),
                running: AtomicBool::new(false),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Register `handler` for `topic`. Handlers for one topic run in
    /// subscription order.
    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Register one shared handler for every topic.
    pub fn subscribe_all<F>(&self, handler: F) -> Vec<SubscriptionId>
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        Topic::ALL
            .iter()
            .map(|topic| {
                let h = Arc::clone(&handler);
                self.subscribe(*topic, move |e| h(e))
            })
            .collect()
    }

    /// Returns `false` if `id` was not subscribed to `topic`.
    pub fn unsubscribe(&self, topic: Topic, id: SubscriptionId) -> bool {
        let mut subs = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(list) = subs.get_mut(&topic) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sid, _)| *sid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            subs.remove(&topic);
        }
        removed
    }

    /// Total registered handlers across all topics.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Enqueue `event` for asynchronous delivery. Never blocks on handlers.
    pub fn publish(&self, event: Event) {
        let tx = self.inner.tx.lock().unwrap_or_else(PoisonError::into_inner);
        if tx.send(event).is_err() {
            debug!("BUS | dispatch queue closed, event dropped");
        }
    }

    /// Convenience: wrap `kind` in an [`Event`] and publish it.
    pub fn emit(&self, source: &'static str, kind: EventKind) {
        self.publish(Event::new(source, kind));
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Spawn the dispatch thread. Idempotent.
    pub fn start(&self) -> Result<()> {
        let mut worker = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return Ok(());
        }

        let rx = self
            .inner
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_else(|| {
                // A previous stop timed out and the old receiver left with its
                // thread; open a fresh queue.
                let (tx, rx) = mpsc::channel();
                *self.inner.tx.lock().unwrap_or_else(PoisonError::into_inner) = tx;
                rx
            });

        self.inner.running.store(true, Ordering::Release);
        let weak = Arc::downgrade(&self.inner);
        let poll = Duration::from_millis(self.inner.config.poll_interval_ms.max(1));
        let handle = thread::Builder::new()
            .name("event-bus".into())
            .spawn(move || dispatch_loop(&weak, rx, poll))
            .map_err(|e| {
                self.inner.running.store(false, Ordering::Release);
                Error::Startup(format!("event dispatch thread: {e}"))
            })?;
        *worker = Some(handle);
        debug!("BUS | dispatch started");
        Ok(())
    }

    /// Signal the dispatch loop to exit and wait (bounded) for it to drain.
    ///
    /// Events enqueued after this call begins may not be delivered.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::Release);
        let Some(handle) = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        let deadline = Instant::now() + Duration::from_millis(self.inner.config.stop_timeout_ms);
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        if !handle.is_finished() {
            warn!("BUS | dispatch loop did not stop within timeout, detaching");
            return;
        }
        match handle.join() {
            Ok(rx) => {
                *self.inner.rx.lock().unwrap_or_else(PoisonError::into_inner) = Some(rx);
                debug!("BUS | dispatch stopped");
            }
            Err(_) => error!("BUS | dispatch thread panicked"),
        }
    }
}

impl Inner {
    fn deliver(&self, event: &Event) {
        let handlers: Vec<Handler> = {
            let subs = self.subscribers.read().unwrap_or_else(PoisonError::into_inner);
            match subs.get(&event.topic()) {
                Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => return,
            }
        };

        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("BUS | handler for {:?} failed: {e:#}", event.topic()),
                Err(_) => error!("BUS | handler for {:?} panicked", event.topic()),
            }
        }
    }
}

fn dispatch_loop(inner: &Weak<Inner>, rx: Receiver<Event>, poll: Duration) -> Receiver<Event> {
    loop {
        match inner.upgrade() {
            Some(bus) if bus.running.load(Ordering::Acquire) => {}
            Some(bus) => {
                // Shutdown requested: flush what is already queued.
                while let Ok(event) = rx.try_recv() {
                    bus.deliver(&event);
                }
                break;
            }
            None => break,
        }

        match rx.recv_timeout(poll) {
            Ok(event) => {
                if let Some(bus) = inner.upgrade() {
                    bus.deliver(&event);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    rx
}
