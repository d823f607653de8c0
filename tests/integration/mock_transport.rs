//! Mock transport and event recorder shared by the integration tests.
//!
//! `MockTransport` answers each command through a test-supplied responder
//! so a test can script exactly what the controller says; `Recorder`
//! captures everything published on the bus.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use armlink::Backend;
use armlink::app::ports::Transport;
use armlink::config::BackendConfig;
use armlink::error::TransportError;
use armlink::events::{Event, EventKind};

type Responder = Box<dyn Fn(&str) -> Option<String> + Send>;

#[derive(Default)]
struct MockState {
    open: bool,
    silent: bool,
    pending: Option<String>,
    sent: Vec<String>,
}

/// Shared handle onto a [`MockTransport`].
#[derive(Clone, Default)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

#[allow(dead_code)]
impl MockHandle {
    /// A silent device swallows commands and never replies.
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().unwrap().silent = silent;
    }

    pub fn sent(&self) -> Vec<String> {
        self.state.lock().unwrap().sent.clone()
    }
}

pub struct MockTransport {
    handle: MockHandle,
    responder: Responder,
}

impl MockTransport {
    pub fn new(responder: impl Fn(&str) -> Option<String> + Send + 'static) -> (Self, MockHandle) {
        let handle = MockHandle::default();
        (
            Self {
                handle: handle.clone(),
                responder: Box::new(responder),
            },
            handle,
        )
    }

    /// Controller that acknowledges everything with `OK` and answers the
    /// probe with `STATUS:OK`.
    pub fn agreeable() -> (Self, MockHandle) {
        Self::new(|cmd| {
            Some(if cmd == "GET_STATUS" {
                "STATUS:OK".to_owned()
            } else {
                "OK".to_owned()
            })
        })
    }
}

impl Transport for MockTransport {
    fn open(&mut self, _endpoint: &str, _baud_rate: u32) -> Result<(), TransportError> {
        self.handle.state.lock().unwrap().open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.handle.state.lock().unwrap().open = false;
    }

    fn is_open(&self) -> bool {
        self.handle.state.lock().unwrap().open
    }

    fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        let mut s = self.handle.state.lock().unwrap();
        s.sent.push(line.to_owned());
        s.pending = if s.silent { None } else { (self.responder)(line) };
        Ok(())
    }

    fn read_line(&mut self, _timeout: Duration) -> Result<String, TransportError> {
        self.handle
            .state
            .lock()
            .unwrap()
            .pending
            .take()
            .ok_or(TransportError::Timeout)
    }
}

// ── Event recorder ────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
}

#[allow(dead_code)]
impl Recorder {
    pub fn attach(backend: &Backend) -> Self {
        let rec = Self::default();
        let events = Arc::clone(&rec.events);
        backend.bus().subscribe_all(move |e| {
            events.lock().unwrap().push(e.clone());
            Ok(())
        });
        rec
    }

    pub fn count(&self, pred: impl Fn(&EventKind) -> bool) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| pred(&e.kind))
            .count()
    }

    /// Wait up to two seconds for at least `n` matching events.
    pub fn wait_for(&self, n: usize, pred: impl Fn(&EventKind) -> bool) -> bool {
        wait_until(Duration::from_secs(2), || self.count(&pred) >= n)
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.kind.clone())
            .collect()
    }
}

pub fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Settings for fast tests: no boot delay, no default pins, short motion
/// waits.
#[allow(dead_code)]
pub fn fast_config() -> BackendConfig {
    let mut config = BackendConfig::simulated();
    config.motion.duration_ms = 0;
    config.automation.min_motion_secs = 0.01;
    config.realtime_interval_ms = 10;
    config
}
