//! Backend coordinator: the only surface the GUI/CLI layer talks to.
//!
//! [`Backend`] composes the event bus, command channel, device service and
//! automation engine, owns their lifecycles, and forwards the collaborator
//! API. Hardware access flows through the injected [`Transport`];
//! persistence through an optional [`ConfigPort`].
//!
//! ```text
//!   Transport ──▶ ┌──────────────────────────────────┐ ──▶ EventBus
//!                 │             Backend              │       subscribers
//!  ConfigPort ◀──▶│ Channel · Device · Automation    │
//!                 └──────────────────────────────────┘
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::config::BackendConfig;
use crate::diagnostics::SystemStatus;
use crate::error::{Error, ProgramError, Result, StorageError};
use crate::events::{Event, EventBus, EventKind, SubscriptionId, Topic};
use crate::protocol::PinMode;

use super::automation::{AutomationEngine, CancelToken};
use super::channel::{CommandChannel, ConnectionState};
use super::device::{AnalogConfig, AnalogReading, DeviceService, PinConfig};
use super::ports::{ConfigDocument, ConfigPort, Transport};
use super::program::{MotionParams, Sequence, StepDef, Task, TaskInfo, Waypoint};

const SOURCE: &str = "backend";

struct Poller {
    token: CancelToken,
    handle: JoinHandle<()>,
}

/// Composed hardware control backend. Construct one per device.
pub struct Backend {
    config: BackendConfig,
    bus: EventBus,
    channel: Arc<CommandChannel>,
    device: Arc<DeviceService>,
    automation: AutomationEngine,
    store: Option<Box<dyn ConfigPort>>,
    poller: Mutex<Option<Poller>>,
}

impl Backend {
    /// Build the backend and start event dispatch. Nothing is sent to the
    /// device until [`connect`](Self::connect).
    pub fn new(config: BackendConfig, transport: Box<dyn Transport>) -> Result<Self> {
        let bus = EventBus::new(config.bus.clone());
        let channel = Arc::new(CommandChannel::new(
            transport,
            config.channel.clone(),
            config.health.clone(),
            bus.clone(),
        ));
        let device = Arc::new(DeviceService::new(
            Arc::clone(&channel),
            bus.clone(),
            config.smoothing.clone(),
            config.pins.status_first_pin,
        ));
        let automation = AutomationEngine::new(
            Arc::clone(&device),
            bus.clone(),
            config.automation.clone(),
            config.motion.clone(),
        );

        bus.start()?;
        info!("backend ready (armlink v{})", env!("CARGO_PKG_VERSION"));

        Ok(Self {
            config,
            bus,
            channel,
            device,
            automation,
            store: None,
            poller: Mutex::new(None),
        })
    }

    /// Build the backend from the settings held by `store`, then load its
    /// pin configurations and sequences. `config` is used when the store is
    /// empty or cannot be read; a read failure is logged.
    pub fn open(
        config: BackendConfig,
        transport: Box<dyn Transport>,
        store: Box<dyn ConfigPort>,
    ) -> Result<Self> {
        let doc = store.load().unwrap_or_else(|e| {
            warn!("configuration load failed, using supplied settings: {e}");
            None
        });
        let config = match &doc {
            Some(doc) => doc.settings.clone(),
            None => config,
        };
        let mut backend = Self::new(config, transport)?;
        if let Some(doc) = doc {
            backend.apply_document(doc);
        }
        backend.store = Some(store);
        Ok(backend)
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    // ── Connection ────────────────────────────────────────────

    /// Open `port`, probe the controller, re-apply known pin configurations
    /// and configure the default output pins.
    pub fn connect(&self, port: &str, baud_rate: u32) -> Result<()> {
        info!("connecting to {port} @ {baud_rate}");
        if let Err(e) = self.channel.open(port, baud_rate) {
            self.report_connect_failure(port, &e);
            return Err(e);
        }
        self.after_connect(port, baud_rate);
        Ok(())
    }

    /// Close and re-open the last endpoint.
    pub fn reconnect(&self) -> Result<()> {
        let Some((port, baud_rate)) = self.channel.last_endpoint() else {
            return Err(Error::NotConnected);
        };
        self.stop_activity();
        self.channel.close();
        self.device.clear_session();
        self.channel.set_state(ConnectionState::Reconnecting);
        info!("reconnecting to {port} @ {baud_rate}");
        if let Err(e) = self.channel.open(&port, baud_rate) {
            self.report_connect_failure(&port, &e);
            return Err(e);
        }
        self.after_connect(&port, baud_rate);
        Ok(())
    }

    fn after_connect(&self, port: &str, baud_rate: u32) {
        // Applied here rather than from a bus handler so the device is fully
        // configured by the time connect returns.
        self.device.reapply_configurations();
        self.init_default_pins();
        self.bus.emit(
            SOURCE,
            EventKind::ConnectionEstablished {
                port: port.to_owned(),
                baud_rate,
            },
        );
    }

    fn init_default_pins(&self) {
        for &pin in &self.config.pins.default_outputs {
            if self.device.pin_config(pin).is_some() {
                continue;
            }
            if let Err(e) = self.device.configure_pin(pin, PinConfig::new(PinMode::Output)) {
                warn!("default output pin {pin} not configured: {e}");
            }
        }
    }

    fn report_connect_failure(&self, port: &str, e: &Error) {
        error!("connection to {port} failed: {e}");
        self.channel.set_state(ConnectionState::Error);
        self.channel.record_error(&e.to_string(), "connect");
        self.bus.emit(
            SOURCE,
            EventKind::HardwareError {
                message: e.to_string(),
                port: Some(port.to_owned()),
            },
        );
    }

    /// Stop every run and the poller, close the link and drop session caches.
    pub fn disconnect(&self) {
        self.stop_activity();
        let was_connected = self.channel.state() == ConnectionState::Connected;
        self.channel.close();
        self.device.clear_session();
        if was_connected {
            self.bus.emit(SOURCE, EventKind::ConnectionLost);
        }
        info!("disconnected");
    }

    fn stop_activity(&self) {
        self.automation.stop_all();
        self.set_realtime(false);
    }

    pub fn state(&self) -> ConnectionState {
        self.channel.state()
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_open()
    }

    // ── Device I/O ────────────────────────────────────────────

    pub fn configure_pin(&self, pin: u8, mode: PinMode, debounce_ms: u32) -> Result<()> {
        self.device.configure_pin(pin, PinConfig { mode, debounce_ms })
    }

    /// Override smoothing for analog `channel`. A `None` factor keeps the
    /// backend-wide sample weight.
    pub fn configure_analog(
        &self,
        channel: &str,
        smoothing_enabled: bool,
        smoothing_factor: Option<f32>,
    ) -> Result<()> {
        self.device.configure_analog(
            channel,
            AnalogConfig {
                smoothing_enabled,
                smoothing_factor,
            },
        )
    }

    pub fn write_digital(&self, pin: u8, value: u8) -> Result<()> {
        self.device.write_digital(pin, value)
    }

    pub fn read_digital(&self, pin: u8) -> Result<u8> {
        self.device.read_digital(pin)
    }

    pub fn read_analog(&self, channel: &str) -> Result<f32> {
        self.device.read_analog(channel)
    }

    pub fn get_status(&self) -> Result<std::collections::BTreeMap<u8, u8>> {
        self.device.get_status()
    }

    pub fn move_to(&self, positions: &[f32]) -> Result<()> {
        self.device.move_to(positions)
    }

    pub fn read_positions(&self) -> Result<Vec<f32>> {
        self.device.read_positions()
    }

    /// Last positions reported by the controller.
    pub fn current_positions(&self) -> Vec<f32> {
        self.device.positions()
    }

    /// Store `params` for later task runs and push them to the controller
    /// now if connected.
    pub fn set_motion_params(&self, params: MotionParams) -> Result<()> {
        self.automation.set_motion_params(params.clone());
        if self.channel.state() == ConnectionState::Connected {
            self.device.apply_motion_params(&params)?;
        }
        Ok(())
    }

    pub fn motion_params(&self) -> MotionParams {
        self.automation.motion_params()
    }

    // ── Real-time position polling ────────────────────────────

    /// Start or stop the background `readall` poller.
    pub fn set_realtime(&self, enabled: bool) {
        let mut poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
        if !enabled {
            if let Some(p) = poller.take() {
                p.token.cancel();
                if p.handle.join().is_err() {
                    error!("position poller panicked");
                }
                debug!("position poller stopped");
            }
            return;
        }
        if poller.is_some() {
            return;
        }

        let token = CancelToken::new();
        let device = Arc::clone(&self.device);
        let channel = Arc::clone(&self.channel);
        let period = Duration::from_millis(self.config.realtime_interval_ms.max(1));
        let t = token.clone();
        let spawned = thread::Builder::new()
            .name("position-poller".into())
            .spawn(move || {
                while t.sleep(period) {
                    if channel.state() != ConnectionState::Connected {
                        continue;
                    }
                    if let Err(e) = device.read_positions() {
                        debug!("position poll failed: {e}");
                    }
                }
            });
        match spawned {
            Ok(handle) => {
                *poller = Some(Poller { token, handle });
                debug!("position poller started ({} ms)", period.as_millis());
            }
            Err(e) => error!("position poller not started: {e}"),
        }
    }

    pub fn is_realtime(&self) -> bool {
        self.poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    // ── Programs ──────────────────────────────────────────────

    pub fn create_sequence(
        &self,
        name: &str,
        steps: Vec<StepDef>,
        looping: bool,
        interval_secs: f64,
    ) -> Result<()> {
        self.automation
            .create_sequence(Sequence::new(name, steps, looping, interval_secs))
    }

    pub fn start(&self, name: &str) -> Result<()> {
        self.automation.start(name)
    }

    pub fn stop(&self, name: &str) -> Result<()> {
        self.automation.stop(name)
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.automation.is_running(name)
    }

    pub fn device(&self) -> &DeviceService {
        &self.device
    }

    pub fn automation(&self) -> &AutomationEngine {
        &self.automation
    }

    pub fn create_task(&self, name: &str, description: &str) -> Result<()> {
        self.automation.create_task(name, description)
    }

    pub fn add_waypoint(&self, task: &str, waypoint: Waypoint) -> Result<()> {
        self.automation.add_waypoint(task, waypoint)
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        self.automation.delete(name)
    }

    pub fn task_info(&self, name: &str) -> Option<TaskInfo> {
        self.automation.task_info(name)
    }

    pub fn program_names(&self) -> Vec<String> {
        self.automation.program_names()
    }

    /// Write task `name` as JSON to `path`.
    pub fn save_task(&self, name: &str, path: &Path) -> Result<()> {
        let task = self
            .automation
            .task(name)
            .ok_or_else(|| ProgramError::NotFound(name.to_owned()))?;
        write_task(path, &task)?;
        info!("saved task '{name}' to {}", path.display());
        Ok(())
    }

    /// Load a task file, replacing any task of the same name. Returns the
    /// task's name.
    pub fn load_task(&self, path: &Path) -> Result<String> {
        let task = read_task(path)?;
        let name = task.name.clone();
        self.automation.insert_task(task)?;
        info!("loaded task '{name}' from {}", path.display());
        Ok(name)
    }

    /// Write every task to `<dir>/<name>.json`.
    pub fn save_all_tasks(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).map_err(StorageError::from)?;
        for task in self.automation.tasks() {
            write_task(&dir.join(format!("{}.json", task.name)), &task)?;
        }
        Ok(())
    }

    /// Load every `*.json` task in `dir`. Unreadable files are logged and
    /// skipped. Returns how many tasks were loaded.
    pub fn load_all_tasks(&self, dir: &Path) -> Result<usize> {
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(StorageError::from)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            match self.load_task(&path) {
                Ok(_) => loaded += 1,
                Err(e) => warn!("skipping {}: {e}", path.display()),
            }
        }
        Ok(loaded)
    }

    // ── Events ────────────────────────────────────────────────

    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.bus.subscribe(topic, handler)
    }

    pub fn unsubscribe(&self, topic: Topic, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(topic, id)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    // ── Status ────────────────────────────────────────────────

    pub fn system_status(&self) -> SystemStatus {
        let link = self.channel.info();
        SystemStatus {
            state: link.state,
            endpoint: link.endpoint,
            connected_at: link.connected_at,
            last_command_at: link.last_command_at,
            health_score: link.health_score,
            average_latency: link.counters.average_latency,
            total_commands: link.counters.total,
            failed_commands: link.counters.failed,
            error_count: link.counters.errors,
            active_programs: self.automation.active_runs(),
            pin_states: self.device.pin_states(),
            analog_values: self
                .device
                .analog_values()
                .into_iter()
                .map(|(ch, AnalogReading { value, .. })| (ch, value))
                .collect(),
            positions: self.device.positions(),
            subscriber_count: self.bus.subscriber_count(),
            recent_errors: link.recent_errors,
        }
    }

    // ── Persistence ───────────────────────────────────────────

    /// Persist pin and analog configurations, sequences and settings.
    /// Without a store this is a no-op.
    pub fn save_configuration(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let mut settings = self.config.clone();
        settings.motion = self.automation.motion_params();
        let doc = ConfigDocument {
            pin_configs: self.device.pin_configs(),
            analog_configs: self.device.analog_configs(),
            sequences: self.automation.sequences(),
            settings,
        };
        store.save(&doc)?;
        info!("configuration saved");
        Ok(())
    }

    /// Load configurations, sequences and motion settings from the store.
    /// Pin configurations reach the device on the next connect.
    ///
    /// The other settings sections size the subsystems and only take effect
    /// through [`open`](Self::open); a stored set that differs from the
    /// running one is logged.
    pub fn load_configuration(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let Some(doc) = store.load()? else {
            debug!("no stored configuration");
            return Ok(());
        };
        let mut stored = doc.settings.clone();
        stored.motion.clone_from(&self.config.motion);
        if stored != self.config {
            warn!("stored settings differ from the running ones, they apply on the next start");
        }
        self.apply_document(doc);
        Ok(())
    }

    fn apply_document(&self, doc: ConfigDocument) {
        self.device.register_configs(doc.pin_configs);
        self.device.register_analog_configs(doc.analog_configs);
        self.automation.load_sequences(doc.sequences);
        self.automation.set_motion_params(doc.settings.motion);
        info!("configuration loaded");
    }

    /// Stop everything, disconnect, save, and stop event dispatch.
    pub fn shutdown(&self) {
        info!("shutting down");
        self.disconnect();
        if let Err(e) = self.save_configuration() {
            error!("configuration save failed: {e}");
        }
        self.bus.stop();
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.set_realtime(false);
        self.automation.stop_all();
        self.bus.stop();
    }
}

fn write_task(path: &Path, task: &Task) -> Result<()> {
    let json = serde_json::to_string_pretty(task).map_err(StorageError::from)?;
    fs::write(path, json).map_err(StorageError::from)?;
    Ok(())
}

fn read_task(path: &Path) -> Result<Task> {
    let text = fs::read_to_string(path).map_err(StorageError::from)?;
    let task = serde_json::from_str(&text).map_err(StorageError::from)?;
    Ok(task)
}
