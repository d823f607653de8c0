//! Automation engine: named programs, each run on its own cancellable thread.
//!
//! Per-program state machine:
//!
//! ```text
//!   Idle ──start──▶ Running ──last step, no loop──▶ Idle  (Completed)
//!                   │  ▲                     ──stop / restart──▶ Idle  (Stopped)
//!                   └──┘ loop wrap           ──waypoint send fails──▶ Idle (Failed)
//! ```
//!
//! Whoever removes a run from the active set publishes its
//! `SequenceCompleted`, so every run produces exactly one completion event.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::config::AutomationLimits;
use crate::error::{ConfigError, Error, ProgramError, Result};
use crate::events::{Completion, EventBus, EventKind, unix_now};

use super::device::DeviceService;
use super::program::{
    MotionParams, Program, Sequence, Step, StepAction, Task, TaskInfo, Waypoint, validate_name,
};

const SOURCE: &str = "automation";

// ───────────────────────────────────────────────────────────────
// Cancellation
// ───────────────────────────────────────────────────────────────

/// Cooperative cancellation flag with interruptible sleeps.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, cv) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cv.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for `duration` unless cancelled first. Returns `false` if the
    /// token was (or became) cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let (flag, cv) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = cv
            .wait_timeout_while(guard, duration, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        !*guard
    }
}

// ───────────────────────────────────────────────────────────────
// Engine
// ───────────────────────────────────────────────────────────────

struct Run {
    generation: u64,
    token: CancelToken,
    cursor: Arc<AtomicUsize>,
    /// Seconds since the Unix epoch.
    started_at: f64,
    handle: Option<JoinHandle<()>>,
}

struct Shared {
    device: Arc<DeviceService>,
    bus: EventBus,
    limits: AutomationLimits,
    motion: RwLock<MotionParams>,
    programs: Mutex<BTreeMap<String, Program>>,
    runs: Mutex<HashMap<String, Run>>,
    next_generation: AtomicU64,
}

pub struct AutomationEngine {
    shared: Arc<Shared>,
    /// Serialises start/stop so a name never has two live runs.
    control: Mutex<()>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AutomationEngine {
    pub fn new(
        device: Arc<DeviceService>,
        bus: EventBus,
        limits: AutomationLimits,
        motion: MotionParams,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                device,
                bus,
                limits,
                motion: RwLock::new(motion),
                programs: Mutex::new(BTreeMap::new()),
                runs: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
            control: Mutex::new(()),
        }
    }

    // ── Authoring ─────────────────────────────────────────────

    /// Add a pin-step sequence. Fails on a duplicate name or any malformed
    /// step; nothing is stored in that case.
    pub fn create_sequence(&self, sequence: Sequence) -> Result<()> {
        sequence.validate()?;
        let mut programs = lock(&self.shared.programs);
        if programs.contains_key(&sequence.name) {
            return Err(ProgramError::AlreadyExists(sequence.name).into());
        }
        info!("SEQ | created '{}' ({} steps)", sequence.name, sequence.steps.len());
        programs.insert(sequence.name.clone(), Program::Steps(sequence));
        Ok(())
    }

    pub fn create_task(&self, name: &str, description: &str) -> Result<()> {
        validate_name(name)?;
        let mut programs = lock(&self.shared.programs);
        if programs.contains_key(name) {
            return Err(ProgramError::AlreadyExists(name.to_owned()).into());
        }
        let max = self.shared.limits.max_tasks;
        if task_count(&programs) >= max {
            return Err(ProgramError::TooManyPrograms(max).into());
        }
        programs.insert(name.to_owned(), Program::Waypoints(Task::new(name, description)));
        info!("SEQ | created task '{name}'");
        Ok(())
    }

    pub fn add_waypoint(&self, task: &str, waypoint: Waypoint) -> Result<()> {
        if waypoint.positions.is_empty() || waypoint.positions.iter().any(|p| !p.is_finite()) {
            return Err(ConfigError::InvalidProgram(
                "waypoint needs at least one finite position".into(),
            )
            .into());
        }
        let mut programs = lock(&self.shared.programs);
        let t = match programs.get_mut(task) {
            Some(Program::Waypoints(t)) => t,
            Some(Program::Steps(_)) => return Err(ProgramError::WrongKind(task.to_owned()).into()),
            None => return Err(ProgramError::NotFound(task.to_owned()).into()),
        };
        let limit = self.shared.limits.max_waypoints;
        if t.waypoints.len() >= limit {
            warn!("SEQ | maximum waypoints ({limit}) reached for '{task}'");
            return Err(ProgramError::TooManyWaypoints {
                task: task.to_owned(),
                limit,
            }
            .into());
        }
        t.waypoints.push(waypoint);
        t.modified_at = unix_now();
        Ok(())
    }

    /// Insert or replace a waypoint task (e.g. loaded from disk).
    pub fn insert_task(&self, task: Task) -> Result<()> {
        validate_name(&task.name)?;
        let mut programs = lock(&self.shared.programs);
        match programs.get(&task.name) {
            Some(Program::Steps(_)) => {
                return Err(ProgramError::AlreadyExists(task.name).into());
            }
            Some(Program::Waypoints(_)) => {}
            None => {
                let max = self.shared.limits.max_tasks;
                if task_count(&programs) >= max {
                    return Err(ProgramError::TooManyPrograms(max).into());
                }
            }
        }
        if task.waypoints.len() > self.shared.limits.max_waypoints {
            return Err(ProgramError::TooManyWaypoints {
                task: task.name,
                limit: self.shared.limits.max_waypoints,
            }
            .into());
        }
        programs.insert(task.name.clone(), Program::Waypoints(task));
        Ok(())
    }

    /// Replace all pin-step sequences with `sequences`. Malformed steps are
    /// kept as authored and skipped when the sequence runs.
    pub fn load_sequences(&self, sequences: BTreeMap<String, Sequence>) {
        let mut programs = lock(&self.shared.programs);
        programs.retain(|_, p| !matches!(p, Program::Steps(_)));
        for (key, mut sequence) in sequences {
            if sequence.name.is_empty() {
                sequence.name.clone_from(&key);
            }
            if programs.contains_key(&sequence.name) {
                warn!("SEQ | sequence '{}' clashes with a task, skipped", sequence.name);
                continue;
            }
            programs.insert(sequence.name.clone(), Program::Steps(sequence));
        }
    }

    /// Stop (if running) and remove `name`.
    pub fn delete(&self, name: &str) -> Result<()> {
        match self.stop(name) {
            Ok(()) | Err(Error::Program(ProgramError::NotRunning(_))) => {}
            Err(e) => return Err(e),
        }
        if lock(&self.shared.programs).remove(name).is_none() {
            return Err(ProgramError::NotFound(name.to_owned()).into());
        }
        info!("SEQ | deleted '{name}'");
        Ok(())
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        match lock(&self.shared.programs).get_mut(name) {
            Some(Program::Steps(s)) => {
                s.enabled = enabled;
                Ok(())
            }
            Some(Program::Waypoints(_)) => Err(ProgramError::WrongKind(name.to_owned()).into()),
            None => Err(ProgramError::NotFound(name.to_owned()).into()),
        }
    }

    pub fn set_looping(&self, name: &str, looping: bool) -> Result<()> {
        match lock(&self.shared.programs).get_mut(name) {
            Some(Program::Steps(s)) => s.looping = looping,
            Some(Program::Waypoints(t)) => t.looping = looping,
            None => return Err(ProgramError::NotFound(name.to_owned()).into()),
        }
        Ok(())
    }

    pub fn program_names(&self) -> Vec<String> {
        lock(&self.shared.programs).keys().cloned().collect()
    }

    pub fn sequence(&self, name: &str) -> Option<Sequence> {
        match lock(&self.shared.programs).get(name) {
            Some(Program::Steps(s)) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn sequences(&self) -> BTreeMap<String, Sequence> {
        lock(&self.shared.programs)
            .iter()
            .filter_map(|(name, p)| match p {
                Program::Steps(s) => Some((name.clone(), s.clone())),
                Program::Waypoints(_) => None,
            })
            .collect()
    }

    pub fn task(&self, name: &str) -> Option<Task> {
        match lock(&self.shared.programs).get(name) {
            Some(Program::Waypoints(t)) => Some(t.clone()),
            _ => None,
        }
    }

    pub fn tasks(&self) -> Vec<Task> {
        lock(&self.shared.programs)
            .values()
            .filter_map(|p| match p {
                Program::Waypoints(t) => Some(t.clone()),
                Program::Steps(_) => None,
            })
            .collect()
    }

    pub fn task_info(&self, name: &str) -> Option<TaskInfo> {
        self.task(name).map(|t| t.info())
    }

    pub fn motion_params(&self) -> MotionParams {
        self.shared
            .motion
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Takes effect from the next task start.
    pub fn set_motion_params(&self, params: MotionParams) {
        *self
            .shared
            .motion
            .write()
            .unwrap_or_else(PoisonError::into_inner) = params;
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Start `name` on a fresh thread, stopping a previous run of the same
    /// name first.
    pub fn start(&self, name: &str) -> Result<()> {
        let _control = lock(&self.control);

        let program = lock(&self.shared.programs)
            .get(name)
            .cloned()
            .ok_or_else(|| ProgramError::NotFound(name.to_owned()))?;
        if !program.enabled() {
            warn!("SEQ | '{name}' is disabled");
            return Err(ProgramError::Disabled(name.to_owned()).into());
        }
        let body = RunBody::prepare(program)?;

        self.stop_run(name);

        let token = CancelToken::new();
        let cursor = Arc::new(AtomicUsize::new(0));
        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
        let step_count = body.len();

        let mut runs = lock(&self.shared.runs);
        let handle = {
            let shared = Arc::clone(&self.shared);
            let token = token.clone();
            let cursor = Arc::clone(&cursor);
            let run_name = name.to_owned();
            thread::Builder::new()
                .name(format!("seq-{name}"))
                .spawn(move || {
                    let outcome = body.execute(&shared, &run_name, &token, &cursor);
                    shared.finish(&run_name, generation, outcome);
                })
                .map_err(|e| Error::Startup(format!("run thread for '{name}': {e}")))?
        };
        runs.insert(
            name.to_owned(),
            Run {
                generation,
                token,
                cursor,
                started_at: unix_now(),
                handle: Some(handle),
            },
        );
        drop(runs);

        info!("SEQ | started '{name}' ({step_count} steps)");
        self.shared.bus.emit(
            SOURCE,
            EventKind::SequenceStarted {
                name: name.to_owned(),
                step_count,
            },
        );
        Ok(())
    }

    /// Cancel the run of `name` and wait for its thread to exit. Fails
    /// without side effects if `name` is not running.
    pub fn stop(&self, name: &str) -> Result<()> {
        let _control = lock(&self.control);
        if self.stop_run(name) {
            Ok(())
        } else {
            Err(ProgramError::NotRunning(name.to_owned()).into())
        }
    }

    /// Stop every active run.
    pub fn stop_all(&self) {
        let _control = lock(&self.control);
        let names: Vec<String> = lock(&self.shared.runs).keys().cloned().collect();
        for name in names {
            self.stop_run(&name);
        }
    }

    fn stop_run(&self, name: &str) -> bool {
        let Some(mut run) = lock(&self.shared.runs).remove(name) else {
            return false;
        };
        run.token.cancel();
        if let Some(handle) = run.handle.take() {
            if handle.join().is_err() {
                error!("SEQ | run thread for '{name}' panicked");
            }
        }
        info!("SEQ | stopped '{name}'");
        self.shared.bus.emit(
            SOURCE,
            EventKind::SequenceCompleted {
                name: name.to_owned(),
                outcome: Completion::Stopped,
            },
        );
        true
    }

    pub fn is_running(&self, name: &str) -> bool {
        lock(&self.shared.runs).contains_key(name)
    }

    pub fn active_runs(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.shared.runs).keys().cloned().collect();
        names.sort();
        names
    }

    /// Index of the step or waypoint the run of `name` is on.
    pub fn current_step(&self, name: &str) -> Option<usize> {
        lock(&self.shared.runs)
            .get(name)
            .map(|r| r.cursor.load(Ordering::Relaxed))
    }

    /// When the current run of `name` started.
    pub fn started_at(&self, name: &str) -> Option<f64> {
        lock(&self.shared.runs).get(name).map(|r| r.started_at)
    }
}

impl Drop for AutomationEngine {
    fn drop(&mut self) {
        for run in lock(&self.shared.runs).values() {
            run.token.cancel();
        }
    }
}

fn task_count(programs: &BTreeMap<String, Program>) -> usize {
    programs
        .values()
        .filter(|p| matches!(p, Program::Waypoints(_)))
        .count()
}

impl Shared {
    /// Natural end of a run: publish its outcome unless `stop` already
    /// claimed it.
    fn finish(&self, name: &str, generation: u64, outcome: Completion) {
        let mut runs = lock(&self.runs);
        if runs.get(name).is_none_or(|r| r.generation != generation) {
            return;
        }
        runs.remove(name);
        drop(runs);
        match outcome {
            Completion::Failed => warn!("SEQ | '{name}' aborted"),
            _ => info!("SEQ | '{name}' finished ({outcome:?})"),
        }
        self.bus.emit(
            SOURCE,
            EventKind::SequenceCompleted {
                name: name.to_owned(),
                outcome,
            },
        );
    }

    fn bump_loop_count(&self, name: &str) {
        if let Some(Program::Waypoints(t)) = lock(&self.programs).get_mut(name) {
            t.loop_count += 1;
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Run bodies
// ───────────────────────────────────────────────────────────────

enum RunBody {
    Steps {
        steps: Vec<Step>,
        looping: bool,
        interval: Duration,
    },
    Waypoints {
        waypoints: Vec<Waypoint>,
        looping: bool,
    },
}

impl RunBody {
    /// Parse what will run; malformed steps are logged and dropped.
    fn prepare(program: Program) -> Result<Self> {
        let name = program.name().to_owned();
        let body = match program {
            Program::Steps(seq) => {
                let interval = seq.interval();
                let steps = seq
                    .steps
                    .iter()
                    .enumerate()
                    .filter_map(|(i, def)| match def.parse() {
                        Ok(step) => Some(step),
                        Err(reason) => {
                            warn!("SEQ | '{name}' step {i} skipped: {reason}");
                            None
                        }
                    })
                    .collect();
                Self::Steps {
                    steps,
                    looping: seq.looping,
                    interval,
                }
            }
            Program::Waypoints(task) => Self::Waypoints {
                waypoints: task.waypoints,
                looping: task.looping,
            },
        };
        if body.is_empty() {
            return Err(ProgramError::Empty(name).into());
        }
        Ok(body)
    }

    fn len(&self) -> usize {
        match self {
            Self::Steps { steps, .. } => steps.len(),
            Self::Waypoints { waypoints, .. } => waypoints.len(),
        }
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn execute(
        self,
        shared: &Shared,
        name: &str,
        token: &CancelToken,
        cursor: &AtomicUsize,
    ) -> Completion {
        match self {
            Self::Steps {
                steps,
                looping,
                interval,
            } => run_steps(shared, name, &steps, looping, interval, token, cursor),
            Self::Waypoints { waypoints, looping } => {
                run_waypoints(shared, name, &waypoints, looping, token, cursor)
            }
        }
    }
}

fn run_steps(
    shared: &Shared,
    name: &str,
    steps: &[Step],
    looping: bool,
    interval: Duration,
    token: &CancelToken,
    cursor: &AtomicUsize,
) -> Completion {
    let mut index = 0;
    loop {
        if token.is_cancelled() {
            return Completion::Stopped;
        }
        cursor.store(index, Ordering::Relaxed);
        let step = &steps[index];
        if !execute_step(&shared.device, name, index, step, token) {
            return Completion::Stopped;
        }

        index += 1;
        if index >= steps.len() {
            if !looping {
                return Completion::Completed;
            }
            index = 0;
        }
        if !token.sleep(interval) {
            return Completion::Stopped;
        }
    }
}

/// Returns `false` if cancelled mid-step. Device failures are logged and
/// the sequence moves on.
fn execute_step(
    device: &DeviceService,
    name: &str,
    index: usize,
    step: &Step,
    token: &CancelToken,
) -> bool {
    let result = match &step.action {
        StepAction::DigitalWrite { pin, value } => device.write_digital(*pin, *value),
        StepAction::DigitalRead { pin } => device.read_digital(*pin).map(drop),
        StepAction::AnalogRead { channel } => device.read_analog(channel).map(drop),
        StepAction::Wait(d) => {
            if !token.sleep(*d) {
                return false;
            }
            Ok(())
        }
    };
    if let Err(e) = result {
        warn!("SEQ | '{name}' step {index} failed: {e}");
    } else {
        debug!("SEQ | '{name}' step {index} done");
    }
    step.delay.is_zero() || token.sleep(step.delay)
}

fn run_waypoints(
    shared: &Shared,
    name: &str,
    waypoints: &[Waypoint],
    looping: bool,
    token: &CancelToken,
    cursor: &AtomicUsize,
) -> Completion {
    let motion = shared
        .motion
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    if let Err(e) = shared.device.apply_motion_params(&motion) {
        error!("SEQ | '{name}' could not apply motion parameters: {e}");
        return Completion::Failed;
    }
    let motion_wait = Duration::from_secs_f32(
        (motion.duration_ms as f32 / 1000.0).max(shared.limits.min_motion_secs.max(0.0)),
    );

    loop {
        for (index, waypoint) in waypoints.iter().enumerate() {
            if token.is_cancelled() {
                return Completion::Stopped;
            }
            cursor.store(index, Ordering::Relaxed);
            if let Err(e) = shared.device.move_to(&waypoint.positions) {
                error!("SEQ | '{name}' waypoint {index} failed: {e}");
                return Completion::Failed;
            }
            if !token.sleep(motion_wait) {
                return Completion::Stopped;
            }
            let delay = Duration::from_millis(u64::from(waypoint.delay_ms));
            if !delay.is_zero() && !token.sleep(delay) {
                return Completion::Stopped;
            }
        }
        if !looping {
            return Completion::Completed;
        }
        shared.bump_loop_count(name);
    }
}
