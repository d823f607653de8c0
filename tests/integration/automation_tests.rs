//! Program lifecycle: sequences, waypoint tasks, stop and restart.

use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use armlink::Backend;
use armlink::adapters::sim::{AXES, SimHandle, SimulatedArm};
use armlink::adapters::store::MemoryStore;
use armlink::app::ports::{ConfigDocument, ConfigPort};
use armlink::app::program::{Sequence, StepDef, Waypoint};
use armlink::config::BackendConfig;
use armlink::error::{ConfigError, Error, ProgramError};
use armlink::events::{Completion, EventKind};

use crate::mock_transport::{Recorder, fast_config, wait_until};

fn connected(config: BackendConfig) -> (Backend, SimHandle, Recorder) {
    let arm = SimulatedArm::new();
    let sim = arm.handle();
    let backend = Backend::new(config, Box::new(arm)).unwrap();
    let rec = Recorder::attach(&backend);
    backend.connect("sim", 115_200).unwrap();
    (backend, sim, rec)
}

fn blink() -> Vec<StepDef> {
    vec![StepDef::digital_write(13, 1), StepDef::digital_write(13, 0)]
}

fn completions(rec: &Recorder, name: &str, outcome: Completion) -> usize {
    rec.count(|k| matches!(
        k,
        EventKind::SequenceCompleted { name: n, outcome: o } if n == name && *o == outcome
    ))
}

fn pose(first: f32) -> Waypoint {
    let mut positions = vec![90.0; AXES];
    positions[0] = first;
    Waypoint::new(positions).with_delay_ms(0)
}

// ── Sequences ─────────────────────────────────────────────────

#[test]
fn looping_blink_until_stopped() {
    let (backend, _sim, rec) = connected(fast_config());
    backend.create_sequence("blink", blink(), true, 0.5).unwrap();

    backend.start("blink").unwrap();
    assert!(backend.is_running("blink"));
    thread::sleep(Duration::from_millis(1100));
    backend.stop("blink").unwrap();

    assert!(!backend.is_running("blink"));
    assert!(rec.wait_for(1, |k| matches!(k, EventKind::SequenceCompleted { .. })));
    thread::sleep(Duration::from_millis(50));
    assert!(rec.count(|k| matches!(k, EventKind::PinStateChanged { pin: 13, .. })) >= 2);
    assert_eq!(completions(&rec, "blink", Completion::Stopped), 1);
    assert_eq!(rec.count(|k| matches!(k, EventKind::SequenceCompleted { .. })), 1);
}

#[test]
fn start_announces_step_count() {
    let (backend, _sim, rec) = connected(fast_config());
    backend.create_sequence("blink", blink(), true, 0.05).unwrap();

    backend.start("blink").unwrap();

    assert!(rec.wait_for(1, |k| matches!(
        k,
        EventKind::SequenceStarted { name, step_count: 2 } if name == "blink"
    )));
    let engine = backend.automation();
    assert!(engine.started_at("blink").is_some_and(|t| t > 0.0));
    assert!(engine.current_step("blink").is_some_and(|i| i < 2));
    backend.stop("blink").unwrap();
    assert_eq!(engine.started_at("blink"), None);
}

#[test]
fn one_shot_sequence_completes() {
    let (backend, sim, rec) = connected(fast_config());
    backend
        .create_sequence(
            "pulse",
            vec![StepDef::digital_write(6, 1), StepDef::wait(0.02), StepDef::digital_write(6, 0)],
            false,
            0.01,
        )
        .unwrap();

    backend.start("pulse").unwrap();

    assert!(rec.wait_for(1, |k| matches!(
        k,
        EventKind::SequenceCompleted { outcome: Completion::Completed, .. }
    )));
    assert!(!backend.is_running("pulse"));
    assert_eq!(sim.level(6), 0);
    assert!(backend.system_status().active_programs.is_empty());
}

#[test]
fn restart_replaces_previous_run() {
    let (backend, _sim, rec) = connected(fast_config());
    backend.create_sequence("blink", blink(), true, 0.05).unwrap();

    backend.start("blink").unwrap();
    backend.start("blink").unwrap();

    assert_eq!(backend.automation().active_runs(), ["blink"]);
    assert!(rec.wait_for(1, |k| matches!(
        k,
        EventKind::SequenceCompleted { outcome: Completion::Stopped, .. }
    )));
    assert!(rec.wait_for(2, |k| matches!(k, EventKind::SequenceStarted { .. })));

    backend.stop("blink").unwrap();
    assert!(rec.wait_for(2, |k| matches!(
        k,
        EventKind::SequenceCompleted { outcome: Completion::Stopped, .. }
    )));
}

#[test]
fn stopping_idle_program_is_rejected() {
    let (backend, _sim, rec) = connected(fast_config());
    backend.create_sequence("blink", blink(), false, 0.0).unwrap();

    let err = backend.stop("blink").unwrap_err();

    assert_eq!(err, Error::Program(ProgramError::NotRunning("blink".into())));
    assert!(backend.program_names().contains(&"blink".to_owned()));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(rec.count(|k| matches!(k, EventKind::SequenceCompleted { .. })), 0);
}

#[test]
fn invalid_definitions_are_not_stored() {
    let (backend, _sim, _rec) = connected(fast_config());

    let steps = vec![StepDef::digital_write(13, 1), StepDef::digital_write(13, 5)];
    let err = backend.create_sequence("bad", steps, false, 1.0).unwrap_err();
    assert!(
        matches!(err, Error::Config(ConfigError::InvalidStep { index: 1, .. })),
        "{err:?}"
    );
    assert!(backend.create_sequence("", blink(), false, 1.0).is_err());
    assert!(backend.create_sequence("neg", blink(), false, -1.0).is_err());
    assert!(backend.program_names().is_empty());

    backend.create_sequence("blink", blink(), false, 1.0).unwrap();
    assert_eq!(
        backend.create_sequence("blink", blink(), false, 1.0),
        Err(Error::Program(ProgramError::AlreadyExists("blink".into())))
    );
}

#[test]
fn malformed_stored_steps_are_skipped() {
    let store = MemoryStore::new();
    let mut doc = ConfigDocument::default();
    let mut seq = Sequence::new("legacy", vec![StepDef::digital_write(12, 1)], false, 0.0);
    seq.steps.insert(
        0,
        StepDef {
            action: "BLINK".into(),
            pin: "12".into(),
            value: 1.0,
            delay: 0.0,
        },
    );
    doc.sequences = BTreeMap::from([("legacy".to_owned(), seq)]);
    doc.settings = fast_config();
    store.save(&doc).unwrap();

    let arm = SimulatedArm::new();
    let sim = arm.handle();
    let backend = Backend::open(fast_config(), Box::new(arm), Box::new(store)).unwrap();
    let rec = Recorder::attach(&backend);
    backend.connect("sim", 115_200).unwrap();

    backend.start("legacy").unwrap();

    assert!(rec.wait_for(1, |k| matches!(
        k,
        EventKind::SequenceStarted { step_count: 1, .. }
    )));
    assert!(rec.wait_for(1, |k| matches!(
        k,
        EventKind::SequenceCompleted { outcome: Completion::Completed, .. }
    )));
    assert_eq!(sim.level(12), 1);
}

#[test]
fn disabled_and_unknown_programs_do_not_start() {
    let (backend, _sim, _rec) = connected(fast_config());
    backend.create_sequence("blink", blink(), true, 0.1).unwrap();
    backend.automation().set_enabled("blink", false).unwrap();

    assert_eq!(
        backend.start("blink"),
        Err(Error::Program(ProgramError::Disabled("blink".into())))
    );
    assert_eq!(
        backend.start("ghost"),
        Err(Error::Program(ProgramError::NotFound("ghost".into())))
    );
    assert!(!backend.is_running("blink"));
}

#[test]
fn step_failures_do_not_abort_sequence() {
    let (backend, sim, rec) = connected(fast_config());
    backend
        .create_sequence(
            "probe",
            vec![StepDef::analog_read("A7"), StepDef::digital_write(11, 1)],
            false,
            0.0,
        )
        .unwrap();

    backend.start("probe").unwrap();

    assert!(rec.wait_for(1, |k| matches!(
        k,
        EventKind::SequenceCompleted { outcome: Completion::Completed, .. }
    )));
    assert_eq!(sim.level(11), 1);
    assert!(backend.system_status().failed_commands >= 1);
}

#[test]
fn disconnect_stops_runs() {
    let (backend, _sim, rec) = connected(fast_config());
    backend.create_sequence("blink", blink(), true, 0.05).unwrap();
    backend.start("blink").unwrap();

    backend.disconnect();

    assert!(!backend.is_running("blink"));
    assert!(rec.wait_for(1, |k| matches!(
        k,
        EventKind::SequenceCompleted { outcome: Completion::Stopped, .. }
    )));
}

#[test]
fn delete_stops_and_removes() {
    let (backend, _sim, _rec) = connected(fast_config());
    backend.create_sequence("blink", blink(), true, 0.05).unwrap();
    backend.start("blink").unwrap();

    backend.delete("blink").unwrap();

    assert!(!backend.is_running("blink"));
    assert!(backend.program_names().is_empty());
    assert_eq!(
        backend.delete("blink"),
        Err(Error::Program(ProgramError::NotFound("blink".into())))
    );
}

// ── Waypoint tasks ────────────────────────────────────────────

#[test]
fn waypoint_task_runs_to_completion() {
    let (backend, sim, rec) = connected(fast_config());
    backend.create_task("wave", "sweep axis 1").unwrap();
    for angle in [30.0, 150.0, 45.0] {
        backend.add_waypoint("wave", pose(angle)).unwrap();
    }

    backend.start("wave").unwrap();

    assert!(rec.wait_for(1, |k| matches!(
        k,
        EventKind::SequenceCompleted { name, outcome: Completion::Completed } if name == "wave"
    )));
    assert_eq!(sim.positions()[0], 45.0);
    assert_eq!(sim.motion_setting("speed").as_deref(), Some("30"));
    assert_eq!(sim.motion_setting("cpg").as_deref(), Some("off"));
    assert_eq!(backend.task_info("wave").unwrap().waypoint_count, 3);
}

#[test]
fn looping_task_counts_passes() {
    let (backend, _sim, _rec) = connected(fast_config());
    backend.create_task("loop", "").unwrap();
    backend.add_waypoint("loop", pose(10.0)).unwrap();
    backend.add_waypoint("loop", pose(20.0)).unwrap();
    backend.automation().set_looping("loop", true).unwrap();

    backend.start("loop").unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        backend.task_info("loop").is_some_and(|t| t.loop_count >= 2)
    }));
    backend.stop("loop").unwrap();

    let info = backend.task_info("loop").unwrap();
    assert!(info.looping);
    assert!(info.loop_count >= 2);
}

#[test]
fn unresponsive_arm_fails_task() {
    let (backend, sim, rec) = connected(fast_config());
    backend.create_task("wave", "").unwrap();
    backend.add_waypoint("wave", pose(30.0)).unwrap();
    sim.set_responsive(false);

    backend.start("wave").unwrap();

    assert!(rec.wait_for(1, |k| matches!(
        k,
        EventKind::SequenceCompleted { outcome: Completion::Failed, .. }
    )));
    assert!(!backend.is_running("wave"));
}

#[test]
fn empty_task_cannot_start() {
    let (backend, _sim, _rec) = connected(fast_config());
    backend.create_task("empty", "").unwrap();
    assert_eq!(
        backend.start("empty"),
        Err(Error::Program(ProgramError::Empty("empty".into())))
    );
}

#[test]
fn task_and_waypoint_limits() {
    let mut config = fast_config();
    config.automation.max_tasks = 2;
    config.automation.max_waypoints = 2;
    let (backend, _sim, _rec) = connected(config);

    backend.create_task("a", "").unwrap();
    backend.create_task("b", "").unwrap();
    assert_eq!(
        backend.create_task("c", ""),
        Err(Error::Program(ProgramError::TooManyPrograms(2)))
    );
    // Pin sequences do not count against the task limit.
    backend.create_sequence("blink", blink(), false, 0.1).unwrap();

    backend.add_waypoint("a", pose(1.0)).unwrap();
    backend.add_waypoint("a", pose(2.0)).unwrap();
    assert!(matches!(
        backend.add_waypoint("a", pose(3.0)),
        Err(Error::Program(ProgramError::TooManyWaypoints { limit: 2, .. }))
    ));
    assert!(matches!(
        backend.add_waypoint("blink", pose(3.0)),
        Err(Error::Program(ProgramError::WrongKind(_)))
    ));
    assert!(matches!(
        backend.add_waypoint("b", Waypoint::new(vec![f32::NAN])),
        Err(Error::Config(_))
    ));
}
