//! Pin, analog, status and motion I/O against the simulated controller.

use std::thread;
use std::time::Duration;

use armlink::Backend;
use armlink::adapters::sim::{SimHandle, SimulatedArm};
use armlink::app::program::MotionParams;
use armlink::error::{ConfigError, Error};
use armlink::events::{EventKind, Topic};
use armlink::protocol::PinMode;

use crate::mock_transport::{MockTransport, Recorder, fast_config};

fn sim_backend() -> (Backend, SimHandle, Recorder) {
    let arm = SimulatedArm::new();
    let sim = arm.handle();
    let backend = Backend::new(fast_config(), Box::new(arm)).unwrap();
    let rec = Recorder::attach(&backend);
    backend.connect("sim", 115_200).unwrap();
    sim.clear_received();
    (backend, sim, rec)
}

#[test]
fn first_write_configures_output() {
    let (backend, sim, _rec) = sim_backend();

    backend.write_digital(7, 1).unwrap();
    backend.write_digital(7, 0).unwrap();

    assert_eq!(
        sim.received(),
        ["PIN_MODE:7:OUTPUT", "DIGITAL_WRITE:7:1", "DIGITAL_WRITE:7:0"]
    );
    assert_eq!(sim.mode(7), Some(PinMode::Output));
    assert_eq!(sim.level(7), 0);
    assert_eq!(backend.system_status().pin_states.get(&7), Some(&0));
}

#[test]
fn invalid_digital_value_is_rejected_locally() {
    let (backend, sim, _rec) = sim_backend();

    let err = backend.write_digital(13, 2).unwrap_err();

    assert_eq!(err, Error::Config(ConfigError::InvalidDigitalValue(2)));
    assert!(sim.received().is_empty());
}

#[test]
fn read_does_not_configure_pin() {
    let (backend, sim, rec) = sim_backend();
    sim.set_level(4, 1);

    assert_eq!(backend.read_digital(4).unwrap(), 1);

    assert_eq!(sim.received(), ["DIGITAL_READ:4"]);
    assert!(rec.wait_for(1, |k| matches!(
        k,
        EventKind::PinStateChanged { pin: 4, state: 1, .. }
    )));
}

#[test]
fn pull_up_reads_high() {
    let (backend, _sim, _rec) = sim_backend();
    backend
        .configure_pin(5, PinMode::InputPullUp, 20)
        .unwrap();
    assert_eq!(backend.read_digital(5).unwrap(), 1);
}

#[test]
fn analog_reads_are_smoothed() {
    let (backend, sim, rec) = sim_backend();

    sim.set_analog("A0", 512);
    assert_eq!(backend.read_analog("A0").unwrap(), 512.0);
    sim.set_analog("A0", 612);
    let second = backend.read_analog("A0").unwrap();

    assert!((second - 542.0).abs() < 1e-3, "{second}");
    assert!(rec.wait_for(1, |k| matches!(
        k,
        EventKind::AnalogValueChanged { channel, raw: 612, .. } if channel == "A0"
    )));
    let cached = backend.system_status().analog_values["A0"];
    assert!((cached - 542.0).abs() < 1e-3);
}

#[test]
fn smoothing_can_be_disabled() {
    let arm = SimulatedArm::new();
    let sim = arm.handle();
    let mut config = fast_config();
    config.smoothing.enabled = false;
    let backend = Backend::new(config, Box::new(arm)).unwrap();
    backend.connect("sim", 115_200).unwrap();

    sim.set_analog("A1", 100);
    backend.read_analog("A1").unwrap();
    sim.set_analog("A1", 900);
    assert_eq!(backend.read_analog("A1").unwrap(), 900.0);
}

#[test]
fn smoothing_restarts_after_reconnect() {
    let (backend, sim, _rec) = sim_backend();
    sim.set_analog("A0", 512);
    backend.read_analog("A0").unwrap();

    backend.disconnect();
    backend.connect("sim", 115_200).unwrap();
    sim.set_analog("A0", 612);

    assert_eq!(backend.read_analog("A0").unwrap(), 612.0);
}

#[test]
fn reconnect_keeps_new_session_while_dispatch_lags() {
    let (backend, sim, _rec) = sim_backend();
    // A slow subscriber holds the dispatch queue behind it.
    backend.subscribe(Topic::PinStateChanged, |_| {
        thread::sleep(Duration::from_millis(300));
        Ok(())
    });
    backend.write_digital(13, 1).unwrap();

    backend.disconnect();
    backend.connect("sim", 115_200).unwrap();
    sim.set_analog("A0", 500);
    let first = backend.read_analog("A0").unwrap();
    sim.set_analog("A0", 600);
    let second = backend.read_analog("A0").unwrap();
    // Let the queued disconnect notification drain.
    thread::sleep(Duration::from_millis(400));
    let third = backend.read_analog("A0").unwrap();

    assert_eq!(first, 500.0);
    assert!((second - 530.0).abs() < 1e-3, "{second}");
    assert!((third - 551.0).abs() < 1e-3, "{third}");
    assert!(backend.system_status().analog_values.contains_key("A0"));
}

#[test]
fn channel_override_disables_smoothing() {
    let (backend, sim, _rec) = sim_backend();
    backend.configure_analog("A2", false, None).unwrap();

    for channel in ["A0", "A2"] {
        sim.set_analog(channel, 100);
        backend.read_analog(channel).unwrap();
        sim.set_analog(channel, 900);
    }

    assert_eq!(backend.read_analog("A2").unwrap(), 900.0);
    let smoothed = backend.read_analog("A0").unwrap();
    assert!((smoothed - 340.0).abs() < 1e-3, "{smoothed}");
    // Overrides send nothing to the controller.
    assert!(sim.received().iter().all(|c| c.starts_with("ANALOG_READ:")));
}

#[test]
fn channel_factor_overrides_backend_weight() {
    let (backend, sim, _rec) = sim_backend();
    backend.configure_analog("A3", true, Some(0.5)).unwrap();

    sim.set_analog("A3", 0);
    backend.read_analog("A3").unwrap();
    sim.set_analog("A3", 100);

    assert_eq!(backend.read_analog("A3").unwrap(), 50.0);
}

#[test]
fn channel_overrides_survive_reconnect() {
    let (backend, sim, _rec) = sim_backend();
    backend.configure_analog("A1", false, None).unwrap();

    backend.disconnect();
    backend.connect("sim", 115_200).unwrap();
    sim.set_analog("A1", 100);
    backend.read_analog("A1").unwrap();
    sim.set_analog("A1", 900);

    assert_eq!(backend.read_analog("A1").unwrap(), 900.0);
}

#[test]
fn bad_smoothing_override_is_rejected() {
    let (backend, _sim, _rec) = sim_backend();

    for factor in [-0.1, 1.5, f32::NAN] {
        let err = backend.configure_analog("A0", true, Some(factor)).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::InvalidSmoothingFactor(_))), "{err:?}");
    }
    assert!(matches!(
        backend.configure_analog("A 0", false, None),
        Err(Error::Config(ConfigError::InvalidChannel(_)))
    ));
    assert!(backend.device().analog_configs().is_empty());
}

#[test]
fn bad_channel_is_rejected_before_sending() {
    let (backend, sim, _rec) = sim_backend();

    for channel in ["", "A0:1", "A 0", "TOOLONGCH"] {
        let err = backend.read_analog(channel).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::InvalidChannel(_))), "{err:?}");
    }
    assert!(sim.received().is_empty());
}

#[test]
fn status_maps_pins_from_two() {
    let (backend, sim, rec) = sim_backend();
    sim.set_level(2, 1);
    sim.set_level(13, 1);

    let pins = backend.get_status().unwrap();

    assert_eq!(pins.len(), 12);
    assert_eq!(pins[&2], 1);
    assert_eq!(pins[&3], 0);
    assert_eq!(pins[&13], 1);
    assert!(rec.wait_for(1, |k| matches!(
        k,
        EventKind::SystemStatus { pin_states, health_score, .. }
            if pin_states.len() == 12 && *health_score > 0.0
    )));
}

#[test]
fn malformed_status_is_a_protocol_failure() {
    let (transport, _mock) = MockTransport::new(|cmd| {
        Some(match cmd {
            "GET_STATUS" => "STATUS:1,x,0".to_owned(),
            _ => "OK".to_owned(),
        })
    });
    // The probe only checks the prefix, so the malformed body still connects.
    let backend = Backend::new(fast_config(), Box::new(transport)).unwrap();
    backend.connect("mock", 115_200).unwrap();

    let err = backend.get_status().unwrap_err();

    assert!(matches!(err, Error::Protocol(_)), "{err:?}");
    let status = backend.system_status();
    assert_eq!(status.total_commands, 1);
    assert_eq!(status.failed_commands, 1);
    assert_eq!(status.error_count, 1);
}

#[test]
fn configurations_survive_reconnect() {
    let (backend, sim, _rec) = sim_backend();
    backend
        .configure_pin(8, PinMode::InputPullUp, 50)
        .unwrap();

    backend.disconnect();
    // The controller forgets pin modes when the port reopens.
    backend.connect("sim", 115_200).unwrap();

    assert_eq!(sim.mode(8), Some(PinMode::InputPullUp));
}

#[test]
fn rejected_configuration_is_not_stored() {
    let (transport, mock) = MockTransport::new(|cmd| {
        Some(if cmd == "GET_STATUS" {
            "STATUS:OK".to_owned()
        } else {
            "ERROR:INVALID_PIN_MODE".to_owned()
        })
    });
    let backend = Backend::new(fast_config(), Box::new(transport)).unwrap();
    backend.connect("mock", 115_200).unwrap();

    assert!(matches!(
        backend.configure_pin(9, PinMode::Input, 50),
        Err(Error::Protocol(_))
    ));
    // Still unknown, so a write tries to configure it again.
    assert!(backend.write_digital(9, 1).is_err());
    let sent = mock.sent();
    assert_eq!(&sent[1..], ["PIN_MODE:9:INPUT", "PIN_MODE:9:OUTPUT"]);
}

#[test]
fn default_outputs_are_configured_on_connect() {
    let arm = SimulatedArm::new();
    let sim = arm.handle();
    let mut config = fast_config();
    config.pins.default_outputs = vec![2, 3, 4];
    let backend = Backend::new(config, Box::new(arm)).unwrap();

    backend.connect("sim", 115_200).unwrap();

    for pin in [2, 3, 4] {
        assert_eq!(sim.mode(pin), Some(PinMode::Output));
    }
    assert_eq!(sim.mode(5), None);
}

#[test]
fn move_and_read_back_positions() {
    let (backend, sim, rec) = sim_backend();
    let target = [10.0, 20.0, 30.0, 40.0, 50.0, 60.0];

    backend.move_to(&target).unwrap();
    assert_eq!(sim.received()[0], "1 10");
    assert_eq!(sim.positions(), target);

    assert_eq!(backend.read_positions().unwrap(), target);
    assert_eq!(backend.current_positions(), target);
    assert!(rec.wait_for(1, |k| matches!(
        k,
        EventKind::PositionsUpdated { positions } if positions.as_slice() == target
    )));
}

#[test]
fn out_of_range_axis_fails() {
    let (backend, _sim, _rec) = sim_backend();
    let err = backend.move_to(&[90.0; 7]).unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "{err:?}");
}

#[test]
fn motion_params_reach_controller() {
    let (backend, sim, _rec) = sim_backend();
    let params = MotionParams {
        speed: 45.0,
        cpg_enabled: true,
        cpg_alpha: 0.4,
        ..MotionParams::default()
    };

    backend.set_motion_params(params.clone()).unwrap();

    assert_eq!(backend.motion_params(), params);
    assert_eq!(sim.motion_setting("speed").as_deref(), Some("45"));
    assert_eq!(sim.motion_setting("cpg").as_deref(), Some("on"));
    assert_eq!(sim.motion_setting("cpgalpha").as_deref(), Some("0.4"));
    assert_eq!(sim.motion_setting("interp").as_deref(), Some("quintic"));
}

#[test]
fn realtime_polling_publishes_positions() {
    let (backend, _sim, rec) = sim_backend();

    backend.set_realtime(true);
    assert!(backend.is_realtime());
    assert!(rec.wait_for(2, |k| matches!(k, EventKind::PositionsUpdated { .. })));
    backend.set_realtime(false);

    assert!(!backend.is_realtime());
    std::thread::sleep(Duration::from_millis(60));
    let seen = rec.count(|k| matches!(k, EventKind::PositionsUpdated { .. }));
    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(
        rec.count(|k| matches!(k, EventKind::PositionsUpdated { .. })),
        seen
    );
}
