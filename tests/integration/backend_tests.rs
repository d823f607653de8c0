//! Connection lifecycle, health bookkeeping and link-loss handling.

use armlink::adapters::sim::SimulatedArm;
use armlink::error::{Error, TransportError};
use armlink::events::{EventKind, PinKind, Topic};
use armlink::{Backend, ConnectionState};

use crate::mock_transport::{MockTransport, Recorder, fast_config};

fn mock_backend() -> (Backend, crate::mock_transport::MockHandle, Recorder) {
    let (transport, mock) = MockTransport::agreeable();
    let backend = Backend::new(fast_config(), Box::new(transport)).unwrap();
    let rec = Recorder::attach(&backend);
    (backend, mock, rec)
}

#[test]
fn probe_reply_connects_and_announces() {
    let (backend, _mock, rec) = mock_backend();
    assert_eq!(backend.state(), ConnectionState::Disconnected);

    backend.connect("/dev/ttyMOCK", 115_200).unwrap();

    assert_eq!(backend.state(), ConnectionState::Connected);
    assert!(backend.is_connected());
    assert!(rec.wait_for(1, |k| matches!(
        k,
        EventKind::ConnectionEstablished { port, baud_rate: 115_200 } if port == "/dev/ttyMOCK"
    )));
    let status = backend.system_status();
    assert_eq!(status.endpoint.as_deref(), Some("/dev/ttyMOCK"));
    assert!(status.connected_at.is_some());
}

#[test]
fn wrong_probe_reply_fails_connect() {
    let (transport, _mock) = MockTransport::new(|_| Some("HELLO".to_owned()));
    let backend = Backend::new(fast_config(), Box::new(transport)).unwrap();
    let rec = Recorder::attach(&backend);

    let err = backend.connect("/dev/ttyMOCK", 9600).unwrap_err();

    assert!(matches!(err, Error::Connection(_)), "{err:?}");
    assert_eq!(backend.state(), ConnectionState::Error);
    assert!(!backend.is_connected());
    assert!(rec.wait_for(1, |k| matches!(k, EventKind::HardwareError { .. })));
    assert_eq!(backend.system_status().error_count, 1);
}

#[test]
fn write_then_timeout_lowers_health() {
    let (backend, mock, rec) = mock_backend();
    backend.connect("/dev/ttyMOCK", 115_200).unwrap();

    backend.write_digital(13, 1).unwrap();
    assert!(rec.wait_for(1, |k| matches!(
        k,
        EventKind::PinStateChanged { pin: 13, state: 1, kind: PinKind::Digital }
    )));

    let before = backend.system_status();
    mock.set_silent(true);
    let err = backend.write_digital(13, 1).unwrap_err();
    let after = backend.system_status();

    assert!(
        matches!(&err, Error::Command(c) if c.cause == TransportError::Timeout),
        "{err:?}"
    );
    assert_eq!(after.error_count, before.error_count + 1);
    assert_eq!(after.failed_commands, before.failed_commands + 1);
    assert!(after.health_score < before.health_score);
    // A timeout is not link loss.
    assert_eq!(backend.state(), ConnectionState::Connected);
}

#[test]
fn commands_require_a_connection() {
    let (backend, mock, _rec) = mock_backend();

    assert_eq!(backend.write_digital(13, 1), Err(Error::NotConnected));
    assert_eq!(backend.read_digital(13), Err(Error::NotConnected));
    assert_eq!(backend.read_analog("A0"), Err(Error::NotConnected));
    assert!(mock.sent().is_empty());
    assert_eq!(backend.system_status().total_commands, 0);
}

#[test]
fn disconnect_announces_loss_once() {
    let (backend, _mock, rec) = mock_backend();
    backend.connect("/dev/ttyMOCK", 115_200).unwrap();

    backend.disconnect();
    backend.disconnect();

    assert_eq!(backend.state(), ConnectionState::Disconnected);
    assert!(rec.wait_for(1, |k| *k == EventKind::ConnectionLost));
    std::thread::sleep(std::time::Duration::from_millis(50));
    assert_eq!(rec.count(|k| *k == EventKind::ConnectionLost), 1);
}

#[test]
fn reconnect_reopens_last_endpoint() {
    let (backend, _mock, rec) = mock_backend();
    assert_eq!(backend.reconnect(), Err(Error::NotConnected));

    backend.connect("/dev/ttyMOCK", 57_600).unwrap();
    backend.reconnect().unwrap();

    assert_eq!(backend.state(), ConnectionState::Connected);
    assert!(rec.wait_for(2, |k| matches!(
        k,
        EventKind::ConnectionEstablished { baud_rate: 57_600, .. }
    )));
}

#[test]
fn pulled_cable_escalates_to_error() {
    let arm = SimulatedArm::new();
    let sim = arm.handle();
    let backend = Backend::new(fast_config(), Box::new(arm)).unwrap();
    let rec = Recorder::attach(&backend);
    backend.connect("sim", 115_200).unwrap();
    sim.set_analog("A0", 300);
    backend.read_analog("A0").unwrap();

    sim.set_link(false);
    let err = backend.write_digital(13, 1).unwrap_err();

    assert!(
        matches!(&err, Error::Command(c) if c.cause.is_link_lost()),
        "{err:?}"
    );
    assert_eq!(backend.state(), ConnectionState::Error);
    assert!(!backend.is_connected());
    assert!(rec.wait_for(1, |k| *k == EventKind::ConnectionLost));
    assert!(rec.wait_for(1, |k| matches!(k, EventKind::HardwareError { .. })));
    // Session caches are gone by the time the failing call returns.
    assert!(backend.system_status().analog_values.is_empty());
    assert_eq!(backend.write_digital(13, 1), Err(Error::NotConnected));
}

#[test]
fn connect_to_absent_device_fails() {
    let arm = SimulatedArm::new();
    let sim = arm.handle();
    sim.set_link(false);
    let backend = Backend::new(fast_config(), Box::new(arm)).unwrap();

    let err = backend.connect("sim", 115_200).unwrap_err();

    assert!(matches!(err, Error::Connection(_)), "{err:?}");
    assert_eq!(backend.state(), ConnectionState::Error);
    let status = backend.system_status();
    assert_eq!(status.recent_errors.len(), 1);
    assert_eq!(status.recent_errors[0].context, "connect");
}

#[test]
fn subscriber_count_tracks_client_handlers() {
    let (transport, _mock) = MockTransport::agreeable();
    let backend = Backend::new(fast_config(), Box::new(transport)).unwrap();
    assert_eq!(backend.system_status().subscriber_count, 0);

    let id = backend.subscribe(Topic::PinStateChanged, |_| Ok(()));
    assert_eq!(backend.system_status().subscriber_count, 1);
    assert!(backend.unsubscribe(Topic::PinStateChanged, id));
    assert_eq!(backend.system_status().subscriber_count, 0);
}

#[test]
fn shutdown_stops_dispatch() {
    let (backend, _mock, _rec) = mock_backend();
    backend.connect("/dev/ttyMOCK", 115_200).unwrap();
    assert!(backend.bus().is_running());

    backend.shutdown();

    assert!(!backend.bus().is_running());
    assert_eq!(backend.state(), ConnectionState::Disconnected);
}
