//! Armlink: command-line front end.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Adapters (outer ring)                     │
//! │                                                              │
//! │  SerialTransport   SimulatedArm   JsonFileStore  LogEventSink│
//! │  (Transport)       (Transport)    (ConfigPort)   (bus → log) │
//! │                                                              │
//! │  ─────────────────── Port Trait Boundary ─────────────────   │
//! │                                                              │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │                   Backend (core)                       │  │
//! │  │  Channel · Health · Device · Automation · EventBus     │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Usage:
//!
//! ```text
//! armlink ports
//! armlink status <port> [baud]
//! armlink run <port> <task.json> [baud]
//! armlink sim [seconds]
//! ```
//!
//! `RUST_LOG` controls verbosity (default `info`); `ARMLINK_CONFIG` points at
//! the persisted configuration (default `backend_config.json`).

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use log::info;

use armlink::Backend;
use armlink::adapters::log_sink::LogEventSink;
use armlink::adapters::serial::{SerialTransport, list_ports};
use armlink::adapters::sim::SimulatedArm;
use armlink::adapters::store::{DEFAULT_CONFIG_FILE, JsonFileStore};
use armlink::app::program::StepDef;
use armlink::config::BackendConfig;
use armlink::diagnostics;

const DEFAULT_BAUD: u32 = 115_200;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    diagnostics::install_panic_handler();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let arg = |i: usize| args.get(i).map(String::as_str);

    match arg(0) {
        Some("ports") => cmd_ports(),
        Some("status") => {
            let port = arg(1).context("usage: armlink status <port> [baud]")?;
            cmd_status(port, parse_baud(arg(2))?)
        }
        Some("run") => {
            let port = arg(1).context("usage: armlink run <port> <task.json> [baud]")?;
            let task = arg(2).context("usage: armlink run <port> <task.json> [baud]")?;
            cmd_run(port, Path::new(task), parse_baud(arg(3))?)
        }
        Some("sim") => {
            let secs = match arg(1) {
                Some(s) => s.parse().with_context(|| format!("invalid duration {s:?}"))?,
                None => 3.0,
            };
            cmd_sim(secs)
        }
        Some(other) => bail!("unknown command {other:?} (expected ports, status, run or sim)"),
        None => bail!("usage: armlink <ports|status|run|sim> ..."),
    }
}

fn parse_baud(arg: Option<&str>) -> Result<u32> {
    match arg {
        Some(s) => s.parse().with_context(|| format!("invalid baud rate {s:?}")),
        None => Ok(DEFAULT_BAUD),
    }
}

fn serial_backend() -> Result<Backend> {
    let path = std::env::var("ARMLINK_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.into());
    let store = JsonFileStore::new(path);
    let backend = Backend::open(
        BackendConfig::default(),
        Box::new(SerialTransport::new()),
        Box::new(store),
    )?;
    LogEventSink::new().attach(backend.bus());
    Ok(backend)
}

fn cmd_ports() -> Result<()> {
    let ports = list_ports()?;
    if ports.is_empty() {
        println!("no serial ports found");
    }
    for p in ports {
        match p.description {
            Some(d) => println!("{}\t{}\t{d}", p.name, p.kind),
            None => println!("{}\t{}", p.name, p.kind),
        }
    }
    Ok(())
}

fn cmd_status(port: &str, baud: u32) -> Result<()> {
    let backend = serial_backend()?;
    backend.connect(port, baud)?;
    backend.get_status()?;
    if let Err(e) = backend.read_positions() {
        info!("positions unavailable: {e}");
    }
    let status = backend.system_status();
    println!("{}", serde_json::to_string_pretty(&status)?);
    backend.shutdown();
    Ok(())
}

fn cmd_run(port: &str, task_file: &Path, baud: u32) -> Result<()> {
    let backend = serial_backend()?;
    backend.connect(port, baud)?;
    let name = backend.load_task(task_file)?;
    backend.start(&name)?;
    while backend.is_running(&name) {
        thread::sleep(Duration::from_millis(100));
    }
    println!("{}", backend.system_status().summary());
    backend.shutdown();
    Ok(())
}

fn cmd_sim(secs: f64) -> Result<()> {
    let arm = SimulatedArm::new();
    let sim = arm.handle();
    let backend = Backend::new(BackendConfig::simulated(), Box::new(arm))?;
    LogEventSink::new().attach(backend.bus());

    backend.connect("sim", DEFAULT_BAUD)?;
    sim.set_analog("A0", 512);
    backend.read_analog("A0")?;
    sim.set_analog("A0", 612);
    backend.read_analog("A0")?;

    backend.create_sequence(
        "blink",
        vec![StepDef::digital_write(13, 1), StepDef::digital_write(13, 0)],
        true,
        0.25,
    )?;
    backend.create_task("wave", "sweep axis 1")?;
    for angle in [45.0, 135.0, 90.0] {
        let mut positions = vec![90.0; armlink::adapters::sim::AXES];
        positions[0] = angle;
        backend.add_waypoint(
            "wave",
            armlink::app::program::Waypoint::new(positions).with_delay_ms(0),
        )?;
    }

    backend.set_realtime(true);
    backend.start("blink")?;
    backend.start("wave")?;

    let deadline = Instant::now() + Duration::from_secs_f64(secs.max(0.0));
    while Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
    }
    backend.stop("blink")?;
    backend.get_status()?;
    println!("{}", backend.system_status().summary());
    backend.shutdown();
    Ok(())
}
