//! CLI entry point: loads the keyed-section configuration, wires a
//! simulated AnalogIO capability into a LockEngine, and runs the control
//! loop on a dedicated thread alongside per-slave sweep tasks and a
//! telemetry-drain task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use tokio::sync::{mpsc, watch};

use translock::analog_sim::SimulatedAnalogIo;
use translock::command::EngineCommand;
use translock::config::{LaserConfig, SystemConfig};
use translock::error::EngineError;
use translock::geometry::Geometry;
use translock::lock_engine::{EngagementFlags, LockConfig, LockEngine, LockPoints};
use translock::scan_clock::ScanClock;
use translock::sweep::{run_continuous_sweep, run_discrete_sweep};
use translock::telemetry::TelemetryFrame;
use translock::traits::{ChannelRole, TelemetryWriter};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the keyed-section configuration file.
    #[arg(short, long, default_value = "translock.ini")]
    config: String,

    /// Seed for the simulated analog-I/O trace generator.
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn load_or_init_config(path: &str) -> SystemConfig {
    match SystemConfig::load(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!("could not load {path} ({e}); writing defaults and continuing with them");
            let cfg = SystemConfig::default();
            if let Err(e) = cfg.save(path) {
                warn!("failed to write default configuration to {path}: {e}");
            }
            cfg
        }
    }
}

/// Logs every drained frame instead of forwarding it to a real time-series
/// database; no HDF5/InfluxDB sink ships with this crate.
struct LoggingTelemetryWriter;

impl TelemetryWriter for LoggingTelemetryWriter {
    fn write_batch(&mut self, frames: &[TelemetryFrame]) -> Result<(), EngineError> {
        for frame in frames {
            info!(
                "telemetry {}: error={:.4}MHz t={:.3}ms R={:.4}/{:.4} power={:.3}V",
                frame.channel, frame.error_mhz, frame.time_ms, frame.real_r, frame.lock_r, frame.power_v
            );
        }
        Ok(())
    }
}

fn initial_slave_r_target(geometry: &Geometry, laser: &LaserConfig) -> f64 {
    if let Some(mhz) = laser.lockpoint_mhz {
        geometry.set_point(mhz).1
    } else {
        laser.lockpoint_r.unwrap_or(0.5)
    }
}

fn laser_configs(system: &SystemConfig) -> Vec<&LaserConfig> {
    let mut lasers = vec![&system.laser1];
    if let Some(l2) = &system.laser2 {
        lasers.push(l2);
    }
    lasers
}

fn apply_channel_mapping(config: &mut SystemConfig, role: ChannelRole, channel_name: &str) {
    match role {
        ChannelRole::Master => config.cavity.input_channel = channel_name.to_string(),
        ChannelRole::Slave(0) => config.laser1.input_channel = channel_name.to_string(),
        ChannelRole::Slave(1) => {
            if let Some(l2) = config.laser2.as_mut() {
                l2.input_channel = channel_name.to_string();
            } else {
                warn!("SetChannelMapping for slave 1 but no LASER2 section is configured");
            }
        }
        ChannelRole::Slave(k) => warn!("no configuration slot for slave {k}; channel mapping ignored"),
    }
}

type SweepHandle = (watch::Sender<bool>, tokio::task::JoinHandle<()>);

#[allow(clippy::too_many_arguments)]
fn handle_command(
    cmd: EngineCommand,
    engine: &mut LockEngine<SimulatedAnalogIo>,
    sweeps: &mut HashMap<usize, SweepHandle>,
    runtime: &tokio::runtime::Handle,
    slave_lock_flags: &[watch::Receiver<bool>],
    cmd_tx: &mpsc::Sender<EngineCommand>,
    config: &mut SystemConfig,
) {
    match cmd {
        EngineCommand::StartScan | EngineCommand::StopScan => {
            // The control loop scans unconditionally; these exist only to
            // complete the operator boundary of SPEC_FULL.md §6.
        }
        EngineCommand::StartDiscreteSweep { slave, params } => {
            if sweeps.contains_key(&slave) {
                warn!("slave {slave}: sweep already running, ignoring StartDiscreteSweep");
                return;
            }
            let (stop_tx, stop_rx) = watch::channel(false);
            let lock_flag = slave_lock_flags[slave].clone();
            let commands = cmd_tx.clone();
            let handle = runtime.spawn(async move {
                match run_discrete_sweep(slave, params, commands, lock_flag, stop_rx).await {
                    Ok(outcome) => info!("slave {slave}: discrete sweep finished: {outcome:?}"),
                    Err(e) => error!("slave {slave}: discrete sweep error: {e}"),
                }
            });
            sweeps.insert(slave, (stop_tx, handle));
        }
        EngineCommand::StartContinuousSweep { slave, params } => {
            if sweeps.contains_key(&slave) {
                warn!("slave {slave}: sweep already running, ignoring StartContinuousSweep");
                return;
            }
            let (stop_tx, stop_rx) = watch::channel(false);
            let lock_flag = slave_lock_flags[slave].clone();
            let commands = cmd_tx.clone();
            let handle = runtime.spawn(async move {
                match run_continuous_sweep(slave, params, commands, lock_flag, stop_rx).await {
                    Ok(outcome) => info!("slave {slave}: continuous sweep finished: {outcome:?}"),
                    Err(e) => error!("slave {slave}: continuous sweep error: {e}"),
                }
            });
            sweeps.insert(slave, (stop_tx, handle));
        }
        EngineCommand::StopSweep { slave } => {
            if let Some((stop_tx, _)) = sweeps.get(&slave) {
                let _ = stop_tx.send(true);
            }
        }
        EngineCommand::SetChannelMapping { role, channel_name } => {
            apply_channel_mapping(config, role, &channel_name);
        }
        EngineCommand::SaveConfiguration { path } => {
            if let Err(e) = config.save(&path) {
                error!("failed to save configuration to {path}: {e}");
            } else {
                info!("configuration saved to {path}");
            }
        }
        other => {
            if let Err(e) = engine.apply_command(&other) {
                warn!("command rejected: {e}");
            }
        }
    }

    sweeps.retain(|slave, (_, handle)| {
        if handle.is_finished() {
            info!("slave {slave}: sweep task slot freed");
            false
        } else {
            true
        }
    });
}

#[allow(clippy::too_many_arguments)]
fn run_control_loop(
    mut engine: LockEngine<SimulatedAnalogIo>,
    mut cmd_rx: mpsc::Receiver<EngineCommand>,
    cmd_tx: mpsc::Sender<EngineCommand>,
    running: Arc<AtomicBool>,
    scan_period: Duration,
    telemetry_tx: mpsc::UnboundedSender<Vec<TelemetryFrame>>,
    runtime: tokio::runtime::Handle,
    slave_lock_flags: Vec<watch::Receiver<bool>>,
    mut config: SystemConfig,
) {
    let mut sweeps: HashMap<usize, SweepHandle> = HashMap::new();
    let telemetry_drain_period = Duration::from_secs(10);
    let mut last_telemetry_drain = Instant::now();

    info!("control loop starting, scan period {scan_period:?}");

    while running.load(Ordering::SeqCst) {
        let iter_start = Instant::now();

        while let Ok(cmd) = cmd_rx.try_recv() {
            handle_command(
                cmd,
                &mut engine,
                &mut sweeps,
                &runtime,
                &slave_lock_flags,
                &cmd_tx,
                &mut config,
            );
        }

        if let Err(e) = engine.run_iteration() {
            error!("fatal control-loop error: {e}");
            break;
        }

        if last_telemetry_drain.elapsed() >= telemetry_drain_period {
            let frames = engine.telemetry_sink_mut().drain();
            if !frames.is_empty() {
                let _ = telemetry_tx.send(frames);
            }
            last_telemetry_drain = Instant::now();
        }

        let elapsed = iter_start.elapsed();
        if elapsed < scan_period {
            thread::sleep(scan_period - elapsed);
        }
    }

    for (slave, (stop_tx, handle)) in sweeps.into_iter() {
        let _ = stop_tx.send(true);
        runtime.block_on(async {
            if handle.await.is_err() {
                warn!("slave {slave}: sweep task panicked during shutdown");
            }
        });
    }
    info!("control loop exiting");
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_millis()
        .init();

    let args = Args::parse();
    info!("translock v{} starting", env!("CARGO_PKG_VERSION"));

    let system = load_or_init_config(&args.config);
    let lasers = laser_configs(&system);
    let n_slaves = lasers.len();

    let scan_clock = ScanClock::new(system.scan_config());
    let master_config = system.master_lock_config();
    let slave_configs: Vec<LockConfig> = lasers.iter().map(|l| system.slave_lock_config(l)).collect();
    let geometries: Vec<Geometry> = lasers.iter().map(|l| system.slave_geometry(l)).collect();
    let bounds: Vec<(f64, f64)> = lasers.iter().map(|l| (l.min_voltage, l.max_voltage)).collect();

    let lock_points = Arc::new(RwLock::new(LockPoints {
        master_ms: system.cavity.lockpoint_ms,
        slave_r_target: geometries
            .iter()
            .zip(lasers.iter())
            .map(|(geo, laser)| initial_slave_r_target(geo, laser))
            .collect(),
    }));
    let engagement = Arc::new(RwLock::new(EngagementFlags {
        master: false,
        slaves: vec![false; n_slaves],
        slave_sweeping: vec![false; n_slaves],
    }));

    warn!("no AnalogIO driver is configured for this build; driving a simulated cavity/laser trace");
    let analog = SimulatedAnalogIo::new(args.seed, &system.scan_config(), n_slaves);

    let mut engine = LockEngine::new(
        analog,
        scan_clock,
        master_config,
        slave_configs,
        geometries,
        bounds,
        lock_points,
        engagement,
        256,
    );

    let slave_lock_flags: Vec<_> = (0..n_slaves).map(|k| engine.slave_lock_flag(k)).collect();

    let (cmd_tx, cmd_rx) = mpsc::channel::<EngineCommand>(256);
    let running = Arc::new(AtomicBool::new(true));

    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            info!("Ctrl+C received, shutting down...");
            running.store(false, Ordering::SeqCst);
        })
        .context("failed to install Ctrl+C handler")?;
    }

    // Bring the engine up: engage master and every configured slave, the
    // way an operator would over the same command channel.
    cmd_tx.send(EngineCommand::EngageMaster).await.ok();
    for k in 0..n_slaves {
        cmd_tx.send(EngineCommand::EngageSlave(k)).await.ok();
    }

    let (telemetry_tx, mut telemetry_rx) = mpsc::unbounded_channel::<Vec<TelemetryFrame>>();
    let telemetry_task = tokio::spawn(async move {
        let mut writer = LoggingTelemetryWriter;
        while let Some(batch) = telemetry_rx.recv().await {
            if let Err(e) = writer.write_batch(&batch) {
                error!("telemetry write failed: {e}");
            }
        }
    });

    let runtime_handle = tokio::runtime::Handle::current();
    let scan_period = Duration::from_secs_f64(system.cavity.scan_time_ms / 1000.0);

    let control_handle = thread::spawn(move || {
        run_control_loop(
            engine,
            cmd_rx,
            cmd_tx,
            running,
            scan_period,
            telemetry_tx,
            runtime_handle,
            slave_lock_flags,
            system,
        )
    });

    control_handle.join().expect("control loop thread panicked");
    drop(telemetry_task.await);
    Ok(())
}
