//! Orchestrates one scan iteration: drive, acquire, detect, update errors,
//! compute feedback, apply. Owns the lock-quality state machines for the
//! master and every configured slave.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use log::{debug, info, warn};
use tokio::sync::watch;

use crate::command::{EngineCommand, GainTarget};
use crate::error::EngineError;
use crate::geometry::Geometry;
use crate::peak_finder::{find_peaks, Peak};
use crate::pi_controller::PiController;
use crate::scan_clock::ScanClock;
use crate::telemetry::{TelemetryFrame, TelemetrySink};
use crate::traits::{AnalogIo, ChannelRole};

/// Bounded ring of the last H=100 error samples (MHz) per channel.
const ERROR_HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LockConfig {
    pub kp: f64,
    pub ki: f64,
    pub rms_threshold_mhz: f64,
    pub rms_window: usize,
    pub peak_criterion: f64,
    pub wrong_peak_fraction: f64,
    pub lock_count_threshold: u32,
}

/// Master set point (ms, within the scan window) and per-slave set points
/// encoded as `R_target`. Owned by LockEngine; SweepEngine reads/writes only
/// this.
#[derive(Debug, Clone)]
pub struct LockPoints {
    pub master_ms: f64,
    pub slave_r_target: Vec<f64>,
}

pub type SharedLockPoints = Arc<RwLock<LockPoints>>;

#[derive(Debug, Clone, Default)]
pub struct EngagementFlags {
    pub master: bool,
    pub slaves: Vec<bool>,
    /// Set while a sweep owns a slave's set point; manual writes to that
    /// slave's set point are rejected while true (SPEC_FULL.md §9
    /// resolution 1).
    pub slave_sweeping: Vec<bool>,
}

pub type SharedEngagement = Arc<RwLock<EngagementFlags>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterLockState {
    Disengaged,
    EngagedMissingPeaks,
    EngagedTracking,
    EngagedLocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveLockState {
    Disengaged,
    EngagedNotLocked,
    EngagedLocked,
}

/// Bounded ring of MHz error samples with a running RMS over the last
/// `min(window, len)` samples.
#[derive(Debug, Clone)]
struct ErrorHistory {
    ring: VecDeque<f64>,
    window: usize,
}

impl ErrorHistory {
    fn new(window: usize) -> Self {
        Self {
            ring: VecDeque::with_capacity(ERROR_HISTORY_CAPACITY),
            window,
        }
    }

    fn push(&mut self, value: f64) {
        if self.ring.len() >= ERROR_HISTORY_CAPACITY {
            self.ring.pop_front();
        }
        self.ring.push_back(value);
    }

    fn rms(&self) -> f64 {
        let n = self.window.min(self.ring.len());
        if n == 0 {
            return f64::INFINITY;
        }
        let sum_sq: f64 = self.ring.iter().rev().take(n).map(|v| v * v).sum();
        (sum_sq / n as f64).sqrt()
    }

    fn clear(&mut self) {
        self.ring.clear();
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct MasterState {
    t1: f64,
    t2: f64,
    interval_ms: f64,
    error_ms: f64,
    error_prev_ms: f64,
}

#[derive(Debug, Clone, Copy)]
struct SlaveState {
    r: f64,
    error_prev: f64,
    peak_time: f64,
    sector: i64,
    lock_count: u32,
    reject_count: u8,
}

impl Default for SlaveState {
    fn default() -> Self {
        Self {
            r: 0.5,
            error_prev: 0.0,
            peak_time: 0.0,
            sector: 0,
            lock_count: 0,
            reject_count: 0,
        }
    }
}

struct SlaveChannel {
    config: LockConfig,
    geometry: Geometry,
    state: SlaveState,
    history: ErrorHistory,
    pi: PiController,
    dc_voltage: f64,
    lock_flag_tx: watch::Sender<bool>,
}

pub struct LockEngine<A: AnalogIo> {
    analog: A,
    scan_clock: ScanClock,
    master_config: LockConfig,
    master_state: MasterState,
    master_history: ErrorHistory,
    master_pi: PiController,
    master_lock_state: MasterLockState,
    master_lock_flag_tx: watch::Sender<bool>,
    slaves: Vec<SlaveChannel>,
    lock_points: SharedLockPoints,
    engagement: SharedEngagement,
    telemetry: TelemetrySink,
}

impl<A: AnalogIo> LockEngine<A> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        analog: A,
        scan_clock: ScanClock,
        master_config: LockConfig,
        slave_configs: Vec<LockConfig>,
        geometries: Vec<Geometry>,
        slave_dc_bounds: Vec<(f64, f64)>,
        lock_points: SharedLockPoints,
        engagement: SharedEngagement,
        telemetry_capacity: usize,
    ) -> Self {
        assert_eq!(slave_configs.len(), geometries.len());
        assert_eq!(slave_configs.len(), slave_dc_bounds.len());

        let (master_lock_flag_tx, _) = watch::channel(false);
        let slaves = slave_configs
            .into_iter()
            .zip(geometries)
            .zip(slave_dc_bounds)
            .map(|((config, geometry), (min_v, max_v))| {
                let (tx, _) = watch::channel(false);
                SlaveChannel {
                    config,
                    geometry,
                    state: SlaveState::default(),
                    history: ErrorHistory::new(config.rms_window),
                    pi: PiController::new(config.kp, config.ki, min_v, max_v),
                    dc_voltage: 0.0,
                    lock_flag_tx: tx,
                }
            })
            .collect();

        Self {
            analog,
            scan_clock,
            master_history: ErrorHistory::new(master_config.rms_window),
            master_pi: PiController::new(master_config.kp, master_config.ki, f64::MIN, f64::MAX),
            master_config,
            master_state: MasterState::default(),
            master_lock_state: MasterLockState::Disengaged,
            master_lock_flag_tx,
            slaves,
            lock_points,
            engagement,
            telemetry: TelemetrySink::new(telemetry_capacity),
        }
    }

    pub fn master_lock_state(&self) -> MasterLockState {
        self.master_lock_state
    }

    pub fn slave_lock_flag(&self, k: usize) -> watch::Receiver<bool> {
        self.slaves[k].lock_flag_tx.subscribe()
    }

    pub fn master_lock_flag(&self) -> watch::Receiver<bool> {
        self.master_lock_flag_tx.subscribe()
    }

    pub fn telemetry_sink_mut(&mut self) -> &mut TelemetrySink {
        &mut self.telemetry
    }

    pub fn engage_master(&mut self) {
        let mut eng = self.engagement.write().unwrap();
        eng.master = true;
        info!("master lock engaged");
    }

    /// Disengaging master forcibly disengages all slaves, zeroes all error
    /// rings and controllers, and clears RMS.
    pub fn disengage_master(&mut self) {
        let mut eng = self.engagement.write().unwrap();
        eng.master = false;
        for flag in eng.slaves.iter_mut() {
            *flag = false;
        }
        drop(eng);

        self.master_history.clear();
        self.master_pi.reset();
        self.master_lock_state = MasterLockState::Disengaged;
        let _ = self.master_lock_flag_tx.send(false);

        for slave in self.slaves.iter_mut() {
            slave.history.clear();
            slave.pi.reset();
            slave.state = SlaveState::default();
            let _ = slave.lock_flag_tx.send(false);
        }
        info!("master lock disengaged; all slaves forced disengaged");
    }

    pub fn engage_slave(&mut self, k: usize) -> Result<(), EngineError> {
        let mut eng = self.engagement.write().unwrap();
        if !eng.master {
            return Err(EngineError::configuration(
                "cannot engage slave lock while master is disengaged",
            ));
        }
        eng.slaves[k] = true;
        Ok(())
    }

    pub fn disengage_slave(&mut self, k: usize) {
        let mut eng = self.engagement.write().unwrap();
        eng.slaves[k] = false;
        drop(eng);
        self.slaves[k].history.clear();
        self.slaves[k].pi.reset();
        self.slaves[k].state = SlaveState::default();
        let _ = self.slaves[k].lock_flag_tx.send(false);
    }

    /// Rejected with `ConfigurationError` while a sweep owns this slave's
    /// set point.
    pub fn set_slave_setpoint_mhz(&mut self, k: usize, detuning_mhz: f64) -> Result<(), EngineError> {
        let eng = self.engagement.read().unwrap();
        if eng.slave_sweeping.get(k).copied().unwrap_or(false) {
            return Err(EngineError::configuration(
                "slave set point is owned by an active sweep",
            ));
        }
        drop(eng);
        let (sector, r_target) = self.slaves[k].geometry.set_point(detuning_mhz);
        self.slaves[k].state.sector = sector;
        let mut points = self.lock_points.write().unwrap();
        points.slave_r_target[k] = r_target;
        Ok(())
    }

    pub fn set_master_lockpoint_ms(&mut self, lockpoint_ms: f64) {
        self.lock_points.write().unwrap().master_ms = lockpoint_ms;
    }

    pub fn set_master_gains(&mut self, kp: f64, ki: f64) {
        self.master_config.kp = kp;
        self.master_config.ki = ki;
        self.master_pi.set_gains(kp, ki);
    }

    pub fn set_slave_gains(&mut self, k: usize, kp: f64, ki: f64) {
        self.slaves[k].config.kp = kp;
        self.slaves[k].config.ki = ki;
        self.slaves[k].pi.set_gains(kp, ki);
    }

    /// Sets FSR for every slave's geometry; master frequency stays fixed.
    pub fn set_fsr_ghz(&mut self, fsr_ghz: f64) {
        for slave in self.slaves.iter_mut() {
            slave.geometry.fsr_ghz = fsr_ghz;
        }
    }

    /// Manual DC write, rejected while a sweep owns this slave.
    pub fn set_slave_voltage_manual(&mut self, k: usize, volts: f64) -> Result<(), EngineError> {
        let eng = self.engagement.read().unwrap();
        if eng.slave_sweeping.get(k).copied().unwrap_or(false) {
            return Err(EngineError::configuration(
                "slave output is owned by an active sweep",
            ));
        }
        drop(eng);
        self.analog.write_dc(&[ChannelRole::Slave(k)], &[volts])?;
        self.slaves[k].dc_voltage = volts;
        Ok(())
    }

    /// Marks/clears sweep ownership of a slave's set point and output.
    pub fn set_slave_sweeping(&mut self, k: usize, sweeping: bool) {
        self.engagement.write().unwrap().slave_sweeping[k] = sweeping;
    }

    /// Clears the lock-quality counter without touching the PI controller or
    /// engagement, used by SweepEngine between discrete-sweep targets.
    pub fn reset_slave_lock_counter(&mut self, k: usize) {
        self.slaves[k].state.lock_count = 0;
        let _ = self.slaves[k].lock_flag_tx.send(false);
    }

    /// Applies every engine-scoped command. `StartScan`/`StopScan`,
    /// `StartDiscreteSweep`/`StartContinuousSweep`/`StopSweep`,
    /// `SetChannelMapping`, and `SaveConfiguration` are handled by the
    /// runtime loop instead, since they act on resources LockEngine does
    /// not own (task handles, SystemConfig, the AnalogIO channel table).
    pub fn apply_command(&mut self, cmd: &EngineCommand) -> Result<(), EngineError> {
        match cmd {
            EngineCommand::EngageMaster => self.engage_master(),
            EngineCommand::DisengageMaster => self.disengage_master(),
            EngineCommand::EngageSlave(k) => self.engage_slave(*k)?,
            EngineCommand::DisengageSlave(k) => self.disengage_slave(*k),
            EngineCommand::SetScanOffset(v) => {
                let mut cfg = *self.scan_clock.config();
                cfg.offset = *v;
                self.scan_clock.reconfigure(cfg);
            }
            EngineCommand::SetScanAmplitude(v) => {
                let mut cfg = *self.scan_clock.config();
                cfg.amplitude = *v;
                self.scan_clock.reconfigure(cfg);
            }
            EngineCommand::SetScanTime(v) => {
                let mut cfg = *self.scan_clock.config();
                cfg.scan_time_ms = *v;
                self.scan_clock.reconfigure(cfg);
            }
            EngineCommand::SetScanSamples(n) => {
                let mut cfg = *self.scan_clock.config();
                cfg.samples = *n;
                self.scan_clock.reconfigure(cfg);
            }
            EngineCommand::SetFsrGhz(fsr) => self.set_fsr_ghz(*fsr),
            EngineCommand::SetMasterLockpointMs(ms) => self.set_master_lockpoint_ms(*ms),
            EngineCommand::SetSlaveSetpointMhz { slave, detuning_mhz } => {
                self.set_slave_setpoint_mhz(*slave, *detuning_mhz)?
            }
            EngineCommand::SetGains { target, kp, ki } => match target {
                GainTarget::Master => self.set_master_gains(*kp, *ki),
                GainTarget::Slave(k) => self.set_slave_gains(*k, *kp, *ki),
            },
            EngineCommand::SetSlaveVoltageManual { slave, volts } => {
                self.set_slave_voltage_manual(*slave, *volts)?
            }
            EngineCommand::ResetSlaveLockCounter(k) => self.reset_slave_lock_counter(*k),
            EngineCommand::SetSlaveSweeping { slave, sweeping } => {
                self.set_slave_sweeping(*slave, *sweeping)
            }
            EngineCommand::StartScan
            | EngineCommand::StopScan
            | EngineCommand::StartDiscreteSweep { .. }
            | EngineCommand::StartContinuousSweep { .. }
            | EngineCommand::StopSweep { .. }
            | EngineCommand::SetChannelMapping { .. }
            | EngineCommand::SaveConfiguration { .. } => {
                return Err(EngineError::configuration(
                    "command is handled by the runtime loop, not LockEngine",
                ));
            }
        }
        Ok(())
    }

    fn channel_list(&self) -> Vec<ChannelRole> {
        let mut channels = vec![ChannelRole::Master];
        for k in 0..self.slaves.len() {
            channels.push(ChannelRole::Slave(k));
        }
        channels
    }

    /// Runs one full scan iteration per §4.F. Returns `Err` only for a
    /// fatal timing failure; all other failure modes are absorbed and
    /// surfaced as state/telemetry.
    pub fn run_iteration(&mut self) -> Result<(), EngineError> {
        let channels = self.channel_list();
        let samples = self.scan_clock.config().samples;
        let dx_ms = self.scan_clock.dx_ms();
        let time_grid = self.scan_clock.time_grid_ms().to_vec();

        self.analog
            .write_ramp(ChannelRole::Master, self.scan_clock.ramp())?;
        let traces = match self.analog.read_synchronized(&channels, samples) {
            Ok(t) => t,
            Err(e) => {
                warn!("acquisition failed this iteration: {e}");
                return Ok(());
            }
        };

        let master_trace = &traces[0];
        let master_peaks = find_peaks(
            master_trace,
            &time_grid,
            dx_ms,
            self.master_config.peak_criterion,
        );

        if master_peaks.len() != 2 {
            self.master_lock_state = if self.engagement.read().unwrap().master {
                MasterLockState::EngagedMissingPeaks
            } else {
                MasterLockState::Disengaged
            };
            warn!(
                "MissingMasterPeaks: expected 2 peaks, found {}",
                master_peaks.len()
            );
            self.publish_power_and_telemetry(&[])?;
            return Ok(());
        }

        let (t1, t2) = sorted_pair(master_peaks[0].time_ms, master_peaks[1].time_ms);
        let interval = t2 - t1;
        self.master_state.t1 = t1;
        self.master_state.t2 = t2;
        self.master_state.interval_ms = interval;

        let master_engaged = self.engagement.read().unwrap().master;
        let mut frames = Vec::new();

        if master_engaged {
            let lockpoint_ms = self.lock_points.read().unwrap().master_ms;
            let e_m_ms = t1 - lockpoint_ms;
            let fsr_ghz = self
                .slaves
                .first()
                .map(|s| s.geometry.fsr_ghz)
                .unwrap_or(1.0);
            let e_m_mhz = e_m_ms * (fsr_ghz * 1000.0) / interval;

            self.master_state.error_prev_ms = self.master_state.error_ms;
            self.master_state.error_ms = e_m_ms;
            self.master_history.push(e_m_mhz);
            let rms = self.master_history.rms();
            let locked = rms < self.master_config.rms_threshold_mhz;
            self.master_lock_state = if locked {
                MasterLockState::EngagedLocked
            } else {
                MasterLockState::EngagedTracking
            };
            let _ = self.master_lock_flag_tx.send(locked);

            let u = self.master_pi.sample(e_m_ms, interval);
            self.scan_clock.move_offset(u);
            debug!("master: e_mhz={e_m_mhz:.4} rms={rms:.4} locked={locked} u={u:.6}");

            frames.push(TelemetryFrame {
                channel: TelemetryFrame::channel_name(ChannelRole::Master),
                error_mhz: e_m_mhz as f32,
                time_ms: t1 as f32,
                real_frequency_mhz: 0.0,
                lock_frequency_mhz: 0.0,
                real_r: 0.0,
                lock_r: 0.0,
                power_v: 0.0,
                wavemeter_frequency_thz: None,
            });

            for k in 0..self.slaves.len() {
                if let Some(frame) = self.run_slave_iteration(k, t1, t2, interval, &traces[k + 1], &time_grid, dx_ms)? {
                    frames.push(frame);
                }
            }
        } else {
            self.master_lock_state = MasterLockState::Disengaged;
        }

        self.publish_power_and_telemetry(&frames)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn run_slave_iteration(
        &mut self,
        k: usize,
        t1: f64,
        t2: f64,
        interval: f64,
        trace: &[f64],
        time_grid: &[f64],
        dx_ms: f64,
    ) -> Result<Option<TelemetryFrame>, EngineError> {
        let slave_engaged = self.engagement.read().unwrap().slaves[k];
        if !slave_engaged {
            return Ok(None);
        }

        let criterion = self.slaves[k].config.peak_criterion;
        let peaks = find_peaks(trace, time_grid, dx_ms, criterion);
        if peaks.is_empty() {
            warn!("slave {k}: no peaks detected, carrying previous error");
            return Ok(None);
        }

        let r_target = self.lock_points.read().unwrap().slave_r_target[k];
        let chosen = choose_peak(&peaks, t1, t2, r_target);
        let r = Geometry::r_parameter(t1, t2, chosen.time_ms);

        let slave = &mut self.slaves[k];
        let fsr_ghz = slave.geometry.slave_fsr_ghz();
        let new_error = r - r_target;
        let jump_mhz = (new_error - slave.state.error_prev).abs() * fsr_ghz * 1000.0;
        let threshold_mhz = slave.config.wrong_peak_fraction * slave.geometry.fsr_ghz * 1000.0;

        let (accepted_r, accepted_error) = if jump_mhz >= threshold_mhz
            && slave.state.reject_count < 5
        {
            slave.state.reject_count += 1;
            warn!(
                "slave {k}: wrong-peak candidate rejected (reject_count={})",
                slave.state.reject_count
            );
            (slave.state.r, slave.state.error_prev)
        } else {
            slave.state.reject_count = 0;
            (r, new_error)
        };

        slave.state.error_prev = accepted_error;
        slave.state.r = accepted_r;
        slave.state.peak_time = chosen.time_ms;

        let error_mhz = accepted_error * fsr_ghz * 1000.0;
        slave.history.push(error_mhz);
        let rms = slave.history.rms();

        let locked = if rms < slave.config.rms_threshold_mhz {
            slave.state.lock_count += 1;
            slave.state.lock_count > slave.config.lock_count_threshold
        } else {
            slave.state.lock_count = 0;
            false
        };
        let _ = slave.lock_flag_tx.send(locked);

        let u = slave.pi.sample(accepted_error, interval);
        slave.dc_voltage = u;
        self.analog.write_dc(&[ChannelRole::Slave(k)], &[u])?;

        debug!(
            "slave {k}: r={:.6} error_mhz={:.4} rms={:.4} locked={locked} u={u:.6}",
            accepted_r, error_mhz, rms
        );

        Ok(Some(TelemetryFrame {
            channel: TelemetryFrame::channel_name(ChannelRole::Slave(k)),
            error_mhz: error_mhz as f32,
            time_ms: chosen.time_ms as f32,
            real_frequency_mhz: slave.geometry.absolute_offset_mhz(slave.state.sector, accepted_r),
            lock_frequency_mhz: slave.geometry.detuning_mhz(r_target),
            real_r: accepted_r,
            lock_r: r_target,
            power_v: 0.0,
            wavemeter_frequency_thz: None,
        }))
    }

    fn publish_power_and_telemetry(&mut self, frames: &[TelemetryFrame]) -> Result<(), EngineError> {
        let power_channels: Vec<ChannelRole> = (0..self.slaves.len()).map(ChannelRole::Slave).collect();
        let powers = if power_channels.is_empty() {
            Vec::new()
        } else {
            self.analog.read_dc(&power_channels, 10).unwrap_or_default()
        };

        for (i, frame) in frames.iter().cloned().enumerate() {
            let mut frame = frame;
            if i > 0 {
                if let Some(&p) = powers.get(i - 1) {
                    frame.power_v = p as f32;
                }
            }
            self.telemetry.push(frame);
        }
        Ok(())
    }
}

fn sorted_pair(a: f64, b: f64) -> (f64, f64) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Computes R using the first detected peak, then iterates over additional
/// peaks keeping the one that minimizes `|R - R_target|`.
fn choose_peak(peaks: &[Peak], t1: f64, t2: f64, r_target: f64) -> Peak {
    let mut best = peaks[0];
    let mut best_diff = (Geometry::r_parameter(t1, t2, best.time_ms) - r_target).abs();
    for &p in &peaks[1..] {
        let diff = (Geometry::r_parameter(t1, t2, p.time_ms) - r_target).abs();
        if diff < best_diff {
            best = p;
            best_diff = diff;
        }
    }
    best
}
