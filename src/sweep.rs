//! Discrete and continuous slave-frequency sweep state machines, layered
//! over LockEngine via the command channel. Each sweep runs as its own
//! `tokio::task`, observing the slave's lock-quality flag and a shared stop
//! signal; it never touches AnalogIO or LockEngine directly.

use std::time::Duration;

use log::{info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep};

use crate::command::{ContinuousSweepParams, DiscreteSweepParams, EngineCommand};
use crate::error::EngineResult;

const LOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SweepOutcome {
    Completed,
    Stopped { progress_fraction: f64 },
    Aborted { timed_out: bool, progress_fraction: f64 },
}

enum WaitResult {
    Locked,
    Stopped,
    TimedOut,
}

/// Generates `{start, start±step, ..., stop}`, sign matching the sweep
/// direction, always ending exactly on `stop`.
fn discrete_targets(start_mhz: f64, stop_mhz: f64, step_mhz: f64) -> Vec<f64> {
    let step = step_mhz.abs().max(f64::EPSILON);
    let ascending = stop_mhz >= start_mhz;
    let mut targets = Vec::new();
    let mut v = start_mhz;
    loop {
        targets.push(v);
        let reached = if ascending { v >= stop_mhz } else { v <= stop_mhz };
        if reached {
            break;
        }
        let next = if ascending { v + step } else { v - step };
        let overshoot = if ascending { next > stop_mhz } else { next < stop_mhz };
        if overshoot {
            targets.push(stop_mhz);
            break;
        }
        v = next;
    }
    targets
}

fn tau(scan_time_ms: f64) -> Duration {
    Duration::from_secs_f64((2.0 * scan_time_ms / 1000.0).max(0.050))
}

async fn wait_locked_or_stop(
    lock_flag: &mut watch::Receiver<bool>,
    stop: &mut watch::Receiver<bool>,
    limit: Duration,
) -> WaitResult {
    if *lock_flag.borrow() {
        return WaitResult::Locked;
    }
    let deadline = sleep(limit);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => return WaitResult::TimedOut,
            changed = lock_flag.changed() => {
                if changed.is_err() {
                    return WaitResult::TimedOut;
                }
                if *lock_flag.borrow() {
                    return WaitResult::Locked;
                }
            }
            changed = stop.changed() => {
                if changed.is_ok() && *stop.borrow() {
                    return WaitResult::Stopped;
                }
            }
        }
    }
}

/// Runs a discrete sweep to completion, to a stop request, or to an abort
/// (lock timeout). On every exit path the slave is left disengaged and its
/// sweep-ownership flag cleared.
pub async fn run_discrete_sweep(
    slave: usize,
    params: DiscreteSweepParams,
    commands: mpsc::Sender<EngineCommand>,
    mut lock_flag: watch::Receiver<bool>,
    mut stop: watch::Receiver<bool>,
) -> EngineResult<SweepOutcome> {
    let targets = discrete_targets(params.start_mhz, params.stop_mhz, params.step_mhz);
    let total = targets.len();
    let dwell = Duration::from_secs_f64(params.dwell_s.max(0.0));

    let _ = commands
        .send(EngineCommand::SetSlaveSweeping { slave, sweeping: true })
        .await;

    let mut completed = 0usize;
    let outcome = 'sweep: loop {
        for target_mhz in &targets {
            if *stop.borrow() {
                break 'sweep SweepOutcome::Stopped {
                    progress_fraction: completed as f64 / total as f64,
                };
            }

            let _ = commands
                .send(EngineCommand::SetSlaveSetpointMhz { slave, detuning_mhz: *target_mhz })
                .await;
            let _ = commands.send(EngineCommand::ResetSlaveLockCounter(slave)).await;

            match wait_locked_or_stop(&mut lock_flag, &mut stop, LOCK_WAIT_TIMEOUT).await {
                WaitResult::Locked => {}
                WaitResult::Stopped => {
                    break 'sweep SweepOutcome::Stopped {
                        progress_fraction: completed as f64 / total as f64,
                    };
                }
                WaitResult::TimedOut => {
                    warn!("discrete sweep slave {slave}: lock timeout at {target_mhz} MHz");
                    break 'sweep SweepOutcome::Aborted {
                        timed_out: true,
                        progress_fraction: completed as f64 / total as f64,
                    };
                }
            }

            tokio::select! {
                _ = sleep(dwell) => {}
                changed = stop.changed() => {
                    if changed.is_ok() && *stop.borrow() {
                        break 'sweep SweepOutcome::Stopped {
                            progress_fraction: (completed + 1) as f64 / total as f64,
                        };
                    }
                }
            }
            completed += 1;
            info!("discrete sweep slave {slave}: {completed}/{total} targets visited");
        }
        break SweepOutcome::Completed;
    };

    let _ = commands.send(EngineCommand::DisengageSlave(slave)).await;
    let _ = commands
        .send(EngineCommand::SetSlaveSweeping { slave, sweeping: false })
        .await;
    Ok(outcome)
}

/// Runs a continuous ping-pong sweep until stopped, or aborted on a lock
/// timeout after reversing at a bound.
pub async fn run_continuous_sweep(
    slave: usize,
    params: ContinuousSweepParams,
    commands: mpsc::Sender<EngineCommand>,
    mut lock_flag: watch::Receiver<bool>,
    mut stop: watch::Receiver<bool>,
) -> EngineResult<SweepOutcome> {
    let period = tau(params.scan_time_ms);
    let step_mhz = params.speed_mhz_per_s * period.as_secs_f64();
    let (lo, hi) = if params.start_mhz <= params.stop_mhz {
        (params.start_mhz, params.stop_mhz)
    } else {
        (params.stop_mhz, params.start_mhz)
    };
    let mut direction = if params.stop_mhz >= params.start_mhz { 1.0 } else { -1.0 };
    let mut current = params.start_mhz;

    let _ = commands
        .send(EngineCommand::SetSlaveSweeping { slave, sweeping: true })
        .await;

    let mut ticker = interval(period);
    let outcome = loop {
        if *stop.borrow() {
            break SweepOutcome::Stopped { progress_fraction: 0.0 };
        }
        tokio::select! {
            _ = ticker.tick() => {}
            changed = stop.changed() => {
                if changed.is_ok() && *stop.borrow() {
                    break SweepOutcome::Stopped { progress_fraction: 0.0 };
                }
                continue;
            }
        }

        current += direction * step_mhz;
        let mut hit_bound = false;
        if current >= hi {
            current = hi;
            hit_bound = true;
        } else if current <= lo {
            current = lo;
            hit_bound = true;
        }

        let _ = commands
            .send(EngineCommand::SetSlaveSetpointMhz { slave, detuning_mhz: current })
            .await;

        if hit_bound {
            let _ = commands.send(EngineCommand::ResetSlaveLockCounter(slave)).await;
            match wait_locked_or_stop(&mut lock_flag, &mut stop, LOCK_WAIT_TIMEOUT).await {
                WaitResult::Locked => {
                    direction = -direction;
                    info!("continuous sweep slave {slave}: reversed at {current} MHz");
                }
                WaitResult::Stopped => break SweepOutcome::Stopped { progress_fraction: 0.0 },
                WaitResult::TimedOut => {
                    warn!("continuous sweep slave {slave}: lock timeout at {current} MHz");
                    break SweepOutcome::Aborted { timed_out: true, progress_fraction: 0.0 };
                }
            }
        }
    };

    let _ = commands.send(EngineCommand::DisengageSlave(slave)).await;
    let _ = commands
        .send(EngineCommand::SetSlaveSweeping { slave, sweeping: false })
        .await;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discrete_targets_scenario_five() {
        let targets = discrete_targets(-100.0, 100.0, 20.0);
        assert_eq!(targets.len(), 11);
        assert_eq!(targets[0], -100.0);
        assert_eq!(*targets.last().unwrap(), 100.0);
    }

    #[test]
    fn discrete_targets_descending() {
        let targets = discrete_targets(50.0, -50.0, 25.0);
        assert_eq!(targets, vec![50.0, 25.0, 0.0, -25.0, -50.0]);
    }

    #[test]
    fn discrete_targets_handles_non_dividing_step() {
        let targets = discrete_targets(0.0, 10.0, 3.0);
        assert_eq!(*targets.last().unwrap(), 10.0);
        assert!(targets.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn tau_is_floored_at_fifty_ms() {
        assert_eq!(tau(1.0), Duration::from_millis(50));
        assert_eq!(tau(50.0), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn discrete_sweep_completes_and_visits_every_target() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(256);
        let (lock_tx, lock_rx) = watch::channel(false);
        let (stop_tx, stop_rx) = watch::channel(false);

        let params = DiscreteSweepParams {
            start_mhz: 0.0,
            stop_mhz: 40.0,
            step_mhz: 20.0,
            dwell_s: 0.0,
        };

        let handle = tokio::spawn(run_discrete_sweep(0, params, cmd_tx, lock_rx, stop_rx));

        // Drive the lock flag true after every setpoint command so each
        // target's wait resolves immediately.
        let mut setpoints = 0;
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                EngineCommand::SetSlaveSetpointMhz { .. } => {
                    setpoints += 1;
                    let _ = lock_tx.send(false);
                    let _ = lock_tx.send(true);
                }
                EngineCommand::DisengageSlave(_) => break,
                _ => {}
            }
        }
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, SweepOutcome::Completed);
        assert_eq!(setpoints, 3); // 0, 20, 40
        let _ = stop_tx;
    }

    #[tokio::test]
    async fn discrete_sweep_abort_on_lock_timeout_reported() {
        // Directly exercises wait_locked_or_stop's timeout branch with a
        // tiny limit instead of waiting the real 60s.
        let (_lock_tx, mut lock_rx) = watch::channel(false);
        let (_stop_tx, mut stop_rx) = watch::channel(false);
        let result = wait_locked_or_stop(&mut lock_rx, &mut stop_rx, Duration::from_millis(5)).await;
        assert!(matches!(result, WaitResult::TimedOut));
    }

    #[tokio::test]
    async fn discrete_sweep_stop_is_observed_and_disengages() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(256);
        let (_lock_tx, lock_rx) = watch::channel(true);
        let (stop_tx, stop_rx) = watch::channel(false);

        let params = DiscreteSweepParams {
            start_mhz: -100.0,
            stop_mhz: 100.0,
            step_mhz: 20.0,
            dwell_s: 0.0,
        };
        let handle = tokio::spawn(run_discrete_sweep(0, params, cmd_tx, lock_rx, stop_rx));

        let mut saw_disengage = false;
        // Stop almost immediately.
        let _ = stop_tx.send(true);
        while let Some(cmd) = cmd_rx.recv().await {
            if matches!(cmd, EngineCommand::DisengageSlave(_)) {
                saw_disengage = true;
                break;
            }
        }
        let outcome = handle.await.unwrap().unwrap();
        assert!(saw_disengage);
        assert!(matches!(outcome, SweepOutcome::Stopped { .. }));
    }
}
