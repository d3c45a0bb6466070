//! End-to-end tests driving `LockEngine` against `SimulatedAnalogIo` over
//! many scan iterations, plus one driving a discrete sweep to completion
//! through the same command channel a real runtime loop would use.
//!
//! Grounded in the teacher's `tests/simulation_e2e.rs` shape (a synthetic
//! physics source driving a capability across hundreds of iterations,
//! asserting convergence rather than exact trajectories); the synthetic
//! source here is `SimulatedAnalogIo`'s two/one-Lorentzian traces instead of
//! the teacher's PTP offset/drift physics.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use translock::analog_sim::SimulatedAnalogIo;
use translock::command::{DiscreteSweepParams, EngineCommand};
use translock::geometry::Geometry;
use translock::lock_engine::{EngagementFlags, LockConfig, LockEngine, LockPoints, MasterLockState};
use translock::scan_clock::{ScanClock, ScanConfig};
use translock::sweep::run_discrete_sweep;

fn scan_config() -> ScanConfig {
    ScanConfig {
        min_voltage: -5.0,
        max_voltage: 5.0,
        offset: 0.0,
        amplitude: 2.0,
        samples: 1000,
        scan_time_ms: 10.0,
    }
}

fn tight_lock_config() -> LockConfig {
    LockConfig {
        kp: 0.3,
        ki: 0.05,
        rms_threshold_mhz: 50.0,
        rms_window: 20,
        peak_criterion: 0.2,
        wrong_peak_fraction: 0.4,
        lock_count_threshold: 50,
    }
}

fn build_engine(n_slaves: usize) -> LockEngine<SimulatedAnalogIo> {
    let analog = SimulatedAnalogIo::new(42, &scan_config(), n_slaves);
    let scan_clock = ScanClock::new(scan_config());
    let geometries = (0..n_slaves).map(|_| Geometry::new(1.0, 400.0, 400.0)).collect();
    let bounds = (0..n_slaves).map(|_| (-5.0, 5.0)).collect();
    let lock_points = Arc::new(RwLock::new(LockPoints {
        master_ms: 2.0,
        slave_r_target: vec![0.5; n_slaves],
    }));
    let engagement = Arc::new(RwLock::new(EngagementFlags {
        master: false,
        slaves: vec![false; n_slaves],
        slave_sweeping: vec![false; n_slaves],
    }));
    LockEngine::new(
        analog,
        scan_clock,
        tight_lock_config(),
        vec![tight_lock_config(); n_slaves],
        geometries,
        bounds,
        lock_points,
        engagement,
        256,
    )
}

/// Master alone, run for many iterations: lock state must leave
/// `Disengaged`/`EngagedMissingPeaks` and settle in `EngagedLocked`.
#[test]
fn master_converges_to_locked_over_many_iterations() {
    let mut engine = build_engine(0);
    engine.engage_master();

    let mut final_state = MasterLockState::Disengaged;
    for _ in 0..300 {
        engine.run_iteration().unwrap();
        final_state = engine.master_lock_state();
    }

    assert_eq!(final_state, MasterLockState::EngagedLocked);
}

/// Master plus one slave: once both are engaged and run long enough, the
/// slave's lock-quality watch flag must flip true.
#[test]
fn slave_converges_to_locked_with_master_engaged() {
    let mut engine = build_engine(1);
    let mut lock_flag = engine.slave_lock_flag(0);
    engine.engage_master();
    engine.engage_slave(0).unwrap();

    for _ in 0..300 {
        engine.run_iteration().unwrap();
        if *lock_flag.borrow_and_update() {
            break;
        }
    }

    assert!(*lock_flag.borrow());
}

/// Disengaging the master mid-run must force the slave's lock flag back to
/// false and clear its lock-quality state, per the single forced-disengage
/// invariant.
#[test]
fn disengaging_master_clears_slave_lock_state() {
    let mut engine = build_engine(1);
    let mut lock_flag = engine.slave_lock_flag(0);
    engine.engage_master();
    engine.engage_slave(0).unwrap();

    for _ in 0..300 {
        engine.run_iteration().unwrap();
    }
    assert!(*lock_flag.borrow_and_update());

    engine.disengage_master();
    assert_eq!(engine.master_lock_state(), MasterLockState::Disengaged);
    assert!(!*lock_flag.borrow_and_update());
}

/// Drives a discrete sweep to completion against a live `LockEngine`: a
/// background task plays the runtime loop's role (drain commands, run
/// iterations) while `run_discrete_sweep` walks its target list over the
/// same command channel an operator UI would use.
#[tokio::test]
async fn discrete_sweep_completes_against_live_engine() {
    let mut engine = build_engine(1);
    engine.engage_master();
    engine.engage_slave(0).unwrap();
    let lock_flag = engine.slave_lock_flag(0);

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<EngineCommand>(64);
    let (stop_tx, stop_rx) = watch::channel(false);

    let driver = tokio::spawn(async move {
        loop {
            while let Ok(cmd) = cmd_rx.try_recv() {
                let _ = engine.apply_command(&cmd);
            }
            engine.run_iteration().unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;
            if *stop_rx.borrow() {
                break;
            }
        }
    });

    let params = DiscreteSweepParams {
        start_mhz: -50.0,
        stop_mhz: 50.0,
        step_mhz: 50.0,
        dwell_s: 0.0,
    };
    let outcome = tokio::time::timeout(
        Duration::from_secs(20),
        run_discrete_sweep(0, params, cmd_tx, lock_flag, watch::channel(false).1),
    )
    .await
    .expect("sweep must finish within the test timeout")
    .unwrap();

    stop_tx.send(true).unwrap();
    driver.await.unwrap();

    use translock::sweep::SweepOutcome;
    assert_eq!(outcome, SweepOutcome::Completed);
}
