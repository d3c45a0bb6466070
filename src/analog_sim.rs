//! Deterministic (given a seed) synthetic `AnalogIo`: generates two or three
//! Lorentzian photodiode peaks per scan plus optional Gaussian noise. Used
//! by the example binary and the end-to-end tests; no real DAQ board driver
//! is shipped.

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::EngineError;
use crate::scan_clock::ScanConfig;
use crate::traits::{AnalogIo, ChannelRole};

/// Sum of Lorentzians `A_i / (G_i^2 + (x-B_i)^2)` sampled over the scan's
/// time grid, matching the original `lor`/`generate_data` shape.
fn lorentzian_sum(x_ms: f64, amplitudes: &[f64], centers_ms: &[f64], gammas_ms: &[f64]) -> f64 {
    amplitudes
        .iter()
        .zip(centers_ms)
        .zip(gammas_ms)
        .map(|((a, b), g)| a / (g * g + (x_ms - b).powi(2)))
        .sum()
}

/// Per-channel synthetic trace recipe: Lorentzian peak positions are
/// expressed relative to the scan window so they move naturally with
/// ScanClock's offset/amplitude.
#[derive(Debug, Clone)]
struct ChannelRecipe {
    amplitudes: Vec<f64>,
    center_fracs: Vec<f64>,
    gamma_ms: Vec<f64>,
    noise_std: f64,
}

pub struct SimulatedAnalogIo {
    rng: StdRng,
    scan_time_ms: f64,
    master: ChannelRecipe,
    slaves: Vec<ChannelRecipe>,
    slave_dc_volts: Vec<f64>,
}

impl SimulatedAnalogIo {
    /// `seed` makes trace noise reproducible across runs; the example
    /// binary and tests pass a fixed seed, a live demo could pass entropy.
    pub fn new(seed: u64, scan_config: &ScanConfig, n_slaves: usize) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            scan_time_ms: scan_config.scan_time_ms,
            master: ChannelRecipe {
                amplitudes: vec![1.0, 1.0],
                center_fracs: vec![0.2, 0.8],
                gamma_ms: vec![0.05, 0.05],
                noise_std: 0.002,
            },
            slaves: (0..n_slaves)
                .map(|_| ChannelRecipe {
                    amplitudes: vec![1.0],
                    center_fracs: vec![0.5],
                    gamma_ms: vec![0.02],
                    noise_std: 0.001,
                })
                .collect(),
            slave_dc_volts: vec![0.0; n_slaves],
        }
    }

    fn add_noise(&mut self, trace: &mut [f64], std: f64) {
        if std <= 0.0 {
            return;
        }
        for y in trace.iter_mut() {
            // Box-Muller transform: no rand_distr dependency needed for one
            // Gaussian sample.
            let u1: f64 = self.rng.random_range(1e-12..1.0);
            let u2: f64 = self.rng.random_range(0.0..1.0);
            let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
            *y += std * z;
        }
    }

    /// Slave peak center tracks its commanded DC voltage, shifted by the
    /// same master-peak separation mapping the original simulator used
    /// (`voltage -> time` via `scan_time`).
    fn slave_center_frac(&self, k: usize) -> f64 {
        let base = 0.5 + self.slave_dc_volts[k] * 0.05;
        base.clamp(0.05, 0.95)
    }
}

impl AnalogIo for SimulatedAnalogIo {
    fn write_ramp(&mut self, channel: ChannelRole, samples: &[f64]) -> Result<(), EngineError> {
        debug!("SimulatedAnalogIo: write_ramp({channel:?}, {} samples)", samples.len());
        Ok(())
    }

    fn write_dc(&mut self, channels: &[ChannelRole], volts: &[f64]) -> Result<(), EngineError> {
        for (ch, v) in channels.iter().zip(volts) {
            if let ChannelRole::Slave(k) = ch {
                if let Some(slot) = self.slave_dc_volts.get_mut(*k) {
                    *slot = *v;
                }
            }
        }
        Ok(())
    }

    fn read_synchronized(
        &mut self,
        channels: &[ChannelRole],
        n: usize,
    ) -> Result<Vec<Vec<f64>>, EngineError> {
        if n == 0 {
            return Err(EngineError::acquisition("synchronized", "zero-length read requested"));
        }
        let mut traces = Vec::with_capacity(channels.len());
        for channel in channels {
            let recipe = match channel {
                ChannelRole::Master => self.master.clone(),
                ChannelRole::Slave(k) => {
                    let mut r = self.slaves[*k].clone();
                    r.center_fracs = vec![self.slave_center_frac(*k)];
                    r
                }
            };
            let centers_ms: Vec<f64> = recipe
                .center_fracs
                .iter()
                .map(|f| f * self.scan_time_ms)
                .collect();
            let mut trace: Vec<f64> = (0..n)
                .map(|i| {
                    let t_ms = i as f64 * self.scan_time_ms / (n - 1).max(1) as f64;
                    lorentzian_sum(t_ms, &recipe.amplitudes, &centers_ms, &recipe.gamma_ms)
                })
                .collect();
            self.add_noise(&mut trace, recipe.noise_std);
            traces.push(trace);
        }
        Ok(traces)
    }

    fn read_dc(&mut self, channels: &[ChannelRole], _m: usize) -> Result<Vec<f64>, EngineError> {
        Ok(channels.iter().map(|_| 1.0).collect())
    }
}
