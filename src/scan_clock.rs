use log::debug;

/// Bounds and shape of the ramp driven onto the cavity piezo each scan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanConfig {
    pub min_voltage: f64,
    pub max_voltage: f64,
    pub offset: f64,
    pub amplitude: f64,
    pub samples: usize,
    pub scan_time_ms: f64,
}

impl ScanConfig {
    /// Clamps offset/amplitude into `[min_voltage, max_voltage]`, shrinking
    /// amplitude if the upper end would otherwise exceed the bound.
    fn clamped(mut self) -> Self {
        if self.offset < self.min_voltage {
            self.offset = self.min_voltage;
        }
        if self.offset > self.max_voltage {
            self.offset = self.max_voltage;
        }
        if self.offset + self.amplitude > self.max_voltage {
            self.amplitude = self.max_voltage - self.offset;
        }
        if self.amplitude < 0.0 {
            self.amplitude = 0.0;
        }
        self
    }

    pub fn sample_rate_hz(&self) -> f64 {
        1000.0 * self.samples as f64 / self.scan_time_ms
    }
}

/// Produces the output ramp and the companion sample-time grid, and keeps
/// both in sync with the current `ScanConfig`.
pub struct ScanClock {
    config: ScanConfig,
    ramp: Vec<f64>,
    time_grid_ms: Vec<f64>,
}

impl ScanClock {
    pub fn new(config: ScanConfig) -> Self {
        let config = config.clamped();
        let mut clock = Self {
            config,
            ramp: Vec::new(),
            time_grid_ms: Vec::new(),
        };
        clock.rebuild();
        clock
    }

    fn rebuild(&mut self) {
        let n = self.config.samples;
        self.ramp.clear();
        self.time_grid_ms.clear();
        if n == 0 {
            return;
        }
        if n == 1 {
            self.ramp.push(self.config.offset);
            self.time_grid_ms.push(0.0);
            return;
        }
        let last = (n - 1) as f64;
        for i in 0..n {
            let frac = i as f64 / last;
            self.ramp
                .push(self.config.offset + frac * self.config.amplitude);
            self.time_grid_ms.push(frac * self.config.scan_time_ms);
        }
        debug!(
            "ScanClock rebuilt: N={} offset={:.4} amplitude={:.4} T={:.2}ms",
            n, self.config.offset, self.config.amplitude, self.config.scan_time_ms
        );
    }

    /// Replaces the configuration wholesale and rebuilds both grids.
    pub fn reconfigure(&mut self, config: ScanConfig) {
        self.config = config.clamped();
        self.rebuild();
    }

    /// Shifts the ramp offset by `delta`, preserving amplitude, then
    /// re-clamps into bounds (possibly shrinking amplitude at the new
    /// offset).
    pub fn move_offset(&mut self, delta: f64) {
        self.config.offset += delta;
        self.config = self.config.clamped();
        self.rebuild();
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn ramp(&self) -> &[f64] {
        &self.ramp
    }

    pub fn time_grid_ms(&self) -> &[f64] {
        &self.time_grid_ms
    }

    pub fn dx_ms(&self) -> f64 {
        if self.config.samples <= 1 {
            self.config.scan_time_ms
        } else {
            self.config.scan_time_ms / (self.config.samples - 1) as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ScanConfig {
        ScanConfig {
            min_voltage: -5.0,
            max_voltage: 5.0,
            offset: 0.0,
            amplitude: 2.0,
            samples: 5,
            scan_time_ms: 10.0,
        }
    }

    #[test]
    fn ramp_spans_offset_to_offset_plus_amplitude() {
        let clock = ScanClock::new(base_config());
        assert_eq!(clock.ramp()[0], 0.0);
        assert_eq!(*clock.ramp().last().unwrap(), 2.0);
        assert_eq!(clock.ramp().len(), 5);
    }

    #[test]
    fn ramp_is_strictly_monotone_for_positive_amplitude() {
        let clock = ScanClock::new(base_config());
        for w in clock.ramp().windows(2) {
            assert!(w[1] > w[0]);
        }
    }

    #[test]
    fn time_grid_spans_zero_to_t() {
        let clock = ScanClock::new(base_config());
        assert_eq!(clock.time_grid_ms()[0], 0.0);
        assert_eq!(*clock.time_grid_ms().last().unwrap(), 10.0);
    }

    #[test]
    fn offset_is_clamped_into_bounds() {
        let mut cfg = base_config();
        cfg.offset = 10.0;
        let clock = ScanClock::new(cfg);
        assert_eq!(clock.config().offset, 5.0);
        // amplitude must have shrunk to fit: offset+amplitude<=max
        assert!(clock.config().offset + clock.config().amplitude <= 5.0 + 1e-9);
    }

    #[test]
    fn amplitude_shrinks_if_it_would_exceed_upper_bound() {
        let mut cfg = base_config();
        cfg.offset = 4.0;
        cfg.amplitude = 5.0;
        let clock = ScanClock::new(cfg);
        assert!((clock.config().amplitude - 1.0).abs() < 1e-9);
    }

    #[test]
    fn move_offset_preserves_amplitude_then_reclamps() {
        let mut clock = ScanClock::new(base_config());
        clock.move_offset(1.0);
        assert_eq!(clock.config().offset, 1.0);
        assert_eq!(clock.config().amplitude, 2.0);

        // moving far past the upper bound clamps offset and may shrink amplitude
        clock.move_offset(100.0);
        assert!(clock.config().offset <= 5.0);
        assert!(clock.config().offset + clock.config().amplitude <= 5.0 + 1e-9);
    }

    #[test]
    fn reconfigure_rebuilds_grids_to_new_sample_count() {
        let mut clock = ScanClock::new(base_config());
        let mut cfg = base_config();
        cfg.samples = 11;
        clock.reconfigure(cfg);
        assert_eq!(clock.ramp().len(), 11);
        assert_eq!(clock.time_grid_ms().len(), 11);
    }

    #[test]
    fn sample_rate_matches_formula() {
        let cfg = base_config();
        assert!((cfg.sample_rate_hz() - 500.0).abs() < 1e-9);
    }

    #[test]
    fn property_offset_in_bounds_for_arbitrary_requests() {
        for raw_offset in [-100.0, -5.0, -1.0, 0.0, 3.0, 4.9, 5.0, 100.0] {
            for amp in [0.0, 0.5, 2.0, 10.0] {
                let mut cfg = base_config();
                cfg.offset = raw_offset;
                cfg.amplitude = amp;
                let clock = ScanClock::new(cfg);
                assert!(clock.config().offset >= cfg.min_voltage - 1e-9);
                assert!(clock.config().offset <= cfg.max_voltage + 1e-9);
                assert!(clock.config().offset + clock.config().amplitude <= cfg.max_voltage + 1e-9);
                assert_eq!(clock.ramp()[0], clock.config().offset);
                assert_eq!(
                    *clock.ramp().last().unwrap(),
                    clock.config().offset + clock.config().amplitude
                );
            }
        }
    }
}
