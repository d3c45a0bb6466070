//! Converts peak timings into the R-parameter and MHz detunings using the
//! cavity's free spectral range.

/// Cavity/laser frequency constants needed to translate timings into MHz.
///
/// `fsr_ghz` is the cavity FSR at the master wavelength; `master_freq_thz`
/// and `slave_freq_thz` are nominal optical frequencies used only to derive
/// `slave_fsr_ghz` (the FSR as seen by the slave laser, which differs
/// slightly from the master's because FSR is wavelength-dependent).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
    pub fsr_ghz: f64,
    pub master_freq_thz: f64,
    pub slave_freq_thz: f64,
}

impl Geometry {
    pub fn new(fsr_ghz: f64, master_freq_thz: f64, slave_freq_thz: f64) -> Self {
        Self {
            fsr_ghz,
            master_freq_thz,
            slave_freq_thz,
        }
    }

    /// FSR as seen by the slave laser: `F_c * f_s / f_m`.
    pub fn slave_fsr_ghz(&self) -> f64 {
        self.fsr_ghz * self.slave_freq_thz / self.master_freq_thz
    }

    /// `R = (t1 - ts) / (t1 - t2)` for sorted master peaks `(t1, t2)`.
    pub fn r_parameter(t1: f64, t2: f64, ts: f64) -> f64 {
        (t1 - ts) / (t1 - t2)
    }

    /// Detuning in MHz from an R value: `-(R - 0.5) * F_s * 1000`.
    pub fn detuning_mhz(&self, r: f64) -> f64 {
        -(r - 0.5) * self.slave_fsr_ghz() * 1000.0
    }

    /// Absolute frequency offset across FSR wraps: `sector*F_c*1000 + detuning`.
    pub fn absolute_offset_mhz(&self, sector: i64, r: f64) -> f64 {
        sector as f64 * self.fsr_ghz * 1000.0 + self.detuning_mhz(r)
    }

    /// Translates a requested detuning `d` (MHz) into `(sector, R_target)`.
    ///
    /// If `|d| > F_c*500` the sector is shifted by
    /// `ceil((|d| - F_c*500) / (F_c*1000))` (sign of d), and `d` is reduced
    /// modulo the FSR into `[-F_c*500, F_c*500]`.
    pub fn set_point(&self, d_mhz: f64) -> (i64, f64) {
        let f_c_mhz = self.fsr_ghz * 1000.0;
        let half_fsr = f_c_mhz / 2.0;
        let mut sector = 0i64;
        let mut d = d_mhz;

        if d > half_fsr {
            sector = ((d - half_fsr) / f_c_mhz).ceil() as i64;
            d -= sector as f64 * f_c_mhz;
        } else if d < -half_fsr {
            sector = -(((-d) - half_fsr) / f_c_mhz).ceil() as i64;
            d -= sector as f64 * f_c_mhz;
        }

        let r_target = 0.5 - d / (self.slave_fsr_ghz() * 1000.0);
        (sector, r_target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unity_geometry(fsr_ghz: f64) -> Geometry {
        // master_freq == slave_freq so slave_fsr == fsr exactly.
        Geometry::new(fsr_ghz, 400.0, 400.0)
    }

    #[test]
    fn scenario_r_half_means_zero_detuning() {
        let r = Geometry::r_parameter(2.0, 8.0, 5.0);
        assert!((r - 0.5).abs() < 1e-12);
        let geo = unity_geometry(1.0);
        assert!(geo.detuning_mhz(r).abs() < 1e-9);
    }

    #[test]
    fn scenario_positive_detuning_wraps_into_sector() {
        let geo = unity_geometry(1.0); // F_c = 1000 MHz
        let (sector, r_target) = geo.set_point(600.0);
        assert_eq!(sector, 1);
        assert!((r_target - 0.9).abs() < 1e-9, "r_target={r_target}");
    }

    #[test]
    fn roundtrip_set_point_recovers_detuning() {
        for fsr in [0.5, 1.0, 1.5, 2.3] {
            for d in [-3000.0, -750.3, -10.0, 0.0, 42.0, 333.3, 2900.0] {
                let geo = unity_geometry(fsr);
                let (sector, r_target) = geo.set_point(d);
                let recovered =
                    sector as f64 * geo.fsr_ghz * 1000.0 - (r_target - 0.5) * geo.slave_fsr_ghz() * 1000.0;
                assert!(
                    (recovered - d).abs() < 1e-6,
                    "fsr={fsr} d={d} recovered={recovered} sector={sector} r_target={r_target}"
                );
            }
        }
    }

    #[test]
    fn slave_fsr_scales_with_frequency_ratio() {
        let geo = Geometry::new(1.0, 400.0, 800.0);
        assert!((geo.slave_fsr_ghz() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn absolute_offset_adds_sector_times_fsr() {
        let geo = unity_geometry(1.0);
        let off0 = geo.absolute_offset_mhz(0, 0.5);
        let off1 = geo.absolute_offset_mhz(1, 0.5);
        assert!((off1 - off0 - 1000.0).abs() < 1e-9);
    }
}
