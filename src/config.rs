//! Loads/saves the keyed-section configuration file (sections `DAQ`,
//! `WAVEMETER`, `CAVITY`, `LASER1`, `LASER2`) into typed structs, and
//! translates those structs into the value types the engine consumes.

use configparser::ini::Ini;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::geometry::Geometry;
use crate::lock_engine::LockConfig;
use crate::scan_clock::ScanConfig;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaqConfig {
    pub device_name: String,
}

impl Default for DaqConfig {
    fn default() -> Self {
        Self {
            device_name: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WavemeterConfig {
    pub ip: String,
    pub port: u16,
    pub laser1_key: String,
    pub laser2_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CavityConfig {
    pub rms_window: usize,
    pub lock_threshold_mhz: f64,
    pub peak_criterion: f64,
    pub scan_time_ms: f64,
    pub scan_samples: usize,
    pub scan_offset: f64,
    pub scan_amplitude: f64,
    pub p_gain: f64,
    pub i_gain: f64,
    pub fsr_ghz: f64,
    pub wavelength_nm: f64,
    pub lockpoint_ms: f64,
    pub min_voltage: f64,
    pub max_voltage: f64,
    pub input_channel: String,
    pub output_channel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LaserConfig {
    pub lockpoint_r: Option<f64>,
    pub lockpoint_mhz: Option<f64>,
    pub wavelength_nm: f64,
    pub peak_criterion: f64,
    pub lock_threshold_mhz: f64,
    pub p_gain: f64,
    pub i_gain: f64,
    pub min_voltage: f64,
    pub max_voltage: f64,
    pub set_voltage: f64,
    pub input_channel: String,
    pub output_channel: String,
    pub power_channel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemConfig {
    pub daq: DaqConfig,
    pub wavemeter: Option<WavemeterConfig>,
    pub cavity: CavityConfig,
    pub laser1: LaserConfig,
    pub laser2: Option<LaserConfig>,
}

/// Wrong-peak rejection threshold as a fraction of one FSR, and the
/// consecutive-good-sample count required to declare lock. The source
/// hard-codes these at 0.4 and 50; this crate exposes them as configuration
/// with those values as defaults (see SPEC_FULL.md §9 resolutions).
const DEFAULT_WRONG_PEAK_FRACTION: f64 = 0.4;
const DEFAULT_LOCK_COUNT_THRESHOLD: u32 = 50;

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            daq: DaqConfig::default(),
            wavemeter: None,
            cavity: CavityConfig {
                rms_window: 20,
                lock_threshold_mhz: 5.0,
                peak_criterion: 0.2,
                scan_time_ms: 10.0,
                scan_samples: 1000,
                scan_offset: 0.0,
                scan_amplitude: 2.0,
                p_gain: 1.0,
                i_gain: 0.1,
                fsr_ghz: 1.0,
                wavelength_nm: 750.0,
                lockpoint_ms: 2.0,
                min_voltage: -5.0,
                max_voltage: 5.0,
                input_channel: "ai0".to_string(),
                output_channel: "ao0".to_string(),
            },
            laser1: LaserConfig {
                lockpoint_r: Some(0.5),
                lockpoint_mhz: None,
                wavelength_nm: 750.0,
                peak_criterion: 0.2,
                lock_threshold_mhz: 5.0,
                p_gain: 1.0,
                i_gain: 0.1,
                min_voltage: 0.0,
                max_voltage: 5.0,
                set_voltage: 0.0,
                input_channel: "ai1".to_string(),
                output_channel: "ao1".to_string(),
                power_channel: "ai4".to_string(),
            },
            laser2: None,
        }
    }
}

fn get_required(ini: &Ini, section: &str, key: &str) -> Result<String, EngineError> {
    ini.get(section, key).ok_or_else(|| {
        EngineError::configuration(format!("missing key [{section}] {key}"))
    })
}

fn get_f64(ini: &Ini, section: &str, key: &str) -> Result<f64, EngineError> {
    let raw = get_required(ini, section, key)?;
    raw.parse::<f64>()
        .map_err(|e| EngineError::configuration(format!("[{section}] {key}: {e}")))
}

fn get_usize(ini: &Ini, section: &str, key: &str) -> Result<usize, EngineError> {
    let raw = get_required(ini, section, key)?;
    raw.parse::<usize>()
        .map_err(|e| EngineError::configuration(format!("[{section}] {key}: {e}")))
}

fn get_u16(ini: &Ini, section: &str, key: &str) -> Result<u16, EngineError> {
    let raw = get_required(ini, section, key)?;
    raw.parse::<u16>()
        .map_err(|e| EngineError::configuration(format!("[{section}] {key}: {e}")))
}

fn parse_laser_section(ini: &Ini, section: &str) -> Result<LaserConfig, EngineError> {
    Ok(LaserConfig {
        lockpoint_r: ini
            .get(section, "LockpointR")
            .map(|v| v.parse::<f64>())
            .transpose()
            .map_err(|e| EngineError::configuration(format!("[{section}] LockpointR: {e}")))?,
        lockpoint_mhz: ini
            .get(section, "LockpointMHz")
            .map(|v| v.parse::<f64>())
            .transpose()
            .map_err(|e| EngineError::configuration(format!("[{section}] LockpointMHz: {e}")))?,
        wavelength_nm: get_f64(ini, section, "Wavelength")?,
        peak_criterion: get_f64(ini, section, "PeakCriterion")?,
        lock_threshold_mhz: get_f64(ini, section, "LockThreshold")?,
        p_gain: get_f64(ini, section, "PGain")?,
        i_gain: get_f64(ini, section, "IGain")?,
        min_voltage: get_f64(ini, section, "MinVoltage")?,
        max_voltage: get_f64(ini, section, "MaxVoltage")?,
        set_voltage: get_f64(ini, section, "SetVoltage")?,
        input_channel: get_required(ini, section, "InputChannel")?,
        output_channel: get_required(ini, section, "OutputChannel")?,
        power_channel: get_required(ini, section, "PowerChannel")?,
    })
}

fn write_laser_section(ini: &mut Ini, section: &str, cfg: &LaserConfig) {
    if let Some(r) = cfg.lockpoint_r {
        ini.set(section, "LockpointR", Some(r.to_string()));
    }
    if let Some(mhz) = cfg.lockpoint_mhz {
        ini.set(section, "LockpointMHz", Some(mhz.to_string()));
    }
    ini.set(section, "Wavelength", Some(cfg.wavelength_nm.to_string()));
    ini.set(section, "PeakCriterion", Some(cfg.peak_criterion.to_string()));
    ini.set(section, "LockThreshold", Some(cfg.lock_threshold_mhz.to_string()));
    ini.set(section, "PGain", Some(cfg.p_gain.to_string()));
    ini.set(section, "IGain", Some(cfg.i_gain.to_string()));
    ini.set(section, "MinVoltage", Some(cfg.min_voltage.to_string()));
    ini.set(section, "MaxVoltage", Some(cfg.max_voltage.to_string()));
    ini.set(section, "SetVoltage", Some(cfg.set_voltage.to_string()));
    ini.set(section, "InputChannel", Some(cfg.input_channel.clone()));
    ini.set(section, "OutputChannel", Some(cfg.output_channel.clone()));
    ini.set(section, "PowerChannel", Some(cfg.power_channel.clone()));
}

impl SystemConfig {
    pub fn load(path: &str) -> Result<Self, EngineError> {
        let mut ini = Ini::new();
        ini.load(path)
            .map_err(|e| EngineError::configuration(format!("failed to read {path}: {e}")))?;

        let daq = DaqConfig {
            device_name: get_required(&ini, "DAQ", "DeviceName")?,
        };

        let wavemeter = if ini.get("WAVEMETER", "IP").is_some() {
            Some(WavemeterConfig {
                ip: get_required(&ini, "WAVEMETER", "IP")?,
                port: get_u16(&ini, "WAVEMETER", "Port")?,
                laser1_key: get_required(&ini, "WAVEMETER", "Laser1")?,
                laser2_key: ini.get("WAVEMETER", "Laser2"),
            })
        } else {
            None
        };

        let cavity = CavityConfig {
            rms_window: get_usize(&ini, "CAVITY", "RMS")?,
            lock_threshold_mhz: get_f64(&ini, "CAVITY", "LockThreshold")?,
            peak_criterion: get_f64(&ini, "CAVITY", "PeakCriterion")?,
            scan_time_ms: get_f64(&ini, "CAVITY", "ScanTime")?,
            scan_samples: get_usize(&ini, "CAVITY", "ScanSamples")?,
            scan_offset: get_f64(&ini, "CAVITY", "ScanOffset")?,
            scan_amplitude: get_f64(&ini, "CAVITY", "ScanAmplitude")?,
            p_gain: get_f64(&ini, "CAVITY", "PGain")?,
            i_gain: get_f64(&ini, "CAVITY", "IGain")?,
            // FSR is stored in the file as MHz, internally as GHz.
            fsr_ghz: get_f64(&ini, "CAVITY", "FSR")? / 1000.0,
            wavelength_nm: get_f64(&ini, "CAVITY", "Wavelength")?,
            lockpoint_ms: get_f64(&ini, "CAVITY", "Lockpoint")?,
            min_voltage: get_f64(&ini, "CAVITY", "MinVoltage")?,
            max_voltage: get_f64(&ini, "CAVITY", "MaxVoltage")?,
            input_channel: get_required(&ini, "CAVITY", "InputChannel")?,
            output_channel: get_required(&ini, "CAVITY", "OutputChannel")?,
        };

        let laser1 = parse_laser_section(&ini, "LASER1")?;
        let laser2 = if ini.get("LASER2", "Wavelength").is_some() {
            Some(parse_laser_section(&ini, "LASER2")?)
        } else {
            None
        };

        Ok(SystemConfig {
            daq,
            wavemeter,
            cavity,
            laser1,
            laser2,
        })
    }

    pub fn save(&self, path: &str) -> Result<(), EngineError> {
        let mut ini = Ini::new();
        ini.set("DAQ", "DeviceName", Some(self.daq.device_name.clone()));

        if let Some(wvm) = &self.wavemeter {
            ini.set("WAVEMETER", "IP", Some(wvm.ip.clone()));
            ini.set("WAVEMETER", "Port", Some(wvm.port.to_string()));
            ini.set("WAVEMETER", "Laser1", Some(wvm.laser1_key.clone()));
            if let Some(laser2_key) = &wvm.laser2_key {
                ini.set("WAVEMETER", "Laser2", Some(laser2_key.clone()));
            }
        }

        let cav = &self.cavity;
        ini.set("CAVITY", "RMS", Some(cav.rms_window.to_string()));
        ini.set("CAVITY", "LockThreshold", Some(cav.lock_threshold_mhz.to_string()));
        ini.set("CAVITY", "PeakCriterion", Some(cav.peak_criterion.to_string()));
        ini.set("CAVITY", "ScanTime", Some(cav.scan_time_ms.to_string()));
        ini.set("CAVITY", "ScanSamples", Some(cav.scan_samples.to_string()));
        ini.set("CAVITY", "ScanOffset", Some(cav.scan_offset.to_string()));
        ini.set("CAVITY", "ScanAmplitude", Some(cav.scan_amplitude.to_string()));
        ini.set("CAVITY", "PGain", Some(cav.p_gain.to_string()));
        ini.set("CAVITY", "IGain", Some(cav.i_gain.to_string()));
        ini.set("CAVITY", "FSR", Some((cav.fsr_ghz * 1000.0).to_string()));
        ini.set("CAVITY", "Wavelength", Some(cav.wavelength_nm.to_string()));
        ini.set("CAVITY", "Lockpoint", Some(cav.lockpoint_ms.to_string()));
        ini.set("CAVITY", "MinVoltage", Some(cav.min_voltage.to_string()));
        ini.set("CAVITY", "MaxVoltage", Some(cav.max_voltage.to_string()));
        ini.set("CAVITY", "InputChannel", Some(cav.input_channel.clone()));
        ini.set("CAVITY", "OutputChannel", Some(cav.output_channel.clone()));

        write_laser_section(&mut ini, "LASER1", &self.laser1);
        if let Some(laser2) = &self.laser2 {
            write_laser_section(&mut ini, "LASER2", laser2);
        }

        ini.write(path)
            .map_err(|e| EngineError::configuration(format!("failed to write {path}: {e}")))
    }

    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            min_voltage: self.cavity.min_voltage,
            max_voltage: self.cavity.max_voltage,
            offset: self.cavity.scan_offset,
            amplitude: self.cavity.scan_amplitude,
            samples: self.cavity.scan_samples,
            scan_time_ms: self.cavity.scan_time_ms,
        }
    }

    pub fn master_lock_config(&self) -> LockConfig {
        LockConfig {
            kp: self.cavity.p_gain,
            ki: self.cavity.i_gain,
            rms_threshold_mhz: self.cavity.lock_threshold_mhz,
            rms_window: self.cavity.rms_window,
            peak_criterion: self.cavity.peak_criterion,
            wrong_peak_fraction: DEFAULT_WRONG_PEAK_FRACTION,
            lock_count_threshold: DEFAULT_LOCK_COUNT_THRESHOLD,
        }
    }

    pub fn slave_lock_config(&self, laser: &LaserConfig) -> LockConfig {
        LockConfig {
            kp: laser.p_gain,
            ki: laser.i_gain,
            rms_threshold_mhz: laser.lock_threshold_mhz,
            rms_window: self.cavity.rms_window,
            peak_criterion: laser.peak_criterion,
            wrong_peak_fraction: DEFAULT_WRONG_PEAK_FRACTION,
            lock_count_threshold: DEFAULT_LOCK_COUNT_THRESHOLD,
        }
    }

    pub fn slave_geometry(&self, laser: &LaserConfig) -> Geometry {
        Geometry::new(self.cavity.fsr_ghz, self.cavity.wavelength_to_thz(), wavelength_to_thz(laser.wavelength_nm))
    }
}

impl CavityConfig {
    fn wavelength_to_thz(&self) -> f64 {
        wavelength_to_thz(self.wavelength_nm)
    }
}

/// Converts a vacuum wavelength in nm to an optical frequency in THz
/// (`f = c / lambda`).
fn wavelength_to_thz(wavelength_nm: f64) -> f64 {
    const C_NM_PER_S: f64 = 2.99792458e17; // speed of light in nm/s
    C_NM_PER_S / wavelength_nm / 1e12
}
