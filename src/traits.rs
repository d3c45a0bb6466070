use crate::error::EngineError;

/// Channel role, used both to select AnalogIO channels and to tag telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    Master,
    Slave(usize),
}

/// Abstract bidirectional analog channel set. Exclusively owned by the
/// control loop; UI and sweep tasks never touch it directly.
///
/// Input read clock must be slaved to the output ramp clock so read sample i
/// corresponds to output sample i. Implementations that cannot guarantee
/// this for a given configuration should return `EngineError::FatalTiming`
/// from `read_synchronized`.
#[cfg_attr(test, mockall::automock)]
pub trait AnalogIo {
    /// Writes the ramp waveform to `channel`. `samples.len()` must equal the
    /// configured scan sample count.
    fn write_ramp(&mut self, channel: ChannelRole, samples: &[f64]) -> Result<(), EngineError>;

    /// Writes one DC level per channel.
    fn write_dc(&mut self, channels: &[ChannelRole], volts: &[f64]) -> Result<(), EngineError>;

    /// Blocks until `n` synchronized samples are available on every
    /// requested channel, returning one trace per channel in request order.
    fn read_synchronized(
        &mut self,
        channels: &[ChannelRole],
        n: usize,
    ) -> Result<Vec<Vec<f64>>, EngineError>;

    /// Averages `m` samples per channel for power monitoring.
    fn read_dc(&mut self, channels: &[ChannelRole], m: usize) -> Result<Vec<f64>, EngineError>;
}

/// Read-only boundary onto an external wavemeter. No live socket client is
/// implemented by this crate; this trait exists so LockEngine can accept one.
#[cfg_attr(test, mockall::automock)]
pub trait WavemeterSource {
    /// Returns `(timestamp_s, frequency_thz)` for the given laser key, or
    /// `None` if the wavemeter has no reading for it yet.
    fn latest_frequency_thz(&self, laser_key: &str) -> Result<Option<(f64, f64)>, EngineError>;
}

/// Non-blocking sink for telemetry frames. The control loop never waits on
/// this; a full sink drops its oldest entry.
#[cfg_attr(test, mockall::automock)]
pub trait TelemetryWriter {
    /// Persists a batch of frames drained from the sink. Called off the
    /// control-loop task on a ≥10s cadence.
    fn write_batch(&mut self, frames: &[crate::telemetry::TelemetryFrame]) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_role_equality() {
        assert_eq!(ChannelRole::Slave(0), ChannelRole::Slave(0));
        assert_ne!(ChannelRole::Slave(0), ChannelRole::Slave(1));
        assert_ne!(ChannelRole::Master, ChannelRole::Slave(0));
    }
}
