use thiserror::Error;

/// The five error kinds the control pipeline can produce.
///
/// Soft kinds (`Acquisition`, `Detection`) are caught by the caller and folded
/// into status/telemetry; `Configuration` is rejected at the command
/// boundary; `SweepAbort` is local to a sweep task; only `FatalTiming`
/// propagates out of `LockEngine::run_iteration`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration rejected: {0}")]
    Configuration(String),

    #[error("acquisition failed on channel {channel}: {reason}")]
    Acquisition { channel: String, reason: String },

    #[error("detection anomaly on {channel}: {reason}")]
    Detection { channel: String, reason: String },

    #[error("sweep aborted on slave {slave}: {reason}")]
    SweepAbort { slave: usize, reason: String },

    #[error("fatal timing error: {0}")]
    FatalTiming(String),
}

impl EngineError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn acquisition(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Acquisition {
            channel: channel.into(),
            reason: reason.into(),
        }
    }

    pub fn detection(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Detection {
            channel: channel.into(),
            reason: reason.into(),
        }
    }

    pub fn sweep_abort(slave: usize, reason: impl Into<String>) -> Self {
        Self::SweepAbort {
            slave,
            reason: reason.into(),
        }
    }

    pub fn fatal_timing(msg: impl Into<String>) -> Self {
        Self::FatalTiming(msg.into())
    }

    /// True for kinds that must stop the control loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalTiming(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_fatal_timing_is_fatal() {
        assert!(!EngineError::configuration("x").is_fatal());
        assert!(!EngineError::acquisition("ch0", "underrun").is_fatal());
        assert!(!EngineError::detection("ch0", "no peaks").is_fatal());
        assert!(!EngineError::sweep_abort(0, "timeout").is_fatal());
        assert!(EngineError::fatal_timing("clock config failed").is_fatal());
    }

    #[test]
    fn messages_include_context() {
        let err = EngineError::acquisition("master", "buffer underrun");
        assert!(err.to_string().contains("master"));
        assert!(err.to_string().contains("buffer underrun"));
    }
}
