//! Fixed-capacity drop-oldest bounded buffers per channel, tapped after
//! error calculation each iteration. A batch drain runs on a separate
//! cadence and writes the accumulated frames to external storage; the sink
//! never blocks the control loop.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::traits::ChannelRole;

/// One published telemetry row. Columns mirror the external telemetry log:
/// `Errors`, `Time`, `RealFrequency`, `LockFrequency`, `RealR`, `LockR`,
/// `Power`, `WvmFrequency`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TelemetryFrame {
    pub channel: String,
    pub error_mhz: f32,
    pub time_ms: f32,
    pub real_frequency_mhz: f64,
    pub lock_frequency_mhz: f64,
    pub real_r: f64,
    pub lock_r: f64,
    pub power_v: f32,
    pub wavemeter_frequency_thz: Option<f64>,
}

impl TelemetryFrame {
    pub fn channel_name(role: ChannelRole) -> String {
        match role {
            ChannelRole::Master => "master".to_string(),
            ChannelRole::Slave(k) => format!("slave{k}"),
        }
    }
}

/// Bounded drop-oldest queue of telemetry frames. Pushing onto a full sink
/// discards the oldest entry rather than blocking or erroring.
pub struct TelemetrySink {
    capacity: usize,
    frames: VecDeque<TelemetryFrame>,
    dropped: u64,
}

impl TelemetrySink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            frames: VecDeque::with_capacity(capacity),
            dropped: 0,
        }
    }

    /// Never blocks: drops the oldest frame if the sink is already full.
    pub fn push(&mut self, frame: TelemetryFrame) {
        if self.frames.len() >= self.capacity {
            self.frames.pop_front();
            self.dropped += 1;
        }
        self.frames.push_back(frame);
    }

    /// Drains every buffered frame for a batch write, oldest first.
    pub fn drain(&mut self) -> Vec<TelemetryFrame> {
        self.frames.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }
}
