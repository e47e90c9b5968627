use std::time::Duration;

use forkwire_frame::{FrameConfig, ProtocolVariant};
use forkwire_transport::DEFAULT_BUFFER_CAPACITY;

/// Delay between two ticks of the periodic flusher.
pub const DEFAULT_FLUSH_PERIOD: Duration = Duration::from_millis(100);

/// How long the controller waits for a worker to present its session id.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Node-level settings shared by the worker and controller sides.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Text encoding used on the wire.
    pub variant: ProtocolVariant,
    /// Capacity of the event buffer. Default: 64 KiB.
    pub buffer_capacity: usize,
    /// Flusher tick. Default: 100 ms.
    pub flush_period: Duration,
    /// Decoder limits and socket timeouts.
    pub frame: FrameConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            variant: ProtocolVariant::default(),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            flush_period: DEFAULT_FLUSH_PERIOD,
            frame: FrameConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn with_variant(mut self, variant: ProtocolVariant) -> Self {
        self.variant = variant;
        self
    }

    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn with_flush_period(mut self, period: Duration) -> Self {
        self.flush_period = period;
        self
    }

    pub fn with_frame_config(mut self, frame: FrameConfig) -> Self {
        self.frame = frame;
        self
    }
}
