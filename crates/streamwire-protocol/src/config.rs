use std::time::Duration;

use streamwire_frame::{FrameConfig, DEFAULT_MAX_FRAME_LENGTH};

/// Default deadline for `send_request`.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default ceiling for a single attachment: 64 MiB.
pub const DEFAULT_MAX_ATTACHMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Default ceiling for one reassembled envelope: 1 MiB.
pub const DEFAULT_MAX_ENVELOPE_SIZE: usize = 1024 * 1024;

/// Default number of finished inbound ids remembered for dropping late
/// frames.
pub const DEFAULT_RETIRED_WINDOW: usize = 4096;

/// Per-connection behavior.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Maximum payload bytes per frame, both directions.
    pub max_frame_length: usize,
    /// Deadline applied by `send_request`.
    pub request_timeout: Duration,
    /// Largest attachment accepted from the peer, declared or observed.
    pub max_attachment_size: u64,
    /// Largest envelope accepted from the peer.
    pub max_envelope_size: usize,
    /// How many finished inbound ids are remembered. Older ones are
    /// forgotten first.
    pub retired_window: usize,
}

impl ConnectionConfig {
    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_attachment_size(mut self, max: u64) -> Self {
        self.max_attachment_size = max;
        self
    }

    pub fn with_max_envelope_size(mut self, max: usize) -> Self {
        self.max_envelope_size = max;
        self
    }

    pub fn with_retired_window(mut self, window: usize) -> Self {
        self.retired_window = window;
        self
    }

    pub(crate) fn frame_config(&self) -> FrameConfig {
        FrameConfig::new(self.max_frame_length)
    }

    /// Frame payload limit after the wire ceiling is applied.
    pub(crate) fn chunk_size(&self) -> usize {
        self.frame_config().effective_max()
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_attachment_size: DEFAULT_MAX_ATTACHMENT_SIZE,
            max_envelope_size: DEFAULT_MAX_ENVELOPE_SIZE,
            retired_window: DEFAULT_RETIRED_WINDOW,
        }
    }
}
