use chatline_core::wire::DEFAULT_MAX_FRAME_BYTES;
use std::time::Duration;
use url::Url;

pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8000/ws";
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub ws_url: Url,
    /// Bound on a turn with no completion or error signal.
    pub stall_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub max_frame_bytes: usize,
}

impl SyncConfig {
    pub fn new(ws_url: Url) -> Self {
        Self {
            ws_url,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            backoff_initial: DEFAULT_BACKOFF_INITIAL,
            backoff_max: DEFAULT_BACKOFF_MAX,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}
