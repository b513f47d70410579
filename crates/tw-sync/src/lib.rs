use std::time::Duration;
use tw_core::patch_protocol::DEFAULT_MAX_FRAME_BYTES;

pub mod buffer;
pub mod channel;
pub mod error;
pub mod merge;
pub mod overlay;
pub mod resync;
pub mod workflow;

pub use buffer::EventBuffer;
pub use channel::{ChannelEvent, ChannelHandle, ChannelTransport, LinkStatus, OpenOutcome};
pub use error::{DomainError, SyncError};
pub use merge::{merge_view, MergedView};
pub use overlay::{FoldOutcome, Overlay};
pub use resync::{Effect, LoadTicket, Reconciler};
pub use workflow::{ExecutionPhase, GateError, HuntWorkflow, Stage, StageState};

pub const DEFAULT_HEARTBEAT_SECS: u64 = 25;
pub const DEFAULT_LOG_BATCH: usize = 10;
pub const DEFAULT_RESYNC_DELAY_MS: u64 = 2_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTuning {
    pub heartbeat_every: Duration,
    pub batch_size: usize,
    pub resync_delay: Duration,
    pub max_frame_bytes: usize,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            heartbeat_every: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            batch_size: DEFAULT_LOG_BATCH,
            resync_delay: Duration::from_millis(DEFAULT_RESYNC_DELAY_MS),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}
