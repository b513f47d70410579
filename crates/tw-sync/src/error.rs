use thiserror::Error;
use tw_core::patch_protocol::FrameError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DomainError {
    pub message: String,
    pub fatal: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("channel transport failed: {0}")]
    Transport(String),
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),
    #[error("backend reported error: {0}")]
    Domain(#[from] DomainError),
    #[error("snapshot fetch failed: {0}")]
    Resync(String),
}

impl SyncError {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Transport(_) => "transport",
            SyncError::Auth(_) => "auth",
            SyncError::Protocol(_) => "protocol",
            SyncError::Domain(_) => "domain",
            SyncError::Resync(_) => "resync",
        }
    }

    /// Auth failures need a fresh credential; nothing retries them.
    pub fn needs_reauth(&self) -> bool {
        matches!(self, SyncError::Auth(_))
    }
}
