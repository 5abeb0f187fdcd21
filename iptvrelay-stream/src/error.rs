use thiserror::Error;

use crate::session::SessionState;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("No free port in {start}-{end} after {attempts} attempts")]
    PortExhausted { start: u16, end: u16, attempts: u32 },

    #[error("Invalid mode: {0}")]
    InvalidMode(String),

    #[error("Upstream rejected the request: HTTP {status}")]
    UpstreamUnauthorized { status: u16 },

    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("Classification ambiguous: {0}")]
    ClassificationAmbiguous(String),

    #[error("Unsupported source: {0}")]
    UnsupportedSource(String),

    #[error("Transcoder failed to start: {0}")]
    TranscoderStartFailed(String),

    #[error("Transcoder crashed: {0}")]
    TranscoderCrashed(String),

    #[error("Restart budget exceeded: {restarts} restarts within {window_secs}s")]
    RestartBudgetExceeded { restarts: u32, window_secs: u64 },

    #[error("Client disconnected")]
    ClientDisconnected,

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type RelayResult<T> = Result<T, RelayError>;

impl RelayError {
    /// Fatal errors end a session even when it is live. Everything else is a
    /// restart trigger for live sessions.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::PortExhausted { .. }
            | Self::InvalidMode(_)
            | Self::UpstreamUnauthorized { .. }
            | Self::UnsupportedSource(_)
            | Self::TranscoderStartFailed(_)
            | Self::RestartBudgetExceeded { .. }
            | Self::SessionNotFound(_)
            | Self::Internal(_) => true,
            Self::UpstreamUnreachable(_)
            | Self::ClassificationAmbiguous(_)
            | Self::TranscoderCrashed(_)
            | Self::ClientDisconnected
            | Self::Io(_) => false,
        }
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Error surfaced to the caller when a session terminates abnormally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("session {session_id} failed while {state}: {error}")]
pub struct SessionError {
    pub session_id: String,
    /// Last state before the session moved to `Error`.
    pub state: SessionState,
    pub error: RelayError,
}
