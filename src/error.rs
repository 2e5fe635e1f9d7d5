use std::time::Duration;

use crate::session::SessionState;

/// Failure to obtain (or keep) the microphone stream and its processing graph.
///
/// Fatal to the `start()` call that hit it. Never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AcquisitionError {
    #[error("microphone access was denied")]
    PermissionDenied,
    #[error("no audio input device available")]
    NoDevice,
    #[error("audio input device was revoked")]
    Revoked,
    #[error("unsupported capture configuration: {0}")]
    UnsupportedConfig(String),
    #[error("failed to build processing graph: {0}")]
    Graph(String),
    #[error("audio backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractError {
    #[error("audio source has been released")]
    SourceReleased,
    #[error("spectrum computation failed: {0}")]
    Spectrum(String),
}

/// A single failed analysis tick. Logged and counted, never propagated.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AnalysisError {
    #[error("inference request failed: {0}")]
    Transport(String),
    #[error("inference service rejected the window: {0}")]
    Rejected(String),
    #[error("inference request timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PersistenceError {
    #[error("storage policy lookup failed: {0}")]
    Policy(String),
    #[error("artifact upload failed: {0}")]
    Upload(String),
    #[error("local export failed: {0}")]
    Export(String),
}

/// Transport-level failure talking to the backend API.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl From<RemoteError> for AnalysisError {
    fn from(err: RemoteError) -> Self {
        AnalysisError::Transport(err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is busy ({0})")]
    Busy(SessionState),
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),
    #[error("start was cancelled before the microphone was acquired")]
    Cancelled,
    #[error("raw capture failed: {0}")]
    Capture(String),
}
