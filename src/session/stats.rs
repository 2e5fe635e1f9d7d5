use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use crate::analysis::{SchedulerStats, ZoneRecord};

/// Lifecycle of a recording session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Acquiring,
    Recording,
    Finalizing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Acquiring => "acquiring",
            SessionState::Recording => "recording",
            SessionState::Finalizing => "finalizing",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of a recording session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    /// Current lifecycle state
    pub state: SessionState,

    /// Id of the current recording, while one is live
    pub run_id: Option<Uuid>,

    /// Seconds recorded in the current (or last) recording
    pub elapsed_secs: u64,

    /// Chunks flushed so far in the current recording
    pub buffered_chunks: usize,

    /// Bytes flushed so far in the current recording
    pub buffered_bytes: usize,

    /// Analysis counters
    pub analysis: SchedulerStats,

    /// The monitored zone
    pub zone: ZoneRecord,
}
