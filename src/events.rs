use std::path::PathBuf;

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::session::SessionState;

/// Everything the monitor reports to its readers (UI, CLI, logs)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    StateChanged {
        state: SessionState,
    },
    AcquisitionFailed {
        error: String,
    },
    /// The device went away mid-recording; the recording was finalized
    SourceLost {
        error: String,
    },
    DangerDetected {
        zone_id: u32,
        predicted_class: Option<i32>,
        label: Option<String>,
        danger_probability: Option<f64>,
        at: DateTime<Local>,
    },
    AnalysisDegraded {
        consecutive_failures: u32,
    },
    AnalysisRecovered,
    ArtifactReady {
        file_name: String,
        bytes: usize,
    },
    ArtifactExported {
        path: PathBuf,
    },
    Persisted {
        file_name: String,
    },
    PersistenceFailed {
        file_name: String,
        error: String,
    },
}

pub type EventSender = broadcast::Sender<MonitorEvent>;

/// Publish to whoever is listening; having no listeners is fine
pub fn emit(events: &EventSender, event: MonitorEvent) {
    let _ = events.send(event);
}
