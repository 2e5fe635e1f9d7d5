use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::analysis::{AnalysisConfig, ZoneConfig};
use crate::audio::{CaptureConfig, ChunkConfig};

/// Raw capture and artifact handling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// How often accumulated audio is flushed into a chunk
    /// Default: 1000ms
    pub flush_interval_ms: u64,

    /// Period of the elapsed-time counter
    /// Default: 1000ms
    pub elapsed_tick_ms: u64,

    /// Where finalized recordings are written locally; `None` keeps them in memory only
    pub export_dir: Option<PathBuf>,

    /// Delete exported recordings older than the storage policy's retention
    pub prune_exports: bool,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 1000,
            elapsed_tick_ms: 1000,
            export_dir: None,
            prune_exports: true,
        }
    }
}

impl RecordingConfig {
    pub fn elapsed_tick(&self) -> Duration {
        Duration::from_millis(self.elapsed_tick_ms.max(1))
    }
}

/// Configuration for a recording session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Microphone constraints and processing graph
    pub capture: CaptureConfig,

    /// Analysis tick, timeout and alerting policy
    pub analysis: AnalysisConfig,

    /// Raw chunk capture and local export
    pub recording: RecordingConfig,

    /// The monitored zone
    pub zone: ZoneConfig,
}

impl SessionConfig {
    pub fn chunk_config(&self) -> ChunkConfig {
        ChunkConfig {
            flush_interval: Duration::from_millis(self.recording.flush_interval_ms.max(1)),
            ..ChunkConfig::new(self.capture.sample_rate, self.capture.channels)
        }
    }
}
