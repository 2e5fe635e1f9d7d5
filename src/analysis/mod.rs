//! Periodic inference over the live audio and the zone state it drives.

mod scheduler;
mod zone;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AnalysisError;
use crate::remote::{AnalysisRequest, AnalysisResponse};

pub use scheduler::{AnalysisScheduler, AnalysisTicket, CompletionOutcome, SchedulerStats, TickOutcome};
pub use zone::{ZoneConfig, ZoneRecord, ZoneStatus, ZoneStatusReader, ZoneStatusStore};

/// Opaque inference boundary
#[async_trait::async_trait]
pub trait InferenceService: Send + Sync {
    async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisResponse, AnalysisError>;
}

/// How a zone leaves the alert state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertMode {
    /// Status follows every reading
    #[default]
    Follow,
    /// Alert holds until acknowledged, regardless of later safe readings
    Latch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Time between analysis ticks
    pub tick_interval_ms: u64,
    /// Nominal window duration reported to the inference service
    pub request_duration_ms: u32,
    /// Per-request timeout
    pub timeout_ms: u64,
    /// Consecutive failed ticks before analysis is reported degraded
    pub degraded_after: u32,
    pub alert_mode: AlertMode,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 3000,
            request_duration_ms: 1000,
            timeout_ms: 10_000,
            degraded_after: 3,
            alert_mode: AlertMode::Follow,
        }
    }
}

impl AnalysisConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
