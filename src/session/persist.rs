use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::{info, warn};

use super::artifact::{prune_expired, RecordingArtifact};
use crate::error::PersistenceError;
use crate::events::{emit, EventSender, MonitorEvent};
use crate::remote::{SaveAudioMessage, StorageSettingsMessage};

pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Storage policy as resolved from the policy collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoragePolicy {
    pub auto_save_enabled: bool,
    pub retention_days: u32,
}

impl Default for StoragePolicy {
    fn default() -> Self {
        Self {
            auto_save_enabled: false,
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

impl From<StorageSettingsMessage> for StoragePolicy {
    fn from(message: StorageSettingsMessage) -> Self {
        let defaults = Self::default();
        Self {
            auto_save_enabled: message
                .auto_save_enabled
                .unwrap_or(defaults.auto_save_enabled),
            retention_days: message.retention_days.unwrap_or(defaults.retention_days),
        }
    }
}

/// Reports whether finalized recordings should be saved remotely
#[async_trait]
pub trait StoragePolicySource: Send + Sync {
    async fn storage_policy(&self) -> Result<StoragePolicy, PersistenceError>;
}

/// Remote home for finalized recordings
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn save(&self, upload: SaveAudioMessage) -> Result<(), PersistenceError>;
}

/// What happened to one artifact after finalization
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistenceReport {
    pub file_name: String,
    /// Local copy, if an export directory is configured
    pub exported: Option<PathBuf>,
    /// Expired exports removed
    pub pruned: usize,
    /// Policy in effect, if the lookup succeeded
    pub policy: Option<StoragePolicy>,
    pub uploaded: bool,
    pub errors: Vec<PersistenceError>,
}

/// Post-finalize handling of one artifact: local export, retention, and
/// upload when the policy asks for it. Failures are logged and reported,
/// never propagated.
pub struct PersistenceJob {
    pub policy: Arc<dyn StoragePolicySource>,
    pub store: Arc<dyn ArtifactStore>,
    pub export_dir: Option<PathBuf>,
    pub prune_exports: bool,
    pub events: EventSender,
}

impl PersistenceJob {
    pub async fn run(self, artifact: RecordingArtifact) -> PersistenceReport {
        let mut report = PersistenceReport {
            file_name: artifact.file_name().to_string(),
            ..PersistenceReport::default()
        };

        if let Some(dir) = &self.export_dir {
            match artifact.save_to(dir) {
                Ok(path) => {
                    emit(
                        &self.events,
                        MonitorEvent::ArtifactExported { path: path.clone() },
                    );
                    report.exported = Some(path);
                }
                Err(e) => self.fail(&mut report, PersistenceError::Export(format!("{:#}", e))),
            }
        }

        // Polled on every finalize; never cached
        let policy = match self.policy.storage_policy().await {
            Ok(policy) => policy,
            Err(e) => {
                self.fail(&mut report, e);
                return report;
            }
        };
        report.policy = Some(policy);

        if let (Some(dir), true) = (&self.export_dir, self.prune_exports) {
            match prune_expired(dir, policy.retention_days, SystemTime::now()) {
                Ok(removed) => report.pruned = removed.len(),
                Err(e) => self.fail(&mut report, PersistenceError::Export(format!("{:#}", e))),
            }
        }

        if !policy.auto_save_enabled {
            info!("Auto-save disabled, {} kept locally only", report.file_name);
            return report;
        }
        if artifact.is_empty() {
            info!("Recording {} is empty, skipping upload", report.file_name);
            return report;
        }

        match self.store.save(artifact.to_upload()).await {
            Ok(()) => {
                info!("Recording {} saved remotely", report.file_name);
                report.uploaded = true;
                emit(
                    &self.events,
                    MonitorEvent::Persisted {
                        file_name: report.file_name.clone(),
                    },
                );
            }
            Err(e) => self.fail(&mut report, e),
        }

        report
    }

    fn fail(&self, report: &mut PersistenceReport, error: PersistenceError) {
        warn!("Persistence of {} failed: {}", report.file_name, error);
        emit(
            &self.events,
            MonitorEvent::PersistenceFailed {
                file_name: report.file_name.clone(),
                error: error.to_string(),
            },
        );
        report.errors.push(error);
    }
}
