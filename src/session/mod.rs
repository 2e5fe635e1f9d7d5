//! Recording session management
//!
//! This module provides the `RecordingSession` state machine that manages:
//! - Microphone acquisition and release
//! - Raw chunk capture and artifact assembly
//! - Periodic analysis of the live audio
//! - Local export, retention and remote persistence of finished recordings

mod artifact;
mod config;
mod persist;
mod session;
mod stats;

pub use artifact::{artifact_file_name, is_artifact_file_name, prune_expired, RecordingArtifact};
pub use config::{RecordingConfig, SessionConfig};
pub use persist::{
    ArtifactStore, PersistenceJob, PersistenceReport, StoragePolicy, StoragePolicySource,
    DEFAULT_RETENTION_DAYS,
};
pub use session::{Collaborators, RecordingSession};
pub use stats::{SessionState, SessionStatus};
