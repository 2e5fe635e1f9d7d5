use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Local};
use tracing::{debug, info, warn};

use crate::audio::{ChunkBuffer, CONTAINER_EXTENSION};
use crate::remote::SaveAudioMessage;

const FILE_PREFIX: &str = "recording_";

/// `recording_YYYYMMDD_HHMMSS.wav`
pub fn artifact_file_name(at: DateTime<Local>) -> String {
    format!(
        "{}{}.{}",
        FILE_PREFIX,
        at.format("%Y%m%d_%H%M%S"),
        CONTAINER_EXTENSION
    )
}

/// Whether `name` looks like a file this crate produced
pub fn is_artifact_file_name(name: &str) -> bool {
    name.starts_with(FILE_PREFIX) && name.ends_with(&format!(".{}", CONTAINER_EXTENSION))
}

/// The finalized recording: every chunk of one run, concatenated in
/// arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingArtifact {
    bytes: Vec<u8>,
    file_name: String,
    created_at: DateTime<Local>,
    chunk_count: usize,
}

impl RecordingArtifact {
    pub fn assemble(chunks: &ChunkBuffer, at: DateTime<Local>) -> Self {
        Self {
            bytes: chunks.assemble(),
            file_name: artifact_file_name(at),
            created_at: at,
            chunk_count: chunks.len(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn created_at(&self) -> DateTime<Local> {
        self.created_at
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// No audio was captured
    pub fn is_empty(&self) -> bool {
        self.chunk_count == 0
    }

    /// Upload message carrying the artifact base64-encoded
    pub fn to_upload(&self) -> SaveAudioMessage {
        SaveAudioMessage {
            audio_data: general_purpose::STANDARD.encode(&self.bytes),
            file_name: self.file_name.clone(),
        }
    }

    /// Write the artifact verbatim into `dir` under its generated name
    pub fn save_to(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create export directory {}", dir.display()))?;

        let path = dir.join(&self.file_name);
        fs::write(&path, &self.bytes)
            .with_context(|| format!("Failed to write recording {}", path.display()))?;

        info!("Recording saved to {} ({} bytes)", path.display(), self.bytes.len());
        Ok(path)
    }
}

/// Delete recordings in `dir` last modified more than `retention_days`
/// before `now`. A retention of 0 keeps everything.
pub fn prune_expired(dir: &Path, retention_days: u32, now: SystemTime) -> Result<Vec<PathBuf>> {
    if retention_days == 0 {
        return Ok(Vec::new());
    }

    let retention = Duration::from_secs(u64::from(retention_days) * 24 * 60 * 60);
    let cutoff = now.checked_sub(retention).unwrap_or(SystemTime::UNIX_EPOCH);
    let mut removed = Vec::new();

    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read export directory {}", dir.display()))?;

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !is_artifact_file_name(name) {
            continue;
        }

        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .with_context(|| format!("Failed to stat {}", name))?;
        if modified >= cutoff {
            continue;
        }

        match fs::remove_file(entry.path()) {
            Ok(()) => {
                debug!("Removed expired recording {}", name);
                removed.push(entry.path());
            }
            Err(e) => warn!("Failed to remove expired recording {}: {}", name, e),
        }
    }

    if !removed.is_empty() {
        info!(
            "Pruned {} recordings older than {} days from {}",
            removed.len(),
            retention_days,
            dir.display()
        );
    }

    Ok(removed)
}
