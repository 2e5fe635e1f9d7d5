use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::analysis::{AnalysisConfig, ZoneConfig};
use crate::audio::CaptureConfig;
use crate::remote::RemoteConfig;
use crate::session::{RecordingConfig, SessionConfig};

/// Looked up (as `config/zone-guard.toml`) when no path is given
pub const DEFAULT_CONFIG_PATH: &str = "config/zone-guard";

/// Environment overrides, e.g. `ZONE_GUARD_REMOTE__BASE_URL`
pub const ENV_PREFIX: &str = "ZONE_GUARD";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub remote: RemoteConfig,
    pub audio: CaptureConfig,
    pub analysis: AnalysisConfig,
    pub recording: RecordingConfig,
    pub zone: ZoneConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    /// Log filter used when `RUST_LOG` is not set
    pub log_filter: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "zone-guard".to_string(),
            log_filter: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from an optional file plus environment overrides.
    ///
    /// An explicit `path` must exist; without one, `config/zone-guard.toml`
    /// is used if present. Fields missing everywhere take their defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_PATH).required(false),
        };

        let settings = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?;

        let mut cfg: Config = settings
            .try_deserialize()
            .context("Invalid configuration")?;

        if let Some(dir) = cfg.recording.export_dir.take() {
            cfg.recording.export_dir = Some(expand_path(&dir));
        }

        Ok(cfg)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            capture: self.audio.clone(),
            analysis: self.analysis.clone(),
            recording: self.recording.clone(),
            zone: self.zone.clone(),
        }
    }
}

/// Expand `~` and environment variables in a configured path
pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.into_owned()),
        Err(_) => PathBuf::from(shellexpand::tilde(&raw).into_owned()),
    }
}
