use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::messages::{AnalysisRequest, AnalysisResponse, SaveAudioMessage, StorageSettingsMessage};
use crate::analysis::InferenceService;
use crate::error::{AnalysisError, PersistenceError, RemoteError};
use crate::session::{ArtifactStore, StoragePolicy, StoragePolicySource};

const ANALYZE_PATH: &str = "/api/audio/analyze";
const STORAGE_SETTINGS_PATH: &str = "/storage/settings";
const SAVE_AUDIO_PATH: &str = "/api/audio-files/save";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Backend API root, e.g. `http://localhost:8080`
    pub base_url: String,
    /// Sent as a bearer token when present
    pub api_token: Option<String>,
    /// Per-request timeout
    pub timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            api_token: None,
            timeout_ms: 10_000,
        }
    }
}

/// HTTP client for the backend API: inference, storage settings and
/// recording uploads.
#[derive(Clone)]
pub struct BackendClient {
    http: Client,
    base_url: String,
    api_token: Option<String>,
}

impl BackendClient {
    pub fn new(config: &RemoteConfig) -> Result<Self, RemoteError> {
        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        info!("Backend client configured for {}", config.base_url);

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, format!("{}{}", self.base_url, path));
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    pub async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResponse, RemoteError> {
        debug!(
            "Posting {} samples for analysis ({} Hz)",
            request.audio_data.len(),
            request.sample_rate
        );
        let response = self
            .request(Method::POST, ANALYZE_PATH)
            .json(request)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn storage_settings(&self) -> Result<StorageSettingsMessage, RemoteError> {
        let response = self
            .request(Method::GET, STORAGE_SETTINGS_PATH)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn save_audio(&self, message: &SaveAudioMessage) -> Result<(), RemoteError> {
        let response = self
            .request(Method::POST, SAVE_AUDIO_PATH)
            .json(message)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

async fn check_status(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::Status {
        status: status.as_u16(),
        body,
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
    let response = check_status(response).await?;
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| RemoteError::Decode(e.to_string()))
}

#[async_trait]
impl InferenceService for BackendClient {
    async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisResponse, AnalysisError> {
        Ok(BackendClient::analyze(self, &request).await?)
    }
}

#[async_trait]
impl StoragePolicySource for BackendClient {
    async fn storage_policy(&self) -> Result<StoragePolicy, PersistenceError> {
        self.storage_settings()
            .await
            .map(StoragePolicy::from)
            .map_err(|e| PersistenceError::Policy(e.to_string()))
    }
}

#[async_trait]
impl ArtifactStore for BackendClient {
    async fn save(&self, upload: SaveAudioMessage) -> Result<(), PersistenceError> {
        self.save_audio(&upload)
            .await
            .map_err(|e| PersistenceError::Upload(e.to_string()))
    }
}
