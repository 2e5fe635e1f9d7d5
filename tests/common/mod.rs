// Scripted collaborators shared by the integration tests
//
// Inference answers from a queue (optionally held until released), the storage
// policy is fixed, and the artifact store records every upload.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use zone_guard::audio::{BackendProbe, SimulatedFactory};
use zone_guard::error::{AnalysisError, PersistenceError};
use zone_guard::remote::{AnalysisRequest, AnalysisResponse, SaveAudioMessage};
use zone_guard::session::{
    ArtifactStore, Collaborators, RecordingSession, SessionConfig, StoragePolicy,
    StoragePolicySource,
};
use zone_guard::InferenceService;

pub fn verdict(dangerous: bool) -> AnalysisResponse {
    AnalysisResponse {
        success: true,
        is_dangerous: dangerous,
        danger_probability: Some(if dangerous { 0.91 } else { 0.04 }),
        predictions: None,
        predicted_class: Some(if dangerous { 1 } else { 0 }),
        message: Some("ok".to_string()),
        error: None,
    }
}

pub fn safe() -> AnalysisResponse {
    verdict(false)
}

pub fn dangerous() -> AnalysisResponse {
    verdict(true)
}

/// Answers requests in order from a script; `safe()` once the script runs out
#[derive(Default)]
pub struct ScriptedInference {
    script: Mutex<VecDeque<Result<AnalysisResponse, AnalysisError>>>,
    requests: Mutex<Vec<AnalysisRequest>>,
    calls: AtomicUsize,
    gate: Option<Semaphore>,
    always_fail: AtomicBool,
}

impl ScriptedInference {
    pub fn new(script: Vec<Result<AnalysisResponse, AnalysisError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        })
    }

    /// Every request waits for `release()` before answering
    pub fn gated(script: Vec<Result<AnalysisResponse, AnalysisError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        })
    }

    pub fn failing() -> Arc<Self> {
        let inference = Self::default();
        inference.always_fail.store(true, Ordering::SeqCst);
        Arc::new(inference)
    }

    /// Let `n` held requests answer
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<AnalysisRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl InferenceService for ScriptedInference {
    async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisResponse, AnalysisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);

        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| AnalysisError::Transport(e.to_string()))?
                .forget();
        }

        if self.always_fail.load(Ordering::SeqCst) {
            return Err(AnalysisError::Transport("connection refused".to_string()));
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(safe()))
    }
}

/// Storage policy that never changes, or always fails
pub struct FixedPolicy {
    policy: Option<StoragePolicy>,
    lookups: AtomicUsize,
}

impl FixedPolicy {
    pub fn auto_save(enabled: bool) -> Arc<Self> {
        Arc::new(Self {
            policy: Some(StoragePolicy {
                auto_save_enabled: enabled,
                retention_days: 30,
            }),
            lookups: AtomicUsize::new(0),
        })
    }

    pub fn unavailable() -> Arc<Self> {
        Arc::new(Self {
            policy: None,
            lookups: AtomicUsize::new(0),
        })
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoragePolicySource for FixedPolicy {
    async fn storage_policy(&self) -> Result<StoragePolicy, PersistenceError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.policy
            .ok_or_else(|| PersistenceError::Policy("settings service unavailable".to_string()))
    }
}

/// Keeps every upload; can be told to reject them
#[derive(Default)]
pub struct RecordingStore {
    uploads: Mutex<Vec<SaveAudioMessage>>,
    reject: AtomicBool,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn rejecting() -> Arc<Self> {
        let store = Self::default();
        store.reject.store(true, Ordering::SeqCst);
        Arc::new(store)
    }

    pub fn uploads(&self) -> Vec<SaveAudioMessage> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactStore for RecordingStore {
    async fn save(&self, upload: SaveAudioMessage) -> Result<(), PersistenceError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(PersistenceError::Upload("backend returned 500".to_string()));
        }
        self.uploads.lock().unwrap().push(upload);
        Ok(())
    }
}

/// A session over the simulated backend plus its handles
pub struct Harness {
    pub session: Arc<RecordingSession>,
    pub probe: Arc<BackendProbe>,
    pub inference: Arc<ScriptedInference>,
    pub policy: Arc<FixedPolicy>,
    pub store: Arc<RecordingStore>,
}

impl Harness {
    pub fn new(inference: Arc<ScriptedInference>) -> Self {
        Self::with(
            SessionConfig::default(),
            inference,
            FixedPolicy::auto_save(true),
            RecordingStore::new(),
        )
    }

    pub fn with(
        config: SessionConfig,
        inference: Arc<ScriptedInference>,
        policy: Arc<FixedPolicy>,
        store: Arc<RecordingStore>,
    ) -> Self {
        let probe = BackendProbe::new();
        let collaborators = Collaborators {
            backends: Arc::new(SimulatedFactory::new(Arc::clone(&probe))),
            inference: inference.clone(),
            storage_policy: policy.clone(),
            artifact_store: store.clone(),
        };

        Self {
            session: Arc::new(RecordingSession::new(config, collaborators)),
            probe,
            inference,
            policy,
            store,
        }
    }
}

/// Let spawned tasks run without moving the clock
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
