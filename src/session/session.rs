use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::Local;
use futures::future::join_all;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::artifact::RecordingArtifact;
use super::config::SessionConfig;
use super::persist::{ArtifactStore, PersistenceJob, PersistenceReport, StoragePolicySource};
use super::stats::{SessionState, SessionStatus};
use crate::analysis::{AnalysisScheduler, InferenceService, ZoneRecord, ZoneStatusReader};
use crate::audio::{AudioSource, BackendFactory, ChunkRecorder};
use crate::error::{AcquisitionError, SessionError};
use crate::events::{emit, EventSender, MonitorEvent};
use crate::remote::BackendClient;
use crate::timer::ScheduledTask;

/// External collaborators a session talks to
#[derive(Clone)]
pub struct Collaborators {
    /// Creates a fresh raw stream for every recording
    pub backends: Arc<dyn BackendFactory>,
    pub inference: Arc<dyn InferenceService>,
    pub storage_policy: Arc<dyn StoragePolicySource>,
    pub artifact_store: Arc<dyn ArtifactStore>,
}

impl Collaborators {
    /// Inference, policy and persistence all served by the backend API
    pub fn remote(backends: Arc<dyn BackendFactory>, client: BackendClient) -> Self {
        let client = Arc::new(client);
        Self {
            backends,
            inference: client.clone(),
            storage_policy: client.clone(),
            artifact_store: client,
        }
    }
}

/// Everything owned by a live recording
struct ActiveRecording {
    run_id: Uuid,
    source: AudioSource,
    recorder: ChunkRecorder,
    elapsed: ScheduledTask,
}

enum Phase {
    Idle,
    Acquiring {
        attempt: u64,
        cancel: CancellationToken,
    },
    Recording(ActiveRecording),
    Finalizing,
}

impl Phase {
    fn state(&self) -> SessionState {
        match self {
            Phase::Idle => SessionState::Idle,
            Phase::Acquiring { .. } => SessionState::Acquiring,
            Phase::Recording(_) => SessionState::Recording,
            Phase::Finalizing => SessionState::Finalizing,
        }
    }
}

struct SessionShared {
    config: SessionConfig,
    backends: Arc<dyn BackendFactory>,
    storage_policy: Arc<dyn StoragePolicySource>,
    artifact_store: Arc<dyn ArtifactStore>,
    scheduler: AnalysisScheduler,
    events: EventSender,
    phase: Mutex<Phase>,
    attempts: AtomicU64,
    elapsed_secs: Arc<AtomicU64>,
    last_artifact: Mutex<Option<RecordingArtifact>>,
    persistence: Mutex<Vec<JoinHandle<PersistenceReport>>>,
}

/// Recording session state machine
///
/// `Idle -> Acquiring -> Recording -> Finalizing -> Idle`. A session owns
/// its audio source, the raw recorder and the analysis scheduler, and is
/// reusable: every `start()` acquires a fresh source.
pub struct RecordingSession {
    shared: Arc<SessionShared>,
}

impl RecordingSession {
    pub fn new(config: SessionConfig, collaborators: Collaborators) -> Self {
        let (events, _) = broadcast::channel(256);
        let scheduler = AnalysisScheduler::new(
            config.analysis.clone(),
            config.capture.sample_rate,
            collaborators.inference,
            ZoneRecord::new(&config.zone),
            events.clone(),
        );

        info!(
            "Recording session created for zone {} ({}, {})",
            config.zone.id, config.zone.name, config.zone.area
        );

        Self {
            shared: Arc::new(SessionShared {
                config,
                backends: collaborators.backends,
                storage_policy: collaborators.storage_policy,
                artifact_store: collaborators.artifact_store,
                scheduler,
                events,
                phase: Mutex::new(Phase::Idle),
                attempts: AtomicU64::new(0),
                elapsed_secs: Arc::new(AtomicU64::new(0)),
                last_artifact: Mutex::new(None),
                persistence: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Acquire the microphone and begin recording and analysis.
    ///
    /// Valid only from `Idle`. Acquisition failures come back to the caller
    /// with the session back in `Idle`. A concurrent `stop()` or `abort()`
    /// during acquisition makes this return `SessionError::Cancelled`.
    pub async fn start(&self) -> Result<Uuid, SessionError> {
        self.shared.start().await
    }

    /// Finalize the current recording.
    ///
    /// Halts analysis and raw capture, releases the source and returns the
    /// artifact. Persistence then runs in the background. From `Idle` this is
    /// a no-op returning `None`; during acquisition it cancels the attempt.
    pub async fn stop(&self) -> Result<Option<RecordingArtifact>, SessionError> {
        let Some(active) = self.shared.begin_finalize(None) else {
            return Ok(None);
        };
        // Finalization runs to completion even if the caller stops waiting
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move { shared.finish_finalize(active).await })
            .await
            .map_err(|e| SessionError::Capture(format!("finalize task failed: {}", e)))?
    }

    /// Forced teardown: release everything immediately, discarding any
    /// buffered audio. Safe in any state.
    pub fn abort(&self) {
        self.shared.abort();
    }

    pub fn state(&self) -> SessionState {
        self.shared.phase().state()
    }

    pub fn status(&self) -> SessionStatus {
        let (state, run_id, buffered_chunks, buffered_bytes) = {
            let phase = self.shared.phase();
            match &*phase {
                Phase::Recording(active) => (
                    SessionState::Recording,
                    Some(active.run_id),
                    active.recorder.buffered_chunks(),
                    active.recorder.buffered_bytes(),
                ),
                other => (other.state(), None, 0, 0),
            }
        };

        SessionStatus {
            state,
            run_id,
            elapsed_secs: self.elapsed_secs(),
            buffered_chunks,
            buffered_bytes,
            analysis: self.shared.scheduler.stats(),
            zone: self.shared.scheduler.zone().snapshot(),
        }
    }

    /// Seconds recorded; reset on start, frozen on stop
    pub fn elapsed_secs(&self) -> u64 {
        self.shared.elapsed_secs.load(Ordering::SeqCst)
    }

    pub fn zone(&self) -> ZoneStatusReader {
        self.shared.scheduler.zone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.shared.events.subscribe()
    }

    /// Clear a latched zone alert
    pub fn acknowledge_alert(&self) -> bool {
        self.shared.scheduler.acknowledge_alert()
    }

    /// The most recently finalized recording, kept for local download
    pub fn last_artifact(&self) -> Option<RecordingArtifact> {
        lock(&self.shared.last_artifact).clone()
    }

    /// Wait for background persistence of finalized recordings
    pub async fn flush_persistence(&self) -> Vec<PersistenceReport> {
        let jobs: Vec<_> = std::mem::take(&mut *lock(&self.shared.persistence));
        join_all(jobs)
            .await
            .into_iter()
            .filter_map(|result| match result {
                Ok(report) => Some(report),
                Err(e) => {
                    error!("Persistence task failed: {}", e);
                    None
                }
            })
            .collect()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl SessionShared {
    fn phase(&self) -> MutexGuard<'_, Phase> {
        lock(&self.phase)
    }

    fn announce(&self, state: SessionState) {
        debug!("Session state: {}", state);
        emit(&self.events, MonitorEvent::StateChanged { state });
    }

    async fn start(self: &Arc<Self>) -> Result<Uuid, SessionError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        {
            let mut phase = self.phase();
            if !matches!(*phase, Phase::Idle) {
                let state = phase.state();
                warn!("start() ignored: session is {}", state);
                return Err(SessionError::Busy(state));
            }
            *phase = Phase::Acquiring {
                attempt,
                cancel: cancel.clone(),
            };
        }
        self.announce(SessionState::Acquiring);

        let backend = self.backends.create();
        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = AudioSource::acquire(backend, &self.config.capture) => Some(result),
        };

        let mut source = match acquired {
            // The backend went down with the dropped acquisition future
            None => {
                info!("Start cancelled during acquisition");
                return Err(SessionError::Cancelled);
            }
            Some(Err(e)) => {
                let was_current = {
                    let mut phase = self.phase();
                    let current = is_attempt(&phase, attempt);
                    if current {
                        *phase = Phase::Idle;
                    }
                    current
                };
                error!("Failed to acquire audio source: {}", e);
                emit(
                    &self.events,
                    MonitorEvent::AcquisitionFailed {
                        error: e.to_string(),
                    },
                );
                if was_current {
                    self.announce(SessionState::Idle);
                }
                return Err(e.into());
            }
            Some(Ok(source)) => source,
        };

        let run_id = Uuid::new_v4();
        {
            let mut phase = self.phase();
            if !is_attempt(&phase, attempt) || cancel.is_cancelled() {
                drop(phase);
                source.release();
                info!("Start cancelled after acquisition, source released");
                return Err(SessionError::Cancelled);
            }

            let (Some(frames), Some(analyser)) = (source.take_frames(), source.analyser()) else {
                *phase = Phase::Idle;
                drop(phase);
                source.release();
                return Err(SessionError::Capture("audio source has no frame feed".to_string()));
            };

            self.elapsed_secs.store(0, Ordering::SeqCst);
            let counter = Arc::clone(&self.elapsed_secs);
            let elapsed = ScheduledTask::every(
                "elapsed",
                self.config.recording.elapsed_tick(),
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
            );
            let recorder = ChunkRecorder::start(self.config.chunk_config(), frames);
            self.scheduler.start(analyser);

            if let Some(lost) = source.take_lost_signal() {
                tokio::spawn(watch_source(Arc::downgrade(self), run_id, lost));
            }

            *phase = Phase::Recording(ActiveRecording {
                run_id,
                source,
                recorder,
                elapsed,
            });
        }

        info!("Recording started: {}", run_id);
        self.announce(SessionState::Recording);
        Ok(run_id)
    }

    /// First half of finalization, shared by `stop()` and source loss.
    /// Invalidates analysis and timers before returning. With `only_run`
    /// set, a recording other than that one is left alone.
    fn begin_finalize(&self, only_run: Option<Uuid>) -> Option<ActiveRecording> {
        let mut active = {
            let mut phase = self.phase();
            match std::mem::replace(&mut *phase, Phase::Finalizing) {
                Phase::Recording(active) if only_run.map_or(true, |id| id == active.run_id) => {
                    active
                }
                Phase::Acquiring { cancel, .. } if only_run.is_none() => {
                    cancel.cancel();
                    *phase = Phase::Idle;
                    drop(phase);
                    info!("Acquisition cancelled by stop");
                    self.announce(SessionState::Idle);
                    return None;
                }
                other => {
                    debug!("stop() ignored: session is {}", other.state());
                    *phase = other;
                    return None;
                }
            }
        };

        self.scheduler.stop();
        active.elapsed.cancel();
        self.announce(SessionState::Finalizing);
        Some(active)
    }

    /// Second half: drain the recorder, release the source, assemble the
    /// artifact and hand it to persistence.
    async fn finish_finalize(
        &self,
        active: ActiveRecording,
    ) -> Result<Option<RecordingArtifact>, SessionError> {
        let ActiveRecording {
            run_id,
            mut source,
            recorder,
            elapsed,
        } = active;
        drop(elapsed);

        let chunks = recorder.stop().await;
        source.release();

        let artifact = chunks.map(|chunks| RecordingArtifact::assemble(&chunks, Local::now()));

        *self.phase() = Phase::Idle;
        self.announce(SessionState::Idle);

        let artifact = artifact?;
        info!(
            "Recording {} finalized: {} ({} bytes, {} chunks, {}s)",
            run_id,
            artifact.file_name(),
            artifact.len(),
            artifact.chunk_count(),
            self.elapsed_secs.load(Ordering::SeqCst)
        );

        *lock(&self.last_artifact) = Some(artifact.clone());
        emit(
            &self.events,
            MonitorEvent::ArtifactReady {
                file_name: artifact.file_name().to_string(),
                bytes: artifact.len(),
            },
        );

        self.spawn_persistence(artifact.clone());
        Ok(Some(artifact))
    }

    fn spawn_persistence(&self, artifact: RecordingArtifact) {
        let job = PersistenceJob {
            policy: Arc::clone(&self.storage_policy),
            store: Arc::clone(&self.artifact_store),
            export_dir: self.config.recording.export_dir.clone(),
            prune_exports: self.config.recording.prune_exports,
            events: self.events.clone(),
        };
        let handle = tokio::spawn(job.run(artifact));

        let mut jobs = lock(&self.persistence);
        jobs.retain(|job| !job.is_finished());
        jobs.push(handle);
    }

    fn abort(&self) {
        let previous = {
            let mut phase = self.phase();
            // Idle has nothing to release; a finalizer owns its resources
            if matches!(*phase, Phase::Idle | Phase::Finalizing) {
                return;
            }
            std::mem::replace(&mut *phase, Phase::Idle)
        };
        self.scheduler.stop();

        match previous {
            Phase::Idle | Phase::Finalizing => {}
            Phase::Acquiring { cancel, .. } => {
                cancel.cancel();
                info!("Acquisition aborted");
            }
            Phase::Recording(mut active) => {
                active.elapsed.cancel();
                active.recorder.abort();
                active.source.release();
                warn!(
                    "Recording {} aborted, buffered audio discarded",
                    active.run_id
                );
            }
        }
        self.announce(SessionState::Idle);
    }
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        self.abort();
    }
}

fn is_attempt(phase: &Phase, attempt: u64) -> bool {
    matches!(phase, Phase::Acquiring { attempt: current, .. } if *current == attempt)
}

/// Finalize the recording if its stream ends on its own (device revoked)
async fn watch_source(session: Weak<SessionShared>, run_id: Uuid, lost: oneshot::Receiver<()>) {
    // An error here means the source was released normally
    if lost.await.is_err() {
        return;
    }
    let Some(shared) = session.upgrade() else {
        return;
    };

    let cause = AcquisitionError::Revoked;
    warn!("Audio source lost during recording {}: {}", run_id, cause);
    emit(
        &shared.events,
        MonitorEvent::SourceLost {
            error: cause.to_string(),
        },
    );
    let Some(active) = shared.begin_finalize(Some(run_id)) else {
        return;
    };
    if let Err(e) = shared.finish_finalize(active).await {
        error!("Failed to finalize recording {} after source loss: {}", run_id, e);
    }
}
