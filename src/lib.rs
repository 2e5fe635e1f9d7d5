pub mod analysis;
pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod remote;
pub mod session;
pub mod timer;

pub use analysis::{
    AlertMode, AnalysisConfig, AnalysisScheduler, AnalysisTicket, InferenceService, ZoneRecord,
    ZoneStatus, ZoneStatusReader, ZoneStatusStore,
};
pub use audio::{
    AnalyserTap, AudioBackend, AudioFrame, AudioSource, AudioWindow, BackendFactory,
    CaptureConfig, ChunkBuffer, ChunkRecorder, MicrophoneFactory, SimulatedFactory,
    WindowExtractor, WINDOW_LEN,
};
pub use config::Config;
pub use error::{
    AcquisitionError, AnalysisError, ExtractError, PersistenceError, RemoteError, SessionError,
};
pub use events::MonitorEvent;
pub use remote::{AnalysisRequest, AnalysisResponse, BackendClient, RemoteConfig};
pub use session::{
    ArtifactStore, Collaborators, RecordingArtifact, RecordingSession, SessionConfig,
    SessionState, SessionStatus, StoragePolicy, StoragePolicySource,
};
