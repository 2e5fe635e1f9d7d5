mod client;
mod messages;

pub use client::{BackendClient, RemoteConfig};
pub use messages::{
    class_label, AnalysisRequest, AnalysisResponse, SaveAudioMessage, StorageSettingsMessage,
    CLASS_LABELS,
};
