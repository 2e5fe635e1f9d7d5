use serde::{Deserialize, Serialize};

/// Window sent to the inference service (`POST /api/audio/analyze`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    pub audio_data: Vec<f32>,
    pub sample_rate: u32,
    /// Nominal duration of the window in milliseconds
    pub duration: u32,
}

/// Inference verdict for one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResponse {
    pub success: bool,
    #[serde(default)]
    pub is_dangerous: bool,
    #[serde(default)]
    pub danger_probability: Option<f64>,
    #[serde(default)]
    pub predictions: Option<Vec<f64>>,
    #[serde(default)]
    pub predicted_class: Option<i32>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl AnalysisResponse {
    /// Label of the predicted class, if it is one the model knows
    pub fn class_label(&self) -> Option<&'static str> {
        self.predicted_class.and_then(class_label)
    }
}

/// Labels of the seven sound classes the model predicts
pub const CLASS_LABELS: [&str; 7] = [
    "normal",
    "scream",
    "help",
    "emergency",
    "background_noise",
    "factory_noise",
    "road_noise",
];

pub fn class_label(index: i32) -> Option<&'static str> {
    usize::try_from(index)
        .ok()
        .and_then(|i| CLASS_LABELS.get(i).copied())
}

/// Storage settings as returned by `GET /storage/settings`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageSettingsMessage {
    #[serde(default)]
    pub auto_save_enabled: Option<bool>,
    #[serde(default)]
    pub retention_days: Option<u32>,
}

/// Recording upload (`POST /api/audio-files/save`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveAudioMessage {
    /// Base64-encoded artifact bytes
    pub audio_data: String,
    pub file_name: String,
}
