use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::AcquisitionError;

/// Block of captured audio, already converted to the requested rate and channel count
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Samples in [-1.0, 1.0], interleaved when `channels > 1`
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    /// Timestamp in milliseconds since the stream was opened
    pub timestamp_ms: u64,
}

/// Constraints used when opening the input stream and building the processing graph
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Requested sample rate (the inference service expects 16kHz)
    pub sample_rate: u32,
    /// Requested channel count (1 = mono)
    pub channels: u16,
    /// Ask the platform for echo cancellation where it offers it
    pub echo_cancellation: bool,
    /// Ask the platform for noise suppression where it offers it
    pub noise_suppression: bool,
    /// Analysis window size of the processing graph (power of two)
    pub fft_size: usize,
    /// Smoothing constant for the frequency view, in [0, 1]
    pub smoothing: f32,
    /// Frame size delivered by the backend in milliseconds
    pub frame_ms: u64,
    /// Input device name; `None` picks the default input device
    pub device: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            echo_cancellation: true,
            noise_suppression: true,
            fft_size: 2048,
            smoothing: 0.8,
            frame_ms: 100,
            device: None,
        }
    }
}

impl CaptureConfig {
    /// Number of samples per channel in one backend frame
    pub fn frame_len(&self) -> usize {
        (self.sample_rate as u64 * self.frame_ms / 1000).max(1) as usize
    }
}

/// Raw input stream
///
/// Implementations:
/// - `MicrophoneBackend`: cpal default (or named) input device
/// - `SimulatedBackend`: synthetic signal for tests and dry runs
#[async_trait::async_trait]
pub trait AudioBackend: Send {
    /// Open the stream
    ///
    /// Returns a channel receiver that will receive audio frames. The channel
    /// closes when the stream ends (released, or the device went away).
    async fn open(
        &mut self,
        config: &CaptureConfig,
    ) -> Result<mpsc::Receiver<AudioFrame>, AcquisitionError>;

    /// Stop every track of the stream. Calling it on a closed backend is a no-op.
    fn close(&mut self);

    /// Check if the stream is currently open
    fn is_open(&self) -> bool;

    /// Backend name for logging
    fn name(&self) -> &str;
}

/// Hands out a fresh backend for every recording session
pub trait BackendFactory: Send + Sync {
    fn create(&self) -> Box<dyn AudioBackend>;
}
