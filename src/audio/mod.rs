pub mod analyser;
pub mod backend;
pub mod chunk;
pub mod microphone;
pub mod simulated;
pub mod source;
pub mod window;

pub use analyser::AnalyserTap;
pub use backend::{AudioBackend, AudioFrame, BackendFactory, CaptureConfig};
pub use chunk::{ChunkBuffer, ChunkConfig, ChunkRecorder, RawChunk, CONTAINER_EXTENSION};
pub use microphone::{MicrophoneBackend, MicrophoneFactory};
pub use simulated::{BackendProbe, SimulatedFactory, Tone};
pub use source::AudioSource;
pub use window::{fit_to_length, AudioWindow, WindowExtractor, WINDOW_LEN};
