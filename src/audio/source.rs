use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::analyser::AnalyserTap;
use super::backend::{AudioBackend, AudioFrame, CaptureConfig};
use crate::error::{AcquisitionError, ExtractError};

/// Live microphone stream plus the processing graph built on it.
///
/// Owns three handles: the raw stream (backend), the graph context (the pump
/// task feeding the analyser and the recorder), and the analyser node. They are
/// either all live or all gone: a failed acquisition rolls back whatever it
/// opened, and `release()` tears down all three. A source is never reused;
/// every session acquires a fresh one.
pub struct AudioSource {
    stream: Option<Box<dyn AudioBackend>>,
    context: Option<JoinHandle<()>>,
    analyser: Option<AnalyserTap>,
    frames: Option<mpsc::Receiver<AudioFrame>>,
    lost: Option<oneshot::Receiver<()>>,
}

impl AudioSource {
    /// Open the stream and build the processing graph on it
    pub async fn acquire(
        mut backend: Box<dyn AudioBackend>,
        config: &CaptureConfig,
    ) -> Result<Self, AcquisitionError> {
        info!(
            "Acquiring audio source via {} ({}Hz, {} channels, fft {})",
            backend.name(),
            config.sample_rate,
            config.channels,
            config.fft_size
        );

        let raw_rx = backend.open(config).await?;

        let analyser = match AnalyserTap::new(config.fft_size, config.smoothing) {
            Ok(analyser) => analyser,
            Err(e) => {
                warn!("Processing graph failed, closing stream: {}", e);
                backend.close();
                return Err(e);
            }
        };

        let (record_tx, record_rx) = mpsc::channel(256);
        let (lost_tx, lost_rx) = oneshot::channel();
        let context = tokio::spawn(pump(raw_rx, analyser.clone(), record_tx, lost_tx));

        info!("Audio source acquired");

        Ok(Self {
            stream: Some(backend),
            context: Some(context),
            analyser: Some(analyser),
            frames: Some(record_rx),
            lost: Some(lost_rx),
        })
    }

    /// Whether the stream and graph are still held
    pub fn is_live(&self) -> bool {
        self.analyser.is_some()
    }

    /// Handle to the analyser node for window extraction
    pub fn analyser(&self) -> Option<AnalyserTap> {
        self.analyser.clone()
    }

    /// Current `fft_size` raw samples
    pub fn read_snapshot(&self) -> Result<Vec<f32>, ExtractError> {
        self.analyser
            .as_ref()
            .ok_or(ExtractError::SourceReleased)?
            .time_domain()
    }

    /// Frame feed for the raw recorder. Can be taken once.
    pub fn take_frames(&mut self) -> Option<mpsc::Receiver<AudioFrame>> {
        self.frames.take()
    }

    /// Resolves if the stream ends while the source is still held (device lost).
    /// Errors out when the source is released normally.
    pub fn take_lost_signal(&mut self) -> Option<oneshot::Receiver<()>> {
        self.lost.take()
    }

    /// Tear down graph, context and stream, in that order. Idempotent.
    pub fn release(&mut self) {
        let was_live = self.analyser.is_some();

        if let Some(analyser) = self.analyser.take() {
            analyser.disconnect();
        }
        if let Some(context) = self.context.take() {
            context.abort();
        }
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
        self.frames = None;
        self.lost = None;

        if was_live {
            info!("Audio source released");
        }
    }
}

impl Drop for AudioSource {
    fn drop(&mut self) {
        self.release();
    }
}

async fn pump(
    mut raw: mpsc::Receiver<AudioFrame>,
    analyser: AnalyserTap,
    record_tx: mpsc::Sender<AudioFrame>,
    lost_tx: oneshot::Sender<()>,
) {
    let mut recorder = Some(record_tx);

    while let Some(frame) = raw.recv().await {
        if !analyser.push(&to_mono(&frame)) {
            return;
        }

        if let Some(tx) = &recorder {
            if tx.send(frame).await.is_err() {
                debug!("Recorder detached from audio source");
                recorder = None;
            }
        }
    }

    if analyser.is_connected() {
        warn!("Audio stream ended while the source was still held");
        let _ = lost_tx.send(());
    }
}

fn to_mono(frame: &AudioFrame) -> Vec<f32> {
    if frame.channels <= 1 {
        return frame.samples.clone();
    }

    let channels = frame.channels as usize;
    frame
        .samples
        .chunks_exact(channels)
        .map(|c| c.iter().sum::<f32>() / channels as f32)
        .collect()
}
