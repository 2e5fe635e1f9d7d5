use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backend::AudioFrame;
use crate::error::SessionError;

/// Container extension of the assembled recording
pub const CONTAINER_EXTENSION: &str = "wav";

/// Size marker used in streamed WAV headers where the final length is unknown
const STREAMING_SIZE: u32 = u32::MAX;

/// Raw capture configuration
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// How often accumulated audio is flushed into a chunk (default: 1s)
    pub flush_interval: Duration,
    /// Sample rate written to the header when no frame says otherwise
    pub sample_rate: u32,
    /// Channel count written to the header when no frame says otherwise
    pub channels: u16,
}

impl ChunkConfig {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            flush_interval: Duration::from_secs(1),
            sample_rate,
            channels,
        }
    }
}

/// One flushed fragment of the recording, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChunk {
    /// Chunk number (0-indexed)
    pub index: usize,
    /// Container bytes; chunk 0 carries the header
    pub bytes: Vec<u8>,
}

/// Append-only sequence of chunks for one recording
#[derive(Debug, Clone, Default)]
pub struct ChunkBuffer {
    chunks: Vec<RawChunk>,
}

impl ChunkBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment; empty fragments are ignored
    pub fn push(&mut self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        let index = self.chunks.len();
        self.chunks.push(RawChunk { index, bytes });
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.chunks.iter().map(|c| c.bytes.len()).sum()
    }

    pub fn chunks(&self) -> &[RawChunk] {
        &self.chunks
    }

    /// Concatenate every chunk in arrival order
    pub fn assemble(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_bytes());
        for chunk in &self.chunks {
            out.extend_from_slice(&chunk.bytes);
        }
        out
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }
}

#[derive(Debug, Default)]
struct RecorderStats {
    chunks: AtomicUsize,
    bytes: AtomicUsize,
}

/// Raw recorder
///
/// Receives frames from the audio source and flushes them into `RawChunk`s on a
/// fixed interval. The chunks concatenate into one streamed WAV file.
pub struct ChunkRecorder {
    cancel: CancellationToken,
    handle: Option<JoinHandle<ChunkBuffer>>,
    stats: Arc<RecorderStats>,
}

impl ChunkRecorder {
    pub fn start(config: ChunkConfig, frames: mpsc::Receiver<AudioFrame>) -> Self {
        info!(
            "Raw recorder started (flush every {}ms)",
            config.flush_interval.as_millis()
        );

        let cancel = CancellationToken::new();
        let stats = Arc::new(RecorderStats::default());
        let handle = tokio::spawn(record(
            config,
            frames,
            cancel.clone(),
            Arc::clone(&stats),
        ));

        Self {
            cancel,
            handle: Some(handle),
            stats,
        }
    }

    /// Chunks flushed so far
    pub fn buffered_chunks(&self) -> usize {
        self.stats.chunks.load(Ordering::SeqCst)
    }

    /// Bytes flushed so far
    pub fn buffered_bytes(&self) -> usize {
        self.stats.bytes.load(Ordering::SeqCst)
    }

    /// Halt capture, flush what is pending and hand back the chunks
    pub async fn stop(mut self) -> Result<ChunkBuffer, SessionError> {
        self.cancel.cancel();
        match self.handle.take() {
            Some(handle) => handle
                .await
                .map_err(|e| SessionError::Capture(format!("recorder task failed: {}", e))),
            None => Ok(ChunkBuffer::new()),
        }
    }

    /// Halt capture and discard everything buffered
    pub fn abort(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let discarded = self.buffered_bytes();
            if discarded > 0 {
                warn!("Raw recorder aborted, {} buffered bytes discarded", discarded);
            }
        }
    }
}

impl Drop for ChunkRecorder {
    fn drop(&mut self) {
        self.abort();
    }
}

async fn record(
    config: ChunkConfig,
    mut frames: mpsc::Receiver<AudioFrame>,
    cancel: CancellationToken,
    stats: Arc<RecorderStats>,
) -> ChunkBuffer {
    let mut buffer = ChunkBuffer::new();
    let mut encoder = WavStreamEncoder::new(config.sample_rate, config.channels);
    let mut flush = interval_at(Instant::now() + config.flush_interval, config.flush_interval);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = flush.tick() => flush_into(&mut encoder, &mut buffer, &stats),
            frame = frames.recv() => match frame {
                Some(frame) => encoder.write(&frame),
                None => {
                    debug!("Frame feed closed");
                    break;
                }
            },
        }
    }

    // Frames already delivered still belong to this recording
    while let Ok(frame) = frames.try_recv() {
        encoder.write(&frame);
    }

    // Final flush, like the last data event of a stopped recorder
    flush_into(&mut encoder, &mut buffer, &stats);

    info!(
        "Raw recorder stopped: {} chunks, {} bytes",
        buffer.len(),
        buffer.total_bytes()
    );

    buffer
}

fn flush_into(encoder: &mut WavStreamEncoder, buffer: &mut ChunkBuffer, stats: &RecorderStats) {
    if let Some(bytes) = encoder.flush() {
        stats.chunks.fetch_add(1, Ordering::SeqCst);
        stats.bytes.fetch_add(bytes.len(), Ordering::SeqCst);
        debug!("Chunk {} flushed ({} bytes)", buffer.len(), bytes.len());
        buffer.push(bytes);
    }
}

/// Encodes frames as 16-bit PCM WAV in flushable pieces.
///
/// The header goes out with the first non-empty flush and uses the streaming
/// size marker, since the final length is unknown while recording.
pub struct WavStreamEncoder {
    sample_rate: u32,
    channels: u16,
    header_sent: bool,
    pending: Vec<u8>,
}

impl WavStreamEncoder {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            header_sent: false,
            pending: Vec::new(),
        }
    }

    pub fn write(&mut self, frame: &AudioFrame) {
        if !self.header_sent && self.pending.is_empty() {
            // The first frame decides the format actually delivered
            self.sample_rate = frame.sample_rate;
            self.channels = frame.channels;
        }
        self.pending.reserve(frame.samples.len() * 2);
        for &sample in &frame.samples {
            self.pending.extend_from_slice(&sample_to_i16(sample).to_le_bytes());
        }
    }

    /// Take everything encoded since the last flush
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            return None;
        }

        let pcm = std::mem::take(&mut self.pending);
        if self.header_sent {
            return Some(pcm);
        }

        self.header_sent = true;
        let mut bytes = wav_header(self.sample_rate, self.channels);
        bytes.extend_from_slice(&pcm);
        Some(bytes)
    }
}

/// 44-byte PCM header with streaming size markers
pub fn wav_header(sample_rate: u32, channels: u16) -> Vec<u8> {
    let bits_per_sample: u16 = 16;
    let block_align = channels * bits_per_sample / 8;
    let byte_rate = sample_rate * block_align as u32;

    let mut header = Vec::with_capacity(44);
    header.extend_from_slice(b"RIFF");
    header.extend_from_slice(&STREAMING_SIZE.to_le_bytes());
    header.extend_from_slice(b"WAVE");
    header.extend_from_slice(b"fmt ");
    header.extend_from_slice(&16u32.to_le_bytes());
    header.extend_from_slice(&1u16.to_le_bytes()); // PCM
    header.extend_from_slice(&channels.to_le_bytes());
    header.extend_from_slice(&sample_rate.to_le_bytes());
    header.extend_from_slice(&byte_rate.to_le_bytes());
    header.extend_from_slice(&block_align.to_le_bytes());
    header.extend_from_slice(&bits_per_sample.to_le_bytes());
    header.extend_from_slice(b"data");
    header.extend_from_slice(&STREAMING_SIZE.to_le_bytes());
    header
}

/// Clamp to [-1, 1] and scale to i16
pub fn sample_to_i16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(samples: Vec<f32>) -> AudioFrame {
        AudioFrame {
            samples,
            sample_rate: 16000,
            channels: 1,
            timestamp_ms: 0,
        }
    }

    #[test]
    fn test_sample_to_i16() {
        assert_eq!(sample_to_i16(0.0), 0);
        assert_eq!(sample_to_i16(1.0), i16::MAX);
        assert_eq!(sample_to_i16(-1.0), -i16::MAX);
        assert_eq!(sample_to_i16(2.0), i16::MAX);
        assert_eq!(sample_to_i16(-2.0), -i16::MAX);
    }

    #[test]
    fn test_header_layout() {
        let header = wav_header(16000, 1);
        assert_eq!(header.len(), 44);
        assert_eq!(&header[0..4], b"RIFF");
        assert_eq!(&header[8..12], b"WAVE");
        assert_eq!(u32::from_le_bytes(header[24..28].try_into().unwrap()), 16000);
        assert_eq!(u32::from_le_bytes(header[28..32].try_into().unwrap()), 32000);
        assert_eq!(&header[36..40], b"data");
    }

    #[test]
    fn test_header_only_in_first_flush() {
        let mut encoder = WavStreamEncoder::new(16000, 1);
        assert!(encoder.flush().is_none());

        encoder.write(&frame(vec![0.0; 10]));
        let first = encoder.flush().unwrap();
        assert_eq!(first.len(), 44 + 20);

        encoder.write(&frame(vec![0.5; 10]));
        let second = encoder.flush().unwrap();
        assert_eq!(second.len(), 20);
        assert_ne!(&second[0..4], b"RIFF");
    }

    #[test]
    fn test_buffer_skips_empty_fragments() {
        let mut buffer = ChunkBuffer::new();
        buffer.push(vec![1]);
        buffer.push(Vec::new());
        buffer.push(vec![2, 3]);

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.chunks()[1].index, 1);
        assert_eq!(buffer.total_bytes(), 3);

        buffer.clear();
        assert!(buffer.is_empty());
    }
}
