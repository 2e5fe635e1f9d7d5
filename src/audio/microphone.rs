// Microphone backend built on cpal
//
// cpal streams are not `Send` on every host, so the stream lives on a dedicated
// audio thread. The backend keeps only the thread handle and a stop channel;
// dropping or closing the backend stops the stream. Inside a tokio runtime the
// thread is joined on the blocking pool so teardown never stalls the timers.

use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Sample, SampleFormat, Stream, StreamConfig, SupportedStreamConfig};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use super::backend::{AudioBackend, AudioFrame, BackendFactory, CaptureConfig};
use crate::error::AcquisitionError;

type FrameSender = Arc<Mutex<Option<mpsc::Sender<AudioFrame>>>>;

/// Creates a `MicrophoneBackend` per session
#[derive(Debug, Default, Clone)]
pub struct MicrophoneFactory;

impl BackendFactory for MicrophoneFactory {
    fn create(&self) -> Box<dyn AudioBackend> {
        Box::new(MicrophoneBackend::new())
    }
}

/// Captures from the default (or configured) input device
#[derive(Default)]
pub struct MicrophoneBackend {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MicrophoneBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl AudioBackend for MicrophoneBackend {
    async fn open(
        &mut self,
        config: &CaptureConfig,
    ) -> Result<mpsc::Receiver<AudioFrame>, AcquisitionError> {
        if self.is_open() {
            return Err(AcquisitionError::Backend("microphone already open".to_string()));
        }

        let (frame_tx, frame_rx) = mpsc::channel(64);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel();
        let capture = config.clone();

        let thread = std::thread::Builder::new()
            .name("zone-guard-audio".to_string())
            .spawn(move || run_capture(capture, frame_tx, ready_tx, stop_rx))
            .map_err(|e| AcquisitionError::Backend(format!("failed to spawn audio thread: {}", e)))?;

        // Stored before awaiting: if this future is dropped, Drop still stops the thread
        self.stop_tx = Some(stop_tx);
        self.thread = Some(thread);

        match ready_rx.await {
            Ok(Ok(())) => Ok(frame_rx),
            Ok(Err(e)) => {
                self.close();
                Err(e)
            }
            Err(_) => {
                self.close();
                Err(AcquisitionError::Backend(
                    "audio thread exited before the stream started".to_string(),
                ))
            }
        }
    }

    fn close(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        let Some(thread) = self.thread.take() else {
            return;
        };

        let join = move || {
            if thread.join().is_err() {
                error!("Audio thread panicked while stopping");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(join);
            }
            Err(_) => join(),
        }
    }

    fn is_open(&self) -> bool {
        self.thread.is_some()
    }

    fn name(&self) -> &str {
        "cpal microphone"
    }
}

impl Drop for MicrophoneBackend {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_capture(
    config: CaptureConfig,
    frame_tx: mpsc::Sender<AudioFrame>,
    ready_tx: oneshot::Sender<Result<(), AcquisitionError>>,
    stop_rx: std_mpsc::Receiver<()>,
) {
    let stream = match build_stream(&config, frame_tx) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(classify(e.to_string())));
        return;
    }

    if ready_tx.send(Ok(())).is_err() {
        // Nobody is waiting for the stream any more
        return;
    }

    // Block until close() signals or the backend is dropped
    let _ = stop_rx.recv();
    drop(stream);
    info!("Microphone stream stopped");
}

fn build_stream(
    config: &CaptureConfig,
    frame_tx: mpsc::Sender<AudioFrame>,
) -> Result<Stream, AcquisitionError> {
    let host = cpal::default_host();

    let device = match &config.device {
        Some(wanted) => host
            .input_devices()
            .map_err(|e| classify(e.to_string()))?
            .find(|d| d.name().map(|n| &n == wanted).unwrap_or(false))
            .ok_or(AcquisitionError::NoDevice)?,
        None => host.default_input_device().ok_or(AcquisitionError::NoDevice)?,
    };

    info!(
        "Audio input device: {}",
        device.name().unwrap_or_else(|_| "<unnamed>".to_string())
    );

    if config.echo_cancellation || config.noise_suppression {
        info!(
            "Echo cancellation / noise suppression requested; host {:?} applies no input processing",
            host.id()
        );
    }

    let supported = select_config(&device, config.sample_rate)?;
    let device_rate = supported.sample_rate().0;
    let device_channels = supported.channels();

    info!(
        "Audio config: {} Hz, {} channels, {:?} (target {} Hz, {} channels)",
        device_rate,
        device_channels,
        supported.sample_format(),
        config.sample_rate,
        config.channels
    );

    let shaper = FrameShaper::new(
        device_rate,
        device_channels,
        config.sample_rate,
        config.channels,
        config.frame_len(),
    );
    let sender: FrameSender = Arc::new(Mutex::new(Some(frame_tx)));
    let stream_config: StreamConfig = supported.config();

    match supported.sample_format() {
        SampleFormat::F32 => build_typed::<f32>(&device, &stream_config, shaper, sender),
        SampleFormat::I16 => build_typed::<i16>(&device, &stream_config, shaper, sender),
        SampleFormat::U16 => build_typed::<u16>(&device, &stream_config, shaper, sender),
        other => Err(AcquisitionError::UnsupportedConfig(format!(
            "sample format {:?}",
            other
        ))),
    }
}

fn build_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut shaper: FrameShaper,
    sender: FrameSender,
) -> Result<Stream, AcquisitionError>
where
    T: cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let data_sender = Arc::clone(&sender);

    let data_fn = move |data: &[T], _: &cpal::InputCallbackInfo| {
        let samples: Vec<f32> = data.iter().map(|&s| s.to_sample::<f32>()).collect();
        for frame in shaper.push(&samples) {
            let guard = data_sender.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(tx) = guard.as_ref() {
                if tx.try_send(frame).is_err() {
                    warn!("Audio frame dropped: consumer is not keeping up");
                }
            }
        }
    };

    let err_fn = move |err: cpal::StreamError| {
        error!("Audio stream error: {}", err);
        if matches!(err, cpal::StreamError::DeviceNotAvailable) {
            // Closing the channel tells the session the device is gone
            sender.lock().unwrap_or_else(|e| e.into_inner()).take();
        }
    };

    device
        .build_input_stream(config, data_fn, err_fn, None)
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => AcquisitionError::NoDevice,
            cpal::BuildStreamError::StreamConfigNotSupported => {
                AcquisitionError::UnsupportedConfig("stream config not supported".to_string())
            }
            other => classify(other.to_string()),
        })
}

/// Prefer a config that supports the requested rate, else the device default
fn select_config(
    device: &cpal::Device,
    sample_rate: u32,
) -> Result<SupportedStreamConfig, AcquisitionError> {
    let ranges = device
        .supported_input_configs()
        .map_err(|e| match e {
            cpal::SupportedStreamConfigsError::DeviceNotAvailable => AcquisitionError::NoDevice,
            other => classify(other.to_string()),
        })?;

    for range in ranges {
        if range.min_sample_rate().0 <= sample_rate && range.max_sample_rate().0 >= sample_rate {
            return Ok(range.with_sample_rate(cpal::SampleRate(sample_rate)));
        }
    }

    device.default_input_config().map_err(|e| match e {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => AcquisitionError::NoDevice,
        other => classify(other.to_string()),
    })
}

/// Map host error text to the acquisition taxonomy
fn classify(message: String) -> AcquisitionError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        AcquisitionError::PermissionDenied
    } else if lower.contains("no such device") || lower.contains("not available") {
        AcquisitionError::NoDevice
    } else {
        AcquisitionError::Backend(message)
    }
}

/// Downmixes, decimates and batches the raw callback buffers into frames
struct FrameShaper {
    in_channels: u16,
    out_channels: u16,
    out_rate: u32,
    step: f64,
    next: f64,
    frame_len: usize,
    pending: Vec<f32>,
    started: Instant,
}

impl FrameShaper {
    fn new(in_rate: u32, in_channels: u16, out_rate: u32, out_channels: u16, frame_len: usize) -> Self {
        let out_channels = if out_channels == 1 { 1 } else { in_channels };
        let step = in_rate as f64 / out_rate.max(1) as f64;
        // Only mono is decimated, and decimation cannot upsample: otherwise
        // frames keep the device rate
        let (step, out_rate) = if step <= 1.0 || out_channels != 1 {
            (1.0, in_rate)
        } else {
            (step, out_rate)
        };

        Self {
            in_channels,
            out_channels,
            out_rate,
            step,
            next: 0.0,
            frame_len: frame_len * out_channels as usize,
            pending: Vec::new(),
            started: Instant::now(),
        }
    }

    fn push(&mut self, interleaved: &[f32]) -> Vec<AudioFrame> {
        let mixed = if self.out_channels == 1 && self.in_channels > 1 {
            downmix(interleaved, self.in_channels)
        } else {
            interleaved.to_vec()
        };

        if self.step == 1.0 {
            self.pending.extend_from_slice(&mixed);
        } else {
            let len = mixed.len() as f64;
            while self.next < len {
                self.pending.push(mixed[self.next as usize]);
                self.next += self.step;
            }
            self.next -= len;
        }

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_len {
            let samples: Vec<f32> = self.pending.drain(..self.frame_len).collect();
            frames.push(AudioFrame {
                samples,
                sample_rate: self.out_rate,
                channels: self.out_channels,
                timestamp_ms: self.started.elapsed().as_millis() as u64,
            });
        }
        frames
    }
}

/// Average interleaved channels into mono
fn downmix(interleaved: &[f32], channels: u16) -> Vec<f32> {
    interleaved
        .chunks_exact(channels as usize)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}
