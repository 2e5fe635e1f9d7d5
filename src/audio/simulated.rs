// Synthetic audio backend
//
// Produces a steady sine tone at the requested rate so the whole pipeline can run
// without hardware (`--simulate`, integration tests). A shared `BackendProbe`
// counts every acquisition and release and lets callers script failures,
// hold an acquisition open, or revoke the device mid-session.

use std::f32::consts::PI;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::backend::{AudioBackend, AudioFrame, BackendFactory, CaptureConfig};
use crate::error::AcquisitionError;

/// Observes and steers every backend created by one `SimulatedFactory`
#[derive(Debug, Default)]
pub struct BackendProbe {
    acquired: AtomicUsize,
    released: AtomicUsize,
    fail_next: Mutex<Option<AcquisitionError>>,
    gate: Mutex<Option<Arc<Notify>>>,
    live: Mutex<Option<CancellationToken>>,
}

impl BackendProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Successful acquisitions so far
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Releases of previously acquired streams so far
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Streams currently held
    pub fn outstanding(&self) -> usize {
        self.acquired() - self.released()
    }

    /// Make the next `open` fail with `err`
    pub fn fail_next(&self, err: AcquisitionError) {
        *lock(&self.fail_next) = Some(err);
    }

    /// Hold every subsequent `open` until `open_gate` is called
    pub fn hold_acquisition(&self) {
        *lock(&self.gate) = Some(Arc::new(Notify::new()));
    }

    /// Let held acquisitions (and future ones) complete
    pub fn open_gate(&self) {
        if let Some(gate) = lock(&self.gate).take() {
            gate.notify_one();
        }
    }

    /// Simulate the device disappearing: the live stream ends without a release
    pub fn revoke(&self) {
        if let Some(token) = lock(&self.live).take() {
            info!("Simulated device revoked");
            token.cancel();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Sine tone parameters
#[derive(Debug, Clone, Copy)]
pub struct Tone {
    pub frequency_hz: f32,
    pub amplitude: f32,
}

impl Default for Tone {
    fn default() -> Self {
        Self {
            frequency_hz: 440.0,
            amplitude: 0.25,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedFactory {
    probe: Arc<BackendProbe>,
    tone: Tone,
}

impl SimulatedFactory {
    pub fn new(probe: Arc<BackendProbe>) -> Self {
        Self {
            probe,
            tone: Tone::default(),
        }
    }

    pub fn with_tone(mut self, tone: Tone) -> Self {
        self.tone = tone;
        self
    }

    pub fn probe(&self) -> Arc<BackendProbe> {
        Arc::clone(&self.probe)
    }
}

impl BackendFactory for SimulatedFactory {
    fn create(&self) -> Box<dyn AudioBackend> {
        Box::new(SimulatedBackend {
            probe: Arc::clone(&self.probe),
            tone: self.tone,
            running: None,
        })
    }
}

pub struct SimulatedBackend {
    probe: Arc<BackendProbe>,
    tone: Tone,
    running: Option<CancellationToken>,
}

#[async_trait::async_trait]
impl AudioBackend for SimulatedBackend {
    async fn open(
        &mut self,
        config: &CaptureConfig,
    ) -> Result<mpsc::Receiver<AudioFrame>, AcquisitionError> {
        if self.running.is_some() {
            return Err(AcquisitionError::Backend("simulated stream already open".to_string()));
        }

        let gate = lock(&self.probe.gate).clone();
        if let Some(gate) = gate {
            debug!("Simulated acquisition held");
            gate.notified().await;
        }

        if let Some(err) = lock(&self.probe.fail_next).take() {
            return Err(err);
        }

        let (tx, rx) = mpsc::channel(64);
        let token = CancellationToken::new();
        tokio::spawn(generate(config.clone(), self.tone, tx, token.clone()));

        *lock(&self.probe.live) = Some(token.clone());
        self.running = Some(token);
        self.probe.acquired.fetch_add(1, Ordering::SeqCst);

        info!(
            "Simulated stream opened ({}Hz, {} channels)",
            config.sample_rate, config.channels
        );

        Ok(rx)
    }

    fn close(&mut self) {
        if let Some(token) = self.running.take() {
            token.cancel();
            self.probe.released.fetch_add(1, Ordering::SeqCst);
            debug!("Simulated stream closed");
        }
    }

    fn is_open(&self) -> bool {
        self.running.is_some()
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

impl Drop for SimulatedBackend {
    fn drop(&mut self) {
        self.close();
    }
}

async fn generate(
    config: CaptureConfig,
    tone: Tone,
    tx: mpsc::Sender<AudioFrame>,
    token: CancellationToken,
) {
    let frame_len = config.frame_len();
    let period = Duration::from_millis(config.frame_ms.max(1));
    let mut ticker = tokio::time::interval(period);
    let mut phase = 0u64;
    let mut elapsed_ms = 0u64;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let mut samples = Vec::with_capacity(frame_len * config.channels as usize);
        for _ in 0..frame_len {
            let t = phase as f32 / config.sample_rate as f32;
            let value = tone.amplitude * (2.0 * PI * tone.frequency_hz * t).sin();
            for _ in 0..config.channels {
                samples.push(value);
            }
            phase += 1;
        }

        let frame = AudioFrame {
            samples,
            sample_rate: config.sample_rate,
            channels: config.channels,
            timestamp_ms: elapsed_ms,
        };
        elapsed_ms += config.frame_ms;

        if tx.send(frame).await.is_err() {
            break;
        }
    }
}
