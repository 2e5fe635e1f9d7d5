use std::collections::VecDeque;
use std::f32::consts::PI;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use realfft::{RealFftPlanner, RealToComplex};

use crate::error::{AcquisitionError, ExtractError};

/// Floor for the frequency view when a bin carries no energy
pub const MIN_DECIBELS: f32 = -100.0;

const MIN_FFT_SIZE: usize = 32;
const MAX_FFT_SIZE: usize = 32768;

/// Analysis node of the processing graph.
///
/// Holds the most recent `fft_size` raw samples pushed by the capture pump.
/// Time-domain snapshots are the raw samples; the frequency view is smoothed
/// across calls with the configured time constant. Once disconnected every read
/// fails with [`ExtractError::SourceReleased`].
#[derive(Clone)]
pub struct AnalyserTap {
    inner: Arc<Mutex<AnalyserState>>,
}

struct AnalyserState {
    fft_size: usize,
    smoothing: f32,
    ring: VecDeque<f32>,
    connected: bool,
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    smoothed: Vec<f32>,
}

impl AnalyserTap {
    pub fn new(fft_size: usize, smoothing: f32) -> Result<Self, AcquisitionError> {
        if !fft_size.is_power_of_two() || !(MIN_FFT_SIZE..=MAX_FFT_SIZE).contains(&fft_size) {
            return Err(AcquisitionError::Graph(format!(
                "fft size {} must be a power of two in {}..={}",
                fft_size, MIN_FFT_SIZE, MAX_FFT_SIZE
            )));
        }
        if !(0.0..=1.0).contains(&smoothing) {
            return Err(AcquisitionError::Graph(format!(
                "smoothing constant {} must be within [0, 1]",
                smoothing
            )));
        }

        let fft = RealFftPlanner::<f32>::new().plan_fft_forward(fft_size);

        Ok(Self {
            inner: Arc::new(Mutex::new(AnalyserState {
                fft_size,
                smoothing,
                ring: VecDeque::with_capacity(fft_size),
                connected: true,
                fft,
                window: blackman(fft_size),
                smoothed: vec![0.0; fft_size / 2],
            })),
        })
    }

    fn state(&self) -> MutexGuard<'_, AnalyserState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn fft_size(&self) -> usize {
        self.state().fft_size
    }

    /// Append captured samples. Returns false once the tap is disconnected.
    pub fn push(&self, samples: &[f32]) -> bool {
        let mut state = self.state();
        if !state.connected {
            return false;
        }

        let fft_size = state.fft_size;
        let skip = samples.len().saturating_sub(fft_size);
        state.ring.extend(&samples[skip..]);
        let excess = state.ring.len().saturating_sub(fft_size);
        state.ring.drain(..excess);
        true
    }

    /// Exactly `fft_size` raw samples, oldest first. Zero-filled at the front
    /// until enough audio has arrived.
    pub fn time_domain(&self) -> Result<Vec<f32>, ExtractError> {
        let state = self.state();
        if !state.connected {
            return Err(ExtractError::SourceReleased);
        }
        Ok(state.snapshot())
    }

    /// Root-mean-square level of the current window
    pub fn rms(&self) -> Result<f32, ExtractError> {
        let samples = self.time_domain()?;
        let sum: f32 = samples.iter().map(|s| s * s).sum();
        Ok((sum / samples.len() as f32).sqrt())
    }

    /// Smoothed magnitude spectrum in dB, `fft_size / 2` bins
    pub fn frequency_db(&self) -> Result<Vec<f32>, ExtractError> {
        let mut state = self.state();
        if !state.connected {
            return Err(ExtractError::SourceReleased);
        }

        let samples = state.snapshot();
        let mut input: Vec<f32> = samples
            .iter()
            .zip(&state.window)
            .map(|(s, w)| s * w)
            .collect();
        let mut spectrum = state.fft.make_output_vec();
        state
            .fft
            .process(&mut input, &mut spectrum)
            .map_err(|e| ExtractError::Spectrum(e.to_string()))?;

        let scale = 1.0 / state.fft_size as f32;
        let tau = state.smoothing;
        let AnalyserState { smoothed, .. } = &mut *state;
        for (bin, value) in smoothed.iter_mut().zip(&spectrum) {
            *bin = tau * *bin + (1.0 - tau) * value.norm() * scale;
        }

        Ok(smoothed
            .iter()
            .map(|&m| {
                if m > 0.0 {
                    (20.0 * m.log10()).max(MIN_DECIBELS)
                } else {
                    MIN_DECIBELS
                }
            })
            .collect())
    }

    /// Detach from the capture pump. Idempotent.
    pub fn disconnect(&self) {
        let mut state = self.state();
        state.connected = false;
        state.ring.clear();
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }
}

impl AnalyserState {
    fn snapshot(&self) -> Vec<f32> {
        let mut out = vec![0.0; self.fft_size - self.ring.len()];
        out.extend(self.ring.iter().copied());
        out
    }
}

impl fmt::Debug for AnalyserTap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("AnalyserTap")
            .field("fft_size", &state.fft_size)
            .field("smoothing", &state.smoothing)
            .field("buffered", &state.ring.len())
            .field("connected", &state.connected)
            .finish()
    }
}

fn blackman(len: usize) -> Vec<f32> {
    let n = len as f32;
    (0..len)
        .map(|i| {
            let x = i as f32 / n;
            0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
        })
        .collect()
}
