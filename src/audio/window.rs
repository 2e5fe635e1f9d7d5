//! Fixed-size analysis windows for the inference service.
//!
//! The model consumes a mel-spectrogram of shape 128 x 63 x 1, so every window
//! handed to it carries exactly [`WINDOW_LEN`] samples regardless of how many
//! raw samples the analyser held.

use super::analyser::AnalyserTap;
use crate::error::ExtractError;

/// Model input length: 128 x 63 x 1
pub const WINDOW_LEN: usize = 128 * 63;

/// Exactly [`WINDOW_LEN`] samples
#[derive(Debug, Clone, PartialEq)]
pub struct AudioWindow {
    samples: Vec<f32>,
}

impl AudioWindow {
    /// Fit a raw snapshot to the model input length
    pub fn from_raw(raw: &[f32]) -> Self {
        Self {
            samples: fit_to_length(raw, WINDOW_LEN),
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }
}

/// Resample or pad `raw` to exactly `target` samples.
///
/// Longer input is reduced by nearest-previous selection at a uniform stride:
/// output `i` is `raw[floor(i * raw.len() / target)]`. No interpolation, no
/// filtering, so the same input always yields the same window. Shorter input
/// is zero-padded at the tail.
pub fn fit_to_length(raw: &[f32], target: usize) -> Vec<f32> {
    let len = raw.len();

    if len > target {
        // Integer floor keeps the index exact for any length
        (0..target).map(|i| raw[i * len / target]).collect()
    } else {
        let mut out = Vec::with_capacity(target);
        out.extend_from_slice(raw);
        out.resize(target, 0.0);
        out
    }
}

/// Pulls a window from the live analyser
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowExtractor;

impl WindowExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Read the analyser's current `fft_size` raw samples and fit them to the model input.
    ///
    /// Never blocks on the capture pump beyond the analyser lock. Fails fast if
    /// the source was released.
    pub fn extract(&self, tap: &AnalyserTap) -> Result<AudioWindow, ExtractError> {
        let raw = tap.time_domain()?;
        Ok(AudioWindow::from_raw(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_len_matches_model_shape() {
        assert_eq!(WINDOW_LEN, 8064);
    }

    #[test]
    fn test_exact_length_passes_through() {
        let raw: Vec<f32> = (0..WINDOW_LEN).map(|i| i as f32).collect();
        assert_eq!(fit_to_length(&raw, WINDOW_LEN), raw);
    }

    #[test]
    fn test_downsample_picks_floor_indices() {
        let raw: Vec<f32> = (0..10).map(|i| i as f32).collect();
        assert_eq!(fit_to_length(&raw, 4), vec![0.0, 2.0, 5.0, 7.0]);
    }

    #[test]
    fn test_short_input_is_zero_padded() {
        let out = fit_to_length(&[0.5, -0.5], 5);
        assert_eq!(out, vec![0.5, -0.5, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_empty_input_is_all_zero() {
        let window = AudioWindow::from_raw(&[]);
        assert_eq!(window.len(), WINDOW_LEN);
        assert!(window.samples().iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_extract_from_released_tap_fails() {
        let tap = AnalyserTap::new(2048, 0.8).unwrap();
        tap.push(&[0.25; 2048]);
        let window = WindowExtractor::new().extract(&tap).unwrap();
        assert_eq!(window.len(), WINDOW_LEN);
        assert!(window.samples()[..2048].iter().all(|&s| s == 0.25));
        assert!(window.samples()[2048..].iter().all(|&s| s == 0.0));

        tap.disconnect();
        assert_eq!(
            WindowExtractor::new().extract(&tap),
            Err(ExtractError::SourceReleased)
        );
    }
}
