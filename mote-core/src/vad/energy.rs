//! Energy-based VAD: RMS against a fixed calibrated threshold.
//!
//! `rms = sqrt(mean(sample^2))` over the whole window, computed in integer
//! space so large windows of full-scale samples cannot lose precision
//! before the final square root. Activity is `rms >= threshold`.
//!
//! The threshold is configuration. It never adapts to the input.

use super::{VadDecision, VoiceActivityDetector};
use crate::buffering::chunk::SampleBuffer;

pub const DEFAULT_THRESHOLD: f32 = 500.0;

/// Stateless RMS threshold detector.
#[derive(Debug, Clone, Copy)]
pub struct EnergyVad {
    threshold: f32,
}

impl EnergyVad {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Root-mean-square of a sample slice. Empty input yields 0.
    pub fn rms(samples: &[i16]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: i64 = samples.iter().map(|&s| i64::from(s) * i64::from(s)).sum();
        (sum_sq as f64 / samples.len() as f64).sqrt() as f32
    }

    /// True iff the window carries speech-level energy.
    ///
    /// The comparison is inclusive (`>=`): a window sitting exactly on the
    /// threshold is speech. A strict `rms > threshold` gate differs only on
    /// those boundary windows.
    pub fn detect(&self, samples: &[i16]) -> bool {
        !samples.is_empty() && Self::rms(samples) >= self.threshold
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn classify(&mut self, window: &SampleBuffer) -> VadDecision {
        self.detect(window.samples()).into()
    }
}
