//! Voice Activity Detection (VAD) abstraction.
//!
//! Detectors are per-window classifiers. Timing (holdoff before declaring
//! end-of-speech) belongs to the session, not to the detector.

pub mod energy;

pub use energy::EnergyVad;

use crate::buffering::chunk::SampleBuffer;

/// Whether a given window contains speech or silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    /// The window's energy is at or above threshold.
    Speech,
    /// Below threshold, or empty.
    Silence,
}

impl VadDecision {
    pub fn is_speech(self) -> bool {
        self == VadDecision::Speech
    }
}

impl From<bool> for VadDecision {
    fn from(active: bool) -> Self {
        if active {
            VadDecision::Speech
        } else {
            VadDecision::Silence
        }
    }
}

/// Trait for all VAD implementations.
pub trait VoiceActivityDetector: Send + 'static {
    /// Classify one capture window.
    fn classify(&mut self, window: &SampleBuffer) -> VadDecision;

    /// Reset any internal state. Stateless detectors ignore this.
    fn reset(&mut self) {}
}
