//! Sample codec and gain stage.
//!
//! ## Conversion
//!
//! The capture hardware delivers left-justified 32-bit words (a 24-bit MEMS
//! microphone in a 32-bit I2S slot). `encode` keeps the upper 16 bits with an
//! arithmetic shift: no dithering, no rounding.
//!
//! ## Gain
//!
//! `factor = volume / 100 * gain`, applied in f32 and saturated to the i16
//! range. Volume is clamped to `[0, 100]`, gain to `[MIN_GAIN, MAX_GAIN]`.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use crate::buffering::chunk::SampleBuffer;

pub const MIN_GAIN: f32 = 1.0;
pub const MAX_GAIN: f32 = 4.0;
pub const MAX_VOLUME: u8 = 100;
pub const DEFAULT_VOLUME: u8 = 70;

/// Convert raw hardware words to 16-bit PCM.
pub fn encode(raw: &[i32], sample_rate: u32) -> SampleBuffer {
    SampleBuffer::new(raw.iter().map(|&w| (w >> 16) as i16).collect(), sample_rate)
}

pub fn clamp_volume(volume_percent: u8) -> u8 {
    volume_percent.min(MAX_VOLUME)
}

/// Clamp a gain multiplier into the supported range. NaN maps to `MIN_GAIN`.
pub fn clamp_gain(gain: f32) -> f32 {
    if gain.is_nan() {
        return MIN_GAIN;
    }
    gain.clamp(MIN_GAIN, MAX_GAIN)
}

#[inline]
fn scale_factor(volume_percent: u8, gain: f32) -> f32 {
    f32::from(clamp_volume(volume_percent)) / 100.0 * clamp_gain(gain)
}

#[inline]
fn scale(sample: i16, factor: f32) -> i16 {
    // `as` from f32 saturates, the clamp keeps the intent explicit.
    (f32::from(sample) * factor)
        .round()
        .clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
}

/// Out-of-place gain: the source stays untouched.
pub fn apply_gain(samples: &[i16], volume_percent: u8, gain: f32) -> Vec<i16> {
    let mut out = Vec::with_capacity(samples.len());
    apply_gain_into(samples, volume_percent, gain, &mut out);
    out
}

/// Out-of-place gain into a reusable buffer (cleared first).
pub fn apply_gain_into(samples: &[i16], volume_percent: u8, gain: f32, out: &mut Vec<i16>) {
    let factor = scale_factor(volume_percent, gain);
    out.clear();
    out.extend(samples.iter().map(|&s| scale(s, factor)));
}

/// Volume and gain settings shared between the control surface and the
/// thread that applies them. Lock-free; the gain is stored as f32 bits.
#[derive(Debug)]
pub struct GainStage {
    volume: AtomicU8,
    gain_bits: AtomicU32,
}

impl GainStage {
    pub fn new(volume_percent: u8, gain: f32) -> Self {
        Self {
            volume: AtomicU8::new(clamp_volume(volume_percent)),
            gain_bits: AtomicU32::new(clamp_gain(gain).to_bits()),
        }
    }

    /// Unity stage: full volume, minimum gain.
    pub fn unity() -> Self {
        Self::new(MAX_VOLUME, MIN_GAIN)
    }

    pub fn set_volume(&self, volume_percent: u8) {
        self.volume
            .store(clamp_volume(volume_percent), Ordering::Relaxed);
    }

    pub fn volume(&self) -> u8 {
        self.volume.load(Ordering::Relaxed)
    }

    pub fn set_gain(&self, gain: f32) {
        self.gain_bits
            .store(clamp_gain(gain).to_bits(), Ordering::Relaxed);
    }

    pub fn gain(&self) -> f32 {
        f32::from_bits(self.gain_bits.load(Ordering::Relaxed))
    }

    /// True when processing would return the input unchanged.
    pub fn is_unity(&self) -> bool {
        self.volume() == MAX_VOLUME && self.gain() == MIN_GAIN
    }

    pub fn process_into(&self, samples: &[i16], out: &mut Vec<i16>) {
        apply_gain_into(samples, self.volume(), self.gain(), out);
    }

    pub fn process(&self, samples: &[i16]) -> Vec<i16> {
        apply_gain(samples, self.volume(), self.gain())
    }
}

impl Default for GainStage {
    fn default() -> Self {
        Self::new(DEFAULT_VOLUME, MIN_GAIN)
    }
}
