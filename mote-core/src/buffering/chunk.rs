//! Typed sample buffer passed from the codec stage to VAD, framing and playback.

/// A contiguous block of mono 16-bit PCM samples at a known sample rate.
///
/// Immutable once produced by the codec; whoever accepts it takes ownership
/// (the message framer on the way out, the playback ring on the way in).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleBuffer {
    samples: Vec<i16>,
    sample_rate: u32,
}

impl SampleBuffer {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns true if the buffer contains no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposes_samples_and_rate() {
        let buf = SampleBuffer::new(vec![1, -2, 3], 16_000);
        assert_eq!(buf.samples(), &[1, -2, 3]);
        assert_eq!(buf.sample_rate(), 16_000);
        assert_eq!(buf.len(), 3);
        assert!(!buf.is_empty());
        assert!(SampleBuffer::new(Vec::new(), 16_000).is_empty());
    }
}
