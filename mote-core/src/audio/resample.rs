//! Rate conversion between device-native rates and the 16 kHz wire rate.
//!
//! Capture converts device → wire before the codec sees the samples; output
//! converts wire → device inside `CpalOutput::write`. Both run on the
//! capture or playback thread, never in a cpal callback, so allocation is
//! fine here.
//!
//! rubato's `FastFixedIn` wants exactly `chunk` input frames per call.
//! Leftover input stays queued until the next call; `reset` drops it along
//! with the filter history (used when capture is flushed and on `zero`).

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{error, info};

use crate::error::{MoteError, Result};

/// Mono f32 converter. Passthrough when both rates match.
pub struct RateConverter {
    inner: Option<Inner>,
    from_rate: u32,
    to_rate: u32,
}

struct Inner {
    resampler: FastFixedIn<f32>,
    queued: Vec<f32>,
    chunk: usize,
    // rubato writes into a per-channel buffer.
    block: Vec<Vec<f32>>,
}

impl RateConverter {
    pub fn new(from_rate: u32, to_rate: u32, chunk: usize) -> Result<Self> {
        if from_rate == to_rate || from_rate == 0 || to_rate == 0 {
            return Ok(Self {
                inner: None,
                from_rate,
                to_rate,
            });
        }

        let chunk = chunk.max(1);
        let resampler = FastFixedIn::<f32>::new(
            f64::from(to_rate) / f64::from(from_rate),
            1.0,
            PolynomialDegree::Cubic,
            chunk,
            1,
        )
        .map_err(|e| MoteError::AudioDevice(format!("resampler init: {e}")))?;
        let block = vec![vec![0f32; resampler.output_frames_max()]];

        info!(from_rate, to_rate, chunk, "resampling enabled");
        Ok(Self {
            inner: Some(Inner {
                resampler,
                queued: Vec::with_capacity(chunk * 2),
                chunk,
                block,
            }),
            from_rate,
            to_rate,
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    pub fn rates(&self) -> (u32, u32) {
        (self.from_rate, self.to_rate)
    }

    /// Input frames waiting for a full chunk.
    pub fn queued(&self) -> usize {
        self.inner.as_ref().map_or(0, |i| i.queued.len())
    }

    /// Convert `input` and append whatever is ready to `out`.
    pub fn process_into(&mut self, input: &[f32], out: &mut Vec<f32>) {
        let Some(inner) = self.inner.as_mut() else {
            out.extend_from_slice(input);
            return;
        };

        inner.queued.extend_from_slice(input);
        let mut consumed = 0;
        while inner.queued.len() - consumed >= inner.chunk {
            let window = &inner.queued[consumed..consumed + inner.chunk];
            match inner
                .resampler
                .process_into_buffer(&[window], &mut inner.block, None)
            {
                Ok((_, produced)) => out.extend_from_slice(&inner.block[0][..produced]),
                Err(e) => error!("resampler: {e}"),
            }
            consumed += inner.chunk;
        }
        inner.queued.drain(..consumed);
    }

    /// 16-bit PCM in, normalised f32 out. Used on the playback path.
    pub fn process_pcm_into(&mut self, pcm: &[i16], out: &mut Vec<f32>) {
        let float: Vec<f32> = pcm.iter().map(|&s| f32::from(s) / 32_768.0).collect();
        self.process_into(&float, out);
    }

    pub fn reset(&mut self) {
        if let Some(inner) = self.inner.as_mut() {
            inner.queued.clear();
            inner.resampler.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_rates_pass_through() {
        let mut rc = RateConverter::new(16_000, 16_000, 480).unwrap();
        assert!(rc.is_passthrough());
        let mut out = vec![9.0];
        rc.process_into(&[0.5, -0.5], &mut out);
        assert_eq!(out, vec![9.0, 0.5, -0.5]);
        assert_eq!(rc.queued(), 0);
    }

    #[test]
    fn downsample_by_three_yields_a_third() {
        let mut rc = RateConverter::new(48_000, 16_000, 480).unwrap();
        assert_eq!(rc.rates(), (48_000, 16_000));
        let mut out = Vec::new();
        rc.process_into(&vec![0.0; 960], &mut out);
        assert!(out.len().abs_diff(320) <= 10, "got {}", out.len());
    }

    #[test]
    fn partial_chunks_wait_for_more_input() {
        let mut rc = RateConverter::new(48_000, 16_000, 480).unwrap();
        let mut out = Vec::new();
        rc.process_into(&vec![0.0; 300], &mut out);
        assert!(out.is_empty());
        assert_eq!(rc.queued(), 300);
        rc.process_into(&vec![0.0; 300], &mut out);
        assert!(!out.is_empty());
        assert_eq!(rc.queued(), 120);
    }

    #[test]
    fn reset_drops_queued_input() {
        let mut rc = RateConverter::new(16_000, 48_000, 480).unwrap();
        let mut out = Vec::new();
        rc.process_pcm_into(&[1_000; 400], &mut out);
        rc.reset();
        assert_eq!(rc.queued(), 0);
        rc.process_pcm_into(&[1_000; 400], &mut out);
        assert!(out.is_empty());
    }
}
