//! Stub devices for hosts without audio hardware and for tests.
//!
//! `StubCapture` replays scripted frames, then produces silence (paced at the
//! sample rate when pacing is on). `StubOutput` records everything written and
//! every silence command into a shared [`OutputLog`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::{CaptureDevice, OutputDevice};
use crate::error::{MoteError, Result};

/// Capture device that replays scripted raw frames.
pub struct StubCapture {
    frames: VecDeque<Vec<i32>>,
    sample_rate: u32,
    paced: bool,
    resets: Arc<Mutex<usize>>,
}

impl StubCapture {
    /// Endless silence, paced like real hardware.
    pub fn silent(sample_rate: u32) -> Self {
        Self {
            frames: VecDeque::new(),
            sample_rate,
            paced: true,
            resets: Arc::new(Mutex::new(0)),
        }
    }

    /// Replay `frames` without pacing, then return zero-length reads.
    pub fn scripted(frames: Vec<Vec<i32>>, sample_rate: u32) -> Self {
        Self {
            frames: frames.into(),
            sample_rate,
            paced: false,
            resets: Arc::new(Mutex::new(0)),
        }
    }

    /// Shared counter of `reset` calls.
    pub fn reset_counter(&self) -> Arc<Mutex<usize>> {
        Arc::clone(&self.resets)
    }

    fn pace(&self, samples: usize) {
        if self.paced && self.sample_rate > 0 {
            let micros = samples as u64 * 1_000_000 / u64::from(self.sample_rate);
            std::thread::sleep(Duration::from_micros(micros));
        }
    }
}

impl CaptureDevice for StubCapture {
    fn read(&mut self, buf: &mut [i32]) -> Result<usize> {
        if let Some(mut frame) = self.frames.pop_front() {
            let n = frame.len().min(buf.len());
            buf[..n].copy_from_slice(&frame[..n]);
            if n < frame.len() {
                frame.drain(..n);
                self.frames.push_front(frame);
            }
            self.pace(n);
            return Ok(n);
        }

        if !self.paced {
            // Script exhausted; behave like a quiet driver timeout.
            std::thread::sleep(Duration::from_millis(5));
            return Ok(0);
        }

        buf.fill(0);
        self.pace(buf.len());
        Ok(buf.len())
    }

    fn reset(&mut self) -> Result<()> {
        *self.resets.lock() += 1;
        debug!("stub capture reset");
        Ok(())
    }
}

/// Everything a [`StubOutput`] was asked to do.
#[derive(Debug, Default, Clone)]
pub struct OutputLog {
    pub samples: Vec<i16>,
    pub writes: usize,
    pub zero_calls: usize,
    pub failed_writes: usize,
}

/// Output device that records instead of playing.
pub struct StubOutput {
    log: Arc<Mutex<OutputLog>>,
    sample_rate: u32,
    paced: bool,
    fail_writes: usize,
}

impl StubOutput {
    /// Unpaced recorder. Returns the device and a handle to its log.
    pub fn new() -> (Self, Arc<Mutex<OutputLog>>) {
        let log = Arc::new(Mutex::new(OutputLog::default()));
        (
            Self {
                log: Arc::clone(&log),
                sample_rate: 0,
                paced: false,
                fail_writes: 0,
            },
            log,
        )
    }

    /// Recorder that blocks for the real duration of each write.
    pub fn paced(sample_rate: u32) -> (Self, Arc<Mutex<OutputLog>>) {
        let (mut out, log) = Self::new();
        out.sample_rate = sample_rate;
        out.paced = sample_rate > 0;
        (out, log)
    }

    /// Make the next `n` writes fail like a transient driver error.
    pub fn fail_next_writes(&mut self, n: usize) {
        self.fail_writes = n;
    }
}

impl OutputDevice for StubOutput {
    fn write(&mut self, samples: &[i16]) -> Result<usize> {
        if self.fail_writes > 0 {
            self.fail_writes -= 1;
            self.log.lock().failed_writes += 1;
            return Err(MoteError::AudioStream("stub write failure".into()));
        }

        {
            let mut log = self.log.lock();
            log.samples.extend_from_slice(samples);
            log.writes += 1;
        }

        if self.paced {
            let micros = samples.len() as u64 * 1_000_000 / u64::from(self.sample_rate);
            std::thread::sleep(Duration::from_micros(micros));
        }
        Ok(samples.len())
    }

    fn zero(&mut self) -> Result<()> {
        self.log.lock().zero_calls += 1;
        Ok(())
    }
}
