//! Audio hardware seams and the codec/gain stage.
//!
//! # Collaborator contracts
//!
//! - [`CaptureDevice::read`] blocks until hardware words are available and
//!   returns how many were written into the caller's buffer.
//! - [`OutputDevice::write`] blocks at the hardware sample rate. It is the
//!   only thing that paces playback.
//! - [`OutputDevice::zero`] silences the output immediately.
//!
//! Driver failures are transient: callers log them, treat the call as
//! zero-effect, and move on to the next cycle.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS), so neither trait requires `Send`. Devices are built by a `Send`
//! factory closure on the thread that will use and drop them.

pub mod codec;
pub mod stub;

#[cfg(feature = "audio-cpal")]
mod cpal_backend;
#[cfg(feature = "audio-cpal")]
pub mod resample;

#[cfg(feature = "audio-cpal")]
pub use cpal_backend::{CpalCapture, CpalOutput};

use crate::error::Result;

/// Microphone-side hardware.
pub trait CaptureDevice {
    /// Fill `buf` with raw left-justified 32-bit hardware words.
    fn read(&mut self, buf: &mut [i32]) -> Result<usize>;

    /// Discard any stale samples queued in the hardware path.
    fn reset(&mut self) -> Result<()>;
}

/// Speaker-side hardware.
pub trait OutputDevice {
    /// Write 16-bit PCM, blocking until the hardware has room.
    /// Returns the number of samples accepted.
    fn write(&mut self, samples: &[i16]) -> Result<usize>;

    /// Stop and silence output, dropping anything queued.
    fn zero(&mut self) -> Result<()>;
}

impl<T: CaptureDevice + ?Sized> CaptureDevice for Box<T> {
    fn read(&mut self, buf: &mut [i32]) -> Result<usize> {
        (**self).read(buf)
    }

    fn reset(&mut self) -> Result<()> {
        (**self).reset()
    }
}

impl<T: OutputDevice + ?Sized> OutputDevice for Box<T> {
    fn write(&mut self, samples: &[i16]) -> Result<usize> {
        (**self).write(samples)
    }

    fn zero(&mut self) -> Result<()> {
        (**self).zero()
    }
}
