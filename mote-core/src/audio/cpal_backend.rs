//! `cpal`-backed capture and output devices.
//!
//! # Design constraints
//!
//! cpal callbacks run on an OS audio thread at elevated priority. They must
//! not allocate, block on a mutex, or perform I/O. Both adapters therefore
//! talk to their callback through a lock-free SPSC `ringbuf` ring:
//!
//! ```text
//! capture:  input callback ──push_slice──► ring ──► read() → resample → i32 words
//! output:   write() → resample ──push_slice──► ring ──► output callback (silence on empty)
//! ```
//!
//! The output ring is kept short (about 100 ms) so that `write` blocks while
//! it is full. That back-pressure is what paces the playback scheduler at
//! the hardware rate.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, SampleFormat, Stream, StreamConfig,
};
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};
use tracing::{error, info, warn};

use super::{resample::RateConverter, CaptureDevice, OutputDevice};
use crate::error::{MoteError, Result};

/// Capture ring: 2 s at 48 kHz.
const CAPTURE_RING_CAPACITY: usize = 96_000;
/// How long `read` waits for the callback before returning zero samples.
const CAPTURE_READ_TIMEOUT: Duration = Duration::from_millis(250);
/// Output ring length in milliseconds of device audio.
const OUTPUT_RING_MS: usize = 100;
/// `write` gives up when the callback has not drained anything for this long.
const OUTPUT_STALL_TIMEOUT: Duration = Duration::from_secs(1);
/// Upper bound on waiting for the callback to drop queued audio.
const FLUSH_ACK_TIMEOUT: Duration = Duration::from_millis(100);
const POLL_INTERVAL: Duration = Duration::from_millis(2);
const RESAMPLE_CHUNK: usize = 480;

fn pick_device(
    candidates: std::result::Result<impl Iterator<Item = Device>, cpal::DevicesError>,
    default: Option<Device>,
    preferred_name: Option<&str>,
    kind: &str,
) -> Option<Device> {
    let mut devices: Vec<Device> = match candidates {
        Ok(devices) => devices.collect(),
        Err(e) => {
            warn!("failed to list {kind} devices: {e}");
            Vec::new()
        }
    };

    if let Some(preferred) = preferred_name {
        if let Some(idx) = devices
            .iter()
            .position(|d| d.name().map(|n| n == preferred).unwrap_or(false))
        {
            return Some(devices.swap_remove(idx));
        }
        warn!(preferred, "preferred {kind} device not found, falling back");
    }

    if default.is_some() {
        return default;
    }
    if !devices.is_empty() {
        warn!("no default {kind} device, falling back to first available");
        return Some(devices.swap_remove(0));
    }
    None
}

#[inline]
fn f32_to_word(sample: f32) -> i32 {
    (sample.clamp(-1.0, 1.0) * i32::MAX as f32) as i32
}

/// Microphone opened through cpal, downmixed to mono and resampled to the
/// wire rate.
///
/// **Not `Send`**: create and drop it on the capture thread.
pub struct CpalCapture {
    _stream: Stream,
    consumer: HeapCons<f32>,
    converter: RateConverter,
    scratch: Vec<f32>,
    pending: Vec<f32>,
    running: Arc<AtomicBool>,
}

impl CpalCapture {
    /// Open an input device by preferred name, otherwise the default input,
    /// otherwise the first one listed.
    pub fn open(preferred_device_name: Option<&str>, target_rate: u32) -> Result<Self> {
        let host = cpal::default_host();
        let device = pick_device(
            host.input_devices(),
            host.default_input_device(),
            preferred_device_name,
            "input",
        )
        .ok_or(MoteError::NoDefaultInputDevice)?;

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| MoteError::AudioDevice(e.to_string()))?;
        let device_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(device_rate, channels, "input config selected");

        let config = StreamConfig {
            channels,
            sample_rate: supported.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        let (mut producer, consumer) = HeapRb::<f32>::new(CAPTURE_RING_CAPACITY).split();
        let running = Arc::new(AtomicBool::new(true));
        let ch = channels as usize;

        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                let running = Arc::clone(&running);
                let mut mix: Vec<f32> = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[f32], _info| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }
                        downmix_into(data, ch, &mut mix, |s| s);
                        push_or_warn(&mut producer, &mix);
                    },
                    |err| error!("input stream error: {err}"),
                    None,
                )
            }
            SampleFormat::I16 => {
                let running = Arc::clone(&running);
                let mut mix: Vec<f32> = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[i16], _info| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }
                        downmix_into(data, ch, &mut mix, |s| f32::from(s) / 32768.0);
                        push_or_warn(&mut producer, &mix);
                    },
                    |err| error!("input stream error: {err}"),
                    None,
                )
            }
            SampleFormat::I32 => {
                let running = Arc::clone(&running);
                let mut mix: Vec<f32> = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[i32], _info| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }
                        downmix_into(data, ch, &mut mix, |s| s as f32 / 2_147_483_648.0);
                        push_or_warn(&mut producer, &mix);
                    },
                    |err| error!("input stream error: {err}"),
                    None,
                )
            }
            fmt => {
                return Err(MoteError::AudioStream(format!(
                    "unsupported input sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| MoteError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| MoteError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            consumer,
            converter: RateConverter::new(device_rate, target_rate, RESAMPLE_CHUNK)?,
            scratch: vec![0f32; RESAMPLE_CHUNK * 4],
            pending: Vec::new(),
            running,
        })
    }
}

fn downmix_into<T: Copy>(
    data: &[T],
    channels: usize,
    out: &mut Vec<f32>,
    conv: impl Fn(T) -> f32,
) {
    let channels = channels.max(1);
    let frames = data.len() / channels;
    out.resize(frames, 0.0);
    for (f, slot) in out.iter_mut().enumerate() {
        let base = f * channels;
        let sum: f32 = data[base..base + channels].iter().map(|&s| conv(s)).sum();
        *slot = sum / channels as f32;
    }
}

fn push_or_warn(producer: &mut HeapProd<f32>, samples: &[f32]) {
    let written = producer.push_slice(samples);
    if written < samples.len() {
        warn!("capture ring full: dropped {} frames", samples.len() - written);
    }
}

impl CaptureDevice for CpalCapture {
    fn read(&mut self, buf: &mut [i32]) -> Result<usize> {
        let deadline = Instant::now() + CAPTURE_READ_TIMEOUT;
        while self.pending.len() < buf.len() {
            let n = self.consumer.pop_slice(&mut self.scratch);
            if n == 0 {
                if !self.pending.is_empty() || Instant::now() >= deadline {
                    break;
                }
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }
            self.converter
                .process_into(&self.scratch[..n], &mut self.pending);
        }

        let n = buf.len().min(self.pending.len());
        for (dst, src) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *dst = f32_to_word(src);
        }
        Ok(n)
    }

    fn reset(&mut self) -> Result<()> {
        let dropped = self.consumer.clear();
        self.converter.reset();
        self.pending.clear();
        tracing::debug!(dropped, "capture path reset");
        Ok(())
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Speaker opened through cpal. Mono input is duplicated to every channel.
///
/// **Not `Send`**: create and drop it on the playback thread.
pub struct CpalOutput {
    _stream: Stream,
    producer: HeapProd<f32>,
    converter: RateConverter,
    flush: Arc<AtomicBool>,
}

impl CpalOutput {
    /// Open an output device by preferred name, otherwise the default output,
    /// otherwise the first one listed. `source_rate` is the rate of the PCM
    /// handed to `write`.
    pub fn open(preferred_device_name: Option<&str>, source_rate: u32) -> Result<Self> {
        let host = cpal::default_host();
        let device = pick_device(
            host.output_devices(),
            host.default_output_device(),
            preferred_device_name,
            "output",
        )
        .ok_or(MoteError::NoDefaultOutputDevice)?;

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening output device"
        );

        let supported = device
            .default_output_config()
            .map_err(|e| MoteError::AudioDevice(e.to_string()))?;
        let device_rate = supported.sample_rate().0;
        let channels = supported.channels() as usize;
        info!(device_rate, channels, "output config selected");

        let config = StreamConfig {
            channels: supported.channels(),
            sample_rate: supported.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        let ring_len = (device_rate as usize * OUTPUT_RING_MS / 1000).max(RESAMPLE_CHUNK);
        let (producer, mut consumer) = HeapRb::<f32>::new(ring_len).split();
        let flush = Arc::new(AtomicBool::new(false));
        let flush_cb = Arc::clone(&flush);

        let stream = match supported.sample_format() {
            SampleFormat::F32 => device.build_output_stream(
                &config,
                move |data: &mut [f32], _info| {
                    fill_frames(data, channels, &mut consumer, &flush_cb, |s| s);
                },
                |err| error!("output stream error: {err}"),
                None,
            ),
            SampleFormat::I16 => device.build_output_stream(
                &config,
                move |data: &mut [i16], _info| {
                    fill_frames(data, channels, &mut consumer, &flush_cb, |s| {
                        (s.clamp(-1.0, 1.0) * 32767.0) as i16
                    });
                },
                |err| error!("output stream error: {err}"),
                None,
            ),
            SampleFormat::U16 => device.build_output_stream(
                &config,
                move |data: &mut [u16], _info| {
                    fill_frames(data, channels, &mut consumer, &flush_cb, |s| {
                        ((s.clamp(-1.0, 1.0) * 32767.0) + 32768.0) as u16
                    });
                },
                |err| error!("output stream error: {err}"),
                None,
            ),
            fmt => {
                return Err(MoteError::AudioStream(format!(
                    "unsupported output sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| MoteError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| MoteError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            producer,
            converter: RateConverter::new(source_rate, device_rate, RESAMPLE_CHUNK)?,
            flush,
        })
    }
}

fn fill_frames<T: Copy>(
    data: &mut [T],
    channels: usize,
    consumer: &mut HeapCons<f32>,
    flush: &AtomicBool,
    conv: impl Fn(f32) -> T,
) {
    if flush.swap(false, Ordering::AcqRel) {
        consumer.clear();
    }
    for frame in data.chunks_mut(channels.max(1)) {
        let value = conv(consumer.try_pop().unwrap_or(0.0));
        for out in frame.iter_mut() {
            *out = value;
        }
    }
}

impl OutputDevice for CpalOutput {
    fn write(&mut self, samples: &[i16]) -> Result<usize> {
        let mut converted = Vec::with_capacity(samples.len() * 3);
        self.converter.process_pcm_into(samples, &mut converted);

        let mut offset = 0;
        let mut last_progress = Instant::now();
        while offset < converted.len() {
            let n = self.producer.push_slice(&converted[offset..]);
            if n > 0 {
                offset += n;
                last_progress = Instant::now();
                continue;
            }
            if last_progress.elapsed() >= OUTPUT_STALL_TIMEOUT {
                return Err(MoteError::AudioStream("output callback stalled".into()));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        Ok(samples.len())
    }

    fn zero(&mut self) -> Result<()> {
        self.converter.reset();
        if self.producer.occupied_len() == 0 {
            return Ok(());
        }
        // The callback owns the consumer half; wait for it to acknowledge the
        // flush so a following write is not swallowed by it.
        self.flush.store(true, Ordering::Release);
        let deadline = Instant::now() + FLUSH_ACK_TIMEOUT;
        while self.flush.load(Ordering::Acquire) {
            if Instant::now() >= deadline {
                return Err(MoteError::AudioStream("output flush not acknowledged".into()));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }
}
