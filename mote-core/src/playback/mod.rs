//! Buffered playback: a bounded sample ring fed by the session and drained by
//! a dedicated scheduler thread that paces itself on the output device.
//!
//! ## Lifecycle
//!
//! ```text
//! PlaybackEngine::new()
//!     └─► start(factory)     → output opened on the playback thread
//!         ├─► produce()      → network audio into the ring (never blocks long)
//!         ├─► finish_stream()→ drain what is buffered, then Completed
//!         ├─► interrupt()    → ring cleared now, output silenced next cycle
//!         └─► stop()         → thread exits, output zeroed and dropped
//! ```
//!
//! The engine handle is cheap to clone. Control calls are flag writes or
//! bounded-lock ring operations, so they are safe from the async main loop.
//! State and lifecycle events are published by the scheduler alone.

pub mod scheduler;

use std::sync::{
    atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use thread_priority::{set_current_thread_priority, ThreadPriority};
use tracing::{debug, info, warn};

pub use scheduler::Scheduler;

use crate::{
    audio::{codec::GainStage, OutputDevice},
    buffering::SampleRing,
    error::{MoteError, Result},
};

/// Tunables for the playback ring and scheduler.
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Ring capacity in seconds of audio. Default: 60.
    pub capacity_secs: u32,
    /// Occupancy that ends `Buffering`. Default: 16 000 (1 s at 16 kHz).
    pub start_threshold: usize,
    /// Samples dequeued per output write. Default: 2 048 (128 ms).
    pub chunk_samples: usize,
    /// Sleep between checks of an empty ring. Default: 20 ms.
    pub underrun_wait: Duration,
    /// Consecutive starvation tolerated before aborting. Default: 5 s.
    pub underrun_timeout: Duration,
    /// Bounded wait for the ring lock. Default: 20 ms.
    pub lock_wait: Duration,
    /// Longest time spent below threshold before starting anyway. Default: 2 s.
    pub max_buffering_wait: Duration,
    /// Initial output volume in percent. Default: 70.
    pub volume: u8,
    /// Initial playback gain multiplier. Default: 1.0.
    pub gain: f32,
    /// Ask the OS for maximum priority on the playback thread. Default: true.
    pub elevate_priority: bool,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            capacity_secs: 60,
            start_threshold: 16_000,
            chunk_samples: 2_048,
            underrun_wait: Duration::from_millis(20),
            underrun_timeout: Duration::from_secs(5),
            lock_wait: Duration::from_millis(20),
            max_buffering_wait: Duration::from_secs(2),
            volume: crate::audio::codec::DEFAULT_VOLUME,
            gain: crate::audio::codec::MIN_GAIN,
            elevate_priority: true,
        }
    }
}

/// The scheduler's relationship to the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    /// Nothing buffered, nothing playing.
    #[default]
    Idle,
    /// Audio arriving, waiting for the start threshold.
    Buffering,
    /// Draining while the stream is still open.
    Playing,
    /// Stream finished; draining what is left.
    Draining,
}

impl PlaybackState {
    pub fn is_playing(self) -> bool {
        matches!(self, PlaybackState::Playing | PlaybackState::Draining)
    }
}

/// Outcome of the playback thread's priority request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadPriorityStatus {
    /// Thread not started, or elevation disabled.
    #[default]
    NotRequested,
    Elevated,
    /// The OS refused (usually missing privileges). Playback runs anyway.
    Refused,
}

impl ThreadPriorityStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ThreadPriorityStatus::Elevated,
            2 => ThreadPriorityStatus::Refused,
            _ => ThreadPriorityStatus::NotRequested,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ThreadPriorityStatus::NotRequested => 0,
            ThreadPriorityStatus::Elevated => 1,
            ThreadPriorityStatus::Refused => 2,
        }
    }
}

/// Request maximum priority for the calling thread. Failure is logged, not fatal.
fn elevate_current_thread() -> ThreadPriorityStatus {
    match set_current_thread_priority(ThreadPriority::Max) {
        Ok(()) => {
            info!("playback thread priority raised");
            ThreadPriorityStatus::Elevated
        }
        Err(e) => {
            warn!("could not raise playback thread priority: {e:?}");
            ThreadPriorityStatus::Refused
        }
    }
}

/// Lifecycle notifications from the scheduler thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// Output started with this many samples buffered.
    Started { buffered: usize },
    /// A finished stream drained to empty.
    Completed,
    /// Starved past the underrun budget; playback aborted.
    TimedOut,
    /// A hard stop was applied and the output silenced.
    Interrupted,
}

#[derive(Default)]
pub struct PlaybackDiagnostics {
    pub produced: AtomicUsize,
    pub dropped: AtomicUsize,
    pub played: AtomicUsize,
    pub underruns: AtomicUsize,
    pub timeouts: AtomicUsize,
    pub interrupts: AtomicUsize,
    pub lock_timeouts: AtomicUsize,
    pub write_errors: AtomicUsize,
}

impl PlaybackDiagnostics {
    pub fn snapshot(&self) -> PlaybackSnapshot {
        PlaybackSnapshot {
            produced: self.produced.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            played: self.played.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            interrupts: self.interrupts.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackSnapshot {
    pub produced: usize,
    pub dropped: usize,
    pub played: usize,
    pub underruns: usize,
    pub timeouts: usize,
    pub interrupts: usize,
    pub lock_timeouts: usize,
    pub write_errors: usize,
}

/// State shared between the control handle and the scheduler thread.
pub(crate) struct Shared {
    pub(crate) config: PlaybackConfig,
    pub(crate) ring: SampleRing,
    pub(crate) state: Mutex<PlaybackState>,
    pub(crate) finished: AtomicBool,
    pub(crate) interrupt: AtomicBool,
    pub(crate) running: AtomicBool,
    pub(crate) consumer_claimed: AtomicBool,
    priority: AtomicU8,
    pub(crate) gain: GainStage,
    pub(crate) diagnostics: PlaybackDiagnostics,
    pub(crate) events_tx: Sender<PlaybackEvent>,
    events_rx: Receiver<PlaybackEvent>,
}

impl Shared {
    pub(crate) fn emit(&self, event: PlaybackEvent) {
        debug!(?event, "playback event");
        let _ = self.events_tx.send(event);
    }
}

/// Control handle for the playback path. Clone freely.
#[derive(Clone)]
pub struct PlaybackEngine {
    shared: Arc<Shared>,
}

impl PlaybackEngine {
    /// Allocate the ring (zero-filled, reused for the process lifetime).
    pub fn new(config: PlaybackConfig, sample_rate: u32) -> Self {
        let ring = SampleRing::with_duration(sample_rate, config.capacity_secs, config.lock_wait);
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let gain = GainStage::new(config.volume, config.gain);

        info!(
            capacity = ring.capacity(),
            start_threshold = config.start_threshold,
            chunk = config.chunk_samples,
            "playback ring allocated"
        );

        Self {
            shared: Arc::new(Shared {
                config,
                ring,
                state: Mutex::new(PlaybackState::Idle),
                finished: AtomicBool::new(false),
                interrupt: AtomicBool::new(false),
                running: AtomicBool::new(false),
                consumer_claimed: AtomicBool::new(false),
                priority: AtomicU8::new(0),
                gain,
                diagnostics: PlaybackDiagnostics::default(),
                events_tx,
                events_rx,
            }),
        }
    }

    /// Queue samples for playback. Returns how many were accepted.
    ///
    /// A short count is backpressure: the ring was full or its lock was busy
    /// past the bounded wait. The remainder is dropped and counted.
    pub fn produce(&self, samples: &[i16]) -> usize {
        if samples.is_empty() {
            return 0;
        }
        let diag = &self.shared.diagnostics;
        let accepted = match self.shared.ring.push(samples) {
            Some(n) => n,
            None => {
                diag.lock_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(samples = samples.len(), "playback ring busy, dropping audio");
                0
            }
        };

        diag.produced.fetch_add(accepted, Ordering::Relaxed);
        let dropped = samples.len() - accepted;
        if dropped > 0 {
            diag.dropped.fetch_add(dropped, Ordering::Relaxed);
            debug!(accepted, dropped, "playback backpressure");
        }
        accepted
    }

    /// Mark the current turn's stream as complete. Idempotent.
    pub fn finish_stream(&self) {
        if !self.shared.finished.swap(true, Ordering::AcqRel) {
            debug!(
                buffered = self.shared.ring.approx_occupied(),
                "playback stream finished"
            );
        }
    }

    /// Hard stop: discard everything buffered right now and have the
    /// scheduler silence the output on its next cycle. Safe in any state.
    ///
    /// Returns the number of samples discarded.
    pub fn interrupt(&self) -> usize {
        // Serialised against `produce` by the ring lock.
        let discarded = self.shared.ring.clear();
        self.shared.finished.store(false, Ordering::Release);
        self.shared.interrupt.store(true, Ordering::Release);
        self.shared
            .diagnostics
            .interrupts
            .fetch_add(1, Ordering::Relaxed);
        info!(discarded, "playback interrupted");
        discarded
    }

    /// Last state published by the scheduler.
    pub fn state(&self) -> PlaybackState {
        *self.shared.state.lock()
    }

    /// True while audio is coming out of the speaker.
    pub fn is_playing(&self) -> bool {
        !self.shared.interrupt.load(Ordering::Acquire) && self.state().is_playing()
    }

    /// True while anything is buffered or the scheduler is not idle.
    pub fn is_active(&self) -> bool {
        if self.shared.interrupt.load(Ordering::Acquire) {
            return false;
        }
        self.state() != PlaybackState::Idle || self.shared.ring.approx_occupied() > 0
    }

    /// Approximate buffered sample count (lock-free).
    pub fn buffered(&self) -> usize {
        self.shared.ring.approx_occupied()
    }

    pub fn set_volume(&self, volume_percent: u8) {
        self.shared.gain.set_volume(volume_percent);
    }

    pub fn volume(&self) -> u8 {
        self.shared.gain.volume()
    }

    pub fn set_gain(&self, gain: f32) {
        self.shared.gain.set_gain(gain);
    }

    pub fn gain(&self) -> f32 {
        self.shared.gain.gain()
    }

    /// A receiver for scheduler lifecycle events. All receivers share one
    /// queue: each event goes to exactly one of them.
    pub fn events(&self) -> Receiver<PlaybackEvent> {
        self.shared.events_rx.clone()
    }

    pub fn diagnostics(&self) -> PlaybackSnapshot {
        self.shared.diagnostics.snapshot()
    }

    pub fn thread_priority(&self) -> ThreadPriorityStatus {
        ThreadPriorityStatus::from_u8(self.shared.priority.load(Ordering::Acquire))
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.shared.config
    }

    /// Claim the single consumer side of the ring.
    ///
    /// # Errors
    /// `MoteError::AlreadyRunning` if a scheduler is already alive.
    pub fn scheduler(&self) -> Result<Scheduler> {
        if self.shared.consumer_claimed.swap(true, Ordering::AcqRel) {
            return Err(MoteError::AlreadyRunning);
        }
        Ok(Scheduler::new(Arc::clone(&self.shared)))
    }

    /// Spawn the playback thread. The output device is built by `factory` on
    /// that thread, since real devices are not `Send`. Blocks until the device
    /// is open (or failed to open).
    pub fn start<F, O>(&self, factory: F) -> Result<JoinHandle<()>>
    where
        F: FnOnce() -> Result<O> + Send + 'static,
        O: OutputDevice + 'static,
    {
        let mut scheduler = self.scheduler()?;
        let shared = Arc::clone(&self.shared);
        shared.running.store(true, Ordering::SeqCst);

        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<()>>();

        let handle = std::thread::Builder::new()
            .name("mote-playback".into())
            .spawn(move || {
                if shared.config.elevate_priority {
                    let status = elevate_current_thread();
                    shared.priority.store(status.as_u8(), Ordering::Release);
                }

                let mut output = match factory() {
                    Ok(o) => {
                        let _ = open_tx.send(Ok(()));
                        o
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        shared.running.store(false, Ordering::SeqCst);
                        return;
                    }
                };

                info!("playback thread started");
                while shared.running.load(Ordering::Acquire) {
                    scheduler.step(&mut output);
                }
                if let Err(e) = output.zero() {
                    warn!("output zero on shutdown failed: {e}");
                }
                info!("playback thread stopped");
            })
            .map_err(MoteError::Io)?;

        match open_rx.recv() {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                self.shared.running.store(false, Ordering::SeqCst);
                Err(MoteError::Other(anyhow::anyhow!(
                    "playback thread died unexpectedly"
                )))
            }
        }
    }

    /// Ask the playback thread to exit after its current cycle.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for PlaybackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackEngine")
            .field("state", &self.state())
            .field("ring", &self.shared.ring)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> PlaybackConfig {
        PlaybackConfig {
            capacity_secs: 1,
            ..PlaybackConfig::default()
        }
    }

    #[test]
    fn produce_reports_backpressure_and_counts_drops() {
        let engine = PlaybackEngine::new(small_config(), 1_000);
        // 1 s at 1 kHz plus the reserved slot: 1 000 usable.
        assert_eq!(engine.produce(&[1; 600]), 600);
        assert_eq!(engine.produce(&[1; 600]), 400);
        assert_eq!(engine.produce(&[1; 10]), 0);

        let diag = engine.diagnostics();
        assert_eq!(diag.produced, 1_000);
        assert_eq!(diag.dropped, 210);
    }

    #[test]
    fn finish_stream_is_idempotent() {
        let engine = PlaybackEngine::new(small_config(), 1_000);
        engine.finish_stream();
        engine.finish_stream();
        assert!(engine.shared.finished.load(Ordering::Acquire));
        assert_eq!(engine.state(), PlaybackState::Idle);
    }

    #[test]
    fn interrupt_on_empty_ring_is_harmless() {
        let engine = PlaybackEngine::new(small_config(), 1_000);
        assert_eq!(engine.interrupt(), 0);
        assert_eq!(engine.interrupt(), 0);
        assert_eq!(engine.buffered(), 0);
        assert!(!engine.is_active());
    }

    #[test]
    fn interrupt_discards_buffered_audio_immediately() {
        let engine = PlaybackEngine::new(small_config(), 1_000);
        engine.produce(&[5; 300]);
        engine.finish_stream();
        assert_eq!(engine.interrupt(), 300);
        assert_eq!(engine.buffered(), 0);
        assert!(!engine.shared.finished.load(Ordering::Acquire));
    }

    #[test]
    fn only_one_scheduler_may_be_claimed() {
        let engine = PlaybackEngine::new(small_config(), 1_000);
        let first = engine.scheduler().expect("first claim");
        assert!(matches!(engine.scheduler(), Err(MoteError::AlreadyRunning)));
        drop(first);
        assert!(engine.scheduler().is_ok());
    }

    #[test]
    fn playback_thread_requests_priority_before_opening_output() {
        let engine = PlaybackEngine::new(small_config(), 1_000);
        assert_eq!(engine.thread_priority(), ThreadPriorityStatus::NotRequested);
        let (out, _log) = crate::audio::stub::StubOutput::new();
        let handle = engine.start(move || Ok(out)).unwrap();
        // Either outcome is fine; the request itself must have been made.
        assert_ne!(engine.thread_priority(), ThreadPriorityStatus::NotRequested);
        engine.stop();
        handle.join().unwrap();
    }

    #[test]
    fn priority_request_can_be_disabled() {
        let engine = PlaybackEngine::new(
            PlaybackConfig {
                elevate_priority: false,
                ..small_config()
            },
            1_000,
        );
        let (out, _log) = crate::audio::stub::StubOutput::new();
        let handle = engine.start(move || Ok(out)).unwrap();
        assert_eq!(engine.thread_priority(), ThreadPriorityStatus::NotRequested);
        engine.stop();
        handle.join().unwrap();
    }

    #[test]
    fn volume_and_gain_setters_clamp() {
        let engine = PlaybackEngine::new(small_config(), 1_000);
        assert_eq!(engine.volume(), 70);
        engine.set_volume(180);
        engine.set_gain(0.1);
        assert_eq!(engine.volume(), 100);
        assert!((engine.gain() - 1.0).abs() < f32::EPSILON);
    }
}
