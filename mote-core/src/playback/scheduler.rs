//! The consumer side of the playback ring.
//!
//! `Scheduler::step` runs one cycle. The playback thread calls it in a loop;
//! tests call it directly against a stub output. Flags are observed at the top
//! of every cycle. An in-flight output write is never cancelled.
//!
//! ```text
//!            occupancy > 0                  threshold / finished / max wait
//!   Idle ───────────────────► Buffering ──────────────────────────────► Playing
//!    ▲                                                                  │
//!    │  empty + finished (Completed)                 finished observed  ▼
//!    ├───────────────────────────────────────────────────────────── Draining
//!    │  underrun budget spent (TimedOut)
//!    └── interrupt flag from any state (Interrupted)
//! ```

use std::sync::{atomic::Ordering, Arc};
use std::time::Instant;

use tracing::{debug, info, warn};

use super::{PlaybackEvent, PlaybackState, Shared};
use crate::audio::OutputDevice;

pub struct Scheduler {
    shared: Arc<Shared>,
    state: PlaybackState,
    chunk: Vec<i16>,
    scaled: Vec<i16>,
    underruns: u32,
    max_underruns: u32,
    buffering_since: Option<Instant>,
}

impl Scheduler {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        let cfg = &shared.config;
        let chunk = vec![0i16; cfg.chunk_samples.max(1)];
        let wait_ms = cfg.underrun_wait.as_millis().max(1);
        let max_underruns = cfg.underrun_timeout.as_millis().div_ceil(wait_ms).max(1);
        let max_underruns = u32::try_from(max_underruns).unwrap_or(u32::MAX);
        let scaled = Vec::with_capacity(chunk.len());

        Self {
            shared,
            state: PlaybackState::Idle,
            chunk,
            scaled,
            underruns: 0,
            max_underruns,
            buffering_since: None,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    /// Run one scheduling cycle and return the resulting state.
    pub fn step<O: OutputDevice>(&mut self, out: &mut O) -> PlaybackState {
        if self.shared.interrupt.swap(false, Ordering::AcqRel) {
            self.silence(out);
            self.underruns = 0;
            self.set_state(PlaybackState::Idle);
            self.shared.emit(PlaybackEvent::Interrupted);
            return self.state;
        }

        match self.state {
            PlaybackState::Idle => self.step_idle(),
            PlaybackState::Buffering => self.step_buffering(),
            PlaybackState::Playing | PlaybackState::Draining => self.step_playing(out),
        }
        self.state
    }

    fn step_idle(&mut self) {
        if self.shared.ring.approx_occupied() > 0 {
            self.buffering_since = Some(Instant::now());
            self.set_state(PlaybackState::Buffering);
            return;
        }
        // A turn that ended without audio still completes.
        if self.shared.finished.swap(false, Ordering::AcqRel) {
            self.shared.emit(PlaybackEvent::Completed);
            return;
        }
        std::thread::sleep(self.shared.config.underrun_wait);
    }

    fn step_buffering(&mut self) {
        let occupied = self.shared.ring.approx_occupied();
        let finished = self.shared.finished.load(Ordering::Acquire);

        if occupied == 0 {
            if finished {
                self.shared.finished.store(false, Ordering::Release);
                self.set_state(PlaybackState::Idle);
                self.shared.emit(PlaybackEvent::Completed);
            } else {
                std::thread::sleep(self.shared.config.underrun_wait);
            }
            return;
        }

        let waited_out = self
            .buffering_since
            .is_some_and(|t| t.elapsed() >= self.shared.config.max_buffering_wait);

        if occupied >= self.shared.config.start_threshold || finished || waited_out {
            if waited_out && !finished && occupied < self.shared.config.start_threshold {
                debug!(occupied, "buffering wait elapsed, starting below threshold");
            }
            self.buffering_since = None;
            self.underruns = 0;
            self.set_state(if finished {
                PlaybackState::Draining
            } else {
                PlaybackState::Playing
            });
            self.shared
                .emit(PlaybackEvent::Started { buffered: occupied });
            return;
        }

        std::thread::sleep(self.shared.config.underrun_wait);
    }

    fn step_playing<O: OutputDevice>(&mut self, out: &mut O) {
        let shared = Arc::clone(&self.shared);
        let finished = shared.finished.load(Ordering::Acquire);
        if finished && self.state == PlaybackState::Playing {
            self.set_state(PlaybackState::Draining);
        }

        let Some(n) = shared.ring.pop(&mut self.chunk) else {
            shared
                .diagnostics
                .lock_timeouts
                .fetch_add(1, Ordering::Relaxed);
            return;
        };

        if n == 0 {
            if finished {
                shared.finished.store(false, Ordering::Release);
                self.underruns = 0;
                self.silence(out);
                self.set_state(PlaybackState::Idle);
                shared.emit(PlaybackEvent::Completed);
                info!("playback completed");
                return;
            }

            self.underruns += 1;
            shared.diagnostics.underruns.fetch_add(1, Ordering::Relaxed);
            if self.underruns >= self.max_underruns {
                warn!(underruns = self.underruns, "playback starved, aborting");
                shared.ring.clear();
                self.underruns = 0;
                self.silence(out);
                self.set_state(PlaybackState::Idle);
                shared.diagnostics.timeouts.fetch_add(1, Ordering::Relaxed);
                shared.emit(PlaybackEvent::TimedOut);
                return;
            }
            std::thread::sleep(shared.config.underrun_wait);
            return;
        }

        self.underruns = 0;

        // A hard stop landed between the pop and the write: drop the chunk.
        if shared.interrupt.load(Ordering::Acquire) {
            return;
        }

        shared.gain.process_into(&self.chunk[..n], &mut self.scaled);
        match out.write(&self.scaled) {
            Ok(written) => {
                shared.diagnostics.played.fetch_add(written, Ordering::Relaxed);
            }
            Err(e) => {
                shared
                    .diagnostics
                    .write_errors
                    .fetch_add(1, Ordering::Relaxed);
                warn!(samples = n, "output write failed: {e}");
            }
        }
    }

    fn silence<O: OutputDevice>(&mut self, out: &mut O) {
        if let Err(e) = out.zero() {
            warn!("output zero failed: {e}");
        }
    }

    fn set_state(&mut self, next: PlaybackState) {
        if next != self.state {
            debug!(from = ?self.state, to = ?next, "playback state");
            self.state = next;
            *self.shared.state.lock() = next;
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        *self.shared.state.lock() = PlaybackState::Idle;
        self.shared.consumer_claimed.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::audio::stub::StubOutput;
    use crate::playback::{PlaybackConfig, PlaybackEngine};

    fn fast_config() -> PlaybackConfig {
        PlaybackConfig {
            capacity_secs: 4,
            start_threshold: 1_000,
            chunk_samples: 256,
            underrun_wait: Duration::from_millis(1),
            underrun_timeout: Duration::from_millis(5),
            max_buffering_wait: Duration::from_secs(60),
            volume: 100,
            gain: 1.0,
            ..PlaybackConfig::default()
        }
    }

    fn engine() -> PlaybackEngine {
        PlaybackEngine::new(fast_config(), 1_000)
    }

    #[test]
    fn stays_buffering_below_threshold() {
        let engine = engine();
        let mut sched = engine.scheduler().unwrap();
        let (mut out, log) = StubOutput::new();

        engine.produce(&[1; 999]);
        assert_eq!(sched.step(&mut out), PlaybackState::Buffering);
        for _ in 0..5 {
            assert_eq!(sched.step(&mut out), PlaybackState::Buffering);
        }
        engine.produce(&[1; 1]);
        assert_eq!(sched.step(&mut out), PlaybackState::Playing);
        assert_eq!(
            engine.events().try_recv(),
            Ok(PlaybackEvent::Started { buffered: 1_000 })
        );
        assert_eq!(log.lock().writes, 0);
    }

    #[test]
    fn drains_in_fixed_chunks_then_completes() {
        let engine = engine();
        let mut sched = engine.scheduler().unwrap();
        let (mut out, log) = StubOutput::new();

        engine.produce(&[7; 600]);
        engine.finish_stream();
        sched.step(&mut out);
        assert_eq!(sched.step(&mut out), PlaybackState::Draining);

        let mut steps = 0;
        while sched.step(&mut out) != PlaybackState::Idle {
            steps += 1;
            assert!(steps < 10);
        }

        let log = log.lock();
        assert_eq!(log.samples.len(), 600);
        assert_eq!(log.writes, 3, "256 + 256 + 88");
        assert_eq!(log.zero_calls, 1);

        let events: Vec<_> = engine.events().try_iter().collect();
        assert_eq!(
            events,
            vec![
                PlaybackEvent::Started { buffered: 600 },
                PlaybackEvent::Completed
            ]
        );
        assert!(!engine.shared.finished.load(Ordering::Acquire));
    }

    #[test]
    fn finished_turn_without_audio_completes() {
        let engine = engine();
        let mut sched = engine.scheduler().unwrap();
        let (mut out, _log) = StubOutput::new();

        engine.finish_stream();
        assert_eq!(sched.step(&mut out), PlaybackState::Idle);
        assert_eq!(engine.events().try_recv(), Ok(PlaybackEvent::Completed));
    }

    #[test]
    fn underrun_budget_times_out() {
        let engine = engine();
        let mut sched = engine.scheduler().unwrap();
        let (mut out, log) = StubOutput::new();

        engine.produce(&[3; 1_000]);
        sched.step(&mut out);
        sched.step(&mut out);
        while engine.buffered() > 0 {
            sched.step(&mut out);
        }

        let mut state = sched.state();
        for _ in 0..5 {
            state = sched.step(&mut out);
        }
        assert_eq!(state, PlaybackState::Idle);
        assert_eq!(log.lock().zero_calls, 1);

        let diag = engine.diagnostics();
        assert_eq!(diag.timeouts, 1);
        assert_eq!(diag.underruns, 5);
        assert!(engine
            .events()
            .try_iter()
            .any(|e| e == PlaybackEvent::TimedOut));
    }

    #[test]
    fn interrupt_while_buffering_goes_idle_and_silences() {
        let engine = engine();
        let mut sched = engine.scheduler().unwrap();
        let (mut out, log) = StubOutput::new();

        engine.produce(&[1; 500]);
        assert_eq!(sched.step(&mut out), PlaybackState::Buffering);
        engine.interrupt();
        assert_eq!(sched.step(&mut out), PlaybackState::Idle);
        assert_eq!(log.lock().zero_calls, 1);
        assert_eq!(engine.events().try_recv(), Ok(PlaybackEvent::Interrupted));
    }

    #[test]
    fn write_errors_are_counted_not_fatal() {
        let engine = engine();
        let mut sched = engine.scheduler().unwrap();
        let (mut out, log) = StubOutput::new();
        out.fail_next_writes(1);

        engine.produce(&[1; 512]);
        engine.finish_stream();
        for _ in 0..4 {
            sched.step(&mut out);
        }

        assert_eq!(engine.diagnostics().write_errors, 1);
        assert_eq!(log.lock().samples.len(), 256);
    }

    #[test]
    fn gain_is_applied_on_the_way_out() {
        let engine = engine();
        engine.set_volume(50);
        let mut sched = engine.scheduler().unwrap();
        let (mut out, log) = StubOutput::new();

        engine.produce(&[1_000; 10]);
        engine.finish_stream();
        for _ in 0..3 {
            sched.step(&mut out);
        }
        assert_eq!(log.lock().samples, vec![500; 10]);
    }
}
