//! `MoteEngine`: top-level runtime controller.
//!
//! ## Lifecycle
//!
//! ```text
//! MoteEngine::new()
//!     ├─► start_playback(factory) → playback thread, output opened on it
//!     ├─► start_capture(factory)  → capture thread, windows into a bounded queue
//!     └─► run(connect, capture)   → connect / session loop / reconnect forever
//!             └─► stop()          → loop returns, threads wind down
//! ```
//!
//! ## Threading
//!
//! Playback and capture each get a dedicated named OS thread because real
//! devices are `!Send` and blocking. Everything protocol-related runs in
//! `run()` on the async runtime as one cooperative loop that owns the
//! `VoiceSession`. The playback ring is the only state the loop shares with
//! a real-time thread.

use std::future::Future;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::{
    audio::{
        codec::{self, GainStage, MAX_VOLUME},
        CaptureDevice, OutputDevice,
    },
    buffering::chunk::SampleBuffer,
    error::{MoteError, Result},
    ipc::events::{SessionEvent, VoiceState},
    playback::{PlaybackConfig, PlaybackEngine, PlaybackSnapshot},
    session::{Disposition, SessionConfig, SessionDiagnostics, SessionSnapshot, VoiceSession},
    transport::{Connection, HeartbeatConfig, TransportEvent},
    vad::energy::DEFAULT_THRESHOLD,
};

/// Broadcast channel capacity for observer events.
const BROADCAST_CAP: usize = 256;

/// Configuration for `MoteEngine`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Wire and processing sample rate (Hz). Default: 16000.
    pub sample_rate: u32,
    /// Samples per capture read. Default: 1024 (64 ms).
    pub capture_chunk: usize,
    /// VAD RMS threshold on 16-bit samples. Default: 500.
    pub vad_threshold: f32,
    /// Quiet time after speech before `voice.silence`. Default: 1.5 s.
    pub silence_holdoff: Duration,
    /// Fixed delay between connection attempts. Default: 5 s.
    pub reconnect_interval: Duration,
    /// Deadline for one connection attempt, handshake included.
    pub connect_timeout: Duration,
    /// Captured windows buffered between the capture thread and the loop.
    /// Default: 8.
    pub capture_queue: usize,
    /// Frames buffered each way on a connection. Default: 64.
    pub frame_queue: usize,
    /// Microphone gain multiplier, clamped like playback gain. Default: 1.0.
    pub mic_gain: f32,
    /// Consecutive bad control frames tolerated. Default: 5.
    pub max_protocol_errors: u32,
    /// Housekeeping tick for playback feedback and outbound flushes.
    /// Default: 20 ms.
    pub tick: Duration,
    pub heartbeat: HeartbeatConfig,
    pub playback: PlaybackConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            capture_chunk: 1_024,
            vad_threshold: DEFAULT_THRESHOLD,
            silence_holdoff: Duration::from_millis(1_500),
            reconnect_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            capture_queue: 8,
            frame_queue: 64,
            mic_gain: codec::MIN_GAIN,
            max_protocol_errors: 5,
            tick: Duration::from_millis(20),
            heartbeat: HeartbeatConfig::default(),
            playback: PlaybackConfig::default(),
        }
    }
}

#[derive(Default)]
pub struct CaptureDiagnostics {
    pub windows: AtomicUsize,
    pub dropped: AtomicUsize,
    pub read_errors: AtomicUsize,
    pub resets: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EngineSnapshot {
    pub capture_windows: usize,
    pub capture_dropped: usize,
    pub capture_read_errors: usize,
    pub capture_resets: usize,
    pub playback: PlaybackSnapshot,
    pub session: SessionSnapshot,
}

/// The top-level engine handle.
///
/// `MoteEngine` is `Send + Sync`; wrap it in an `Arc` to call `stop()` or
/// the volume setters from another task while `run()` is in flight.
pub struct MoteEngine {
    config: EngineConfig,
    device_id: String,
    /// `false` once `stop()` has been called.
    running: Arc<AtomicBool>,
    /// Guards against two concurrent `run()` loops.
    loop_active: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    playback: PlaybackEngine,
    events_tx: broadcast::Sender<SessionEvent>,
    /// Set by the loop, consumed by the capture thread.
    capture_reset: Arc<AtomicBool>,
    mic_gain: Arc<GainStage>,
    state: Arc<Mutex<VoiceState>>,
    capture_diag: Arc<CaptureDiagnostics>,
    session_diag: Mutex<Option<Arc<SessionDiagnostics>>>,
}

impl MoteEngine {
    pub fn new(config: EngineConfig, device_id: impl Into<String>) -> Self {
        let (events_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (shutdown_tx, _) = watch::channel(false);
        let playback = PlaybackEngine::new(config.playback.clone(), config.sample_rate);
        let mic_gain = Arc::new(GainStage::new(MAX_VOLUME, config.mic_gain));

        Self {
            config,
            device_id: device_id.into(),
            running: Arc::new(AtomicBool::new(true)),
            loop_active: AtomicBool::new(false),
            shutdown_tx,
            playback,
            events_tx,
            capture_reset: Arc::new(AtomicBool::new(false)),
            mic_gain,
            state: Arc::new(Mutex::new(VoiceState::Disconnected)),
            capture_diag: Arc::new(CaptureDiagnostics::default()),
            session_diag: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn playback(&self) -> &PlaybackEngine {
        &self.playback
    }

    // ── Controls exposed to collaborators ────────────────────────────────────

    pub fn set_volume(&self, volume_percent: u8) {
        self.playback.set_volume(volume_percent);
    }

    pub fn set_gain(&self, gain: f32) {
        self.playback.set_gain(gain);
    }

    pub fn set_mic_gain(&self, gain: f32) {
        self.mic_gain.set_gain(gain);
    }

    pub fn is_playback_active(&self) -> bool {
        self.playback.is_active()
    }

    /// Last voice state observed by the loop.
    pub fn state(&self) -> VoiceState {
        *self.state.lock()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    pub fn diagnostics(&self) -> EngineSnapshot {
        let session = self
            .session_diag
            .lock()
            .as_ref()
            .map(|d| d.snapshot())
            .unwrap_or_default();
        EngineSnapshot {
            capture_windows: self.capture_diag.windows.load(Ordering::Relaxed),
            capture_dropped: self.capture_diag.dropped.load(Ordering::Relaxed),
            capture_read_errors: self.capture_diag.read_errors.load(Ordering::Relaxed),
            capture_resets: self.capture_diag.resets.load(Ordering::Relaxed),
            playback: self.playback.diagnostics(),
            session,
        }
    }

    // ── Threads ──────────────────────────────────────────────────────────────

    /// Start the playback consumer on its own thread.
    pub fn start_playback<F, O>(&self, factory: F) -> Result<JoinHandle<()>>
    where
        F: FnOnce() -> Result<O> + Send + 'static,
        O: OutputDevice + 'static,
    {
        if !self.running.load(Ordering::SeqCst) {
            return Err(MoteError::NotRunning);
        }
        self.playback.start(factory)
    }

    /// Start the capture thread. Returns the queue of encoded windows for
    /// `run()`. Blocks until the device is open (or failed to open).
    ///
    /// The thread never blocks on the queue: when the loop falls behind,
    /// new windows are dropped and counted.
    pub fn start_capture<F, C>(&self, factory: F) -> Result<mpsc::Receiver<SampleBuffer>>
    where
        F: FnOnce() -> Result<C> + Send + 'static,
        C: CaptureDevice + 'static,
    {
        if !self.running.load(Ordering::SeqCst) {
            return Err(MoteError::NotRunning);
        }

        let (tx, rx) = mpsc::channel(self.config.capture_queue.max(1));
        let running = Arc::clone(&self.running);
        let reset = Arc::clone(&self.capture_reset);
        let gain = Arc::clone(&self.mic_gain);
        let diag = Arc::clone(&self.capture_diag);
        let chunk = self.config.capture_chunk.max(1);
        let rate = self.config.sample_rate;

        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<()>>();

        std::thread::Builder::new()
            .name("mote-capture".into())
            .spawn(move || {
                let mut device = match factory() {
                    Ok(d) => {
                        let _ = open_tx.send(Ok(()));
                        d
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };

                info!(chunk, rate, "capture thread started");
                let mut raw = vec![0i32; chunk];
                while running.load(Ordering::Acquire) {
                    if reset.swap(false, Ordering::AcqRel) {
                        diag.resets.fetch_add(1, Ordering::Relaxed);
                        if let Err(e) = device.reset() {
                            warn!("capture reset failed: {e}");
                        }
                    }

                    let n = match device.read(&mut raw) {
                        Ok(n) => n,
                        Err(e) => {
                            diag.read_errors.fetch_add(1, Ordering::Relaxed);
                            warn!("capture read failed: {e}");
                            std::thread::sleep(Duration::from_millis(10));
                            continue;
                        }
                    };
                    if n == 0 {
                        continue;
                    }

                    let mut window = codec::encode(&raw[..n], rate);
                    if !gain.is_unity() {
                        window = SampleBuffer::new(gain.process(window.samples()), rate);
                    }
                    diag.windows.fetch_add(1, Ordering::Relaxed);

                    match tx.try_send(window) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            diag.dropped.fetch_add(1, Ordering::Relaxed);
                            debug!("capture queue full, dropping window");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
                info!("capture thread stopped");
            })
            .map_err(MoteError::Io)?;

        match open_rx.recv() {
            Ok(Ok(())) => Ok(rx),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MoteError::Other(anyhow::anyhow!(
                "capture thread died unexpectedly"
            ))),
        }
    }

    // ── Main loop ────────────────────────────────────────────────────────────

    /// Connect, run the session, and reconnect on a fixed interval until
    /// `stop()` is called.
    ///
    /// `connect` is invoked once per attempt and abandoned after
    /// `connect_timeout`. A failed attempt or a lost connection waits
    /// `reconnect_interval` before the next one; playback keeps running on
    /// its own thread throughout.
    pub async fn run<C, Fut>(
        &self,
        mut connect: C,
        mut capture: mpsc::Receiver<SampleBuffer>,
    ) -> Result<()>
    where
        C: FnMut() -> Fut,
        Fut: Future<Output = Result<Connection>>,
    {
        if !self.running.load(Ordering::SeqCst) {
            return Err(MoteError::NotRunning);
        }
        if self.loop_active.swap(true, Ordering::SeqCst) {
            return Err(MoteError::AlreadyRunning);
        }

        let session_config = SessionConfig {
            device_id: self.device_id.clone(),
            silence_holdoff: self.config.silence_holdoff,
            max_protocol_errors: self.config.max_protocol_errors,
        };
        let mut session = VoiceSession::new(
            session_config,
            self.config.vad_threshold,
            self.playback.clone(),
            self.events_tx.clone(),
        );
        *self.session_diag.lock() = Some(session.diagnostics_handle());

        let mut shutdown = self.shutdown_tx.subscribe();
        let mut tick = tokio::time::interval(self.config.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut capture_open = true;

        info!(device_id = %self.device_id, "voice loop started");

        'outer: while self.running.load(Ordering::SeqCst) {
            // Keep playback feedback and the capture queue serviced while a
            // slow or silent host holds the attempt open.
            let connecting = tokio::time::timeout(self.config.connect_timeout, connect());
            tokio::pin!(connecting);
            let attempt = loop {
                tokio::select! {
                    r = &mut connecting => {
                        break r.unwrap_or_else(|_| {
                            Err(MoteError::Transport(format!(
                                "connect timed out after {:?}",
                                self.config.connect_timeout
                            )))
                        });
                    }
                    window = capture.recv(), if capture_open => match window {
                        Some(window) => session.process_capture(&window, Instant::now()),
                        None => capture_open = false,
                    },
                    _ = tick.tick() => session.poll_playback(),
                    _ = shutdown.changed() => break 'outer,
                }
                self.publish(&mut session, &mut capture);
            };

            match attempt {
                Ok(mut conn) => {
                    session.on_connected(Instant::now());
                    self.publish(&mut session, &mut capture);
                    let stopped = self
                        .serve(
                            &mut session,
                            &mut conn,
                            &mut capture,
                            &mut capture_open,
                            &mut tick,
                            &mut shutdown,
                        )
                        .await;
                    session.on_disconnected();
                    self.publish(&mut session, &mut capture);
                    if stopped {
                        break 'outer;
                    }
                }
                Err(e) => {
                    warn!("voice channel connect failed: {e}");
                }
            }

            let stopped = self
                .idle_for(
                    self.config.reconnect_interval,
                    &mut session,
                    &mut capture,
                    &mut capture_open,
                    &mut tick,
                    &mut shutdown,
                )
                .await;
            if stopped {
                break;
            }
            debug!("reconnecting voice channel");
        }

        session.on_disconnected();
        self.publish(&mut session, &mut capture);
        self.loop_active.store(false, Ordering::SeqCst);
        info!("voice loop stopped");
        Ok(())
    }

    /// Pump one live connection. Returns `true` if the engine was stopped.
    async fn serve(
        &self,
        session: &mut VoiceSession,
        conn: &mut Connection,
        capture: &mut mpsc::Receiver<SampleBuffer>,
        capture_open: &mut bool,
        tick: &mut tokio::time::Interval,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        if !Self::flush(session, conn).await {
            return false;
        }

        loop {
            tokio::select! {
                event = conn.recv() => match event {
                    Some(TransportEvent::Frame(frame)) => {
                        if session.handle_frame(frame, Instant::now()) == Disposition::Disconnect {
                            return false;
                        }
                    }
                    Some(TransportEvent::Closed(reason)) => {
                        info!(?reason, "voice channel closed");
                        return false;
                    }
                    None => {
                        info!("voice channel dropped");
                        return false;
                    }
                },
                window = capture.recv(), if *capture_open => match window {
                    Some(window) => session.process_capture(&window, Instant::now()),
                    None => {
                        warn!("capture queue closed");
                        *capture_open = false;
                    }
                },
                _ = tick.tick() => session.poll_playback(),
                _ = shutdown.changed() => return true,
            }

            self.publish(session, capture);
            if !Self::flush(session, conn).await {
                return false;
            }
        }
    }

    /// Wait out the reconnect interval while keeping playback feedback and
    /// the capture queue serviced. Returns `true` if the engine was stopped.
    async fn idle_for(
        &self,
        wait: Duration,
        session: &mut VoiceSession,
        capture: &mut mpsc::Receiver<SampleBuffer>,
        capture_open: &mut bool,
        tick: &mut tokio::time::Interval,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let sleep = tokio::time::sleep(wait);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                window = capture.recv(), if *capture_open => match window {
                    // Disconnected: the gate drops it.
                    Some(window) => session.process_capture(&window, Instant::now()),
                    None => *capture_open = false,
                },
                _ = tick.tick() => session.poll_playback(),
                _ = shutdown.changed() => return true,
            }
            self.publish(session, capture);
        }
    }

    /// Send everything the session queued. `false` if the channel is gone.
    async fn flush(session: &mut VoiceSession, conn: &Connection) -> bool {
        let frames: Vec<_> = session.drain_outgoing().collect();
        for frame in frames {
            if conn.send(frame).await.is_err() {
                return false;
            }
        }
        true
    }

    /// Mirror session state out to the engine handle and the capture thread.
    ///
    /// A capture reset also discards windows already queued for the loop:
    /// they predate the reset and must not be forwarded.
    fn publish(&self, session: &mut VoiceSession, capture: &mut mpsc::Receiver<SampleBuffer>) {
        if session.take_capture_reset() {
            self.capture_reset.store(true, Ordering::Release);
            let mut stale = 0;
            while capture.try_recv().is_ok() {
                stale += 1;
            }
            if stale > 0 {
                self.capture_diag.dropped.fetch_add(stale, Ordering::Relaxed);
                debug!(stale, "discarded queued capture windows");
            }
        }
        *self.state.lock() = session.state();
    }

    /// Stop the loop and both threads.
    ///
    /// # Errors
    /// `MoteError::NotRunning` if already stopped.
    pub fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(MoteError::NotRunning);
        }
        let _ = self.shutdown_tx.send(true);
        self.playback.stop();
        info!("engine stop requested");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
