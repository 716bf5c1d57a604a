//! The voice session state machine.
//!
//! `VoiceSession` owns one connection's worth of state and is driven entirely
//! by the main loop: connection changes, inbound frames, captured windows and
//! playback lifecycle events go in; outbound frames and observer events come
//! out. It never blocks and never touches the network itself, which keeps the
//! whole protocol testable with plain method calls.
//!
//! ## Declared transitions
//!
//! ```text
//! Disconnected ──connect──► Idle ──listening──► Listening ──processing──► Processing
//!                            ▲                     │ ▲                        │
//!                            │                     │ └──────interrupt─────┐   │ response
//!                            │                     └──response──► Speaking ◄──┘
//!                            └──────────── done / error ───────────────┘
//! any ──close / repeated garbage──► Disconnected
//! ```
//!
//! `done` drains buffered speech; `interrupt` and `error` discard it.

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    buffering::chunk::SampleBuffer,
    ipc::events::{SessionEvent, VoiceState},
    playback::{PlaybackEngine, PlaybackEvent},
    protocol::{
        decode_server, encode_client, encode_samples, ClientMessage, Frame, PcmReassembler,
        ProtocolError, ServerMessage,
    },
    vad::{energy::EnergyVad, VoiceActivityDetector},
};

/// Per-session tunables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Sent in `voice.start`.
    pub device_id: String,
    /// Quiet time after the last speech window before `voice.silence`.
    pub silence_holdoff: Duration,
    /// Consecutive undecodable control frames tolerated before the
    /// connection is treated as broken.
    pub max_protocol_errors: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            silence_holdoff: Duration::from_millis(1_500),
            max_protocol_errors: 5,
        }
    }
}

/// What the main loop should do with the connection after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    Disconnect,
}

#[derive(Default)]
pub struct SessionDiagnostics {
    pub frames_forwarded: AtomicUsize,
    pub samples_forwarded: AtomicUsize,
    pub frames_gated: AtomicUsize,
    pub silence_notices: AtomicUsize,
    pub control_frames: AtomicUsize,
    pub audio_frames: AtomicUsize,
    pub protocol_errors: AtomicUsize,
    pub foreign_frames: AtomicUsize,
    pub ignored_transitions: AtomicUsize,
}

impl SessionDiagnostics {
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            frames_forwarded: self.frames_forwarded.load(Ordering::Relaxed),
            samples_forwarded: self.samples_forwarded.load(Ordering::Relaxed),
            frames_gated: self.frames_gated.load(Ordering::Relaxed),
            silence_notices: self.silence_notices.load(Ordering::Relaxed),
            control_frames: self.control_frames.load(Ordering::Relaxed),
            audio_frames: self.audio_frames.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            foreign_frames: self.foreign_frames.load(Ordering::Relaxed),
            ignored_transitions: self.ignored_transitions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub frames_forwarded: usize,
    pub samples_forwarded: usize,
    pub frames_gated: usize,
    pub silence_notices: usize,
    pub control_frames: usize,
    pub audio_frames: usize,
    pub protocol_errors: usize,
    pub foreign_frames: usize,
    pub ignored_transitions: usize,
}

/// Silence-since-last-speech timer. Armed by a speech window, fires once.
#[derive(Debug, Default)]
struct Holdoff {
    last_voice: Option<Instant>,
    fired: bool,
}

impl Holdoff {
    /// Feed one window's decision. Returns true exactly once per quiet spell.
    fn update(&mut self, speech: bool, now: Instant, holdoff: Duration) -> bool {
        if speech {
            self.last_voice = Some(now);
            self.fired = false;
            return false;
        }
        match self.last_voice {
            Some(t) if !self.fired && now.saturating_duration_since(t) > holdoff => {
                self.fired = true;
                true
            }
            _ => false,
        }
    }

    fn reset(&mut self) {
        self.last_voice = None;
        self.fired = false;
    }
}

pub struct VoiceSession {
    config: SessionConfig,
    state: VoiceState,
    playback: PlaybackEngine,
    playback_events: Receiver<PlaybackEvent>,
    vad: Box<dyn VoiceActivityDetector>,
    holdoff: Holdoff,
    pcm: PcmReassembler,
    outbox: VecDeque<Frame>,
    events_tx: broadcast::Sender<SessionEvent>,
    capture_reset_pending: bool,
    consecutive_errors: u32,
    last_activity: Option<Instant>,
    diagnostics: Arc<SessionDiagnostics>,
}

impl VoiceSession {
    pub fn new(
        config: SessionConfig,
        vad_threshold: f32,
        playback: PlaybackEngine,
        events_tx: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self::with_detector(
            config,
            Box::new(EnergyVad::new(vad_threshold)),
            playback,
            events_tx,
        )
    }

    /// Build a session around any detector.
    pub fn with_detector(
        config: SessionConfig,
        vad: Box<dyn VoiceActivityDetector>,
        playback: PlaybackEngine,
        events_tx: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let playback_events = playback.events();
        Self {
            config,
            state: VoiceState::Disconnected,
            playback,
            playback_events,
            vad,
            holdoff: Holdoff::default(),
            pcm: PcmReassembler::new(),
            outbox: VecDeque::new(),
            events_tx,
            capture_reset_pending: false,
            consecutive_errors: 0,
            last_activity: None,
            diagnostics: Arc::new(SessionDiagnostics::default()),
        }
    }

    pub fn state(&self) -> VoiceState {
        self.state
    }

    pub fn device_id(&self) -> &str {
        &self.config.device_id
    }

    /// Whether a captured window would be forwarded right now.
    pub fn is_forwarding(&self) -> bool {
        self.state.forwards_audio()
    }

    pub fn last_activity(&self) -> Option<Instant> {
        self.last_activity
    }

    pub fn playback(&self) -> &PlaybackEngine {
        &self.playback
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    pub fn diagnostics(&self) -> SessionSnapshot {
        self.diagnostics.snapshot()
    }

    pub fn diagnostics_handle(&self) -> Arc<SessionDiagnostics> {
        Arc::clone(&self.diagnostics)
    }

    // ── Connection lifecycle ─────────────────────────────────────────────────

    /// The channel is up: announce the device and start streaming.
    ///
    /// A second connection replaces the first; the old session is torn
    /// down before the new one starts.
    pub fn on_connected(&mut self, now: Instant) {
        if self.state.is_connected() {
            warn!("new connection while one is active, tearing down the old session");
            self.on_disconnected();
        }

        self.consecutive_errors = 0;
        self.last_activity = Some(now);
        self.outbox.push_back(encode_client(&ClientMessage::Start {
            device_id: self.config.device_id.clone(),
        }));
        self.emit(SessionEvent::Connection { connected: true });
        self.transition(VoiceState::Idle);
        info!(device_id = %self.config.device_id, "voice session started");
    }

    /// The channel is gone. Full local reset: playback stopped, forwarding
    /// stopped, anything queued for the old connection dropped.
    pub fn on_disconnected(&mut self) {
        if !self.state.is_connected() {
            return;
        }
        self.hard_stop();
        self.outbox.clear();
        self.holdoff.reset();
        self.consecutive_errors = 0;
        self.emit(SessionEvent::Connection { connected: false });
        self.transition(VoiceState::Disconnected);
        info!("voice session ended");
    }

    // ── Inbound ──────────────────────────────────────────────────────────────

    pub fn handle_frame(&mut self, frame: Frame, now: Instant) -> Disposition {
        self.last_activity = Some(now);
        match frame {
            Frame::Text(text) => self.handle_text(&text),
            Frame::Binary(bytes) => {
                self.handle_binary(&bytes);
                Disposition::Continue
            }
        }
    }

    /// Decode and apply one control frame.
    pub fn handle_text(&mut self, text: &str) -> Disposition {
        self.diagnostics
            .control_frames
            .fetch_add(1, Ordering::Relaxed);
        debug!(payload = %text, "control frame");

        match decode_server(text) {
            Ok(msg) => {
                self.consecutive_errors = 0;
                self.apply(msg);
                Disposition::Continue
            }
            // Relay traffic shares the channel. Not ours, not an error.
            Err(ProtocolError::UnknownType(kind)) => {
                self.diagnostics
                    .foreign_frames
                    .fetch_add(1, Ordering::Relaxed);
                debug!(%kind, state = ?self.state, "ignoring control frame of unknown type");
                Disposition::Continue
            }
            Err(e) => {
                self.consecutive_errors += 1;
                self.diagnostics
                    .protocol_errors
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    consecutive = self.consecutive_errors,
                    state = ?self.state,
                    "discarding control frame: {e}"
                );
                if self.consecutive_errors > self.config.max_protocol_errors {
                    warn!("control channel unreadable, dropping connection");
                    Disposition::Disconnect
                } else {
                    Disposition::Continue
                }
            }
        }
    }

    /// Route synthesized speech to playback, whatever the state.
    pub fn handle_binary(&mut self, bytes: &[u8]) {
        self.diagnostics.audio_frames.fetch_add(1, Ordering::Relaxed);
        let samples = self.pcm.push(bytes);
        if samples.is_empty() {
            return;
        }
        let accepted = self.playback.produce(&samples);
        debug!(bytes = bytes.len(), samples = samples.len(), accepted, "speech audio");
        self.emit(SessionEvent::AudioArrived {
            samples: samples.len(),
            accepted,
        });
    }

    fn apply(&mut self, msg: ServerMessage) {
        use VoiceState::*;

        match msg {
            ServerMessage::Listening {} => match self.state {
                Idle => self.transition(Listening),
                Listening => {}
                other => self.ignore("voice.listening", other),
            },
            ServerMessage::Transcription { text } => {
                info!(%text, "transcription");
                self.emit(SessionEvent::Transcript { text });
            }
            ServerMessage::Processing {} => match self.state {
                Listening => self.transition(Processing),
                Processing => {}
                other => self.ignore("voice.processing", other),
            },
            ServerMessage::Response { text } => {
                info!(%text, "response");
                self.emit(SessionEvent::Response { text });
                match self.state {
                    Listening | Processing => self.transition(Speaking),
                    Speaking => {}
                    other => self.ignore("voice.response", other),
                }
            }
            ServerMessage::Done {} => match self.state {
                Listening | Processing | Speaking => {
                    self.playback.finish_stream();
                    self.pcm.reset();
                    self.capture_reset_pending = true;
                    self.holdoff.reset();
                    self.transition(Idle);
                }
                other => self.ignore("voice.done", other),
            },
            ServerMessage::Interrupt {} => {
                // Always safe to clear, even before playback started.
                self.hard_stop();
                self.capture_reset_pending = true;
                self.holdoff.reset();
                match self.state {
                    Speaking | Processing => self.transition(Listening),
                    Listening => {}
                    other => self.ignore("voice.interrupt", other),
                }
            }
            ServerMessage::Error { error } => {
                warn!(%error, "server error");
                self.emit(SessionEvent::ServerError { message: error });
                if self.state.is_connected() {
                    self.hard_stop();
                    self.holdoff.reset();
                    self.transition(Idle);
                }
            }
        }
    }

    // ── Capture ──────────────────────────────────────────────────────────────

    /// Gate one captured window. Forwarded windows are queued as binary
    /// frames; the holdoff may add a `voice.silence` after them.
    pub fn process_capture(&mut self, window: &SampleBuffer, now: Instant) {
        if !self.state.forwards_audio() {
            self.holdoff.reset();
            self.diagnostics.frames_gated.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if window.is_empty() {
            return;
        }

        let speech = self.vad.classify(window).is_speech();
        self.outbox
            .push_back(Frame::Binary(encode_samples(window.samples())));
        self.diagnostics
            .frames_forwarded
            .fetch_add(1, Ordering::Relaxed);
        self.diagnostics
            .samples_forwarded
            .fetch_add(window.len(), Ordering::Relaxed);

        if self
            .holdoff
            .update(speech, now, self.config.silence_holdoff)
        {
            debug!(state = ?self.state, "silence holdoff expired");
            self.outbox
                .push_back(encode_client(&ClientMessage::Silence {}));
            self.diagnostics
                .silence_notices
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    // ── Playback feedback ────────────────────────────────────────────────────

    /// Consume scheduler lifecycle events.
    pub fn poll_playback(&mut self) {
        while let Ok(event) = self.playback_events.try_recv() {
            match event {
                PlaybackEvent::Completed => {
                    self.capture_reset_pending = true;
                    self.emit(SessionEvent::PlaybackCompleted);
                }
                PlaybackEvent::TimedOut => {
                    warn!(state = ?self.state, "playback underrun timeout");
                }
                PlaybackEvent::Started { buffered } => {
                    debug!(buffered, "playback started");
                }
                PlaybackEvent::Interrupted => {
                    debug!("playback silenced");
                }
            }
        }
    }

    /// True once per requested capture-path reset.
    pub fn take_capture_reset(&mut self) -> bool {
        std::mem::take(&mut self.capture_reset_pending)
    }

    /// Frames queued for the channel, oldest first.
    pub fn drain_outgoing(&mut self) -> impl Iterator<Item = Frame> + '_ {
        self.outbox.drain(..)
    }

    pub fn pending_outgoing(&self) -> usize {
        self.outbox.len()
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn hard_stop(&mut self) {
        self.playback.interrupt();
        self.pcm.reset();
        self.vad.reset();
    }

    fn ignore(&self, kind: &str, state: VoiceState) {
        self.diagnostics
            .ignored_transitions
            .fetch_add(1, Ordering::Relaxed);
        debug!(kind, ?state, "control message has no transition from this state");
    }

    fn transition(&mut self, to: VoiceState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        info!(?from, ?to, "voice state");
        self.emit(SessionEvent::StateChanged { from, to });
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }
}

impl std::fmt::Debug for VoiceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceSession")
            .field("state", &self.state)
            .field("device_id", &self.config.device_id)
            .field("outbox", &self.outbox.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::PlaybackConfig;

    fn session() -> VoiceSession {
        let playback = PlaybackEngine::new(PlaybackConfig::default(), 16_000);
        let (tx, _) = broadcast::channel(64);
        let config = SessionConfig {
            device_id: "0a1b2c3d4e5f".into(),
            ..SessionConfig::default()
        };
        VoiceSession::new(config, 500.0, playback, tx)
    }

    fn connected() -> VoiceSession {
        let mut s = session();
        s.on_connected(Instant::now());
        s.drain_outgoing().for_each(drop);
        s
    }

    fn loud() -> SampleBuffer {
        SampleBuffer::new(vec![2_000; 320], 16_000)
    }

    fn quiet() -> SampleBuffer {
        SampleBuffer::new(vec![0; 320], 16_000)
    }

    fn drive(s: &mut VoiceSession, types: &[&str]) {
        for t in types {
            let text = match *t {
                "voice.transcription" | "voice.response" => {
                    format!(r#"{{"type":"{t}","text":"x"}}"#)
                }
                "voice.error" => format!(r#"{{"type":"{t}","error":"x"}}"#),
                _ => format!(r#"{{"type":"{t}"}}"#),
            };
            assert_eq!(s.handle_text(&text), Disposition::Continue);
        }
    }

    #[test]
    fn connect_sends_start_with_device_id() {
        let mut s = session();
        let mut rx = s.subscribe();
        s.on_connected(Instant::now());

        assert_eq!(s.state(), VoiceState::Idle);
        let out: Vec<_> = s.drain_outgoing().collect();
        assert_eq!(
            out,
            vec![Frame::Text(
                r#"{"type":"voice.start","deviceId":"0a1b2c3d4e5f"}"#.into()
            )]
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::Connection { connected: true }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::StateChanged {
                from: VoiceState::Disconnected,
                to: VoiceState::Idle
            }
        );
    }

    #[test]
    fn full_turn_walks_declared_transitions() {
        let mut s = connected();
        drive(&mut s, &["voice.listening"]);
        assert_eq!(s.state(), VoiceState::Listening);
        drive(&mut s, &["voice.transcription"]);
        assert_eq!(s.state(), VoiceState::Listening);
        drive(&mut s, &["voice.processing"]);
        assert_eq!(s.state(), VoiceState::Processing);
        drive(&mut s, &["voice.response"]);
        assert_eq!(s.state(), VoiceState::Speaking);
        drive(&mut s, &["voice.done"]);
        assert_eq!(s.state(), VoiceState::Idle);
        assert!(s.take_capture_reset());
        assert!(!s.take_capture_reset());
    }

    #[test]
    fn interrupt_from_speaking_returns_to_listening_and_clears_audio() {
        let mut s = connected();
        drive(&mut s, &["voice.listening", "voice.processing", "voice.response"]);
        s.handle_binary(&encode_samples(&[9; 4_000]));
        assert_eq!(s.playback().buffered(), 4_000);

        drive(&mut s, &["voice.interrupt"]);
        assert_eq!(s.state(), VoiceState::Listening);
        assert_eq!(s.playback().buffered(), 0);
        assert!(s.take_capture_reset());
    }

    #[test]
    fn interrupt_before_playback_still_clears() {
        let mut s = connected();
        s.handle_binary(&encode_samples(&[1; 100]));
        drive(&mut s, &["voice.interrupt"]);
        assert_eq!(s.state(), VoiceState::Idle);
        assert_eq!(s.playback().buffered(), 0);
    }

    #[test]
    fn undeclared_transitions_are_ignored() {
        let mut s = connected();
        drive(&mut s, &["voice.processing", "voice.done"]);
        assert_eq!(s.state(), VoiceState::Idle);

        drive(&mut s, &["voice.listening", "voice.processing", "voice.listening"]);
        assert_eq!(s.state(), VoiceState::Processing);
        assert_eq!(s.diagnostics().ignored_transitions, 3);
    }

    #[test]
    fn missing_required_field_keeps_state() {
        let mut s = connected();
        drive(&mut s, &["voice.listening", "voice.processing"]);
        assert_eq!(
            s.handle_text(r#"{"type":"voice.response"}"#),
            Disposition::Continue
        );
        assert_eq!(s.state(), VoiceState::Processing);
        assert_eq!(s.diagnostics().protocol_errors, 1);
    }

    #[test]
    fn server_error_hard_stops_and_returns_to_idle() {
        let mut s = connected();
        let mut rx = s.subscribe();
        drive(&mut s, &["voice.listening", "voice.processing", "voice.response"]);
        s.handle_binary(&encode_samples(&[3; 500]));
        drive(&mut s, &["voice.error"]);

        assert_eq!(s.state(), VoiceState::Idle);
        assert_eq!(s.playback().buffered(), 0);
        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(events.contains(&SessionEvent::ServerError {
            message: "x".into()
        }));
    }

    #[test]
    fn repeated_garbage_requests_disconnect() {
        let mut s = connected();
        for _ in 0..5 {
            assert_eq!(s.handle_text("garbage"), Disposition::Continue);
        }
        assert_eq!(s.handle_text("garbage"), Disposition::Disconnect);
    }

    #[test]
    fn valid_frame_resets_error_streak() {
        let mut s = connected();
        for _ in 0..5 {
            s.handle_text(r#"{"type":"voice.response"}"#);
        }
        drive(&mut s, &["voice.listening"]);
        for _ in 0..5 {
            assert_eq!(s.handle_text("{"), Disposition::Continue);
        }
    }

    #[test]
    fn unknown_types_never_drop_the_connection() {
        let mut s = connected();
        drive(&mut s, &["voice.listening"]);
        for _ in 0..20 {
            assert_eq!(
                s.handle_text(r#"{"type":"net.scan","id":1}"#),
                Disposition::Continue
            );
        }
        assert_eq!(s.state(), VoiceState::Listening);
        let diag = s.diagnostics();
        assert_eq!(diag.foreign_frames, 20);
        assert_eq!(diag.protocol_errors, 0);
    }

    #[test]
    fn unknown_types_do_not_interrupt_a_garbage_streak() {
        let mut s = connected();
        for _ in 0..5 {
            s.handle_text("garbage");
        }
        s.handle_text(r#"{"type":"http.proxy"}"#);
        assert_eq!(s.handle_text("garbage"), Disposition::Disconnect);
    }

    #[test]
    fn processing_never_forwards_microphone_audio() {
        let mut s = connected();
        drive(&mut s, &["voice.listening", "voice.processing"]);
        s.process_capture(&loud(), Instant::now());
        assert_eq!(s.pending_outgoing(), 0);
        assert_eq!(s.diagnostics().frames_gated, 1);
    }

    #[test]
    fn speaking_forwards_for_barge_in() {
        let mut s = connected();
        drive(&mut s, &["voice.listening", "voice.response"]);
        assert_eq!(s.state(), VoiceState::Speaking);
        s.process_capture(&loud(), Instant::now());
        assert!(matches!(
            s.drain_outgoing().next(),
            Some(Frame::Binary(b)) if b.len() == 640
        ));
    }

    #[test]
    fn disconnected_session_is_inert() {
        let mut s = session();
        s.process_capture(&loud(), Instant::now());
        assert_eq!(s.pending_outgoing(), 0);
        s.on_disconnected();
        assert_eq!(s.state(), VoiceState::Disconnected);
    }

    #[test]
    fn disconnect_resets_everything() {
        let mut s = connected();
        drive(&mut s, &["voice.listening", "voice.response"]);
        s.handle_binary(&encode_samples(&[1; 1_000]));
        s.process_capture(&loud(), Instant::now());
        s.on_disconnected();

        assert_eq!(s.state(), VoiceState::Disconnected);
        assert_eq!(s.pending_outgoing(), 0);
        assert_eq!(s.playback().buffered(), 0);
        assert!(!s.is_forwarding());
    }

    #[test]
    fn reconnect_tears_down_previous_session() {
        let mut s = connected();
        drive(&mut s, &["voice.listening"]);
        let mut rx = s.subscribe();
        s.on_connected(Instant::now());

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(
            events,
            vec![
                SessionEvent::Connection { connected: false },
                SessionEvent::StateChanged {
                    from: VoiceState::Listening,
                    to: VoiceState::Disconnected
                },
                SessionEvent::Connection { connected: true },
                SessionEvent::StateChanged {
                    from: VoiceState::Disconnected,
                    to: VoiceState::Idle
                },
            ]
        );
        assert_eq!(s.pending_outgoing(), 1);
    }

    #[test]
    fn holdoff_fires_once_after_quiet_spell() {
        let mut s = connected();
        let t0 = Instant::now();
        s.process_capture(&loud(), t0);
        s.process_capture(&quiet(), t0 + Duration::from_millis(1_000));
        s.process_capture(&quiet(), t0 + Duration::from_millis(1_500));
        s.process_capture(&quiet(), t0 + Duration::from_millis(1_501));
        s.process_capture(&quiet(), t0 + Duration::from_millis(3_000));

        let silences = s
            .drain_outgoing()
            .filter(|f| matches!(f, Frame::Text(t) if t.contains("voice.silence")))
            .count();
        assert_eq!(silences, 1);
    }

    #[test]
    fn holdoff_needs_speech_to_arm() {
        let mut s = connected();
        let t0 = Instant::now();
        for i in 0..10 {
            s.process_capture(&quiet(), t0 + Duration::from_secs(i));
        }
        assert_eq!(s.diagnostics().silence_notices, 0);
    }

    #[test]
    fn odd_length_audio_is_reassembled() {
        let mut s = connected();
        let wire = encode_samples(&[10, 20, 30]);
        s.handle_binary(&wire[..3]);
        s.handle_binary(&wire[3..]);
        assert_eq!(s.playback().buffered(), 3);
    }

    #[test]
    fn playback_completion_requests_capture_reset() {
        let mut s = connected();
        let playback = s.playback().clone();
        let mut sched = playback.scheduler().unwrap();
        let (mut out, _log) = crate::audio::stub::StubOutput::new();

        playback.finish_stream();
        sched.step(&mut out);
        s.poll_playback();
        assert!(s.take_capture_reset());
    }
}
