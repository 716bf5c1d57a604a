use std::collections::HashSet;
use std::time::{Duration, Instant};

use mote_core::audio::stub::StubOutput;
use mote_core::ipc::events::{SessionEvent, VoiceState};
use mote_core::playback::{PlaybackConfig, PlaybackEngine, PlaybackState};
use mote_core::protocol::{encode_samples, Frame};
use mote_core::session::{SessionConfig, VoiceSession};
use mote_core::SampleBuffer;
use tokio::sync::broadcast;

fn new_session() -> (VoiceSession, broadcast::Receiver<SessionEvent>) {
    let playback = PlaybackEngine::new(
        PlaybackConfig {
            volume: 100,
            ..PlaybackConfig::default()
        },
        16_000,
    );
    let (tx, rx) = broadcast::channel(256);
    let config = SessionConfig {
        device_id: "00aabbccddee".into(),
        silence_holdoff: Duration::from_millis(1_500),
        max_protocol_errors: 5,
    };
    (VoiceSession::new(config, 500.0, playback, tx), rx)
}

fn msg(kind: &str) -> String {
    match kind {
        "voice.transcription" | "voice.response" => {
            format!(r#"{{"type":"{kind}","text":"ok"}}"#)
        }
        "voice.error" => format!(r#"{{"type":"{kind}","error":"bad"}}"#),
        _ => format!(r#"{{"type":"{kind}"}}"#),
    }
}

fn window(level: i16) -> SampleBuffer {
    SampleBuffer::new(vec![level; 1_024], 16_000)
}

fn silence_frames(frames: &[Frame]) -> usize {
    frames
        .iter()
        .filter(|f| matches!(f, Frame::Text(t) if t == r#"{"type":"voice.silence"}"#))
        .count()
}

#[test]
fn done_drains_then_signals_capture_reset() {
    let (mut s, mut rx) = new_session();
    s.on_connected(Instant::now());
    for kind in ["voice.listening", "voice.processing", "voice.response"] {
        s.handle_text(&msg(kind));
    }
    assert_eq!(s.state(), VoiceState::Speaking);

    s.handle_binary(&encode_samples(&vec![500; 4_096]));
    s.handle_text(&msg("voice.done"));
    assert_eq!(s.state(), VoiceState::Idle);
    assert!(s.take_capture_reset(), "reset requested on done");

    // Buffered speech still plays out.
    let playback = s.playback().clone();
    assert_eq!(playback.buffered(), 4_096);
    let mut sched = playback.scheduler().unwrap();
    let (mut out, log) = StubOutput::new();
    let mut guard = 0;
    loop {
        let state = sched.step(&mut out);
        guard += 1;
        assert!(guard < 32);
        if state == PlaybackState::Idle && playback.buffered() == 0 && guard > 2 {
            break;
        }
    }
    assert_eq!(log.lock().samples.len(), 4_096);

    s.poll_playback();
    assert!(s.take_capture_reset(), "reset requested again on drain");

    let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
    assert!(events.contains(&SessionEvent::PlaybackCompleted));
    assert!(events.contains(&SessionEvent::StateChanged {
        from: VoiceState::Speaking,
        to: VoiceState::Idle
    }));
}

#[test]
fn one_silence_notice_exactly_when_holdoff_expires() {
    let (mut s, _rx) = new_session();
    s.on_connected(Instant::now());
    s.handle_text(&msg("voice.listening"));
    s.drain_outgoing().for_each(drop);

    let t0 = Instant::now();
    let step = Duration::from_millis(64);
    let mut at = t0;
    for _ in 0..3 {
        s.process_capture(&window(2_000), at);
        at += step;
    }
    let last_voice = at - step;
    assert_eq!(silence_frames(&s.drain_outgoing().collect::<Vec<_>>()), 0);

    // Quiet windows right up to the holdoff boundary: nothing yet.
    while at <= last_voice + Duration::from_millis(1_500) {
        s.process_capture(&window(0), at);
        assert_eq!(
            silence_frames(&s.drain_outgoing().collect::<Vec<_>>()),
            0,
            "too early at {:?}",
            at - last_voice
        );
        at += step;
    }

    // First window past the boundary carries the notice, after its audio.
    s.process_capture(&window(0), at);
    let frames: Vec<_> = s.drain_outgoing().collect();
    assert_eq!(silence_frames(&frames), 1);
    assert!(matches!(frames.first(), Some(Frame::Binary(_))));

    for _ in 0..40 {
        at += step;
        s.process_capture(&window(0), at);
    }
    assert_eq!(silence_frames(&s.drain_outgoing().collect::<Vec<_>>()), 0);
    assert_eq!(s.diagnostics().silence_notices, 1);
    assert_eq!(s.state(), VoiceState::Listening, "silence is advisory");
}

#[test]
fn every_declared_transition_is_reachable() {
    let (mut s, mut rx) = new_session();
    s.on_connected(Instant::now());
    let script = [
        "voice.listening",
        "voice.processing",
        "voice.response",
        "voice.done",
        "voice.listening",
        "voice.response",
        "voice.interrupt",
        "voice.processing",
        "voice.interrupt",
        "voice.processing",
        "voice.error",
    ];
    for kind in script {
        s.handle_text(&msg(kind));
    }
    s.on_disconnected();

    let seen: HashSet<(VoiceState, VoiceState)> = std::iter::from_fn(|| rx.try_recv().ok())
        .filter_map(|e| match e {
            SessionEvent::StateChanged { from, to } => Some((from, to)),
            _ => None,
        })
        .collect();

    use VoiceState::*;
    let declared: HashSet<_> = [
        (Disconnected, Idle),
        (Idle, Listening),
        (Listening, Processing),
        (Processing, Speaking),
        (Speaking, Idle),
        (Listening, Speaking),
        (Speaking, Listening),
        (Processing, Listening),
        (Processing, Idle),
        (Idle, Disconnected),
    ]
    .into_iter()
    .collect();
    assert_eq!(seen, declared);
}

#[test]
fn no_undeclared_transition_under_arbitrary_input() {
    use VoiceState::*;
    let allowed: HashSet<(VoiceState, VoiceState)> = [
        (Disconnected, Idle),
        (Idle, Listening),
        (Listening, Processing),
        (Listening, Speaking),
        (Processing, Speaking),
        (Listening, Idle),
        (Processing, Idle),
        (Speaking, Idle),
        (Speaking, Listening),
        (Processing, Listening),
        (Idle, Disconnected),
        (Listening, Disconnected),
        (Processing, Disconnected),
        (Speaking, Disconnected),
    ]
    .into_iter()
    .collect();

    let kinds = [
        "voice.listening",
        "voice.transcription",
        "voice.processing",
        "voice.response",
        "voice.done",
        "voice.interrupt",
        "voice.error",
    ];

    let (mut s, mut rx) = new_session();
    s.on_connected(Instant::now());
    // Deterministic pseudo-random walk.
    let mut seed = 0x2545_f491u32;
    for i in 0..2_000 {
        seed ^= seed << 13;
        seed ^= seed >> 17;
        seed ^= seed << 5;
        s.handle_text(&msg(kinds[seed as usize % kinds.len()]));

        if s.state() == Processing {
            s.process_capture(&window(3_000), Instant::now());
            assert!(
                !s.drain_outgoing().any(|f| matches!(f, Frame::Binary(_))),
                "processing forwarded audio"
            );
        }
        if i % 500 == 499 {
            s.on_disconnected();
            s.on_connected(Instant::now());
        }
        s.drain_outgoing().for_each(drop);

        while let Ok(e) = rx.try_recv() {
            if let SessionEvent::StateChanged { from, to } = e {
                assert!(allowed.contains(&(from, to)), "{from:?} -> {to:?}");
            }
        }
    }
}
