//! Control and audio framing for the voice channel.
//!
//! One duplex channel carries two payload kinds:
//!
//! | Kind   | Direction        | Content                                  |
//! |--------|------------------|------------------------------------------|
//! | Text   | both             | JSON `{"type": "voice.*", ...fields}`    |
//! | Binary | device → server  | microphone PCM (forwarding gate open)    |
//! | Binary | server → device  | synthesized speech PCM for playback      |
//!
//! PCM is 16-bit signed little-endian mono at the configured rate.
//!
//! Control frames are decoded in two passes: the `type` tag is checked
//! against the known vocabulary first, then the typed variant is built.
//! That keeps "unknown message" apart from "known message with a broken
//! required field" so the session can treat them differently. Unknown
//! extra fields are ignored.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Device → server control messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Session start, sent once per connection.
    #[serde(rename = "voice.start")]
    Start {
        #[serde(rename = "deviceId")]
        device_id: String,
    },
    /// Local holdoff expired: the user has stopped talking.
    #[serde(rename = "voice.silence")]
    Silence {},
}

/// Server → device control messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "voice.listening")]
    Listening {},
    #[serde(rename = "voice.transcription")]
    Transcription { text: String },
    #[serde(rename = "voice.processing")]
    Processing {},
    #[serde(rename = "voice.response")]
    Response { text: String },
    #[serde(rename = "voice.done")]
    Done {},
    #[serde(rename = "voice.interrupt")]
    Interrupt {},
    #[serde(rename = "voice.error")]
    Error { error: String },
}

/// Every `type` tag the device understands from the server.
pub const SERVER_TYPES: &[&str] = &[
    "voice.listening",
    "voice.transcription",
    "voice.processing",
    "voice.response",
    "voice.done",
    "voice.interrupt",
    "voice.error",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed control frame: {0}")]
    Malformed(String),

    #[error("control frame has no string `type`")]
    MissingType,

    #[error("unknown control type `{0}`")]
    UnknownType(String),

    #[error("invalid fields for `{kind}`: {reason}")]
    InvalidFields { kind: String, reason: String },

    #[error("odd-length PCM payload ({0} bytes)")]
    OddLength(usize),
}

/// One unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(t) => t.len(),
            Frame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decode a server control frame.
pub fn decode_server(text: &str) -> Result<ServerMessage, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let kind = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_owned();

    if !SERVER_TYPES.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownType(kind));
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidFields {
        kind,
        reason: e.to_string(),
    })
}

/// Encode a device control message as a text frame.
pub fn encode_client(msg: &ClientMessage) -> Frame {
    // Serialising a plain tagged enum of strings cannot fail.
    Frame::Text(serde_json::to_string(msg).unwrap_or_default())
}

/// PCM samples to little-endian wire bytes.
pub fn encode_samples(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

/// Little-endian wire bytes to PCM samples. The payload must be even-length.
pub fn decode_samples(bytes: &[u8]) -> Result<Vec<i16>, ProtocolError> {
    if bytes.len() % 2 != 0 {
        return Err(ProtocolError::OddLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect())
}

/// Stitches inbound audio frames whose boundaries split a sample.
///
/// A trailing odd byte is held and prefixed to the next frame. Call
/// [`PcmReassembler::reset`] whenever buffered playback is discarded.
#[derive(Debug, Default)]
pub struct PcmReassembler {
    carry: Option<u8>,
}

impl PcmReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<i16> {
        let mut out = Vec::with_capacity((bytes.len() + 1) / 2);
        let mut rest = bytes;

        if let Some(lo) = self.carry.take() {
            match rest.split_first() {
                Some((&hi, tail)) => {
                    out.push(i16::from_le_bytes([lo, hi]));
                    rest = tail;
                }
                None => {
                    self.carry = Some(lo);
                    return out;
                }
            }
        }

        let (body, tail) = rest.split_at(rest.len() & !1);
        match decode_samples(body) {
            Ok(samples) => out.extend(samples),
            Err(e) => tracing::error!("pcm split left an odd body: {e}"),
        }
        if let [last] = tail {
            self.carry = Some(*last);
        }
        out
    }

    pub fn has_carry(&self) -> bool {
        self.carry.is_some()
    }

    pub fn reset(&mut self) {
        self.carry = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_match_wire_format() {
        let start = encode_client(&ClientMessage::Start {
            device_id: "a1b2c3d4e5f6".into(),
        });
        let Frame::Text(text) = start else {
            panic!("expected text frame");
        };
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["type"], "voice.start");
        assert_eq!(json["deviceId"], "a1b2c3d4e5f6");

        assert_eq!(
            encode_client(&ClientMessage::Silence {}),
            Frame::Text(r#"{"type":"voice.silence"}"#.into())
        );
    }

    #[test]
    fn decodes_every_server_type() {
        let cases = [
            (r#"{"type":"voice.listening"}"#, ServerMessage::Listening {}),
            (
                r#"{"type":"voice.transcription","text":"hi"}"#,
                ServerMessage::Transcription { text: "hi".into() },
            ),
            (r#"{"type":"voice.processing"}"#, ServerMessage::Processing {}),
            (
                r#"{"type":"voice.response","text":"hello"}"#,
                ServerMessage::Response {
                    text: "hello".into(),
                },
            ),
            (r#"{"type":"voice.done"}"#, ServerMessage::Done {}),
            (r#"{"type":"voice.interrupt"}"#, ServerMessage::Interrupt {}),
            (
                r#"{"type":"voice.error","error":"boom"}"#,
                ServerMessage::Error {
                    error: "boom".into(),
                },
            ),
        ];
        for (text, expected) in cases {
            assert_eq!(decode_server(text), Ok(expected), "{text}");
        }
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let msg = decode_server(r#"{"type":"voice.done","turnId":7,"extra":{"a":1}}"#);
        assert_eq!(msg, Ok(ServerMessage::Done {}));
    }

    #[test]
    fn classifies_bad_frames() {
        assert!(matches!(
            decode_server("{not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert_eq!(
            decode_server(r#"{"text":"x"}"#),
            Err(ProtocolError::MissingType)
        );
        assert_eq!(
            decode_server(r#"{"type":"voice.dance"}"#),
            Err(ProtocolError::UnknownType("voice.dance".into()))
        );

        let err = decode_server(r#"{"type":"voice.transcription"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFields { ref kind, .. } if kind == "voice.transcription"));
        let err = decode_server(r#"{"type":"voice.error","error":42}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFields { .. }));
    }

    #[test]
    fn sample_bytes_are_little_endian() {
        let bytes = encode_samples(&[1, -2, 0x1234]);
        assert_eq!(bytes, vec![0x01, 0x00, 0xFE, 0xFF, 0x34, 0x12]);
        assert_eq!(decode_samples(&bytes), Ok(vec![1, -2, 0x1234]));
        assert_eq!(decode_samples(&[1, 2, 3]), Err(ProtocolError::OddLength(3)));
    }

    #[test]
    fn reassembler_carries_split_samples() {
        let wire = encode_samples(&[100, -200, 300, -400]);
        let mut r = PcmReassembler::new();

        let mut got = r.push(&wire[..3]);
        assert!(r.has_carry());
        got.extend(r.push(&wire[3..4]));
        assert!(!r.has_carry());
        got.extend(r.push(&wire[4..]));
        assert_eq!(got, vec![100, -200, 300, -400]);
    }

    #[test]
    fn reassembler_reset_drops_carry() {
        let mut r = PcmReassembler::new();
        assert!(r.push(&[0xAA]).is_empty());
        assert!(r.push(&[]).is_empty());
        assert!(r.has_carry());
        r.reset();
        assert_eq!(r.push(&[0x01, 0x00]), vec![1]);
    }
}
