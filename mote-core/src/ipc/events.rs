//! Session events for the presentation layer.
//!
//! | Event              | Emitted when                                   |
//! |--------------------|------------------------------------------------|
//! | `stateChanged`     | the voice state machine takes a transition     |
//! | `connection`       | the channel connects or drops                  |
//! | `transcript`       | the server reports what it heard               |
//! | `response`         | the server reports what it will say            |
//! | `audioArrived`     | a synthesized-speech frame reached playback    |
//! | `serverError`      | the server sends `voice.error`                 |
//! | `playbackCompleted`| a finished turn drained out of the speaker     |

use serde::{Deserialize, Serialize};

/// Voice session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceState {
    /// No channel.
    #[default]
    Disconnected,
    /// Connected, streaming the microphone for wake-word detection.
    Idle,
    /// Server heard the wake word and is taking the command.
    Listening,
    /// Server is working on a reply. The microphone is not forwarded.
    Processing,
    /// Reply audio is arriving and playing.
    Speaking,
}

impl VoiceState {
    /// Whether captured microphone audio may be sent in this state.
    ///
    /// `Speaking` is included so the server can hear a barge-in wake word.
    pub fn forwards_audio(self) -> bool {
        matches!(
            self,
            VoiceState::Idle | VoiceState::Listening | VoiceState::Speaking
        )
    }

    pub fn is_connected(self) -> bool {
        self != VoiceState::Disconnected
    }
}

/// Everything the session tells its observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SessionEvent {
    StateChanged { from: VoiceState, to: VoiceState },
    Connection { connected: bool },
    Transcript { text: String },
    Response { text: String },
    /// `samples` arrived; `accepted` made it into the ring.
    AudioArrived { samples: usize, accepted: usize },
    ServerError { message: String },
    PlaybackCompleted,
}
