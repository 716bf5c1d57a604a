//! # mote-core
//!
//! On-device runtime for a voice-interaction appliance.
//!
//! ## Architecture
//!
//! ```text
//! CaptureDevice → codec::encode → mic gain ─► VoiceSession (VAD, gate, holdoff)
//!  (capture thread)                              │            ▲
//!                                                ▼            │ control frames
//!                                        Connection (voice channel)
//!                                                             │ binary frames
//!                                                             ▼
//!          OutputDevice ◄── gain ◄── Scheduler ◄── SampleRing ◄── produce()
//!                          (playback thread)
//! ```
//!
//! The session loop is single-threaded and cooperative. The playback
//! scheduler runs on its own thread and only shares the sample ring with it.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod store;
pub mod transport;
pub mod vad;

// Convenience re-exports for downstream crates
pub use buffering::chunk::SampleBuffer;
pub use engine::{EngineConfig, MoteEngine};
pub use error::{MoteError, Result};
pub use ipc::events::{SessionEvent, VoiceState};
pub use playback::{
    PlaybackConfig, PlaybackEngine, PlaybackEvent, PlaybackState, ThreadPriorityStatus,
};
pub use session::{SessionConfig, VoiceSession};
pub use store::KeyValueStore;
pub use transport::{Connection, Endpoint, HeartbeatConfig, TlsMode};

#[cfg(feature = "audio-cpal")]
pub use audio::{CpalCapture, CpalOutput};
