//! Observer-facing types published on the engine's broadcast channel.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a
//! presentation layer (status display, log shipper) can forward them as JSON.

pub mod events;
