//! Mote device host entry point.
//!
//! Loads settings and the provisioning store, opens the audio devices, and
//! runs the voice loop until Ctrl-C.
//!
//! ## Environment
//!
//! - `RUST_LOG` overrides the default `mote=info` filter.
//! - `MOTE_SETTINGS` points at an alternate settings file.
//! - `MOTE_STUB_AUDIO=1` swaps the sound card for silent stub devices.

mod settings;
mod storage;

use std::sync::Arc;

use anyhow::{bail, Context};
use mote_core::audio::stub::{StubCapture, StubOutput};
use mote_core::store::{self, KeyValueStore, MemoryStore};
use mote_core::{transport, CpalCapture, CpalOutput, MoteEngine, SessionEvent};
use settings::{default_settings_path, load_settings, save_settings};
use storage::SqliteStore;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mote=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn open_store() -> Arc<dyn KeyValueStore> {
    match SqliteStore::new(SqliteStore::default_db_path()) {
        Ok(store) => {
            info!(path = %store.path().display(), "opened key-value store");
            Arc::new(store)
        }
        Err(e) => {
            warn!("key-value store unavailable, identity will not persist: {e}");
            Arc::new(MemoryStore::new())
        }
    }
}

fn stub_audio_requested() -> bool {
    std::env::var("MOTE_STUB_AUDIO")
        .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let settings_path = default_settings_path();
    let settings = load_settings(&settings_path);
    if !settings_path.exists() {
        if let Err(e) = save_settings(&settings_path, &settings) {
            warn!(path = %settings_path.display(), "could not write default settings: {e}");
        }
    }

    let store = open_store();
    let fallback = settings.fallback_endpoint();
    let Some(endpoint) = store::load_endpoint(store.as_ref(), fallback.as_ref())
        .context("reading gateway configuration")?
    else {
        bail!(
            "no gateway configured: provision `gateway/host` or set gatewayHost in {}",
            settings_path.display()
        );
    };
    let device_id = store::device_id(store.as_ref()).context("resolving device id")?;

    let config = settings.to_engine_config();
    let rate = config.sample_rate;
    let heartbeat = config.heartbeat.clone();
    let frame_queue = config.frame_queue;
    info!(
        device_id = %device_id,
        gateway = %endpoint,
        volume = config.playback.volume,
        "starting mote"
    );

    let engine = Arc::new(MoteEngine::new(config, device_id));

    let (playback, capture) = if stub_audio_requested() {
        warn!("using stub audio devices");
        let playback = engine.start_playback(move || Ok(StubOutput::paced(rate).0))?;
        let capture = engine.start_capture(move || Ok(StubCapture::silent(rate)))?;
        (playback, capture)
    } else {
        let output = settings.preferred_output_device.clone();
        let input = settings.preferred_input_device.clone();
        let playback = engine
            .start_playback(move || CpalOutput::open(output.as_deref(), rate))
            .context("opening output device")?;
        let capture = engine
            .start_capture(move || CpalCapture::open(input.as_deref(), rate))
            .context("opening input device")?;
        (playback, capture)
    };

    let mut events = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::StateChanged { from, to }) => {
                    info!(?from, ?to, "voice state");
                }
                Ok(SessionEvent::Transcript { text }) => info!(%text, "heard"),
                Ok(SessionEvent::Response { text }) => info!(%text, "assistant"),
                Ok(SessionEvent::ServerError { message }) => warn!(%message, "server error"),
                Ok(other) => tracing::debug!(?other, "session event"),
                Err(RecvError::Lagged(n)) => warn!("event logger lagged by {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let stopper = Arc::clone(&engine);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            if let Err(e) = stopper.stop() {
                warn!("stop: {e}");
            }
        }
    });

    engine
        .run(
            move || {
                let endpoint = endpoint.clone();
                let heartbeat = heartbeat.clone();
                async move { transport::connect(&endpoint, &heartbeat, frame_queue).await }
            },
            capture,
        )
        .await?;

    if engine.is_running() {
        engine.stop()?;
    }
    if playback.join().is_err() {
        warn!("playback thread panicked");
    }
    info!(diagnostics = ?engine.diagnostics(), "mote stopped");
    Ok(())
}
