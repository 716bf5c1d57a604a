//! Persistent device settings (JSON file in the data directory).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mote_core::audio::codec::{clamp_gain, clamp_volume};
use mote_core::transport::DEFAULT_PATH;
use mote_core::{EngineConfig, Endpoint, TlsMode};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
    /// Used only when the store has no gateway host.
    pub gateway_host: Option<String>,
    pub gateway_port: u16,
    pub gateway_path: String,
    pub gateway_token: Option<String>,
    pub gateway_tls: TlsMode,
    pub volume: u8,
    pub playback_gain: f32,
    pub mic_gain: f32,
    pub vad_threshold: f32,
    pub silence_holdoff_ms: u64,
    pub reconnect_interval_ms: u64,
    pub start_threshold_samples: usize,
    pub heartbeat_interval_secs: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            preferred_input_device: None,
            preferred_output_device: None,
            gateway_host: None,
            gateway_port: mote_core::transport::DEFAULT_PORT,
            gateway_path: DEFAULT_PATH.into(),
            gateway_token: None,
            gateway_tls: TlsMode::Auto,
            volume: engine.playback.volume,
            playback_gain: engine.playback.gain,
            mic_gain: engine.mic_gain,
            vad_threshold: engine.vad_threshold,
            silence_holdoff_ms: engine.silence_holdoff.as_millis() as u64,
            reconnect_interval_ms: engine.reconnect_interval.as_millis() as u64,
            start_threshold_samples: engine.playback.start_threshold,
            heartbeat_interval_secs: engine.heartbeat.interval.as_secs(),
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.preferred_input_device = trimmed(self.preferred_input_device.take());
        self.preferred_output_device = trimmed(self.preferred_output_device.take());
        self.gateway_host = trimmed(self.gateway_host.take());
        self.gateway_token = trimmed(self.gateway_token.take());
        if self.gateway_port == 0 {
            self.gateway_port = mote_core::transport::DEFAULT_PORT;
        }
        let path = self.gateway_path.trim();
        self.gateway_path = if path.is_empty() {
            DEFAULT_PATH.into()
        } else if path.starts_with('/') {
            path.into()
        } else {
            format!("/{path}")
        };
        self.volume = clamp_volume(self.volume);
        self.playback_gain = clamp_gain(self.playback_gain);
        self.mic_gain = clamp_gain(self.mic_gain);
        if !self.vad_threshold.is_finite() {
            self.vad_threshold = mote_core::vad::energy::DEFAULT_THRESHOLD;
        }
        self.vad_threshold = self.vad_threshold.clamp(0.0, f32::from(i16::MAX));
        self.silence_holdoff_ms = self.silence_holdoff_ms.clamp(100, 60_000);
        self.reconnect_interval_ms = self.reconnect_interval_ms.clamp(250, 300_000);
        // Must fit in the ring or playback would never start on its own.
        self.start_threshold_samples = self.start_threshold_samples.clamp(256, 16_000 * 30);
        self.heartbeat_interval_secs = self.heartbeat_interval_secs.min(600);
    }

    pub fn to_engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig {
            vad_threshold: self.vad_threshold,
            silence_holdoff: Duration::from_millis(self.silence_holdoff_ms),
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
            mic_gain: self.mic_gain,
            ..EngineConfig::default()
        };
        config.playback.volume = self.volume;
        config.playback.gain = self.playback_gain;
        config.playback.start_threshold = self.start_threshold_samples;
        // Zero disables keep-alive.
        config.heartbeat.interval = Duration::from_secs(self.heartbeat_interval_secs);
        config
    }

    /// Endpoint built from settings alone, used as the store fallback.
    pub fn fallback_endpoint(&self) -> Option<Endpoint> {
        let host = self.gateway_host.clone()?;
        let mut endpoint = Endpoint::new(
            host,
            self.gateway_port,
            self.gateway_token.clone().unwrap_or_default(),
        )
        .with_tls(self.gateway_tls);
        endpoint.path = self.gateway_path.clone();
        Some(endpoint)
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn default_settings_path() -> PathBuf {
    if let Some(path) = std::env::var_os("MOTE_SETTINGS") {
        return PathBuf::from(path);
    }
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Mote")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("mote")
            .join("settings.json")
    }
}

/// Missing or unreadable files yield defaults.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| match serde_json::from_str::<AppSettings>(&raw) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!(path = %path.display(), "ignoring unreadable settings: {e}");
                None
            }
        })
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
