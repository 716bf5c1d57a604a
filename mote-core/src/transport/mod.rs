//! Where the voice channel goes and what a live channel looks like.
//!
//! A [`Connection`] is a pair of bounded queues: frames out, events in. The
//! WebSocket connector (feature `ws`) pumps a real socket into that shape;
//! [`Connection::pair`] builds an in-memory one for tests and simulators.
//!
//! Secured vs. plain transport is a trust-boundary decision and therefore
//! configuration ([`TlsMode`]). `Auto` picks plain only for addresses that
//! cannot leave the local network.

#[cfg(feature = "ws")]
mod ws;

#[cfg(feature = "ws")]
pub use ws::connect;

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{MoteError, Result};
use crate::protocol::Frame;

pub const DEFAULT_PATH: &str = "/ws/voice";
pub const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Plain for private/loopback/link-local hosts, TLS otherwise.
    #[default]
    Auto,
    Secure,
    Plain,
}

impl FromStr for TlsMode {
    type Err = MoteError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(TlsMode::Auto),
            "secure" | "tls" | "wss" => Ok(TlsMode::Secure),
            "plain" | "ws" => Ok(TlsMode::Plain),
            other => Err(MoteError::Config(format!("unknown tls mode `{other}`"))),
        }
    }
}

/// True for hosts that stay on the local network.
pub fn is_private_host(host: &str) -> bool {
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        Ok(IpAddr::V6(v6)) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || (first & 0xfe00) == 0xfc00 // unique local
                || (first & 0xffc0) == 0xfe80 // link local
        }
        Err(_) => false,
    }
}

/// Target of the voice channel.
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub token: String,
    pub tls: TlsMode,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, token: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            path: DEFAULT_PATH.into(),
            token: token.into(),
            tls: TlsMode::Auto,
        }
    }

    pub fn with_tls(mut self, tls: TlsMode) -> Self {
        self.tls = tls;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(MoteError::Config("gateway host is empty".into()));
        }
        if self.port == 0 {
            return Err(MoteError::Config("gateway port is 0".into()));
        }
        Ok(())
    }

    pub fn use_tls(&self) -> bool {
        match self.tls {
            TlsMode::Secure => true,
            TlsMode::Plain => false,
            TlsMode::Auto => !is_private_host(&self.host),
        }
    }

    /// Full URL, token included. Never log this.
    pub fn url(&self) -> String {
        self.build_url(&self.token)
    }

    /// URL safe for logs.
    pub fn redacted_url(&self) -> String {
        if self.token.is_empty() {
            self.build_url("")
        } else {
            self.build_url("***")
        }
    }

    fn build_url(&self, token: &str) -> String {
        let scheme = if self.use_tls() { "wss" } else { "ws" };
        let host = match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => format!("[{}]", self.host),
            _ => self.host.clone(),
        };
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("{scheme}://{host}:{}{path}?token={token}", self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted_url())
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("path", &self.path)
            .field("token", &"***")
            .field("tls", &self.tls)
            .finish()
    }
}

/// WebSocket keep-alive. A zero interval disables it.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub pong_timeout: Duration,
    /// Consecutive unanswered pings that close the connection.
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            pong_timeout: Duration::from_secs(3),
            max_missed: 2,
        }
    }
}

impl HeartbeatConfig {
    pub fn enabled(&self) -> bool {
        !self.interval.is_zero()
    }
}

/// Something that happened on the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(Frame),
    /// The channel is gone. Carries a reason when one is known.
    Closed(Option<String>),
}

/// A live channel as seen by the main loop.
#[derive(Debug)]
pub struct Connection {
    outgoing: mpsc::Sender<Frame>,
    incoming: mpsc::Receiver<TransportEvent>,
}

/// The far side of an in-memory [`Connection`].
#[derive(Debug)]
pub struct RemoteEnd {
    pub to_device: mpsc::Sender<TransportEvent>,
    pub from_device: mpsc::Receiver<Frame>,
}

impl RemoteEnd {
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.to_device
            .send(TransportEvent::Frame(Frame::Text(text.into())))
            .await
            .map_err(|_| MoteError::ConnectionClosed)
    }

    pub async fn send_binary(&self, bytes: Vec<u8>) -> Result<()> {
        self.to_device
            .send(TransportEvent::Frame(Frame::Binary(bytes)))
            .await
            .map_err(|_| MoteError::ConnectionClosed)
    }

    pub async fn close(&self, reason: Option<String>) -> Result<()> {
        self.to_device
            .send(TransportEvent::Closed(reason))
            .await
            .map_err(|_| MoteError::ConnectionClosed)
    }
}

impl Connection {
    pub fn new(
        outgoing: mpsc::Sender<Frame>,
        incoming: mpsc::Receiver<TransportEvent>,
    ) -> Self {
        Self { outgoing, incoming }
    }

    /// In-memory channel with `capacity` frames of buffering each way.
    pub fn pair(capacity: usize) -> (Connection, RemoteEnd) {
        let (out_tx, out_rx) = mpsc::channel(capacity.max(1));
        let (in_tx, in_rx) = mpsc::channel(capacity.max(1));
        (
            Connection::new(out_tx, in_rx),
            RemoteEnd {
                to_device: in_tx,
                from_device: out_rx,
            },
        )
    }

    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.outgoing
            .send(frame)
            .await
            .map_err(|_| MoteError::ConnectionClosed)
    }

    /// Next event, or `None` once the transport side is gone.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.incoming.recv().await
    }
}
