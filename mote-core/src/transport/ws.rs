//! WebSocket connector built on `tokio-tungstenite`.
//!
//! The socket is split into a reader task and a writer task. The writer also
//! owns the heartbeat: it pings on a fixed interval, expects any inbound
//! traffic within the pong timeout, and closes the socket once too many
//! pings in a row go unanswered. Either task may report the end of the
//! channel as `TransportEvent::Closed`; the main loop acts on the first.

use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{interval_at, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::{Connection, Endpoint, HeartbeatConfig, TransportEvent};
use crate::error::{MoteError, Result};
use crate::protocol::Frame;

/// Open the voice channel. Resolves once the WebSocket handshake completes.
pub async fn connect(
    endpoint: &Endpoint,
    heartbeat: &HeartbeatConfig,
    capacity: usize,
) -> Result<Connection> {
    endpoint.validate()?;
    info!(url = %endpoint.redacted_url(), "connecting voice channel");

    let (socket, _response) = connect_async(endpoint.url())
        .await
        .map_err(|e| MoteError::Transport(e.to_string()))?;
    info!(url = %endpoint.redacted_url(), "voice channel connected");

    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(capacity.max(1));
    let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(capacity.max(1));
    let last_seen = Arc::new(Mutex::new(Instant::now()));

    let reader_tx = in_tx.clone();
    let reader_seen = Arc::clone(&last_seen);
    tokio::spawn(async move {
        let reason = loop {
            let message = match stream.next().await {
                Some(Ok(m)) => m,
                Some(Err(e)) => break Some(e.to_string()),
                None => break None,
            };
            *reader_seen.lock() = Instant::now();

            let frame = match message {
                Message::Text(text) => Frame::Text(text),
                Message::Binary(bytes) => Frame::Binary(bytes),
                Message::Close(close) => break close.map(|c| c.reason.into_owned()),
                // tungstenite answers pings itself.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };
            if reader_tx.send(TransportEvent::Frame(frame)).await.is_err() {
                // Main loop dropped the connection.
                return;
            }
        };
        debug!(?reason, "voice channel reader finished");
        let _ = reader_tx.send(TransportEvent::Closed(reason)).await;
    });

    let heartbeat = heartbeat.clone();
    tokio::spawn(async move {
        let period = if heartbeat.enabled() {
            heartbeat.interval
        } else {
            // Unused: the tick branch is disabled.
            std::time::Duration::from_secs(3_600)
        };
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut missed = 0u32;
        let mut last_ping = Instant::now();
        let mut pong_deadline: Option<tokio::time::Instant> = None;

        loop {
            let deadline = pong_deadline.unwrap_or_else(|| tokio::time::Instant::now() + period);
            tokio::select! {
                frame = out_rx.recv() => {
                    let Some(frame) = frame else {
                        let _ = sink.close().await;
                        debug!("voice channel writer closed by owner");
                        return;
                    };
                    let message = match frame {
                        Frame::Text(text) => Message::Text(text),
                        Frame::Binary(bytes) => Message::Binary(bytes),
                    };
                    if let Err(e) = sink.send(message).await {
                        warn!("voice channel write failed: {e}");
                        let _ = in_tx.send(TransportEvent::Closed(Some(e.to_string()))).await;
                        return;
                    }
                }
                _ = ticker.tick(), if heartbeat.enabled() => {
                    last_ping = Instant::now();
                    pong_deadline = Some(tokio::time::Instant::now() + heartbeat.pong_timeout);
                    if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                        let _ = in_tx.send(TransportEvent::Closed(Some(e.to_string()))).await;
                        return;
                    }
                }
                _ = tokio::time::sleep_until(deadline), if pong_deadline.is_some() => {
                    pong_deadline = None;
                    if *last_seen.lock() >= last_ping {
                        missed = 0;
                        continue;
                    }
                    missed += 1;
                    warn!(missed, "heartbeat unanswered");
                    if missed >= heartbeat.max_missed.max(1) {
                        let _ = sink.close().await;
                        let _ = in_tx
                            .send(TransportEvent::Closed(Some("heartbeat timeout".into())))
                            .await;
                        return;
                    }
                }
            }
        }
    });

    Ok(Connection::new(out_tx, in_rx))
}
