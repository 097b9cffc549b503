//! WebSocket relay transport.
//!
//! Each opened transport runs one background task that owns the socket:
//!
//! ```text
//!   ChannelTransport ──Outbound──► socket task ──► relay
//!                                      │
//!   TransportEvent  ◄──────────────────┘ (frames, then Closed)
//! ```
//!
//! The task answers pings, drops inbound heartbeats, sends a heartbeat of
//! its own every `heartbeat_interval`, and exits on the first error or close.

// Rust guideline compliant 2026-02

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ChannelTransport, Connector, Outbound, TransportEvent, TransportLink};
use crate::error::WalletLinkError;
use crate::models::RelayUrl;
use crate::protocol::HEARTBEAT;
use crate::ws::{self, WsMessage, WsReader, WsWriter};

/// Default interval between outbound heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Opens relay transports over `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    heartbeat_interval: Duration,
    origin: Option<String>,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketConnector {
    /// Connector with the default heartbeat and no `Origin` header.
    #[must_use]
    pub fn new() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            origin: None,
        }
    }

    /// Set the heartbeat interval. `Duration::ZERO` disables heartbeats.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Send `origin` as the `Origin` header of the upgrade request.
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &RelayUrl) -> Result<TransportLink, WalletLinkError> {
        let ws_url = ws::http_to_ws_scheme(url.as_str());
        let mut headers = Vec::new();
        if let Some(origin) = &self.origin {
            headers.push(("Origin", origin.as_str()));
        }

        log::info!("[Transport] Connecting to {}", ws_url);
        let (writer, reader) = ws::connect(&ws_url, &headers).await.map_err(|e| {
            log::warn!("[Transport] Connection to {} failed: {:#}", ws_url, e);
            WalletLinkError::TransportFailed(format!("{e:#}"))
        })?;
        log::info!("[Transport] Connected to {}", ws_url);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let heartbeat = (!self.heartbeat_interval.is_zero()).then(|| {
            let mut interval = tokio::time::interval_at(
                tokio::time::Instant::now() + self.heartbeat_interval,
                self.heartbeat_interval,
            );
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });

        tokio::spawn(run_socket_loop(SocketLoop {
            url: url.clone(),
            writer,
            reader,
            outbound: outbound_rx,
            events: events_tx,
            heartbeat,
            closed: Arc::clone(&closed),
        }));

        Ok(TransportLink {
            transport: Box::new(ChannelTransport::new(outbound_tx, closed)),
            events: events_rx,
        })
    }
}

struct SocketLoop {
    url: RelayUrl,
    writer: WsWriter,
    reader: WsReader,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<TransportEvent>,
    heartbeat: Option<tokio::time::Interval>,
    closed: Arc<AtomicBool>,
}

async fn next_heartbeat(heartbeat: &mut Option<tokio::time::Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Own the socket until it closes, then report [`TransportEvent::Closed`].
async fn run_socket_loop(mut state: SocketLoop) {
    let reason = loop {
        tokio::select! {
            msg = state.reader.recv() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    if text == HEARTBEAT {
                        log::trace!("[Transport] Heartbeat from {}", state.url);
                        continue;
                    }
                    if state.events.send(TransportEvent::Frame(text)).is_err() {
                        let _ = state.writer.close().await;
                        break "event receiver dropped".to_string();
                    }
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    let _ = state.writer.send_pong(data).await;
                }
                Some(Ok(WsMessage::Close { code, reason })) => {
                    break format!("closed by server ({code}) {reason}").trim_end().to_string();
                }
                Some(Err(e)) => break e.to_string(),
                None => break "stream ended".to_string(),
            },

            cmd = state.outbound.recv() => match cmd {
                Some(Outbound::Frame(text)) => {
                    if let Err(e) = state.writer.send_text(&text).await {
                        break format!("{e:#}");
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = state.writer.close().await;
                    break "closed locally".to_string();
                }
            },

            () = next_heartbeat(&mut state.heartbeat) => {
                if let Err(e) = state.writer.send_text(HEARTBEAT).await {
                    break format!("{e:#}");
                }
            }
        }
    };

    state.closed.store(true, Ordering::SeqCst);
    log::info!("[Transport] {} disconnected: {}", state.url, reason);
    let _ = state.events.send(TransportEvent::Closed { reason });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_unreachable_relay_fails() {
        let connector = WebSocketConnector::new().with_heartbeat_interval(Duration::ZERO);
        let result = connector.open(&RelayUrl::from("ws://127.0.0.1:1/rpc")).await;
        assert!(matches!(result, Err(WalletLinkError::TransportFailed(_))));
    }

    #[test]
    fn test_builder_settings() {
        let connector = WebSocketConnector::new()
            .with_heartbeat_interval(Duration::from_secs(3))
            .with_origin("https://dapp.test");
        assert_eq!(connector.heartbeat_interval, Duration::from_secs(3));
        assert_eq!(connector.origin.as_deref(), Some("https://dapp.test"));
    }
}
