//! WebSocket plumbing for relay connections.
//!
//! Wraps `tokio-tungstenite` in a reader/writer pair so the transport loop
//! can drive both halves from one `tokio::select!`. Nothing else in the crate
//! touches `tokio-tungstenite` directly.

// Rust guideline compliant 2026-02

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Frame read from the relay.
#[derive(Debug)]
pub enum WsMessage {
    /// UTF-8 text frame (relay RPC or heartbeat).
    Text(String),
    /// Ping frame; answered with a pong carrying the same payload.
    Ping(Vec<u8>),
    /// Close frame with status code and reason.
    Close {
        /// WebSocket close code (1005 when the peer sent none).
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Write half of a relay socket.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

impl WsWriter {
    /// Send a text frame.
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string()))
            .await
            .context("WebSocket send_text failed")
    }

    /// Answer a ping.
    pub async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Pong(data))
            .await
            .context("WebSocket send_pong failed")
    }

    /// Send a close frame and shut the sink.
    pub async fn close(&mut self) -> Result<()> {
        // The peer may already be gone; closing the sink is what matters.
        let _ = self.sink.send(tungstenite::Message::Close(None)).await;
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Read half of a relay socket.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl WsReader {
    /// Next frame, or `None` once the stream has ended.
    ///
    /// Binary, pong and raw frames are not part of the relay protocol and are
    /// skipped.
    pub async fn recv(&mut self) -> Option<Result<WsMessage>> {
        loop {
            match self.stream.next().await? {
                Ok(tungstenite::Message::Text(text)) => {
                    return Some(Ok(WsMessage::Text(text.to_string())));
                }
                Ok(tungstenite::Message::Ping(data)) => {
                    return Some(Ok(WsMessage::Ping(data.to_vec())));
                }
                Ok(tungstenite::Message::Close(close_frame)) => {
                    let (code, reason) = close_frame
                        .map(|cf| (cf.code.into(), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Some(Ok(WsMessage::Close { code, reason }));
                }
                Ok(tungstenite::Message::Binary(data)) => {
                    log::debug!("[Transport] Ignoring {} byte binary frame", data.len());
                }
                Ok(tungstenite::Message::Pong(_) | tungstenite::Message::Frame(_)) => {}
                Err(e) => return Some(Err(anyhow::anyhow!("WebSocket read error: {e}"))),
            }
        }
    }
}

/// Open a WebSocket to `url`, adding each `(name, value)` header to the
/// upgrade request.
pub async fn connect(url: &str, headers: &[(&str, &str)]) -> Result<(WsWriter, WsReader)> {
    use tungstenite::client::IntoClientRequest;

    let mut request = url
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {url}"))?;

    for &(name, value) in headers {
        let header_name = tungstenite::http::HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name: {name}"))?;
        let header_value = tungstenite::http::HeaderValue::from_str(value)
            .with_context(|| format!("invalid header value for {name}"))?;
        request.headers_mut().insert(header_name, header_value);
    }

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .with_context(|| format!("WebSocket connect to {url} failed"))?;

    let (sink, stream) = ws_stream.split();
    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Rewrite an `http(s)://` relay address to `ws(s)://`.
///
/// WebSocket URLs pass through unchanged.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_to_ws_scheme() {
        assert_eq!(
            http_to_ws_scheme("https://www.walletlink.org/rpc"),
            "wss://www.walletlink.org/rpc"
        );
        assert_eq!(http_to_ws_scheme("http://localhost:8080/rpc"), "ws://localhost:8080/rpc");
    }

    #[test]
    fn test_ws_urls_pass_through() {
        assert_eq!(http_to_ws_scheme("wss://relay.test/rpc"), "wss://relay.test/rpc");
        assert_eq!(http_to_ws_scheme("ws://127.0.0.1:9/rpc"), "ws://127.0.0.1:9/rpc");
    }

    #[test]
    fn test_only_scheme_is_rewritten() {
        assert_eq!(
            http_to_ws_scheme("https://relay.test/?next=http://x"),
            "wss://relay.test/?next=http://x"
        );
    }

    #[tokio::test]
    async fn test_connect_invalid_url_returns_error() {
        assert!(connect("not-a-url", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_unreachable_host_returns_error() {
        assert!(connect("ws://127.0.0.1:1/rpc", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_header() {
        assert!(connect("ws://127.0.0.1:1/rpc", &[("bad header", "x")]).await.is_err());
    }
}
