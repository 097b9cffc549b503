//! Relay transports.
//!
//! A [`Connector`] opens one persistent text channel per relay URL and hands
//! back a [`TransportLink`]: the [`Transport`] used to send frames plus the
//! stream of inbound [`TransportEvent`]s. The stream always ends with a single
//! [`TransportEvent::Closed`]; there is no reconnect.
//!
//! Two implementations ship with the crate:
//!
//! - [`WebSocketConnector`] for real relay servers
//! - [`MemoryConnector`] which pairs each opened transport with an in-process
//!   [`MemoryRemote`] (tests and embedding)

// Rust guideline compliant 2026-02

pub mod memory;
pub mod websocket;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::WalletLinkError;
use crate::models::RelayUrl;

pub use memory::{MemoryConnector, MemoryRemote};
pub use websocket::WebSocketConnector;

/// Something that happened on a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Text frame received from the relay.
    Frame(String),
    /// The transport is gone. Always the last event.
    Closed {
        /// Why it closed.
        reason: String,
    },
}

/// Sending side of an open relay transport.
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Queue a text frame. Never waits for the socket.
    fn send(&self, frame: String) -> Result<(), WalletLinkError>;

    /// Close the transport. Idempotent.
    fn close(&self);

    /// True once the transport has closed, locally or remotely.
    fn is_closed(&self) -> bool;
}

/// An opened transport and its inbound events.
#[derive(Debug)]
pub struct TransportLink {
    /// Outbound half.
    pub transport: Box<dyn Transport>,
    /// Inbound half, ending with [`TransportEvent::Closed`].
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens transports to relay servers.
#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    /// Open a transport to `url`.
    ///
    /// Fails with [`WalletLinkError::TransportFailed`] if the relay cannot
    /// be reached.
    async fn open(&self, url: &RelayUrl) -> Result<TransportLink, WalletLinkError>;
}

/// Command queued for the task that owns the socket.
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(String),
    Close,
}

/// [`Transport`] backed by an unbounded queue to the socket owner.
#[derive(Debug)]
pub(crate) struct ChannelTransport {
    tx: mpsc::UnboundedSender<Outbound>,
    closed: Arc<AtomicBool>,
}

impl ChannelTransport {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Outbound>, closed: Arc<AtomicBool>) -> Self {
        Self { tx, closed }
    }
}

impl Transport for ChannelTransport {
    fn send(&self, frame: String) -> Result<(), WalletLinkError> {
        if self.is_closed() || self.tx.send(Outbound::Frame(frame)).is_err() {
            return Err(WalletLinkError::TransportClosed);
        }
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(Outbound::Close);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_after_close_fails() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = ChannelTransport::new(tx, Arc::new(AtomicBool::new(false)));

        transport.send("one".into()).unwrap();
        transport.close();
        transport.close();

        assert!(matches!(rx.try_recv(), Ok(Outbound::Frame(f)) if f == "one"));
        assert!(matches!(rx.try_recv(), Ok(Outbound::Close)));
        assert!(rx.try_recv().is_err(), "close is sent once");
        assert_eq!(transport.send("two".into()), Err(WalletLinkError::TransportClosed));
    }

    #[test]
    fn test_dropped_owner_reads_as_closed() {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = ChannelTransport::new(tx, Arc::new(AtomicBool::new(false)));
        drop(rx);

        assert!(transport.is_closed());
        assert_eq!(transport.send("x".into()), Err(WalletLinkError::TransportClosed));
    }
}
