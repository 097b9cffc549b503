//! In-process relay transport.
//!
//! Every [`MemoryConnector::open`] creates a transport whose other end is a
//! [`MemoryRemote`]. Tests (or an embedding host) take the remote with
//! [`MemoryConnector::accept`] and play the relay: read the frames the client
//! sent, push frames back, or close the transport.

// Rust guideline compliant 2026-02

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use super::{ChannelTransport, Connector, Outbound, TransportEvent, TransportLink};
use crate::error::WalletLinkError;
use crate::models::RelayUrl;

#[derive(Debug, Default)]
struct MemoryState {
    unaccepted: HashMap<RelayUrl, VecDeque<MemoryRemote>>,
    opens: HashMap<RelayUrl, usize>,
    refused: HashSet<RelayUrl>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    state: Mutex<MemoryState>,
    opened: Notify,
}

/// [`Connector`] whose transports end in [`MemoryRemote`]s.
///
/// Cloning shares the same set of remotes.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    inner: Arc<MemoryInner>,
}

impl MemoryConnector {
    /// Create a connector with no refused URLs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later open of `url` fail with `TransportFailed`.
    pub fn refuse(&self, url: impl Into<RelayUrl>) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.refused.insert(url.into());
        }
    }

    /// Number of transports opened to `url` so far.
    #[must_use]
    pub fn open_count(&self, url: &RelayUrl) -> usize {
        self.inner
            .state
            .lock()
            .map(|state| state.opens.get(url).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Wait for the next transport opened to `url` and take its remote end.
    pub async fn accept(&self, url: impl Into<RelayUrl>) -> MemoryRemote {
        let url = url.into();
        loop {
            let notified = self.inner.opened.notified();
            if let Some(remote) = self.take_unaccepted(&url) {
                return remote;
            }
            notified.await;
        }
    }

    fn take_unaccepted(&self, url: &RelayUrl) -> Option<MemoryRemote> {
        let mut state = self.inner.state.lock().ok()?;
        state.unaccepted.get_mut(url)?.pop_front()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, url: &RelayUrl) -> Result<TransportLink, WalletLinkError> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        {
            let mut state = self
                .inner
                .state
                .lock()
                .map_err(|e| WalletLinkError::TransportFailed(e.to_string()))?;
            if state.refused.contains(url) {
                return Err(WalletLinkError::TransportFailed(format!("{url} refused the connection")));
            }
            *state.opens.entry(url.clone()).or_default() += 1;
            state
                .unaccepted
                .entry(url.clone())
                .or_default()
                .push_back(MemoryRemote {
                    url: url.clone(),
                    outbound: outbound_rx,
                    events: events_tx,
                    closed: Arc::clone(&closed),
                });
        }
        self.inner.opened.notify_waiters();
        log::debug!("[Transport] Opened in-memory transport to {}", url);

        Ok(TransportLink {
            transport: Box::new(ChannelTransport::new(outbound_tx, closed)),
            events: events_rx,
        })
    }
}

/// Relay-side end of an in-memory transport.
#[derive(Debug)]
pub struct MemoryRemote {
    url: RelayUrl,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<TransportEvent>,
    closed: Arc<AtomicBool>,
}

impl MemoryRemote {
    /// URL this transport was opened to.
    #[must_use]
    pub fn url(&self) -> &RelayUrl {
        &self.url
    }

    /// Next frame sent by the client; `None` once the client closed.
    pub async fn next_frame(&mut self) -> Option<String> {
        match self.outbound.recv().await? {
            Outbound::Frame(text) => Some(text),
            Outbound::Close => None,
        }
    }

    /// Next frame if one is already queued.
    pub fn try_next_frame(&mut self) -> Option<String> {
        match self.outbound.try_recv().ok()? {
            Outbound::Frame(text) => Some(text),
            Outbound::Close => None,
        }
    }

    /// Next frame parsed as JSON. Non-JSON frames are skipped.
    pub async fn next_json(&mut self) -> Option<serde_json::Value> {
        loop {
            let frame = self.next_frame().await?;
            if let Ok(value) = serde_json::from_str(&frame) {
                return Some(value);
            }
        }
    }

    /// Deliver a frame to the client. Returns `false` if the client is gone.
    pub fn push(&self, text: impl Into<String>) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.events.send(TransportEvent::Frame(text.into())).is_ok()
    }

    /// Deliver a JSON frame to the client.
    pub fn push_json(&self, value: &serde_json::Value) -> bool {
        self.push(value.to_string())
    }

    /// Close the transport from the relay side.
    pub fn close(&self, reason: impl Into<String>) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Closed { reason: reason.into() });
        }
    }

    /// True once either side closed the transport.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for MemoryRemote {
    fn drop(&mut self) {
        self.close("remote dropped");
    }
}
