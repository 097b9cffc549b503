//! Top-level client: relay URL → shared connection, plus the outward streams.
//!
//! # Architecture
//!
//! ```text
//!   caller tasks                         dispatcher task (one per multiplexer)
//!   ────────────                         ─────────────────────────────────────
//!   link / approve / ...                 ┌──────────────────────────────────┐
//!        │                               │ Dispatch::Transport  → Connection│
//!        ▼                               │ Dispatch::Deadline   → Connection│
//!   connections: url → Arc<Connection>   │ outputs → DedupCache → EventBus  │
//!        │                               └──────────────────────────────────┘
//!        ▼                                          ▲
//!   Transport (send queue)       forwarder task per transport (events)
//! ```
//!
//! Only the dispatcher touches the [`DedupCache`], so check-then-insert needs
//! no lock. Caller operations lock the connection table or a connection's
//! session table briefly and never across an `.await`.

// Rust guideline compliant 2026-02

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::bus::{BusEvent, EventBus, NoticeSubscription, RequestSubscription, Topic};
use crate::connection::{wait_established, Connection, ConnectionOutput};
use crate::crypto::{Aes256GcmCodec, Codec};
use crate::dedup::{DedupCache, DEFAULT_DEDUP_CAPACITY};
use crate::error::WalletLinkError;
use crate::handshake::DappInfo;
use crate::models::{
    ClientMetadata, ClientMetadataKey, HostRequest, HostRequestId, LinkNotice, RelayUrl, Session, SessionSecret,
};
use crate::protocol::web3::Web3Request;
use crate::repository::SessionRepository;
use crate::transport::{Connector, TransportEvent};

/// Default time a handshake may take before the session fails.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunables for a [`ConnectionMultiplexer`].
#[derive(Debug, Clone)]
pub struct MultiplexerOptions {
    /// Handshake deadline; `Duration::ZERO` waits forever.
    pub handshake_timeout: Duration,
    /// Number of request ids remembered for de-duplication.
    pub dedup_capacity: usize,
    /// DApp description sent with each handshake.
    pub dapp: DappInfo,
    /// Payload codec.
    pub codec: Arc<dyn Codec>,
}

impl Default for MultiplexerOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            dapp: DappInfo::default(),
            codec: Arc::new(Aes256GcmCodec::new()),
        }
    }
}

type ConnectionTable = Arc<RwLock<HashMap<RelayUrl, Arc<Connection>>>>;

/// Work item for the dispatcher.
#[derive(Debug)]
enum Dispatch {
    /// Event from a connection's transport.
    Transport {
        connection: Arc<Connection>,
        event: TransportEvent,
    },
    /// A handshake deadline passed.
    Deadline {
        connection: Weak<Connection>,
        session_id: String,
        start_seq: u64,
    },
}

/// Relay client multiplexing many sessions over one transport per URL.
///
/// Must be created inside a tokio runtime; it spawns its dispatcher task.
#[derive(Debug)]
pub struct ConnectionMultiplexer {
    connector: Arc<dyn Connector>,
    repository: Arc<dyn SessionRepository>,
    codec: Arc<dyn Codec>,
    dapp: Arc<DappInfo>,
    handshake_timeout: Duration,
    connections: ConnectionTable,
    forwarders: Mutex<HashMap<RelayUrl, JoinHandle<()>>>,
    link_locks: Mutex<HashMap<RelayUrl, Arc<tokio::sync::Mutex<()>>>>,
    bus: Arc<EventBus>,
    dispatch_tx: mpsc::UnboundedSender<Dispatch>,
    dispatcher: JoinHandle<()>,
}

impl ConnectionMultiplexer {
    /// Create a multiplexer and start its dispatcher.
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        repository: Arc<dyn SessionRepository>,
        options: MultiplexerOptions,
    ) -> Self {
        let connections: ConnectionTable = Arc::default();
        let bus = EventBus::new();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();

        let dispatcher = tokio::spawn(run_dispatcher(
            dispatch_rx,
            Dispatcher {
                dedup: DedupCache::new(options.dedup_capacity.max(1)),
                bus: Arc::clone(&bus),
                repository: Arc::clone(&repository),
                connections: Arc::clone(&connections),
            },
        ));

        Self {
            connector,
            repository,
            codec: options.codec,
            dapp: Arc::new(options.dapp),
            handshake_timeout: options.handshake_timeout,
            connections,
            forwarders: Mutex::new(HashMap::new()),
            link_locks: Mutex::new(HashMap::new()),
            bus,
            dispatch_tx,
            dispatcher,
        }
    }

    /// Open one connection per relay URL used by any stored session and
    /// start every session's handshake. `user_id` only labels the log.
    ///
    /// Handshakes are not awaited; watch [`Self::subscribe_notices`] for
    /// failures. URLs that cannot be reached are skipped with a
    /// [`LinkNotice::TransportClosed`]. The previous connection table is
    /// replaced as a whole.
    pub async fn connect(&self, user_id: &str, metadata: ClientMetadata) -> Result<(), WalletLinkError> {
        let mut by_url: BTreeMap<RelayUrl, Vec<Session>> = BTreeMap::new();
        for session in self.repository.sessions().await {
            by_url.entry(session.url.clone()).or_default().push(session);
        }
        log::info!("[Multiplexer] Connecting {} relay(s) for {}", by_url.len(), user_id);

        let mut table = HashMap::new();
        let mut forwarders = HashMap::new();
        for (url, sessions) in by_url {
            let (connection, forwarder) = match self.open_connection(&url, &metadata).await {
                Ok(pair) => pair,
                Err(e) => {
                    log::warn!("[Multiplexer] Skipping {}: {}", url, e);
                    self.bus
                        .publish(BusEvent::Notice(LinkNotice::TransportClosed { url: url.clone() }));
                    continue;
                }
            };

            for session in &sessions {
                match connection.start_session(&session.id, session.secret.clone(), session.version.clone()) {
                    Ok(start) => self.arm_deadline(&connection, &session.id, start.started),
                    Err(e) => log::warn!("[Multiplexer] Could not start {} on {}: {}", session.id, url, e),
                }
            }
            log::info!("[Multiplexer] Connected {} with {} session(s)", url, sessions.len());
            table.insert(url.clone(), connection);
            forwarders.insert(url, forwarder);
        }

        let old_table = match self.connections.write() {
            Ok(mut current) => std::mem::replace(&mut *current, table),
            Err(e) => return Err(WalletLinkError::Repository(format!("connection table poisoned: {e}"))),
        };
        let old_forwarders = self
            .forwarders
            .lock()
            .map(|mut current| std::mem::replace(&mut *current, forwarders))
            .unwrap_or_default();
        self.shut_down(old_table, old_forwarders);
        Ok(())
    }

    /// Close every connection. Subscriptions stay open. Idempotent.
    pub fn disconnect(&self) {
        let table = self
            .connections
            .write()
            .map(|mut current| std::mem::take(&mut *current))
            .unwrap_or_default();
        let forwarders = self
            .forwarders
            .lock()
            .map(|mut current| std::mem::take(&mut *current))
            .unwrap_or_default();
        if !table.is_empty() {
            log::info!("[Multiplexer] Disconnecting {} connection(s)", table.len());
        }
        self.shut_down(table, forwarders);
    }

    /// Every stored session.
    pub async fn sessions(&self) -> Vec<Session> {
        self.repository.sessions().await
    }

    /// Watch the stored session list.
    pub fn observe_sessions(&self) -> watch::Receiver<Vec<Session>> {
        self.repository.observe_sessions()
    }

    /// Link a session and wait for its handshake.
    ///
    /// Reuses the URL's connection if one is registered. Otherwise a new
    /// connection is opened and registered only if the handshake succeeds.
    /// The linked session is saved to the repository.
    pub async fn link(
        &self,
        session_id: &str,
        secret: SessionSecret,
        version: Option<String>,
        url: &RelayUrl,
        user_id: &str,
        metadata: ClientMetadata,
    ) -> Result<(), WalletLinkError> {
        if let Some(connection) = self.connection(url) {
            self.link_on(&connection, session_id, secret.clone(), version.clone())
                .await?;
        } else {
            let url_lock = self.url_lock(url);
            let _guard = url_lock.lock().await;

            // Another link may have registered the URL while we waited.
            if let Some(connection) = self.connection(url) {
                self.link_on(&connection, session_id, secret.clone(), version.clone())
                    .await?;
            } else {
                let (connection, forwarder) = self.open_connection(url, &metadata).await?;
                if let Err(e) = self
                    .link_on(&connection, session_id, secret.clone(), version.clone())
                    .await
                {
                    log::warn!("[Multiplexer] Link of {} on {} failed: {}", session_id, url, e);
                    forwarder.abort();
                    self.publish_notices(connection.close());
                    return Err(e);
                }
                self.register(connection, forwarder);
            }
        }

        let mut session = Session::new(session_id, secret, url.clone(), user_id);
        session.version = version;
        session.metadata = metadata;
        session.linked = true;
        self.repository.save(session).await?;
        log::info!("[Multiplexer] Linked {} on {}", session_id, url);
        Ok(())
    }

    /// Destroy a session on its relay and remove it from the repository.
    pub async fn unlink(&self, session: &Session) -> Result<(), WalletLinkError> {
        let connection = self
            .connection(&session.url)
            .ok_or_else(|| WalletLinkError::NoConnectionFound(session.url.clone()))?;
        connection.destroy_session(&session.id)?;
        self.repository.delete(&session.id, &session.url).await
    }

    /// Push a metadata entry to every session on every connection.
    pub fn set_metadata(&self, key: &ClientMetadataKey, value: &str) -> Result<(), WalletLinkError> {
        for connection in self.all_connections() {
            if let Err(e) = connection.set_metadata(key, value) {
                log::warn!("[Multiplexer] set_metadata on {} failed: {}", connection.url(), e);
            }
        }
        Ok(())
    }

    /// Answer a wallet request with `result`.
    pub fn approve(&self, request_id: &HostRequestId, result: Value) -> Result<(), WalletLinkError> {
        self.routed(&request_id.url)?.approve(request_id, result)
    }

    /// Decline a wallet request.
    pub fn reject(&self, request_id: &HostRequestId) -> Result<(), WalletLinkError> {
        self.routed(&request_id.url)?.reject(request_id)
    }

    /// Publish a further request on an established session. Returns the
    /// request's id.
    pub fn publish_request(
        &self,
        session_id: &str,
        url: &RelayUrl,
        request: Web3Request,
    ) -> Result<String, WalletLinkError> {
        self.routed(url)?.publish_request(session_id, request)
    }

    /// Mark requests as seen. Individual failures are logged and skipped.
    pub async fn mark_as_seen(&self, request_ids: &[HostRequestId]) {
        for id in request_ids {
            if let Err(e) = self.repository.mark_as_seen(id).await {
                log::debug!("[Multiplexer] mark_as_seen({}) failed: {}", id.event_id, e);
            }
        }
    }

    /// Look up a request received on a stored session.
    pub async fn get_request(
        &self,
        event_id: &str,
        session_id: &str,
        url: &RelayUrl,
    ) -> Result<HostRequest, WalletLinkError> {
        if self.repository.get_session(session_id, url).await.is_none() {
            return Err(WalletLinkError::SessionNotFound);
        }
        self.repository
            .get_request(&HostRequestId::new(event_id, session_id, url.clone()))
            .await
            .ok_or(WalletLinkError::EventNotFound)
    }

    /// Subscribe to de-duplicated requests.
    pub fn subscribe_requests(&self) -> RequestSubscription {
        RequestSubscription::new(self.bus.subscribe(Topic::Requests))
    }

    /// Subscribe to session and transport notices.
    pub fn subscribe_notices(&self) -> NoticeSubscription {
        NoticeSubscription::new(self.bus.subscribe(Topic::Notices))
    }

    /// End every outstanding subscription.
    pub fn clear_subscriptions(&self) {
        self.bus.clear();
    }

    /// Registered connection for `url`, if open.
    #[must_use]
    pub fn connection(&self, url: &RelayUrl) -> Option<Arc<Connection>> {
        let table = self.connections.read().ok()?;
        table.get(url).filter(|c| !c.is_closed()).cloned()
    }

    /// Number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.read().map(|t| t.len()).unwrap_or(0)
    }

    fn routed(&self, url: &RelayUrl) -> Result<Arc<Connection>, WalletLinkError> {
        self.connection(url)
            .ok_or_else(|| WalletLinkError::NoConnectionFound(url.clone()))
    }

    fn all_connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    fn url_lock(&self, url: &RelayUrl) -> Arc<tokio::sync::Mutex<()>> {
        self.link_locks
            .lock()
            .map(|mut locks| Arc::clone(locks.entry(url.clone()).or_default()))
            .unwrap_or_default()
    }

    async fn link_on(
        &self,
        connection: &Arc<Connection>,
        session_id: &str,
        secret: SessionSecret,
        version: Option<String>,
    ) -> Result<(), WalletLinkError> {
        let start = connection.start_session(session_id, secret, version)?;
        self.arm_deadline(connection, session_id, start.started);
        wait_established(start.state).await
    }

    async fn open_connection(
        &self,
        url: &RelayUrl,
        metadata: &ClientMetadata,
    ) -> Result<(Arc<Connection>, JoinHandle<()>), WalletLinkError> {
        let link = self.connector.open(url).await?;
        let connection = Connection::new(
            url.clone(),
            link.transport,
            Arc::clone(&self.codec),
            Arc::clone(&self.dapp),
            metadata.clone(),
        );
        let forwarder = spawn_forwarder(Arc::clone(&connection), link.events, self.dispatch_tx.clone());
        Ok((connection, forwarder))
    }

    fn register(&self, connection: Arc<Connection>, forwarder: JoinHandle<()>) {
        let url = connection.url().clone();
        let replaced = self
            .connections
            .write()
            .ok()
            .and_then(|mut table| table.insert(url.clone(), connection));
        if let Some(old) = replaced {
            self.publish_notices(old.close());
        }
        if let Ok(mut forwarders) = self.forwarders.lock() {
            if let Some(old) = forwarders.insert(url, forwarder) {
                old.abort();
            }
        }
    }

    fn shut_down(&self, connections: HashMap<RelayUrl, Arc<Connection>>, forwarders: HashMap<RelayUrl, JoinHandle<()>>) {
        for forwarder in forwarders.into_values() {
            forwarder.abort();
        }
        for connection in connections.into_values() {
            self.publish_notices(connection.close());
        }
    }

    fn publish_notices(&self, notices: Vec<LinkNotice>) {
        for notice in notices {
            self.bus.publish(BusEvent::Notice(notice));
        }
    }

    fn arm_deadline(&self, connection: &Arc<Connection>, session_id: &str, started: Option<u64>) {
        let Some(start_seq) = started else {
            return;
        };
        if self.handshake_timeout.is_zero() {
            return;
        }

        let timeout = self.handshake_timeout;
        let tx = self.dispatch_tx.clone();
        let connection = Arc::downgrade(connection);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(Dispatch::Deadline {
                connection,
                session_id,
                start_seq,
            });
        });
    }
}

impl Drop for ConnectionMultiplexer {
    fn drop(&mut self) {
        self.disconnect();
        self.dispatcher.abort();
    }
}

/// Pump one transport's events into the dispatcher.
fn spawn_forwarder(
    connection: Arc<Connection>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    tx: mpsc::UnboundedSender<Dispatch>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let closed = matches!(event, TransportEvent::Closed { .. });
            let item = Dispatch::Transport {
                connection: Arc::clone(&connection),
                event,
            };
            if tx.send(item).is_err() || closed {
                break;
            }
        }
    })
}

/// State owned by the dispatcher task.
struct Dispatcher {
    dedup: DedupCache,
    bus: Arc<EventBus>,
    repository: Arc<dyn SessionRepository>,
    connections: ConnectionTable,
}

async fn run_dispatcher(mut rx: mpsc::UnboundedReceiver<Dispatch>, mut state: Dispatcher) {
    while let Some(item) = rx.recv().await {
        let outputs = match item {
            Dispatch::Transport {
                connection,
                event: TransportEvent::Frame(text),
            } => connection.handle_frame(&text),
            Dispatch::Transport {
                connection,
                event: TransportEvent::Closed { reason },
            } => {
                state.unregister(&connection);
                connection.handle_closed(&reason)
            }
            Dispatch::Deadline {
                connection,
                session_id,
                start_seq,
            } => connection
                .upgrade()
                .map(|c| c.expire_handshake(&session_id, start_seq))
                .unwrap_or_default(),
        };

        for output in outputs {
            state.publish(output).await;
        }
    }
    log::debug!("[Dispatcher] Exiting");
}

impl Dispatcher {
    /// Drop `connection` from the table if it is still the registered one.
    fn unregister(&self, connection: &Arc<Connection>) {
        if let Ok(mut table) = self.connections.write() {
            let registered = table
                .get(connection.url())
                .is_some_and(|current| Arc::ptr_eq(current, connection));
            if registered {
                table.remove(connection.url());
                log::info!("[Dispatcher] Removed closed connection {}", connection.url());
            }
        }
    }

    async fn publish(&mut self, output: ConnectionOutput) {
        match output {
            ConnectionOutput::Request { request, notices } => {
                if self.dedup.contains(&request.id) {
                    log::debug!(
                        "[Dispatcher] Dropping duplicate event {} on {}",
                        request.id.event_id,
                        request.id.session_id
                    );
                    return;
                }
                self.dedup.insert(request.id.clone());

                if let Err(e) = self.repository.add_pending_request(request.clone()).await {
                    log::debug!("[Dispatcher] Request {} not stored: {}", request.id.event_id, e);
                }
                self.bus.publish(BusEvent::Request(request));
                for notice in notices {
                    self.bus.publish(BusEvent::Notice(notice));
                }
            }
            ConnectionOutput::Notice(notice) => {
                self.bus.publish(BusEvent::Notice(notice));
            }
            ConnectionOutput::SessionDeleted { session_id, url } => {
                match self.repository.delete(&session_id, &url).await {
                    Ok(()) => log::info!("[Dispatcher] Deleted destroyed session {}", session_id),
                    Err(e) => log::debug!("[Dispatcher] Could not delete {}: {}", session_id, e),
                }
            }
        }
    }
}
