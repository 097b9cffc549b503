//! One relay transport and the sessions multiplexed over it.
//!
//! A `Connection` owns its [`Transport`] and a handshake state machine per
//! session. Inbound frames are fed in by the multiplexer's dispatcher via
//! [`Connection::handle_frame`]; public operations come from caller tasks.
//! Both sides take the session table lock only for short, non-async
//! sections and send through the transport's non-blocking queue.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde_json::Value;
use tokio::sync::watch;

use crate::crypto::Codec;
use crate::error::WalletLinkError;
use crate::handshake::{DappInfo, HandshakeAction, HandshakeState, HandshakeStateMachine};
use crate::models::{ClientMetadata, ClientMetadataKey, HostRequest, HostRequestId, LinkNotice, RelayUrl, SessionSecret};
use crate::protocol::web3::{Web3Request, Web3Response};
use crate::protocol::{request_ids, ClientMessage, ServerMessage};
use crate::transport::Transport;

/// Result of processing inbound traffic, for the dispatcher to publish.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionOutput {
    /// A decrypted event and the notices derived from it.
    Request {
        /// The decrypted request.
        request: HostRequest,
        /// Notices to publish if the request is not a duplicate.
        notices: Vec<LinkNotice>,
    },
    /// A notice that is always published.
    Notice(LinkNotice),
    /// The relay destroyed a session; it should leave storage too.
    SessionDeleted {
        /// Destroyed session.
        session_id: String,
        /// Relay the session lived on.
        url: RelayUrl,
    },
}

/// Outcome of asking a connection to start a session.
#[derive(Debug)]
pub struct SessionStart {
    /// Watches the session's handshake state.
    pub state: watch::Receiver<HandshakeState>,
    /// Start sequence of a newly created handshake; `None` if a live one
    /// already existed.
    pub started: Option<u64>,
}

/// Shared transport to one relay URL.
#[derive(Debug)]
pub struct Connection {
    url: RelayUrl,
    transport: Box<dyn Transport>,
    codec: Arc<dyn Codec>,
    dapp: Arc<DappInfo>,
    metadata: RwLock<ClientMetadata>,
    sessions: Mutex<HashMap<String, HandshakeStateMachine>>,
    next_request_id: AtomicU64,
    next_start_seq: AtomicU64,
}

impl Connection {
    /// Wrap an open transport.
    #[must_use]
    pub fn new(
        url: RelayUrl,
        transport: Box<dyn Transport>,
        codec: Arc<dyn Codec>,
        dapp: Arc<DappInfo>,
        metadata: ClientMetadata,
    ) -> Arc<Self> {
        Arc::new(Self {
            url,
            transport,
            codec,
            dapp,
            metadata: RwLock::new(metadata),
            sessions: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(request_ids::FIRST_DYNAMIC),
            next_start_seq: AtomicU64::new(0),
        })
    }

    /// Relay URL of this connection.
    #[must_use]
    pub fn url(&self) -> &RelayUrl {
        &self.url
    }

    /// True once the transport has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    fn lock_sessions(&self) -> Result<MutexGuard<'_, HashMap<String, HandshakeStateMachine>>, WalletLinkError> {
        self.sessions
            .lock()
            .map_err(|_poisoned| WalletLinkError::InvalidSessionState)
    }

    fn next_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send_frame(&self, frame: &ClientMessage) -> Result<(), WalletLinkError> {
        let text = frame.to_frame()?;
        log::debug!(
            "[Connection] -> {} {} ({})",
            frame.type_name(),
            frame.session_id(),
            self.url
        );
        self.transport.send(text)
    }

    /// Start the handshake for `session_id` unless a live one exists.
    ///
    /// A `Failed` handshake is replaced by a fresh one.
    pub fn start_session(
        &self,
        session_id: &str,
        secret: SessionSecret,
        version: Option<String>,
    ) -> Result<SessionStart, WalletLinkError> {
        if self.transport.is_closed() {
            return Err(WalletLinkError::TransportClosed);
        }

        let mut sessions = self.lock_sessions()?;
        if let Some(existing) = sessions.get(session_id) {
            if !existing.state().is_failed() {
                return Ok(SessionStart {
                    state: existing.subscribe(),
                    started: None,
                });
            }
            log::info!("[Connection] Replacing failed session {} on {}", session_id, self.url);
        }

        let seq = self.next_start_seq.fetch_add(1, Ordering::Relaxed);
        let mut machine = HandshakeStateMachine::new(
            session_id,
            secret,
            self.url.clone(),
            version,
            Arc::clone(&self.codec),
            Arc::clone(&self.dapp),
            seq,
        );
        let state = machine.subscribe();
        let actions = machine.start()?;
        sessions.insert(session_id.to_string(), machine);

        let mut sink = Vec::new();
        self.execute(&mut sessions, session_id, actions, &mut sink);
        drop(sessions);

        log::info!("[Connection] Started handshake for {} on {}", session_id, self.url);
        Ok(SessionStart {
            state,
            started: Some(seq),
        })
    }

    /// Start (if needed) and wait until the session's handshake finishes.
    pub async fn link(
        &self,
        session_id: &str,
        secret: SessionSecret,
        version: Option<String>,
    ) -> Result<(), WalletLinkError> {
        let start = self.start_session(session_id, secret, version)?;
        wait_established(start.state).await
    }

    /// Current handshake state of a session.
    #[must_use]
    pub fn session_state(&self, session_id: &str) -> Option<HandshakeState> {
        let sessions = self.sessions.lock().ok()?;
        sessions.get(session_id).map(HandshakeStateMachine::state)
    }

    /// Ids of every session bound to this connection.
    #[must_use]
    pub fn session_ids(&self) -> Vec<String> {
        self.sessions
            .lock()
            .map(|sessions| sessions.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Best-effort remote destroy, then unconditional local removal.
    pub fn destroy_session(&self, session_id: &str) -> Result<(), WalletLinkError> {
        let mut sessions = self.lock_sessions()?;
        let machine = sessions
            .remove(session_id)
            .ok_or(WalletLinkError::SessionNotFound)?;

        let mut metadata = ClientMetadata::new();
        metadata.insert(ClientMetadataKey::Destroyed.as_str().to_string(), "1".to_string());
        if let Err(e) = self.send_frame(&machine.metadata_frame(self.next_id(), metadata)) {
            log::warn!(
                "[Connection] Could not notify relay of destroyed session {}: {}",
                session_id,
                e
            );
        }
        log::info!("[Connection] Destroyed session {} on {}", session_id, self.url);
        Ok(())
    }

    /// Answer a wallet request with `result`.
    pub fn approve(&self, request_id: &HostRequestId, result: Value) -> Result<(), WalletLinkError> {
        self.respond(request_id, |method| Web3Response::approved(method, result))
    }

    /// Decline a wallet request.
    pub fn reject(&self, request_id: &HostRequestId) -> Result<(), WalletLinkError> {
        self.respond(request_id, |method| Web3Response::rejected(method))
    }

    fn respond(
        &self,
        request_id: &HostRequestId,
        build: impl FnOnce(String) -> Web3Response,
    ) -> Result<(), WalletLinkError> {
        let mut sessions = self.lock_sessions()?;
        let machine = sessions
            .get_mut(&request_id.session_id)
            .ok_or(WalletLinkError::SessionNotFound)?;

        let pending = machine.take_pending(&request_id.event_id)?;
        let sent = machine
            .response_frame(self.next_id(), &pending, build(pending.method.clone()))
            .and_then(|frame| self.send_frame(&frame));
        if let Err(e) = sent {
            machine.restore_pending(request_id.event_id.clone(), pending);
            return Err(e);
        }
        machine.mark_answered(request_id.event_id.clone());
        Ok(())
    }

    /// Encrypt and publish a further request on an established session.
    /// Returns the request's id.
    pub fn publish_request(&self, session_id: &str, request: Web3Request) -> Result<String, WalletLinkError> {
        let mut sessions = self.lock_sessions()?;
        let machine = sessions
            .get_mut(session_id)
            .ok_or(WalletLinkError::SessionNotFound)?;
        let (frame, request_id) = machine.request_frame(self.next_id(), request)?;
        self.send_frame(&frame)?;
        Ok(request_id)
    }

    /// Store `key = value` in this connection's metadata and push it to
    /// every live session. Per-session send failures are logged.
    pub fn set_metadata(&self, key: &ClientMetadataKey, value: &str) -> Result<(), WalletLinkError> {
        if let Ok(mut metadata) = self.metadata.write() {
            metadata.insert(key.as_str().to_string(), value.to_string());
        }

        let sessions = self.lock_sessions()?;
        for machine in sessions.values().filter(|m| !m.state().is_failed()) {
            let mut update = ClientMetadata::new();
            update.insert(key.as_str().to_string(), value.to_string());
            if let Err(e) = self.send_frame(&machine.metadata_frame(self.next_id(), update)) {
                log::warn!(
                    "[Connection] set_metadata({}) failed for {}: {}",
                    key,
                    machine.session_id(),
                    e
                );
            }
        }
        Ok(())
    }

    /// Process one inbound text frame.
    pub fn handle_frame(&self, text: &str) -> Vec<ConnectionOutput> {
        let msg = match ServerMessage::parse(text) {
            Ok(Some(msg)) => msg,
            Ok(None) => return Vec::new(),
            Err(e) => {
                log::warn!("[Connection] Dropping frame from {}: {}", self.url, e);
                return Vec::new();
            }
        };
        log::debug!(
            "[Connection] <- {} {} ({})",
            msg.type_name(),
            msg.session_id().unwrap_or("-"),
            self.url
        );

        let Ok(mut sessions) = self.lock_sessions() else {
            return Vec::new();
        };
        let targets = route(&sessions, &msg);
        if targets.is_empty() {
            log::debug!("[Connection] No session for {} on {}", msg.type_name(), self.url);
        }

        let mut out = Vec::new();
        for session_id in targets {
            let Some(machine) = sessions.get_mut(&session_id) else {
                continue;
            };
            let before = machine.state();
            let actions = machine.on_message(&msg);
            let finished = before == HandshakeState::EventPublished
                && machine.state() == HandshakeState::AwaitingResponse;
            if finished {
                self.push_connection_metadata(machine);
            }
            self.execute(&mut sessions, &session_id, actions, &mut out);
        }
        out
    }

    fn push_connection_metadata(&self, machine: &HandshakeStateMachine) {
        let metadata = self
            .metadata
            .read()
            .map(|m| m.clone())
            .unwrap_or_default();
        if metadata.is_empty() {
            return;
        }
        if let Err(e) = self.send_frame(&machine.metadata_frame(self.next_id(), metadata)) {
            log::warn!(
                "[Connection] Could not send metadata for {}: {}",
                machine.session_id(),
                e
            );
        }
    }

    /// The transport closed: fail every session.
    pub fn handle_closed(&self, reason: &str) -> Vec<ConnectionOutput> {
        log::warn!("[Connection] Transport to {} closed: {}", self.url, reason);
        let mut out = vec![ConnectionOutput::Notice(LinkNotice::TransportClosed {
            url: self.url.clone(),
        })];
        if let Ok(mut sessions) = self.lock_sessions() {
            let ids: Vec<String> = sessions.keys().cloned().collect();
            for session_id in ids {
                if let Some(machine) = sessions.get_mut(&session_id) {
                    let actions = machine.fail(WalletLinkError::TransportClosed);
                    self.execute(&mut sessions, &session_id, actions, &mut out);
                }
            }
        }
        out
    }

    /// Fail a handshake that has not finished by its deadline.
    ///
    /// `start_seq` identifies the handshake the deadline belongs to, so a
    /// replaced session is not affected.
    pub fn expire_handshake(&self, session_id: &str, start_seq: u64) -> Vec<ConnectionOutput> {
        let mut out = Vec::new();
        let Ok(mut sessions) = self.lock_sessions() else {
            return out;
        };
        let Some(machine) = sessions.get_mut(session_id) else {
            return out;
        };
        if machine.start_seq() != start_seq || !machine.state().is_handshaking() {
            return out;
        }
        let actions = machine.fail(WalletLinkError::HandshakeTimeout);
        self.execute(&mut sessions, session_id, actions, &mut out);
        out
    }

    /// Close the transport and drop every session. In-flight `link` calls
    /// resolve with [`WalletLinkError::TransportClosed`].
    ///
    /// Returns a `SessionFailed` notice for each session that had not
    /// already failed.
    #[must_use]
    pub fn close(&self) -> Vec<LinkNotice> {
        let mut notices = Vec::new();
        if let Ok(mut sessions) = self.lock_sessions() {
            for machine in sessions.values_mut() {
                for action in machine.fail(WalletLinkError::TransportClosed) {
                    if let HandshakeAction::Notice(notice) = action {
                        notices.push(notice);
                    }
                }
            }
            sessions.clear();
        }
        self.transport.close();
        log::info!("[Connection] Closed {}", self.url);
        notices
    }

    fn execute(
        &self,
        sessions: &mut HashMap<String, HandshakeStateMachine>,
        session_id: &str,
        actions: Vec<HandshakeAction>,
        out: &mut Vec<ConnectionOutput>,
    ) {
        for action in actions {
            match action {
                HandshakeAction::Send(frame) => {
                    if let Err(e) = self.send_frame(&frame) {
                        log::warn!(
                            "[Connection] Failed to send {} for {}: {}",
                            frame.type_name(),
                            session_id,
                            e
                        );
                    }
                }
                HandshakeAction::Notice(notice) => out.push(ConnectionOutput::Notice(notice)),
                HandshakeAction::Deliver { request, notices } => {
                    out.push(ConnectionOutput::Request { request, notices });
                }
                HandshakeAction::DeleteSession => {
                    sessions.remove(session_id);
                    out.push(ConnectionOutput::SessionDeleted {
                        session_id: session_id.to_string(),
                        url: self.url.clone(),
                    });
                }
            }
        }
    }
}

/// Sessions a frame should be fed to.
///
/// Frames naming a session go to it. Acks without a session id go to the
/// earliest-started session waiting for that ack (`Fail` matches any
/// pending ack). A bare `Linked` goes to every established session.
fn route(sessions: &HashMap<String, HandshakeStateMachine>, msg: &ServerMessage) -> Vec<String> {
    if let Some(session_id) = msg.session_id() {
        return if sessions.contains_key(session_id) {
            vec![session_id.to_string()]
        } else {
            Vec::new()
        };
    }

    match msg {
        ServerMessage::Linked { .. } => sessions
            .values()
            .filter(|m| m.state().is_established())
            .map(|m| m.session_id().to_string())
            .collect(),
        ServerMessage::Ok { .. }
        | ServerMessage::IsLinkedOk { .. }
        | ServerMessage::GetSessionConfigOk { .. }
        | ServerMessage::PublishEventOk { .. }
        | ServerMessage::Fail { .. } => {
            let wanted = msg.type_name();
            sessions
                .values()
                .filter(|m| match m.state().expected_ack() {
                    Some(expected) => wanted == "Fail" || expected == wanted,
                    None => false,
                })
                .min_by_key(|m| m.start_seq())
                .map(|m| vec![m.session_id().to_string()])
                .unwrap_or_default()
        }
        _ => Vec::new(),
    }
}

/// Resolve once the handshake is established, or with its failure.
pub async fn wait_established(mut state: watch::Receiver<HandshakeState>) -> Result<(), WalletLinkError> {
    loop {
        {
            let current = state.borrow_and_update();
            if current.is_established() {
                return Ok(());
            }
            if let HandshakeState::Failed(e) = &*current {
                return Err(e.clone());
            }
        }
        if state.changed().await.is_err() {
            // The state machine was dropped: the session was removed.
            let last = state.borrow().clone();
            return match last {
                HandshakeState::Failed(e) => Err(e),
                s if s.is_established() => Ok(()),
                _ => Err(WalletLinkError::SessionNotFound),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Aes256GcmCodec;
    use crate::transport::{Connector, MemoryConnector, MemoryRemote};

    const URL: &str = "wss://relay.test/rpc";

    async fn open() -> (Arc<Connection>, MemoryRemote) {
        let connector = MemoryConnector::new();
        let link = connector.open(&RelayUrl::from(URL)).await.unwrap();
        let remote = connector.accept(URL).await;
        let conn = Connection::new(
            RelayUrl::from(URL),
            link.transport,
            Arc::new(Aes256GcmCodec::new()),
            Arc::new(DappInfo::default()),
            ClientMetadata::new(),
        );
        (conn, remote)
    }

    /// Play the relay's side of the four-step handshake for one session.
    async fn ack_handshake(conn: &Connection, remote: &mut MemoryRemote) {
        for ack in ["OK", "IsLinkedOK", "GetSessionConfigOK", "PublishEventOK"] {
            let frame = remote.next_json().await.unwrap();
            let reply = serde_json::json!({
                "type": ack,
                "id": frame["id"],
                "sessionId": frame["sessionId"],
            });
            conn.handle_frame(&reply.to_string());
        }
    }

    #[tokio::test]
    async fn test_link_completes_after_four_acks() {
        let (conn, mut remote) = open().await;
        let start = conn.start_session("A", SessionSecret::new("abc"), None).unwrap();
        assert!(start.started.is_some());

        ack_handshake(&conn, &mut remote).await;
        wait_established(start.state).await.unwrap();
        assert_eq!(conn.session_state("A"), Some(HandshakeState::AwaitingResponse));
    }

    #[tokio::test]
    async fn test_second_start_is_noop() {
        let (conn, mut remote) = open().await;
        conn.start_session("A", SessionSecret::new("abc"), None).unwrap();
        let again = conn.start_session("A", SessionSecret::new("abc"), None).unwrap();
        assert!(again.started.is_none());

        assert!(remote.next_frame().await.is_some());
        assert!(remote.try_next_frame().is_none(), "only one HostSession is sent");
    }

    #[tokio::test]
    async fn test_acks_without_session_id_go_to_earliest_session() {
        let (conn, mut remote) = open().await;
        conn.start_session("first", SessionSecret::new("a"), None).unwrap();
        conn.start_session("second", SessionSecret::new("b"), None).unwrap();
        remote.next_frame().await.unwrap();
        remote.next_frame().await.unwrap();

        conn.handle_frame(r#"{"type":"OK","id":1}"#);
        assert_eq!(conn.session_state("first"), Some(HandshakeState::Linked));
        assert_eq!(conn.session_state("second"), Some(HandshakeState::SessionRequested));

        conn.handle_frame(r#"{"type":"OK","id":1}"#);
        assert_eq!(conn.session_state("second"), Some(HandshakeState::Linked));
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let (conn, _remote) = open().await;
        conn.start_session("A", SessionSecret::new("abc"), None).unwrap();
        assert!(conn.handle_frame("{oops").is_empty());
        assert!(conn.handle_frame(r#"{"sessionId":"A"}"#).is_empty());
        assert!(conn.handle_frame("h").is_empty());
        assert_eq!(conn.session_state("A"), Some(HandshakeState::SessionRequested));
    }

    #[tokio::test]
    async fn test_metadata_pushed_after_handshake() {
        let (conn, mut remote) = open().await;
        conn.set_metadata(&ClientMetadataKey::EthereumAddress, "0xabc").unwrap();
        conn.start_session("A", SessionSecret::new("abc"), None).unwrap();
        ack_handshake(&conn, &mut remote).await;

        let frame = remote.next_json().await.unwrap();
        assert_eq!(frame["type"], "SetSessionConfig");
        assert_eq!(frame["id"], 5);
        assert_eq!(frame["metadata"]["EthereumAddress"], "0xabc");
    }

    #[tokio::test]
    async fn test_destroy_sends_marker_and_removes() {
        let (conn, mut remote) = open().await;
        conn.start_session("A", SessionSecret::new("abc"), None).unwrap();
        remote.next_frame().await.unwrap();

        conn.destroy_session("A").unwrap();
        let frame = remote.next_json().await.unwrap();
        assert_eq!(frame["type"], "SetSessionConfig");
        assert_eq!(frame["metadata"]["__destroyed"], "1");
        assert!(conn.session_state("A").is_none());
        assert_eq!(conn.destroy_session("A"), Err(WalletLinkError::SessionNotFound));
    }

    #[tokio::test]
    async fn test_approve_unknown_session_or_event() {
        let (conn, mut remote) = open().await;
        let id = HostRequestId::new("e1", "A", URL);
        assert_eq!(conn.approve(&id, Value::Null), Err(WalletLinkError::SessionNotFound));

        conn.start_session("A", SessionSecret::new("abc"), None).unwrap();
        assert_eq!(conn.reject(&id), Err(WalletLinkError::SessionNotFound));

        ack_handshake(&conn, &mut remote).await;
        assert_eq!(conn.reject(&id), Err(WalletLinkError::EventNotFound));
    }

    #[tokio::test]
    async fn test_transport_close_fails_sessions() {
        let (conn, _remote) = open().await;
        let start = conn.start_session("A", SessionSecret::new("abc"), None).unwrap();

        let out = conn.handle_closed("gone");
        assert_eq!(
            out[0],
            ConnectionOutput::Notice(LinkNotice::TransportClosed {
                url: RelayUrl::from(URL)
            })
        );
        assert_eq!(
            wait_established(start.state).await,
            Err(WalletLinkError::TransportClosed)
        );
    }

    #[tokio::test]
    async fn test_close_reports_live_sessions_once() {
        let (conn, mut remote) = open().await;
        let start = conn.start_session("A", SessionSecret::new("abc"), None).unwrap();
        ack_handshake(&conn, &mut remote).await;
        let other = conn.start_session("B", SessionSecret::new("def"), None).unwrap();
        assert_eq!(conn.expire_handshake("B", other.started.unwrap()).len(), 1);

        let notices = conn.close();
        assert_eq!(
            notices,
            vec![LinkNotice::SessionFailed {
                session_id: "A".into(),
                url: RelayUrl::from(URL),
                error: WalletLinkError::TransportClosed,
            }]
        );
        assert_eq!(
            wait_established(start.state).await,
            Err(WalletLinkError::TransportClosed)
        );
        assert!(conn.close().is_empty());
    }

    #[tokio::test]
    async fn test_expire_only_affects_matching_handshake() {
        let (conn, _remote) = open().await;
        let start = conn.start_session("A", SessionSecret::new("abc"), None).unwrap();
        let seq = start.started.unwrap();

        assert!(conn.expire_handshake("A", seq + 1).is_empty());
        let out = conn.expire_handshake("A", seq);
        assert!(matches!(
            &out[..],
            [ConnectionOutput::Notice(LinkNotice::SessionFailed {
                error: WalletLinkError::HandshakeTimeout,
                ..
            })]
        ));

        // A failed session is replaced on the next start.
        let again = conn.start_session("A", SessionSecret::new("abc"), None).unwrap();
        assert!(again.started.is_some());
    }

    #[tokio::test]
    async fn test_remote_destroy_is_reported() {
        let (conn, mut remote) = open().await;
        conn.start_session("A", SessionSecret::new("abc"), None).unwrap();
        ack_handshake(&conn, &mut remote).await;

        let out = conn.handle_frame(
            r#"{"type":"SessionConfigUpdated","sessionId":"A","metadata":{"__destroyed":"1"}}"#,
        );
        assert!(out.contains(&ConnectionOutput::SessionDeleted {
            session_id: "A".into(),
            url: RelayUrl::from(URL)
        }));
        assert!(conn.session_state("A").is_none());
    }
}
