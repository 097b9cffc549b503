//! Per-session handshake state machine.
//!
//! The machine performs no I/O. [`HandshakeStateMachine::start`] and
//! [`HandshakeStateMachine::on_message`] return the [`HandshakeAction`]s the
//! owning connection must carry out (frames to send, notices and requests to
//! publish). The current [`HandshakeState`] is also published on a `watch`
//! channel so `link` callers can wait for the outcome.
//!
//! # Steps
//!
//! ```text
//!   Idle ──start──► SessionRequested ──OK──► Linked ──IsLinkedOK──► ConfigReceived
//!        HostSession               IsLinked        GetSessionConfig
//!
//!   ConfigReceived ──GetSessionConfigOK──► EventPublished ──PublishEventOK──► AwaitingResponse
//!                   PublishEvent(Web3Request)
//!
//!   AwaitingResponse ──Event──► Completed | Rejected
//! ```
//!
//! `Completed` and `Rejected` keep classifying later events; `Failed` accepts
//! nothing.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use data_encoding::HEXLOWER;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::watch;

use crate::crypto::{random_hex, Codec};
use crate::dedup::DedupCache;
use crate::error::WalletLinkError;
use crate::models::{ClientMetadata, HostRequest, HostRequestId, LinkNotice, RelayUrl, SessionSecret};
use crate::protocol::web3::{
    Web3Request, Web3RequestEnvelope, Web3Response, Web3ResponseEnvelope, USER_REJECTED_MESSAGE,
};
use crate::protocol::{request_ids, ClientMessage, EventType, ServerMessage};

/// Answered event ids remembered per session.
const ANSWERED_CAPACITY: usize = 256;

/// Progress of one session's handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    /// Not started.
    Idle,
    /// `HostSession` sent.
    SessionRequested,
    /// `IsLinked` sent.
    Linked,
    /// `GetSessionConfig` sent.
    ConfigReceived,
    /// Handshake request published.
    EventPublished,
    /// Handshake done; waiting for the wallet.
    AwaitingResponse,
    /// The wallet answered a request.
    Completed,
    /// The wallet declined a request.
    Rejected,
    /// The session can no longer be used.
    Failed(WalletLinkError),
}

impl HandshakeState {
    /// Relay ack this state is waiting for, by wire type.
    #[must_use]
    pub fn expected_ack(&self) -> Option<&'static str> {
        match self {
            Self::SessionRequested => Some("OK"),
            Self::Linked => Some("IsLinkedOK"),
            Self::ConfigReceived => Some("GetSessionConfigOK"),
            Self::EventPublished => Some("PublishEventOK"),
            _ => None,
        }
    }

    /// True while the four handshake steps are still in flight.
    #[must_use]
    pub fn is_handshaking(&self) -> bool {
        self.expected_ack().is_some()
    }

    /// True once the handshake has finished and events are accepted.
    #[must_use]
    pub fn is_established(&self) -> bool {
        matches!(self, Self::AwaitingResponse | Self::Completed | Self::Rejected)
    }

    /// True if the session may answer pending requests.
    #[must_use]
    pub fn can_respond(&self) -> bool {
        matches!(self, Self::AwaitingResponse | Self::Completed)
    }

    /// True for [`HandshakeState::Failed`].
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Side effect requested by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeAction {
    /// Send a frame to the relay.
    Send(ClientMessage),
    /// Publish a notice.
    Notice(LinkNotice),
    /// Deliver a decrypted event. `notices` describe how it was classified
    /// and are published only if the request is not a duplicate.
    Deliver {
        /// The decrypted request.
        request: HostRequest,
        /// Notices derived from it.
        notices: Vec<LinkNotice>,
    },
    /// The relay destroyed the session; drop it locally and in storage.
    DeleteSession,
}

/// Description of the DApp sent with the handshake request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DappInfo {
    /// Name shown in the wallet.
    pub app_name: String,
    /// Logo shown in the wallet.
    pub app_logo_url: String,
    /// Origin sent with every request.
    pub origin: String,
}

impl Default for DappInfo {
    fn default() -> Self {
        Self {
            app_name: "WalletLink DApp".to_string(),
            app_logo_url: String::new(),
            origin: "http://localhost".to_string(),
        }
    }
}

/// Request received from the wallet that has not been answered yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    /// JSON-RPC method of the request.
    pub method: String,
    /// Id the answer must carry.
    pub reply_id: String,
}

/// Handshake and event state of one session.
#[derive(Debug)]
pub struct HandshakeStateMachine {
    session_id: String,
    secret: SessionSecret,
    url: RelayUrl,
    version: Option<String>,
    codec: Arc<dyn Codec>,
    dapp: Arc<DappInfo>,
    state_tx: watch::Sender<HandshakeState>,
    start_seq: u64,
    /// Ids of requests this session published and is waiting on.
    outstanding: HashMap<String, String>,
    /// Wallet requests not yet approved or rejected, by event id.
    pending: HashMap<String, PendingRequest>,
    /// Event ids already answered.
    answered: DedupCache<String>,
}

impl HandshakeStateMachine {
    /// Create an idle machine. `start_seq` orders machines on one
    /// connection for ack routing.
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        secret: SessionSecret,
        url: RelayUrl,
        version: Option<String>,
        codec: Arc<dyn Codec>,
        dapp: Arc<DappInfo>,
        start_seq: u64,
    ) -> Self {
        let (state_tx, _) = watch::channel(HandshakeState::Idle);
        Self {
            session_id: session_id.into(),
            secret,
            url,
            version,
            codec,
            dapp,
            state_tx,
            start_seq,
            outstanding: HashMap::new(),
            pending: HashMap::new(),
            answered: DedupCache::new(ANSWERED_CAPACITY),
        }
    }

    /// Session this machine drives.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Protocol version announced for the session.
    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Position of this machine in its connection's start order.
    #[must_use]
    pub fn start_seq(&self) -> u64 {
        self.start_seq
    }

    /// Snapshot of the current state.
    #[must_use]
    pub fn state(&self) -> HandshakeState {
        self.state_tx.borrow().clone()
    }

    /// Watch state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<HandshakeState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, next: HandshakeState) {
        log::debug!(
            "[Handshake] {} {:?} -> {:?}",
            self.session_id,
            *self.state_tx.borrow(),
            next
        );
        self.state_tx.send_replace(next);
    }

    /// Begin the handshake by requesting the session.
    pub fn start(&mut self) -> Result<Vec<HandshakeAction>, WalletLinkError> {
        if self.state() != HandshakeState::Idle {
            return Err(WalletLinkError::InvalidSessionState);
        }

        let session_key = self.codec.session_key(&self.session_id, &self.secret);
        self.set_state(HandshakeState::SessionRequested);
        Ok(vec![HandshakeAction::Send(ClientMessage::HostSession {
            id: request_ids::HOST_SESSION,
            session_id: self.session_id.clone(),
            session_key,
        })])
    }

    /// Feed one inbound frame addressed to this session.
    pub fn on_message(&mut self, msg: &ServerMessage) -> Vec<HandshakeAction> {
        let state = self.state();
        if state.is_failed() {
            return Vec::new();
        }

        if msg.marks_destroyed() {
            log::info!("[Handshake] Session {} destroyed by relay", self.session_id);
            self.set_state(HandshakeState::Failed(WalletLinkError::SessionNotFound));
            return vec![
                HandshakeAction::Notice(LinkNotice::SessionDestroyed {
                    session_id: self.session_id.clone(),
                    url: self.url.clone(),
                }),
                HandshakeAction::DeleteSession,
            ];
        }

        match (&state, msg) {
            (HandshakeState::SessionRequested, ServerMessage::Ok { .. }) => {
                self.set_state(HandshakeState::Linked);
                vec![HandshakeAction::Send(ClientMessage::IsLinked {
                    id: request_ids::IS_LINKED,
                    session_id: self.session_id.clone(),
                })]
            }
            (HandshakeState::Linked, ServerMessage::IsLinkedOk { linked, .. }) => {
                log::debug!(
                    "[Handshake] {} wallet linked: {}",
                    self.session_id,
                    linked.unwrap_or(false)
                );
                self.set_state(HandshakeState::ConfigReceived);
                vec![HandshakeAction::Send(ClientMessage::GetSessionConfig {
                    id: request_ids::GET_SESSION_CONFIG,
                    session_id: self.session_id.clone(),
                })]
            }
            (HandshakeState::ConfigReceived, ServerMessage::GetSessionConfigOk { .. }) => {
                let envelope = Web3RequestEnvelope::accounts_request(
                    random_hex(8),
                    self.dapp.app_name.clone(),
                    self.dapp.app_logo_url.clone(),
                    self.dapp.origin.clone(),
                );
                match self.publish_frame(request_ids::PUBLISH_EVENT, &envelope) {
                    Ok(frame) => {
                        self.set_state(HandshakeState::EventPublished);
                        vec![HandshakeAction::Send(frame)]
                    }
                    Err(e) => self.fail(e),
                }
            }
            (HandshakeState::EventPublished, ServerMessage::PublishEventOk { .. }) => {
                self.set_state(HandshakeState::AwaitingResponse);
                Vec::new()
            }
            (s, ServerMessage::Fail { error, .. }) if s.is_handshaking() => {
                let detail = error.clone().unwrap_or_else(|| "unspecified".to_string());
                log::warn!(
                    "[Handshake] Relay rejected {} for {}: {}",
                    s.expected_ack().unwrap_or("request"),
                    self.session_id,
                    detail
                );
                self.fail(WalletLinkError::ServerRejected(detail))
            }
            (s, ServerMessage::Linked { .. }) if s.is_established() => {
                vec![HandshakeAction::Notice(LinkNotice::WalletConnected {
                    session_id: self.session_id.clone(),
                    url: self.url.clone(),
                })]
            }
            (s, ServerMessage::Event { event_id, data, .. }) if s.is_established() => {
                self.on_event(event_id.as_deref(), data)
            }
            (_, ServerMessage::Fail { error, .. }) => {
                log::warn!(
                    "[Handshake] Relay reported failure for {}: {}",
                    self.session_id,
                    error.as_deref().unwrap_or("unspecified")
                );
                Vec::new()
            }
            _ => {
                log::debug!(
                    "[Handshake] {} ignoring {} in {:?}",
                    self.session_id,
                    msg.type_name(),
                    state
                );
                Vec::new()
            }
        }
    }

    /// Move to `Failed(error)` and report it. No-op if already failed.
    pub fn fail(&mut self, error: WalletLinkError) -> Vec<HandshakeAction> {
        if self.state().is_failed() {
            return Vec::new();
        }
        log::warn!("[Handshake] Session {} failed: {}", self.session_id, error);
        self.set_state(HandshakeState::Failed(error.clone()));
        vec![HandshakeAction::Notice(LinkNotice::SessionFailed {
            session_id: self.session_id.clone(),
            url: self.url.clone(),
            error,
        })]
    }

    fn on_event(&mut self, frame_event_id: Option<&str>, data: &str) -> Vec<HandshakeAction> {
        let plaintext = match self.codec.decrypt(data, &self.secret) {
            Ok(plaintext) => plaintext,
            Err(e) => return self.fail(e),
        };
        let payload: Value = match serde_json::from_slice(&plaintext) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("[Handshake] Dropping non-JSON event for {}: {}", self.session_id, e);
                return Vec::new();
            }
        };

        let event_id = frame_event_id
            .map(str::to_string)
            .or_else(|| payload_id(&payload))
            .unwrap_or_else(|| derived_event_id(data));
        let request_id = HostRequestId::new(event_id.clone(), self.session_id.clone(), self.url.clone());
        let mut notices = Vec::new();

        let method = if let Some(envelope) = Web3ResponseEnvelope::from_payload(&payload) {
            self.outstanding.remove(&envelope.id);
            if envelope.response.is_rejection() {
                self.set_state(HandshakeState::Rejected);
                notices.push(LinkNotice::Rejected {
                    request_id: request_id.clone(),
                    message: USER_REJECTED_MESSAGE.to_string(),
                });
            } else {
                if let Some(message) = &envelope.response.error_message {
                    log::warn!(
                        "[Handshake] {} answered {} with error: {}",
                        self.session_id,
                        envelope.response.method,
                        message
                    );
                }
                self.set_state(HandshakeState::Completed);
                notices.push(LinkNotice::Approved {
                    request_id: request_id.clone(),
                });
                if let Some(address) = envelope.response.first_account() {
                    notices.push(LinkNotice::AccountsReceived {
                        session_id: self.session_id.clone(),
                        address: address.to_string(),
                    });
                }
            }
            envelope.response.method
        } else {
            let method = payload
                .pointer("/request/method")
                .or_else(|| payload.get("method"))
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            if self.answered.contains(&event_id) {
                log::debug!("[Handshake] {} already answered {}", self.session_id, event_id);
            } else {
                let reply_id = payload_id(&payload).unwrap_or_else(|| event_id.clone());
                self.pending.insert(
                    event_id,
                    PendingRequest {
                        method: method.clone(),
                        reply_id,
                    },
                );
            }
            method
        };

        vec![HandshakeAction::Deliver {
            request: HostRequest {
                id: request_id,
                method,
                decrypted_payload: payload,
                received_at: Utc::now(),
            },
            notices,
        }]
    }

    /// Encrypt `envelope` into a `PublishEvent` frame and remember its id.
    pub fn publish_frame(
        &mut self,
        id: u64,
        envelope: &Web3RequestEnvelope,
    ) -> Result<ClientMessage, WalletLinkError> {
        let plaintext = serde_json::to_vec(envelope)
            .map_err(|e| WalletLinkError::MalformedMessage(format!("cannot encode request: {e}")))?;
        let data = self.codec.encrypt(&plaintext, &self.secret)?;
        self.outstanding
            .insert(envelope.id.clone(), envelope.request.method().to_string());

        Ok(ClientMessage::PublishEvent {
            id,
            session_id: self.session_id.clone(),
            event: EventType::Web3Request,
            data,
            call_webhook: true,
        })
    }

    /// Build and publish a follow-up request. Returns the frame and the
    /// request's id.
    pub fn request_frame(
        &mut self,
        id: u64,
        request: Web3Request,
    ) -> Result<(ClientMessage, String), WalletLinkError> {
        if !self.state().is_established() {
            return Err(WalletLinkError::InvalidSessionState);
        }
        let envelope = Web3RequestEnvelope::new(random_hex(8), request, self.dapp.origin.clone());
        let frame = self.publish_frame(id, &envelope)?;
        Ok((frame, envelope.id))
    }

    /// Take the pending wallet request `event_id` for answering.
    ///
    /// A session that cannot answer yet is reported as not found.
    pub fn take_pending(&mut self, event_id: &str) -> Result<PendingRequest, WalletLinkError> {
        if !self.state().can_respond() {
            return Err(WalletLinkError::SessionNotFound);
        }
        self.pending.remove(event_id).ok_or(WalletLinkError::EventNotFound)
    }

    /// Put back a request whose answer could not be sent.
    pub fn restore_pending(&mut self, event_id: String, pending: PendingRequest) {
        self.pending.insert(event_id, pending);
    }

    /// Record that `event_id` was answered; redelivery will not re-arm it.
    pub fn mark_answered(&mut self, event_id: String) {
        self.answered.insert(event_id);
    }

    /// Number of wallet requests awaiting an answer.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Encrypt a `Web3Response` answering `pending`.
    pub fn response_frame(
        &self,
        id: u64,
        pending: &PendingRequest,
        response: Web3Response,
    ) -> Result<ClientMessage, WalletLinkError> {
        let envelope = Web3ResponseEnvelope::new(pending.reply_id.clone(), response);
        let plaintext = serde_json::to_vec(&envelope)
            .map_err(|e| WalletLinkError::MalformedMessage(format!("cannot encode response: {e}")))?;
        let data = self.codec.encrypt(&plaintext, &self.secret)?;

        Ok(ClientMessage::PublishEvent {
            id,
            session_id: self.session_id.clone(),
            event: EventType::Web3Response,
            data,
            call_webhook: true,
        })
    }

    /// `SetSessionConfig` frame storing `metadata` for this session.
    #[must_use]
    pub fn metadata_frame(&self, id: u64, metadata: ClientMetadata) -> ClientMessage {
        ClientMessage::SetSessionConfig {
            id,
            session_id: self.session_id.clone(),
            webhook_id: None,
            webhook_url: None,
            metadata,
        }
    }
}

/// The payload's own `id`, as a string.
fn payload_id(payload: &Value) -> Option<String> {
    match payload.get("id")? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Stable id for events that carry none: a prefix of the ciphertext hash.
fn derived_event_id(data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());
    HEXLOWER.encode(&digest[..8])
}
