//! Relay RPC frames.
//!
//! Every frame is a JSON object tagged by `type`. The client sends the
//! handshake requests and configuration updates; the relay answers with
//! `…OK` acknowledgements and pushes `Linked`, `Event` and
//! `SessionConfigUpdated` messages. A bare `"h"` frame is a heartbeat.

// Rust guideline compliant 2026-02

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::WalletLinkError;
use crate::models::ClientMetadata;

/// Heartbeat frame exchanged with the relay.
pub const HEARTBEAT: &str = "h";

/// Request ids used by the four handshake steps.
pub mod request_ids {
    /// `HostSession`.
    pub const HOST_SESSION: u64 = 1;
    /// `IsLinked`.
    pub const IS_LINKED: u64 = 2;
    /// `GetSessionConfig`.
    pub const GET_SESSION_CONFIG: u64 = 3;
    /// `PublishEvent` carrying the handshake request.
    pub const PUBLISH_EVENT: u64 = 4;
    /// First id handed out for requests after the handshake.
    pub const FIRST_DYNAMIC: u64 = 5;
}

/// Name of the event carried by `PublishEvent` / `Event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// DApp → wallet request.
    Web3Request,
    /// Wallet → DApp response.
    Web3Response,
    /// DApp cancelled an outstanding request.
    Web3RequestCanceled,
}

/// Frames sent from the client to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Claim a session with its derived key.
    HostSession {
        /// Request id.
        id: u64,
        /// Session to host.
        session_id: String,
        /// `sha256("{id}, {secret} WalletLink")`.
        session_key: String,
    },
    /// Ask whether the wallet has joined.
    IsLinked {
        /// Request id.
        id: u64,
        /// Session to query.
        session_id: String,
    },
    /// Fetch the session's stored metadata.
    GetSessionConfig {
        /// Request id.
        id: u64,
        /// Session to query.
        session_id: String,
    },
    /// Publish an encrypted event to the other party.
    PublishEvent {
        /// Request id.
        id: u64,
        /// Target session.
        session_id: String,
        /// Event name.
        event: EventType,
        /// Hex AES-GCM envelope.
        data: String,
        /// Ask the relay to fire the wallet's push webhook.
        call_webhook: bool,
    },
    /// Update the session's metadata.
    SetSessionConfig {
        /// Request id.
        id: u64,
        /// Target session.
        session_id: String,
        /// Push webhook id, if registered.
        webhook_id: Option<String>,
        /// Push webhook URL, if registered.
        webhook_url: Option<String>,
        /// Metadata entries to store.
        metadata: ClientMetadata,
    },
}

impl ClientMessage {
    /// Session this frame addresses.
    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Self::HostSession { session_id, .. }
            | Self::IsLinked { session_id, .. }
            | Self::GetSessionConfig { session_id, .. }
            | Self::PublishEvent { session_id, .. }
            | Self::SetSessionConfig { session_id, .. } => session_id,
        }
    }

    /// Wire `type` of the frame.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::HostSession { .. } => "HostSession",
            Self::IsLinked { .. } => "IsLinked",
            Self::GetSessionConfig { .. } => "GetSessionConfig",
            Self::PublishEvent { .. } => "PublishEvent",
            Self::SetSessionConfig { .. } => "SetSessionConfig",
        }
    }

    /// Serialize to a text frame.
    pub fn to_frame(&self) -> Result<String, WalletLinkError> {
        serde_json::to_string(self)
            .map_err(|e| WalletLinkError::MalformedMessage(format!("cannot encode {}: {e}", self.type_name())))
    }
}

/// Frames pushed by the relay.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// `HostSession` accepted.
    #[serde(rename = "OK")]
    Ok {
        /// Echoed request id.
        #[serde(default)]
        id: Option<u64>,
        /// Session the ack belongs to.
        #[serde(default)]
        session_id: Option<String>,
    },
    /// Answer to `IsLinked`.
    #[serde(rename = "IsLinkedOK")]
    IsLinkedOk {
        /// Echoed request id.
        #[serde(default)]
        id: Option<u64>,
        /// Session the ack belongs to.
        #[serde(default)]
        session_id: Option<String>,
        /// Whether the wallet has joined.
        #[serde(default)]
        linked: Option<bool>,
        /// Whether the wallet is currently online.
        #[serde(default)]
        online: Option<bool>,
    },
    /// Answer to `GetSessionConfig`.
    #[serde(rename = "GetSessionConfigOK")]
    GetSessionConfigOk {
        /// Echoed request id.
        #[serde(default)]
        id: Option<u64>,
        /// Session the ack belongs to.
        #[serde(default)]
        session_id: Option<String>,
        /// Stored metadata.
        #[serde(default)]
        metadata: BTreeMap<String, serde_json::Value>,
    },
    /// `PublishEvent` accepted.
    #[serde(rename = "PublishEventOK")]
    PublishEventOk {
        /// Echoed request id.
        #[serde(default)]
        id: Option<u64>,
        /// Session the ack belongs to.
        #[serde(default)]
        session_id: Option<String>,
        /// Id the relay assigned to the published event.
        #[serde(default)]
        event_id: Option<String>,
    },
    /// A request failed on the relay.
    Fail {
        /// Echoed request id.
        #[serde(default)]
        id: Option<u64>,
        /// Session the failure belongs to.
        #[serde(default)]
        session_id: Option<String>,
        /// Relay error description.
        #[serde(default)]
        error: Option<String>,
    },
    /// The wallet joined the session.
    Linked {
        /// Joined session.
        #[serde(default)]
        session_id: Option<String>,
        /// Whether the wallet is online.
        #[serde(default)]
        online: Option<bool>,
    },
    /// Encrypted event from the wallet.
    Event {
        /// Session the event belongs to.
        session_id: String,
        /// Relay-assigned event id.
        #[serde(default)]
        event_id: Option<String>,
        /// Event name.
        #[serde(default)]
        event: Option<String>,
        /// Hex AES-GCM envelope.
        data: String,
    },
    /// Session metadata changed on the relay.
    SessionConfigUpdated {
        /// Session whose metadata changed.
        #[serde(default)]
        session_id: Option<String>,
        /// New metadata.
        #[serde(default)]
        metadata: BTreeMap<String, serde_json::Value>,
    },
    /// Any frame type this client does not handle.
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Parse a text frame.
    ///
    /// Returns `Ok(None)` for heartbeats and empty frames, and
    /// [`WalletLinkError::MalformedMessage`] for non-JSON frames or frames
    /// without a string `type`.
    pub fn parse(text: &str) -> Result<Option<Self>, WalletLinkError> {
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed == HEARTBEAT {
            return Ok(None);
        }

        let value: serde_json::Value = serde_json::from_str(trimmed)
            .map_err(|e| WalletLinkError::MalformedMessage(format!("invalid JSON: {e}")))?;
        if !value.get("type").is_some_and(serde_json::Value::is_string) {
            return Err(WalletLinkError::MalformedMessage("missing type field".to_string()));
        }

        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| WalletLinkError::MalformedMessage(e.to_string()))
    }

    /// Session the frame names, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Ok { session_id, .. }
            | Self::IsLinkedOk { session_id, .. }
            | Self::GetSessionConfigOk { session_id, .. }
            | Self::PublishEventOk { session_id, .. }
            | Self::Fail { session_id, .. }
            | Self::Linked { session_id, .. }
            | Self::SessionConfigUpdated { session_id, .. } => session_id.as_deref(),
            Self::Event { session_id, .. } => Some(session_id),
            Self::Unknown => None,
        }
    }

    /// Wire `type` of the frame.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Ok { .. } => "OK",
            Self::IsLinkedOk { .. } => "IsLinkedOK",
            Self::GetSessionConfigOk { .. } => "GetSessionConfigOK",
            Self::PublishEventOk { .. } => "PublishEventOK",
            Self::Fail { .. } => "Fail",
            Self::Linked { .. } => "Linked",
            Self::Event { .. } => "Event",
            Self::SessionConfigUpdated { .. } => "SessionConfigUpdated",
            Self::Unknown => "Unknown",
        }
    }

    /// True if the metadata carried by this frame marks the session destroyed.
    #[must_use]
    pub fn marks_destroyed(&self) -> bool {
        match self {
            Self::GetSessionConfigOk { metadata, .. } | Self::SessionConfigUpdated { metadata, .. } => {
                metadata
                    .get(crate::models::ClientMetadataKey::Destroyed.as_str())
                    .and_then(serde_json::Value::as_str)
                    == Some("1")
            }
            _ => false,
        }
    }
}
