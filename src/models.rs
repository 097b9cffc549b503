//! Domain types shared by the connection, multiplexer and repository layers.

// Rust guideline compliant 2026-02

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::WalletLinkError;

/// Relay server identifier (the WebSocket URL of the relay RPC endpoint).
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelayUrl(String);

impl RelayUrl {
    /// Borrow the URL as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RelayUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RelayUrl {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RelayUrl {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for RelayUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Shared symmetric secret negotiated out-of-band (QR code / deep link).
///
/// Zeroed on drop and never printed by `Debug`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct SessionSecret(String);

impl SessionSecret {
    /// Wrap secret material.
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Borrow the raw secret for encryption.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionSecret(<redacted>)")
    }
}

impl From<&str> for SessionSecret {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Metadata keys understood by the relay's `SetSessionConfig` call.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum ClientMetadataKey {
    /// The wallet's Ethereum address.
    EthereumAddress,
    /// Marks a session as destroyed; the relay stores `"1"`.
    Destroyed,
    /// Any other application-defined key.
    Custom(String),
}

impl ClientMetadataKey {
    /// Wire name of the key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::EthereumAddress => "EthereumAddress",
            Self::Destroyed => "__destroyed",
            Self::Custom(key) => key,
        }
    }
}

impl std::fmt::Display for ClientMetadataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client metadata attached to sessions, keyed by wire name.
pub type ClientMetadata = BTreeMap<String, String>;

/// A linked (DApp, wallet) pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Session identifier shared with the wallet.
    pub id: String,
    /// Shared secret used to derive the session key and encrypt events.
    pub secret: SessionSecret,
    /// Relay server the session lives on.
    pub url: RelayUrl,
    /// Local user the session belongs to.
    pub user_id: String,
    /// Protocol version announced by the wallet, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Client metadata pushed to the relay.
    #[serde(default)]
    pub metadata: ClientMetadata,
    /// Whether the handshake has completed at least once.
    #[serde(default)]
    pub linked: bool,
}

impl Session {
    /// Create an unlinked session record.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        secret: impl Into<SessionSecret>,
        url: impl Into<RelayUrl>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            secret: secret.into(),
            url: url.into(),
            user_id: user_id.into(),
            version: None,
            metadata: ClientMetadata::new(),
            linked: false,
        }
    }
}

/// Identity of one inbound request; the de-duplication key.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostRequestId {
    /// Relay event identifier.
    pub event_id: String,
    /// Session the event was published on.
    pub session_id: String,
    /// Relay server the event arrived from.
    pub url: RelayUrl,
}

impl HostRequestId {
    /// Build a request id.
    #[must_use]
    pub fn new(
        event_id: impl Into<String>,
        session_id: impl Into<String>,
        url: impl Into<RelayUrl>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            session_id: session_id.into(),
            url: url.into(),
        }
    }
}

/// A decrypted request delivered to the consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostRequest {
    /// Unique id of the request.
    pub id: HostRequestId,
    /// JSON-RPC method named by the payload.
    pub method: String,
    /// Full decrypted JSON payload.
    pub decrypted_payload: serde_json::Value,
    /// When the event was decrypted.
    pub received_at: DateTime<Utc>,
}

/// Out-of-band notifications about sessions and transports.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkNotice {
    /// The wallet joined the session.
    WalletConnected {
        /// Session the wallet joined.
        session_id: String,
        /// Relay server of the session.
        url: RelayUrl,
    },
    /// The wallet answered a request successfully.
    Approved {
        /// Request that was answered.
        request_id: HostRequestId,
    },
    /// The wallet declined a request.
    Rejected {
        /// Request that was declined.
        request_id: HostRequestId,
        /// Error message supplied by the wallet.
        message: String,
    },
    /// The wallet shared its account address.
    AccountsReceived {
        /// Session the address belongs to.
        session_id: String,
        /// First address of the returned account list.
        address: String,
    },
    /// A session's handshake or event processing failed.
    SessionFailed {
        /// Failed session.
        session_id: String,
        /// Relay server of the session.
        url: RelayUrl,
        /// Cause of the failure.
        error: WalletLinkError,
    },
    /// The relay reported the session as destroyed.
    SessionDestroyed {
        /// Destroyed session.
        session_id: String,
        /// Relay server of the session.
        url: RelayUrl,
    },
    /// The transport to a relay server closed.
    TransportClosed {
        /// Relay server whose transport closed.
        url: RelayUrl,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = SessionSecret::new("c0ffee");
        assert_eq!(format!("{secret:?}"), "SessionSecret(<redacted>)");
        assert_eq!(secret.expose(), "c0ffee");
    }

    #[test]
    fn test_session_serializes_camel_case() {
        let session = Session::new("s1", "abc", "wss://relay.test/rpc", "user-1");
        let json = serde_json::to_value(&session).expect("serialize");
        assert_eq!(json["id"], "s1");
        assert_eq!(json["secret"], "abc");
        assert_eq!(json["url"], "wss://relay.test/rpc");
        assert_eq!(json["userId"], "user-1");
        assert_eq!(json["linked"], false);
        assert!(json.get("version").is_none());
    }

    #[test]
    fn test_metadata_key_wire_names() {
        assert_eq!(ClientMetadataKey::EthereumAddress.as_str(), "EthereumAddress");
        assert_eq!(ClientMetadataKey::Destroyed.as_str(), "__destroyed");
        assert_eq!(ClientMetadataKey::Custom("Theme".into()).to_string(), "Theme");
    }

    #[test]
    fn test_request_ids_differ_by_url() {
        let a = HostRequestId::new("e1", "s1", "wss://a.test");
        let b = HostRequestId::new("e1", "s1", "wss://b.test");
        assert_ne!(a, b);
        assert_eq!(a, HostRequestId::new("e1", "s1", "wss://a.test"));
    }
}
