//! Error kinds surfaced by the WalletLink client.
//!
//! Every public operation returns `Result<_, WalletLinkError>`. The enum is
//! `Clone` so a failure can be stored in a handshake state and broadcast to
//! every task waiting on that session.

// Rust guideline compliant 2026-02

use crate::models::RelayUrl;

/// Errors that can occur while linking sessions or exchanging events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletLinkError {
    /// No connection is registered for the relay URL.
    NoConnectionFound(RelayUrl),
    /// The session is unknown (to the connection or to the repository).
    SessionNotFound,
    /// No pending request matches the event id.
    EventNotFound,
    /// Ciphertext could not be decrypted with the session secret.
    DecryptionFailure,
    /// Frame was not valid JSON, or lacked a `type` field.
    MalformedMessage(String),
    /// The transport closed while the operation was in flight.
    TransportClosed,
    /// The transport could not be opened.
    TransportFailed(String),
    /// The relay did not acknowledge a handshake step in time.
    HandshakeTimeout,
    /// The relay answered a handshake step with a `Fail` frame.
    ServerRejected(String),
    /// The session exists but is not in a state that allows the operation.
    InvalidSessionState,
    /// The session repository reported an error.
    Repository(String),
}

impl std::fmt::Display for WalletLinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoConnectionFound(url) => write!(f, "No connection found for {url}"),
            Self::SessionNotFound => write!(f, "Session not found"),
            Self::EventNotFound => write!(f, "Event not found"),
            Self::DecryptionFailure => write!(f, "Unable to decrypt event data"),
            Self::MalformedMessage(msg) => write!(f, "Malformed message: {msg}"),
            Self::TransportClosed => write!(f, "Transport closed"),
            Self::TransportFailed(msg) => write!(f, "Transport failed: {msg}"),
            Self::HandshakeTimeout => write!(f, "Handshake timed out"),
            Self::ServerRejected(msg) => write!(f, "Relay server rejected request: {msg}"),
            Self::InvalidSessionState => write!(f, "Session is not ready for this operation"),
            Self::Repository(msg) => write!(f, "Session repository error: {msg}"),
        }
    }
}

impl std::error::Error for WalletLinkError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_url() {
        let err = WalletLinkError::NoConnectionFound(RelayUrl::from("wss://relay.test/rpc"));
        assert_eq!(err.to_string(), "No connection found for wss://relay.test/rpc");
    }

    #[test]
    fn test_errors_convert_to_anyhow() {
        let err: anyhow::Error = WalletLinkError::HandshakeTimeout.into();
        assert_eq!(err.to_string(), "Handshake timed out");
    }
}
