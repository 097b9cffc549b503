//! WalletLink - DApp-side relay client.
//!
//! A DApp and a wallet that share a secret exchange encrypted events through
//! a WalletLink relay server. This crate keeps one persistent transport per
//! relay, runs the session handshake on it, and delivers each wallet request
//! to subscribers exactly once.
//!
//! # Architecture
//!
//! - **Multiplexer** - Owns every connection, links and unlinks sessions
//! - **Connection** - One transport to one relay, routes frames to sessions
//! - **Handshake** - Per-session state machine, pure over incoming frames
//! - **Dispatcher** - Single task that de-duplicates requests and publishes them
//!
//! # Modules
//!
//! - [`multiplexer`] - Public entry point
//! - [`protocol`] - Relay frames and Web3 payloads
//! - [`transport`] - WebSocket and in-memory transports
//! - [`crypto`] - Event envelope encryption
//! - [`config`] - Configuration loading/saving

pub mod bus;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod dedup;
pub mod error;
pub mod handshake;
pub mod models;
pub mod multiplexer;
pub mod pairing;
pub mod protocol;
pub mod repository;
pub mod transport;
pub mod ws;

// Re-export commonly used types
pub use config::Config;
pub use crypto::{Aes256GcmCodec, Codec};
pub use error::WalletLinkError;
pub use handshake::{DappInfo, HandshakeState};
pub use models::{
    ClientMetadata, ClientMetadataKey, HostRequest, HostRequestId, LinkNotice, RelayUrl, Session,
    SessionSecret,
};
pub use multiplexer::{ConnectionMultiplexer, MultiplexerOptions};
pub use pairing::PairingRequest;
pub use repository::{InMemorySessionRepository, SessionRepository};
pub use transport::{Connector, MemoryConnector, WebSocketConnector};
