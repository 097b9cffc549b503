//! Wire formats: relay RPC frames and the Web3 payloads they carry.

// Rust guideline compliant 2026-02

pub mod messages;
pub mod web3;

pub use messages::{request_ids, ClientMessage, EventType, ServerMessage, HEARTBEAT};
pub use web3::{Web3Request, Web3RequestEnvelope, Web3Response, Web3ResponseEnvelope};
