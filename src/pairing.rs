//! Out-of-band pairing.
//!
//! A wallet joins a session by scanning a link that carries the session id,
//! the shared secret and the relay to use. The secret never touches the relay.

// Rust guideline compliant 2026-02

use std::fmt::Write as _;

use qrcodegen::{QrCode, QrCodeEcc};

use crate::crypto::random_hex;
use crate::models::{RelayUrl, SessionSecret};

/// Page the wallet opens to join a session.
pub const LINK_BASE_URL: &str = "https://www.walletlink.org/#/link";

/// Modules of white border around the QR code.
const QUIET_ZONE: i32 = 2;

/// Fresh session credentials for a wallet to join.
#[derive(Debug, Clone)]
pub struct PairingRequest {
    /// Session id (hex, 16 random bytes).
    pub session_id: String,
    /// Shared secret (hex, 32 random bytes).
    pub secret: SessionSecret,
    /// Relay both sides connect to.
    pub url: RelayUrl,
    /// Origin of the DApp asking to pair.
    pub origin: String,
}

impl PairingRequest {
    /// Generate a new id and secret for `url`.
    #[must_use]
    pub fn generate(url: impl Into<RelayUrl>, origin: impl Into<String>) -> Self {
        Self {
            session_id: random_hex(16),
            secret: SessionSecret::new(random_hex(32)),
            url: url.into(),
            origin: origin.into(),
        }
    }

    /// Link the wallet opens to join this session.
    #[must_use]
    pub fn deep_link(&self) -> String {
        format!(
            "{LINK_BASE_URL}?parent-origin={}&id={}&secret={}&server={}&v=1",
            encode_component(&self.origin),
            self.session_id,
            self.secret.expose(),
            encode_component(self.url.as_str()),
        )
    }

    /// The deep link as terminal rows of a QR code.
    pub fn qr_lines(&self) -> Result<Vec<String>, qrcodegen::DataTooLong> {
        qr_code_lines(&self.deep_link())
    }
}

/// Percent-encode everything outside the URI unreserved set.
fn encode_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}

/// Render `data` as a QR code, two modules per terminal row.
///
/// Each character covers one module column and two module rows using
/// Unicode half blocks, which keeps the code roughly square in a terminal.
pub fn qr_code_lines(data: &str) -> Result<Vec<String>, qrcodegen::DataTooLong> {
    let code = QrCode::encode_text(data, QrCodeEcc::Medium)?;
    let total = code.size() + QUIET_ZONE * 2;
    // get_module is false outside the symbol, which gives the quiet zone.
    let dark = |x: i32, y: i32| y < total && code.get_module(x - QUIET_ZONE, y - QUIET_ZONE);

    let lines = (0..total)
        .step_by(2)
        .map(|y| {
            (0..total)
                .map(|x| match (dark(x, y), dark(x, y + 1)) {
                    (true, true) => '█',
                    (true, false) => '▀',
                    (false, true) => '▄',
                    (false, false) => ' ',
                })
                .collect::<String>()
        })
        .collect();
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_sizes() {
        let pairing = PairingRequest::generate("wss://www.walletlink.org/rpc", "http://localhost");
        assert_eq!(pairing.session_id.len(), 32);
        assert_eq!(pairing.secret.expose().len(), 64);

        let other = PairingRequest::generate("wss://www.walletlink.org/rpc", "http://localhost");
        assert_ne!(pairing.session_id, other.session_id);
    }

    #[test]
    fn test_deep_link_encodes_urls() {
        let pairing = PairingRequest {
            session_id: "abcd".into(),
            secret: SessionSecret::new("beef"),
            url: RelayUrl::from("wss://www.walletlink.org/rpc"),
            origin: "http://localhost:3000".into(),
        };
        assert_eq!(
            pairing.deep_link(),
            "https://www.walletlink.org/#/link?parent-origin=http%3A%2F%2Flocalhost%3A3000\
             &id=abcd&secret=beef&server=wss%3A%2F%2Fwww.walletlink.org%2Frpc&v=1"
        );
    }

    #[test]
    fn test_qr_uses_half_blocks() {
        let lines = qr_code_lines("https://example.com").unwrap();
        assert!(!lines.is_empty());
        let width = lines[0].chars().count();
        assert!(lines.iter().all(|l| l.chars().count() == width));
        assert_eq!(lines.len(), width.div_ceil(2));
        assert!(lines.iter().any(|l| l.contains('█') || l.contains('▀') || l.contains('▄')));
        // Quiet zone row.
        assert!(lines[0].chars().all(|c| c == ' '));
    }

    #[test]
    fn test_pairing_qr_renders() {
        let pairing = PairingRequest::generate("wss://www.walletlink.org/rpc", "http://localhost");
        assert!(pairing.qr_lines().unwrap().len() > 10);
    }
}
