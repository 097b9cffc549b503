//! AES-256-GCM event envelopes and session key derivation.
//!
//! WalletLink payloads travel through the relay as lowercase hex strings:
//!
//! ```text
//! hex( nonce[12] || tag[16] || ciphertext[..] )
//! ```
//!
//! The symmetric key is the session secret itself when it is 64 hex
//! characters (the form wallets put in the pairing link); any other secret is
//! stretched through SHA-256 so short shared strings still yield a 256-bit key.
//!
//! The relay authenticates a session owner with
//! `sha256("{session_id}, {secret} WalletLink")`, hex encoded.

// Rust guideline compliant 2026-02

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use data_encoding::{HEXLOWER, HEXLOWER_PERMISSIVE};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::WalletLinkError;
use crate::models::SessionSecret;

/// Nonce size for AES-GCM (96 bits = 12 bytes).
const NONCE_SIZE: usize = 12;

/// Authentication tag size for AES-GCM.
const TAG_SIZE: usize = 16;

/// Symmetric encryption and key derivation used by the handshake.
///
/// Implementations must be deterministic in `session_key` and must fail with
/// [`WalletLinkError::DecryptionFailure`] when the secret does not match.
pub trait Codec: Send + Sync + std::fmt::Debug {
    /// Encrypt `plaintext` into the relay's hex envelope.
    fn encrypt(&self, plaintext: &[u8], secret: &SessionSecret) -> Result<String, WalletLinkError>;

    /// Decrypt a hex envelope produced by [`Codec::encrypt`].
    fn decrypt(&self, ciphertext: &str, secret: &SessionSecret) -> Result<Vec<u8>, WalletLinkError>;

    /// Derive the key presented to the relay in `HostSession`.
    fn session_key(&self, session_id: &str, secret: &SessionSecret) -> String;
}

/// Default [`Codec`]: AES-256-GCM with a random nonce per message.
#[derive(Debug, Default, Clone, Copy)]
pub struct Aes256GcmCodec;

impl Aes256GcmCodec {
    /// Create the codec.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Codec for Aes256GcmCodec {
    fn encrypt(&self, plaintext: &[u8], secret: &SessionSecret) -> Result<String, WalletLinkError> {
        let key = derive_key(secret);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]));

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| WalletLinkError::MalformedMessage(format!("encryption failed: {e}")))?;

        // aes-gcm appends the tag; the relay format puts it before the ciphertext.
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_SIZE);
        let mut envelope = Vec::with_capacity(NONCE_SIZE + sealed.len());
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(tag);
        envelope.extend_from_slice(ciphertext);

        Ok(HEXLOWER.encode(&envelope))
    }

    fn decrypt(&self, ciphertext: &str, secret: &SessionSecret) -> Result<Vec<u8>, WalletLinkError> {
        let envelope = HEXLOWER_PERMISSIVE
            .decode(ciphertext.as_bytes())
            .map_err(|_| WalletLinkError::DecryptionFailure)?;
        if envelope.len() < NONCE_SIZE + TAG_SIZE {
            return Err(WalletLinkError::DecryptionFailure);
        }

        let (nonce_bytes, rest) = envelope.split_at(NONCE_SIZE);
        let (tag, body) = rest.split_at(TAG_SIZE);
        let mut sealed = Vec::with_capacity(rest.len());
        sealed.extend_from_slice(body);
        sealed.extend_from_slice(tag);

        let key = derive_key(secret);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]));
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), sealed.as_ref())
            .map_err(|_| WalletLinkError::DecryptionFailure)
    }

    fn session_key(&self, session_id: &str, secret: &SessionSecret) -> String {
        let input = Zeroizing::new(format!("{session_id}, {} WalletLink", secret.expose()));
        HEXLOWER.encode(&Sha256::digest(input.as_bytes()))
    }
}

/// Turn a session secret into 32 bytes of key material.
fn derive_key(secret: &SessionSecret) -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    match HEXLOWER_PERMISSIVE.decode(secret.expose().as_bytes()) {
        Ok(bytes) if bytes.len() == 32 => key.copy_from_slice(&bytes),
        _ => key.copy_from_slice(&Sha256::digest(secret.expose().as_bytes())),
    }
    key
}

/// Generate `len` random bytes as lowercase hex (session ids and secrets).
#[must_use]
pub fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);
    HEXLOWER.encode(&bytes)
}
