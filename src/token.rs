//! Authenticated, encrypted tokens for client-held state
//!
//! Layout of a token before base64url encoding:
//!
//! ```text
//! version (1) | issued_at (8, big endian unix seconds) | nonce (12) | ciphertext+gcm tag | hmac (32)
//! ```
//!
//! The payload is serialized as JSON and sealed with AES-256-GCM under the
//! block key. The whole frame, prefixed with the token name, is then signed
//! with HMAC-SHA256 under the hash key. Decoding checks the MAC first and
//! only then looks at anything else.

use std::marker::PhantomData;
use std::time::Duration;

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{de::DeserializeOwned, Serialize};
use sha2::Sha256;

use crate::error::{Error, ErrorKind, Result};

type HmacSha256 = Hmac<Sha256>;

const VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const MAC_LEN: usize = 32;
const HEADER_LEN: usize = 1 + 8 + NONCE_LEN;

/// Tolerated clock skew for tokens dated in the future.
const MAX_SKEW_SECS: i64 = 60;

/// Why a token was rejected. Never surfaced to callers, only logged.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("not valid base64")]
    Encoding,
    #[error("token too short")]
    Truncated,
    #[error("authentication tag mismatch")]
    Signature,
    #[error("unknown token version {0}")]
    Version(u8),
    #[error("token expired")]
    Expired,
    #[error("token issued in the future")]
    FromFuture,
    #[error("decryption failed")]
    Decrypt,
    #[error("malformed payload")]
    Payload,
}

/// Server-held keys for sealing tokens. Built once at start-up.
#[derive(Clone)]
pub struct SecureToken<T> {
    name: String,
    mac: HmacSha256,
    cipher: Aes256Gcm,
    max_age: Duration,
    _payload: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for SecureToken<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureToken")
            .field("name", &self.name)
            .field("max_age", &self.max_age)
            .finish_non_exhaustive()
    }
}

impl<T> SecureToken<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    /// `name` binds tokens to their purpose; a token minted under one name
    /// never decodes under another.
    pub fn new(
        name: impl Into<String>,
        hash_key: &[u8],
        block_key: &[u8; 32],
        max_age: Duration,
    ) -> Result<Self> {
        if hash_key.is_empty() {
            return Err(Error::invalid("Hash key required."));
        }
        let mac = <HmacSha256 as Mac>::new_from_slice(hash_key)
            .map_err(|_| Error::invalid("Invalid hash key."))?;
        let cipher = Aes256Gcm::new_from_slice(block_key)
            .map_err(|_| Error::invalid("Block key must be 32 bytes."))?;

        Ok(Self {
            name: name.into(),
            mac,
            cipher,
            max_age,
            _payload: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Serializes, encrypts and signs `payload`.
    pub fn encode(&self, payload: &T) -> Result<String> {
        self.encode_at(payload, Utc::now().timestamp())
    }

    /// Returns the payload, or the default payload if the token fails any check.
    pub fn decode(&self, token: &str) -> (T, bool) {
        match self.open(token, Utc::now().timestamp()) {
            Ok(payload) => (payload, true),
            Err(err) => {
                tracing::debug!(token = %self.name, error = %err, "rejected token");
                (T::default(), false)
            }
        }
    }

    fn encode_at(&self, payload: &T, issued_at: i64) -> Result<String> {
        let plaintext = serde_json::to_vec(payload)?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &plaintext,
                    aad: self.name.as_bytes(),
                },
            )
            .map_err(|_| Error::new(ErrorKind::Internal, "token encryption failed"))?;

        let mut frame = Vec::with_capacity(HEADER_LEN + ciphertext.len() + MAC_LEN);
        frame.push(VERSION);
        frame.extend_from_slice(&issued_at.to_be_bytes());
        frame.extend_from_slice(&nonce);
        frame.extend_from_slice(&ciphertext);

        let tag = self.mac(&frame).finalize().into_bytes();
        frame.extend_from_slice(&tag);

        Ok(URL_SAFE_NO_PAD.encode(frame))
    }

    fn open(&self, token: &str, now: i64) -> Result<T, TokenError> {
        let frame = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| TokenError::Encoding)?;
        if frame.len() < HEADER_LEN + MAC_LEN {
            return Err(TokenError::Truncated);
        }

        let (body, tag) = frame.split_at(frame.len() - MAC_LEN);
        self.mac(body)
            .verify_slice(tag)
            .map_err(|_| TokenError::Signature)?;

        if body[0] != VERSION {
            return Err(TokenError::Version(body[0]));
        }

        let mut ts = [0u8; 8];
        ts.copy_from_slice(&body[1..9]);
        let issued_at = i64::from_be_bytes(ts);
        if issued_at > now + MAX_SKEW_SECS {
            return Err(TokenError::FromFuture);
        }
        let max_age = i64::try_from(self.max_age.as_secs()).unwrap_or(i64::MAX);
        if now.saturating_sub(issued_at) > max_age {
            return Err(TokenError::Expired);
        }

        let nonce = Nonce::from_slice(&body[9..HEADER_LEN]);
        let plaintext = self
            .cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &body[HEADER_LEN..],
                    aad: self.name.as_bytes(),
                },
            )
            .map_err(|_| TokenError::Decrypt)?;

        serde_json::from_slice(&plaintext).map_err(|_| TokenError::Payload)
    }

    fn mac(&self, body: &[u8]) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(self.name.as_bytes());
        mac.update(&[0]);
        mac.update(body);
        mac
    }
}
