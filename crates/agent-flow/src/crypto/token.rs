//! AES-256-GCM sealed capability tokens.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD as BASE64URL},
    Engine,
};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Nonce size for AES-GCM (96 bits / 12 bytes).
const NONCE_SIZE: usize = 12;

/// Key size for AES-256 (256 bits / 32 bytes).
const KEY_SIZE: usize = 32;

/// Identity bound into a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub run: String,
    pub thread: String,
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Mints and verifies capability tokens.
pub trait TokenIssuer: Send + Sync {
    /// Mint a token for `claims`. `expires_at` is overwritten with the issuer's TTL.
    fn mint(&self, claims: Claims) -> AppResult<String>;

    /// Open a token, rejecting tampered or expired ones.
    fn verify(&self, token: &str) -> AppResult<Claims>;
}

/// Token issuer sealing JSON claims with AES-256-GCM.
#[derive(Clone)]
pub struct SealedTokenIssuer {
    cipher: Aes256Gcm,
    ttl: Duration,
}

impl SealedTokenIssuer {
    /// Create an issuer from a base64-encoded 32-byte key.
    pub fn from_base64(key_base64: &str, ttl: std::time::Duration) -> AppResult<Self> {
        let key_bytes = BASE64
            .decode(key_base64)
            .map_err(|e| AppError::Encryption(format!("Invalid base64 key: {}", e)))?;
        Self::from_bytes(&key_bytes, ttl)
    }

    pub fn from_bytes(key_bytes: &[u8], ttl: std::time::Duration) -> AppResult<Self> {
        if key_bytes.len() != KEY_SIZE {
            return Err(AppError::Encryption(format!(
                "Invalid key length: expected {} bytes, got {}",
                KEY_SIZE,
                key_bytes.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key_bytes)
            .map_err(|e| AppError::Encryption(format!("Failed to create cipher: {}", e)))?;
        let ttl = Duration::from_std(ttl)
            .map_err(|e| AppError::Config(format!("Invalid token TTL: {}", e)))?;
        Ok(Self { cipher, ttl })
    }

    /// Issuer with a freshly generated random key.
    pub fn random(ttl: std::time::Duration) -> AppResult<Self> {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill(&mut key[..]);
        Self::from_bytes(&key, ttl)
    }

    /// Use the configured key when present, otherwise a random one.
    pub fn from_config(key_base64: Option<&str>, ttl: std::time::Duration) -> AppResult<Self> {
        match key_base64 {
            Some(key) => Self::from_base64(key, ttl),
            None => Self::random(ttl),
        }
    }

    fn seal(&self, plaintext: &[u8]) -> AppResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| AppError::Encryption(format!("Encryption failed: {}", e)))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, sealed: &[u8]) -> AppResult<Vec<u8>> {
        if sealed.len() < NONCE_SIZE {
            return Err(AppError::Encryption("Token too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| AppError::Encryption("Token failed authentication".to_string()))
    }
}

impl TokenIssuer for SealedTokenIssuer {
    fn mint(&self, mut claims: Claims) -> AppResult<String> {
        claims.expires_at = Utc::now() + self.ttl;
        let sealed = self.seal(&serde_json::to_vec(&claims)?)?;
        Ok(BASE64URL.encode(sealed))
    }

    fn verify(&self, token: &str) -> AppResult<Claims> {
        let sealed = BASE64URL
            .decode(token)
            .map_err(|e| AppError::Encryption(format!("Malformed token: {}", e)))?;
        let claims: Claims = serde_json::from_slice(&self.open(&sealed)?)?;
        if claims.expires_at <= Utc::now() {
            return Err(AppError::Encryption(format!(
                "Token for run {} expired at {}",
                claims.run, claims.expires_at
            )));
        }
        Ok(claims)
    }
}
