//! Compressed blob fields.
//!
//! Large or opaque record fields (program graphs, call frames, chat state,
//! loop elements) are stored gzip-compressed and base64-encoded so they
//! survive any JSON-shaped object store.

use std::io::{Read, Write};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// A gzip + base64 encoded payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompressedBlob(String);

impl CompressedBlob {
    /// Compress raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> AppResult<Self> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(bytes)
            .map_err(|e| AppError::Codec(format!("gzip write failed: {}", e)))?;
        let compressed = encoder
            .finish()
            .map_err(|e| AppError::Codec(format!("gzip finish failed: {}", e)))?;
        Ok(Self(BASE64.encode(compressed)))
    }

    /// Compress the JSON encoding of a value.
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> AppResult<Self> {
        Self::from_bytes(&serde_json::to_vec(value)?)
    }

    /// Compress a string.
    pub fn from_text(text: &str) -> AppResult<Self> {
        Self::from_bytes(text.as_bytes())
    }

    /// Decompress to raw bytes.
    pub fn to_bytes(&self) -> AppResult<Vec<u8>> {
        let compressed = BASE64
            .decode(self.0.as_bytes())
            .map_err(|e| AppError::Codec(format!("invalid base64 blob: {}", e)))?;
        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| AppError::Codec(format!("gzip read failed: {}", e)))?;
        Ok(out)
    }

    /// Decompress and decode JSON.
    pub fn decode<T: DeserializeOwned>(&self) -> AppResult<T> {
        let bytes = self.to_bytes()?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Decompress to a UTF-8 string.
    pub fn to_text(&self) -> AppResult<String> {
        String::from_utf8(self.to_bytes()?)
            .map_err(|e| AppError::Codec(format!("blob is not utf-8: {}", e)))
    }

    /// The encoded form, as stored.
    pub fn as_encoded(&self) -> &str {
        &self.0
    }
}
