use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::error::StorageError;

/// A validated SHA-512 digest of a file's bytes.
///
/// Once recorded for a primary file, the fingerprint identifies that exact
/// content; derivatives are only ever committed against a matching value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 64]);

impl Fingerprint {
    /// Compute the SHA-512 digest of the given data.
    pub fn compute(data: &[u8]) -> Self {
        let digest = Sha512::digest(data);
        Self(digest.into())
    }

    /// Compute the digest incrementally from an async reader.
    pub async fn compute_reader<R>(reader: &mut R) -> Result<(Self, u64), StorageError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut hasher = Sha512::new();
        let mut total: u64 = 0;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            total += n as u64;
            hasher.update(&buf[..n]);
        }
        Ok((Self(hasher.finalize().into()), total))
    }

    /// Construct from raw SHA-512 bytes.
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Parse a hex-encoded digest string.
    pub fn from_hex(s: &str) -> Result<Self, StorageError> {
        if s.len() != 128 {
            return Err(StorageError::InvalidFingerprint(format!(
                "expected 128 hex characters, got {}",
                s.len()
            )));
        }

        let bytes = hex::decode(s)
            .map_err(|e| StorageError::InvalidFingerprint(format!("invalid hex: {e}")))?;

        let arr: [u8; 64] = bytes
            .try_into()
            .map_err(|_| StorageError::InvalidFingerprint("decoded to wrong length".into()))?;

        Ok(Self(arr))
    }

    /// Return the digest as a 128-character lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Return the raw 64-byte digest.
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({}…)", &self.to_hex()[..16])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
