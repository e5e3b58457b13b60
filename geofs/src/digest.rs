//! Content digests.
//!
//! Every blob in the content store is keyed by the SHA-256 of its bytes.
//! Digests are raw bytes in the on-disk record formats; hex appears only
//! in filesystem names and logs. The algorithm is fixed per volume and
//! recorded in the `views/index` header, so a volume written with one
//! construction is never silently reinterpreted with another.

use std::fmt;

use sha2::{Digest as _, Sha256};

use crate::errors::{GeofsError, GeofsResult};

/// Width of a content digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// Name recorded in the volume index header.
pub const DIGEST_ALGORITHM: &str = "sha-256";

/// A 256-bit content address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentDigest([u8; DIGEST_LEN]);

impl ContentDigest {
    /// Digest of the given bytes. Deterministic; the only way blobs are
    /// keyed.
    pub fn compute(bytes: &[u8]) -> Self {
        let out = Sha256::digest(bytes);
        let mut raw = [0u8; DIGEST_LEN];
        raw.copy_from_slice(&out);
        ContentDigest(raw)
    }

    /// Digest used for directory-kind ref entries, which carry no content.
    pub fn empty() -> Self {
        Self::compute(&[])
    }

    pub fn from_bytes(raw: [u8; DIGEST_LEN]) -> Self {
        ContentDigest(raw)
    }

    pub fn from_slice(raw: &[u8]) -> GeofsResult<Self> {
        if raw.len() != DIGEST_LEN {
            return Err(GeofsError::Corrupt(format!(
                "digest must be {DIGEST_LEN} bytes, got {}",
                raw.len()
            )));
        }
        let mut bytes = [0u8; DIGEST_LEN];
        bytes.copy_from_slice(raw);
        Ok(ContentDigest(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn parse_hex(text: &str) -> GeofsResult<Self> {
        let raw = hex::decode(text)
            .map_err(|e| GeofsError::invalid(format!("bad digest hex {text:?}: {e}")))?;
        Self::from_slice(&raw)
    }

    /// First byte as two hex chars; shard directory name in the store.
    pub fn shard(&self) -> String {
        hex::encode(&self.0[..1])
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({}..)", &self.to_hex()[..8])
    }
}
