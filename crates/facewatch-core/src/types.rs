use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Embedding dimension produced by the upstream face descriptor model.
pub const EMBEDDING_DIM: usize = 128;

/// Quantization step applied before fingerprinting (1e-4).
const FINGERPRINT_SCALE: f32 = 10_000.0;

/// Primary key of an identity row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(pub i64);

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether an identity carries an externally verified label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    /// Placeholder created for an unmatched face, awaiting resolution.
    Temporary,
    Confirmed,
}

impl IdentityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Temporary => "temporary",
            Self::Confirmed => "confirmed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "temporary" => Some(Self::Temporary),
            "confirmed" => Some(Self::Confirmed),
            _ => None,
        }
    }
}

/// A stored identity. Embeddings and snapshots hang off it by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    /// Display name; `unknownN` for placeholders.
    pub label: String,
    /// External reference number, if any.
    pub secondary_id: Option<String>,
    pub kind: IdentityKind,
    /// Operator-flagged.
    pub important: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Identity {
    pub fn is_temporary(&self) -> bool {
        self.kind == IdentityKind::Temporary
    }
}

/// Face embedding vector (128-dimensional for the descriptor model in use).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Stable dedup key for this vector.
    ///
    /// Values are quantized to 1e-4 and hashed with SHA-256, so the result
    /// does not depend on float formatting, process seed, or platform.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        for v in &self.values {
            let q = (v * FINGERPRINT_SCALE).round() as i32;
            hasher.update(q.to_le_bytes());
        }
        let digest = hasher.finalize();
        let mut head = [0u8; 16];
        head.copy_from_slice(&digest[..16]);
        Fingerprint(u128::from_be_bytes(head))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Encode as little-endian f32 bytes for blob storage.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Decode from little-endian f32 bytes. Returns `None` on a ragged length.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self { values })
    }
}

/// 128-bit fingerprint of a quantized embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub u128);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid fingerprint: {0:?}")]
pub struct ParseFingerprintError(pub String);

impl FromStr for Fingerprint {
    type Err = ParseFingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 {
            return Err(ParseFingerprintError(s.to_string()));
        }
        u128::from_str_radix(s, 16)
            .map(Fingerprint)
            .map_err(|_| ParseFingerprintError(s.to_string()))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot is empty")]
    Empty,
    #[error("snapshot is not a recognized image: {0}")]
    Unrecognized(String),
}

/// Opaque face crop handed over by the embedding provider.
#[derive(Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub data: Vec<u8>,
    /// Lower-case image format extension, e.g. "jpg" or "png".
    pub format: String,
}

impl Snapshot {
    /// Wrap encoded image bytes, sniffing their format from the magic bytes.
    pub fn new(data: Vec<u8>) -> Result<Self, SnapshotError> {
        if data.is_empty() {
            return Err(SnapshotError::Empty);
        }
        let format = image::guess_format(&data)
            .map_err(|e| SnapshotError::Unrecognized(e.to_string()))?;
        let format = format
            .extensions_str()
            .first()
            .copied()
            .unwrap_or("bin")
            .to_string();
        Ok(Self { data, format })
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// One face from one frame, as delivered by the embedding provider.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub embedding: Embedding,
    pub snapshot: Snapshot,
}

/// Result of matching a query embedding against the Confirmed gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub identity_id: IdentityId,
    /// Euclidean distance to the closest embedding of the identity.
    pub distance: f32,
    pub label: String,
    pub secondary_id: Option<String>,
    pub important: bool,
}

/// JPEG SOI + APP0/JFIF header, enough for format sniffing in tests.
#[cfg(test)]
pub(crate) const TEST_JPEG: [u8; 12] = [
    0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00, 0x01,
];
