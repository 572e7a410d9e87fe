//! Snapshot codec for shareable links and export files.
//!
//! Pipeline:
//! ```text
//! DocumentSnapshot ──serde_json──► canonical text ──LZ4──► bytes ──base64url──► String
//!                  ◄──────────────────────────── decode ◄───────────────────────
//! ```
//!
//! Encoding is deterministic: the snapshot only contains structs and vectors,
//! never hash maps, so the same snapshot always yields the same string.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::block::Block;

/// Snapshot format version written by this build.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Upper bound on the decompressed size of a snapshot. A corrupt size prefix
/// must not turn into a huge allocation.
pub const MAX_SNAPSHOT_BYTES: usize = 64 * 1024 * 1024;

/// Serializable projection of a document: live blocks in index order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub version: u32,
    pub blocks: Vec<Block>,
}

impl DocumentSnapshot {
    /// Build a snapshot from arbitrary blocks: tombstones are dropped and the
    /// rest ordered by `(index, id)`.
    pub fn from_blocks<I>(blocks: I) -> Self
    where
        I: IntoIterator<Item = Block>,
    {
        let mut blocks: Vec<Block> = blocks.into_iter().filter(|b| !b.deleted).collect();
        blocks.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.id.cmp(&b.id)));
        Self {
            version: SNAPSHOT_VERSION,
            blocks,
        }
    }

    pub fn empty() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            blocks: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl Default for DocumentSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

/// Snapshot codec errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    /// The input could not be decoded back into a snapshot.
    #[error("Corrupt snapshot: {0}")]
    CorruptSnapshot(String),
    #[error("Snapshot serialization error: {0}")]
    SerializationError(String),
}

/// Encode a snapshot into a compact URL-safe string.
pub fn encode(snapshot: &DocumentSnapshot) -> Result<String, SnapshotError> {
    let text = serde_json::to_vec(snapshot)
        .map_err(|e| SnapshotError::SerializationError(e.to_string()))?;
    let compressed = lz4_flex::compress_prepend_size(&text);
    Ok(URL_SAFE_NO_PAD.encode(compressed))
}

/// Decode a string produced by [`encode`].
pub fn decode(encoded: &str) -> Result<DocumentSnapshot, SnapshotError> {
    let trimmed = encoded.trim().trim_end_matches('=');
    if trimmed.is_empty() {
        return Err(SnapshotError::CorruptSnapshot("empty input".into()));
    }

    let compressed = URL_SAFE_NO_PAD
        .decode(trimmed)
        .map_err(|e| SnapshotError::CorruptSnapshot(format!("base64: {e}")))?;

    if compressed.len() < 4 {
        return Err(SnapshotError::CorruptSnapshot("truncated header".into()));
    }
    let declared = u32::from_le_bytes([compressed[0], compressed[1], compressed[2], compressed[3]]) as usize;
    if declared > MAX_SNAPSHOT_BYTES {
        return Err(SnapshotError::CorruptSnapshot(format!(
            "declared size {declared} exceeds limit"
        )));
    }

    let text = lz4_flex::decompress_size_prepended(&compressed)
        .map_err(|e| SnapshotError::CorruptSnapshot(format!("lz4: {e}")))?;
    let snapshot: DocumentSnapshot = serde_json::from_slice(&text)
        .map_err(|e| SnapshotError::CorruptSnapshot(format!("json: {e}")))?;

    if snapshot.version > SNAPSHOT_VERSION {
        return Err(SnapshotError::CorruptSnapshot(format!(
            "unsupported version {}",
            snapshot.version
        )));
    }
    Ok(snapshot)
}

/// Decode a locator value, treating anything unusable as an empty document.
pub fn decode_or_empty(encoded: Option<&str>) -> DocumentSnapshot {
    match encoded {
        None => DocumentSnapshot::empty(),
        Some(text) => match decode(text) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::warn!("Ignoring unreadable snapshot: {e}");
                DocumentSnapshot::empty()
            }
        },
    }
}

/// Ratio of canonical text size to encoded string size.
pub fn compression_ratio(snapshot: &DocumentSnapshot) -> Result<f64, SnapshotError> {
    let text = serde_json::to_vec(snapshot)
        .map_err(|e| SnapshotError::SerializationError(e.to_string()))?;
    let encoded = encode(snapshot)?;
    if encoded.is_empty() {
        return Ok(0.0);
    }
    Ok(text.len() as f64 / encoded.len() as f64)
}
