//! Block data model.
//!
//! A document is an ordered collection of blocks. Each block carries its
//! replicated fields plus the per-field stamps ([`CrdtMeta`]) that make
//! merging convergent across replicas.
//!
//! ```text
//! ┌──────────────────────────── Block ────────────────────────────┐
//! │ id        (immutable)                                         │
//! │ kind      ── stamp ─┐                                         │
//! │ data      ── stamp ─┤                                         │
//! │ index     ── stamp ─┼── CrdtMeta (one LWW register per field) │
//! │ deleted   ── stamp ─┘                                         │
//! │ created_by / last_edited_by  (derived from the stamps)        │
//! └───────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crdt::{CrdtMeta, Stamp};

/// Globally unique, immutable block identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(String);

impl BlockId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BlockId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for BlockId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identity of one replica (a tab, a device, a peer).
///
/// Doubles as the peer id on the network and as the tie-breaker of the
/// last-writer-wins merge.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(String);

impl ReplicaId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random replica identity for this session.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReplicaId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ReplicaId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque block payload.
///
/// Holds canonical JSON text. The engine stores, compares and forwards it but
/// never looks inside. Kept as a string so it survives both the binary wire
/// codec and the textual snapshot form unchanged.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(String);

impl Payload {
    /// The JSON `null` payload.
    pub fn null() -> Self {
        Self("null".to_string())
    }

    /// Wrap already-encoded text without validating it.
    pub fn raw(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// Encode a JSON value. Object keys come out sorted, so equal values
    /// always produce equal payloads.
    pub fn from_json(value: &serde_json::Value) -> Self {
        Self(value.to_string())
    }

    /// Encode any serializable value.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        let value = serde_json::to_value(value)?;
        Ok(Self::from_json(&value))
    }

    /// Parse the payload back into a JSON value.
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::null()
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Self::from_json(&value)
    }
}

/// Kind given to blocks created without an explicit type.
pub const DEFAULT_BLOCK_KIND: &str = "paragraph";

/// The unit of replicated content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub id: BlockId,
    /// Rendering kind, opaque to the engine.
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Payload,
    /// Position among siblings. Not unique under concurrent inserts.
    pub index: i64,
    pub created_by: ReplicaId,
    pub last_edited_by: ReplicaId,
    #[serde(rename = "crdtMeta")]
    pub meta: CrdtMeta,
    /// Tombstone flag.
    pub deleted: bool,
}

impl Block {
    /// Materialize a new block from a patch, stamping every field with `stamp`.
    pub fn create(patch: &BlockPatch, stamp: Stamp) -> Self {
        Self {
            id: patch.id.clone(),
            kind: patch
                .kind
                .clone()
                .unwrap_or_else(|| DEFAULT_BLOCK_KIND.to_string()),
            data: patch.data.clone().unwrap_or_default(),
            index: patch.index.unwrap_or(0),
            created_by: stamp.replica.clone(),
            last_edited_by: stamp.replica.clone(),
            meta: CrdtMeta::uniform(stamp),
            deleted: patch.deleted.unwrap_or(false),
        }
    }

    /// Apply a local patch on top of this block.
    ///
    /// Only the fields present in `patch` are written, each with `stamp`.
    /// The caller guarantees `stamp` exceeds every stamp already in the block,
    /// which makes this equal to merging a one-write delta.
    pub fn patched(&self, patch: &BlockPatch, stamp: Stamp) -> Self {
        let mut next = self.clone();
        if let Some(kind) = &patch.kind {
            next.kind = kind.clone();
            next.meta.kind = stamp.clone();
        }
        if let Some(data) = &patch.data {
            next.data = data.clone();
            next.meta.data = stamp.clone();
        }
        if let Some(index) = patch.index {
            next.index = index;
            next.meta.index = stamp.clone();
        }
        if let Some(deleted) = patch.deleted {
            next.deleted = deleted;
            next.meta.deleted = stamp.clone();
        }
        next.last_edited_by = next.meta.latest().replica.clone();
        next
    }

    /// Convergent join of two states of the same block.
    ///
    /// Commutative, associative and idempotent: every field is resolved
    /// independently by its stamp, and the derived authorship fields are
    /// recomputed from the merged stamps.
    pub fn merge(&self, other: &Block) -> Block {
        debug_assert_eq!(self.id, other.id, "merging different blocks");

        let (kind, kind_stamp) = lww((&self.kind, &self.meta.kind), (&other.kind, &other.meta.kind));
        let (data, data_stamp) = lww((&self.data, &self.meta.data), (&other.data, &other.meta.data));
        let (index, index_stamp) =
            lww((&self.index, &self.meta.index), (&other.index, &other.meta.index));
        let (deleted, deleted_stamp) = lww(
            (&self.deleted, &self.meta.deleted),
            (&other.deleted, &other.meta.deleted),
        );
        let created = (&self.meta.created).min(&other.meta.created);

        let meta = CrdtMeta {
            created: created.clone(),
            kind: kind_stamp.clone(),
            data: data_stamp.clone(),
            index: index_stamp.clone(),
            deleted: deleted_stamp.clone(),
        };
        let last_edited_by = meta.latest().replica.clone();

        Block {
            id: self.id.clone(),
            kind: kind.clone(),
            data: data.clone(),
            index: *index,
            created_by: created.replica.clone(),
            last_edited_by,
            meta,
            deleted: *deleted,
        }
    }

    /// Greatest stamp carried by this block.
    pub fn latest_stamp(&self) -> &Stamp {
        self.meta.latest()
    }

    /// True when the replicated fields differ (ignores stamps).
    pub fn content_differs(&self, other: &Block) -> bool {
        self.kind != other.kind
            || self.data != other.data
            || self.index != other.index
            || self.deleted != other.deleted
    }

    pub fn view(&self) -> BlockView {
        BlockView {
            id: self.id.clone(),
            kind: self.kind.clone(),
            data: self.data.clone(),
            index: self.index,
        }
    }
}

/// Pick the winning register value: greater stamp first, then greater value.
///
/// The value comparison only matters for two different values under the same
/// stamp, which a well-behaved replica never produces.
fn lww<'a, T: Ord>(a: (&'a T, &'a Stamp), b: (&'a T, &'a Stamp)) -> (&'a T, &'a Stamp) {
    if (b.1, b.0) > (a.1, a.0) {
        b
    } else {
        a
    }
}

/// Partial block used for local writes. Absent fields are left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPatch {
    pub id: BlockId,
    pub kind: Option<String>,
    pub data: Option<Payload>,
    pub index: Option<i64>,
    pub deleted: Option<bool>,
}

impl BlockPatch {
    pub fn new(id: impl Into<BlockId>) -> Self {
        Self {
            id: id.into(),
            kind: None,
            data: None,
            index: None,
            deleted: None,
        }
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn data(mut self, data: Payload) -> Self {
        self.data = Some(data);
        self
    }

    pub fn index(mut self, index: i64) -> Self {
        self.index = Some(index);
        self
    }

    pub fn deleted(mut self, deleted: bool) -> Self {
        self.deleted = Some(deleted);
        self
    }

    /// Whether the patch writes anything besides the id.
    pub fn is_empty(&self) -> bool {
        self.kind.is_none() && self.data.is_none() && self.index.is_none() && self.deleted.is_none()
    }
}

/// What the editing surface sees for inserts and updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockView {
    pub id: BlockId,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Payload,
    pub index: i64,
}
