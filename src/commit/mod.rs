//! Content-addressed commits
//!
//! A commit records, for every parent, the diff list that turns the
//! parent's state into this commit's state. Its id is the SHA-256 of that
//! content plus its level, so two commits with the same id are the same
//! commit and a commit can never be edited after creation. Commits refer to
//! their parents by id only; the graph lives in whatever arena stores them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const COMMIT_ID_SIZE: usize = 32;

const HASH_DOMAIN: &[u8] = b"otsync.commit.v1";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommitError {
    #[error("Failed to encode commit content: {0}")]
    Encoding(String),

    #[error("Invalid commit id {0:?}")]
    InvalidId(String),
}

/// Content hash identifying a commit.
///
/// Ordered bytewise; the order carries no causal meaning and is only used to
/// break ties deterministically.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommitId([u8; COMMIT_ID_SIZE]);

impl CommitId {
    pub fn from_bytes(bytes: [u8; COMMIT_ID_SIZE]) -> Self {
        CommitId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; COMMIT_ID_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, CommitError> {
        let bytes = hex::decode(s).map_err(|_| CommitError::InvalidId(s.to_string()))?;
        let bytes: [u8; COMMIT_ID_SIZE] = bytes
            .try_into()
            .map_err(|_| CommitError::InvalidId(s.to_string()))?;
        Ok(CommitId(bytes))
    }

    /// First 8 hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// Hex strings, so ids can key JSON maps.
impl Serialize for CommitId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for CommitId {
    fn deserialize<De: Deserializer<'de>>(deserializer: De) -> Result<Self, De::Error> {
        let s = String::deserialize(deserializer)?;
        CommitId::from_hex(&s).map_err(de::Error::custom)
    }
}

impl fmt::Debug for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommitId({})", self.short())
    }
}

/// An immutable node of the history graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit<D> {
    id: CommitId,
    parents: BTreeMap<CommitId, Vec<D>>,
    level: u64,
}

impl<D: Serialize> Commit<D> {
    /// Hash of a commit's content.
    pub fn compute_id(
        parents: &BTreeMap<CommitId, Vec<D>>,
        level: u64,
    ) -> Result<CommitId, CommitError> {
        let edges: Vec<(&CommitId, &Vec<D>)> = parents.iter().collect();
        let mut encoded = Vec::new();
        ciborium::into_writer(&(level, edges), &mut encoded)
            .map_err(|e| CommitError::Encoding(e.to_string()))?;

        let mut hasher = Sha256::new();
        hasher.update(HASH_DOMAIN);
        hasher.update(&encoded);
        Ok(CommitId(hasher.finalize().into()))
    }

    /// Build a commit from its parent edges. The id is derived from the
    /// content.
    pub fn new(parents: BTreeMap<CommitId, Vec<D>>, level: u64) -> Result<Self, CommitError> {
        let id = Self::compute_id(&parents, level)?;
        Ok(Self { id, parents, level })
    }

    /// The empty document every history starts from.
    pub fn root() -> Result<Self, CommitError> {
        Self::new(BTreeMap::new(), 0)
    }

    /// Single-parent commit one level above `parent`.
    pub fn child_of(parent: &Commit<D>, diffs: Vec<D>) -> Result<Self, CommitError> {
        Self::on(parent.id, parent.level, diffs)
    }

    /// Single-parent commit given only the parent's id and level.
    pub fn on(parent: CommitId, parent_level: u64, diffs: Vec<D>) -> Result<Self, CommitError> {
        let mut parents = BTreeMap::new();
        parents.insert(parent, diffs);
        Self::new(parents, parent_level + 1)
    }

    /// Whether the stored id matches the content. Commits arriving from
    /// storage or peers are deserialized as-is and must be checked.
    pub fn verify(&self) -> Result<bool, CommitError> {
        Ok(Self::compute_id(&self.parents, self.level)? == self.id)
    }
}

impl<D> Commit<D> {
    pub fn id(&self) -> CommitId {
        self.id
    }

    pub fn level(&self) -> u64 {
        self.level
    }

    pub fn parents(&self) -> &BTreeMap<CommitId, Vec<D>> {
        &self.parents
    }

    pub fn parent_ids(&self) -> impl Iterator<Item = &CommitId> {
        self.parents.keys()
    }

    /// Diffs leading from `parent` to this commit.
    pub fn diffs_from(&self, parent: &CommitId) -> Option<&[D]> {
        self.parents.get(parent).map(Vec::as_slice)
    }

    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }
}
