//! Commit storage
//!
//! A repository is an append-only log of commits plus the set of current
//! heads. The only coordination between writers is optimistic: a push
//! succeeds only while every parent it declares is still a head.

mod memory;

pub use memory::InMemoryRepository;

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::commit::{Commit, CommitError, CommitId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// A declared parent is no longer a head; re-read heads and retry.
    #[error("Head stale: declared parents {declared:?}, current heads {heads:?}")]
    HeadStale {
        declared: Vec<CommitId>,
        heads: Vec<CommitId>,
    },

    #[error("Commit not found: {0}")]
    NotFound(CommitId),

    #[error("Parent {0} of pushed commit is unknown")]
    MissingParent(CommitId),

    #[error("Commit {id} at level {level} is not above all of its parents")]
    InvalidLevel { id: CommitId, level: u64 },

    #[error("Commit {0} does not match its content hash")]
    Corrupt(CommitId),

    #[error("Repository unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Commit(#[from] CommitError),
}

impl RepositoryError {
    pub fn is_head_stale(&self) -> bool {
        matches!(self, RepositoryError::HeadStale { .. })
    }
}

/// Storage backend for one document's commit graph.
#[async_trait]
pub trait OtRepository<D>: Send + Sync
where
    D: Clone + Serialize + Send + Sync + 'static,
{
    /// Build a single-parent commit. Nothing is stored until `push`.
    fn create_commit(
        &self,
        parent: CommitId,
        diffs: Vec<D>,
        level: u64,
    ) -> Result<Commit<D>, RepositoryError> {
        let mut parents = BTreeMap::new();
        parents.insert(parent, diffs);
        Ok(Commit::new(parents, level)?)
    }

    /// Build a merge commit over several parents.
    fn create_merge_commit(
        &self,
        parents: BTreeMap<CommitId, Vec<D>>,
        level: u64,
    ) -> Result<Commit<D>, RepositoryError> {
        Ok(Commit::new(parents, level)?)
    }

    /// Store `commit` if all of its parents are current heads.
    ///
    /// Pushing a commit that is already stored is a no-op.
    async fn push(&self, commit: Commit<D>) -> Result<(), RepositoryError>;

    async fn get_heads(&self) -> Result<BTreeSet<CommitId>, RepositoryError>;

    async fn load_commit(&self, id: &CommitId) -> Result<Commit<D>, RepositoryError>;

    /// Full-state diffs stored for `id`, if any.
    async fn load_snapshot(&self, id: &CommitId) -> Result<Option<Vec<D>>, RepositoryError>;

    async fn save_snapshot(&self, id: &CommitId, diffs: Vec<D>) -> Result<(), RepositoryError>;
}
