//! Client/server sync protocol
//!
//! A [`SyncNode`] is whatever a client talks to: a handful of calls, all expressed
//! as commit ids plus diff lists. [`RepositoryNode`] answers them directly
//! from a repository; [`wire::WireNode`] forwards them over a byte transport.

pub mod wire;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::algorithms::{GraphError, OtAlgorithms};
use crate::commit::CommitId;
use crate::ot::{OtError, OtSystem};
use crate::repository::{OtRepository, RepositoryError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// The commit the client built on is no longer a head.
    #[error("Push conflict: base commit is no longer a head")]
    Conflict,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Graph error: {0}")]
    Graph(String),

    #[error(transparent)]
    Transform(#[from] OtError),

    #[error("Codec error: {0}")]
    Codec(String),
}

impl From<RepositoryError> for NodeError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::HeadStale { .. } => NodeError::Conflict,
            RepositoryError::Unavailable(reason) => NodeError::Network(reason),
            other => NodeError::Graph(other.to_string()),
        }
    }
}

impl From<GraphError> for NodeError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::Repository(e) => e.into(),
            GraphError::Transform(e) => NodeError::Transform(e),
            // The server could not settle the heads; the client may retry.
            GraphError::RetriesExhausted { .. } => NodeError::Conflict,
            other => NodeError::Graph(other.to_string()),
        }
    }
}

/// Server side of the sync protocol.
#[async_trait]
pub trait SyncNode<D>: Send + Sync
where
    D: Send + 'static,
{
    /// Current merged head and its full state.
    async fn checkout(&self) -> Result<(CommitId, Vec<D>), NodeError>;

    /// Full state of a specific commit, which need not be a head.
    async fn checkout_at(&self, id: &CommitId) -> Result<Vec<D>, NodeError>;

    /// Current merged head and the diffs leading from `old` to it.
    async fn pull(&self, old: &CommitId) -> Result<(CommitId, Vec<D>), NodeError>;

    /// Append `diffs` on top of `current`, returning the new commit.
    ///
    /// Fails with [`NodeError::Conflict`] once `current` is no longer a head.
    /// Repeating a push that was already stored returns the same commit.
    async fn push(&self, current: &CommitId, diffs: Vec<D>) -> Result<CommitId, NodeError>;
}

/// Sync node answering straight from a repository.
///
/// Every checkout and pull first merges the heads, so clients only ever see
/// a single linear head.
pub struct RepositoryNode<R: ?Sized, S> {
    algorithms: OtAlgorithms<R, S>,
}

impl<R, S> RepositoryNode<R, S>
where
    R: OtRepository<S::Diff> + ?Sized,
    S: OtSystem,
    S::Diff: Serialize,
{
    pub fn new(algorithms: OtAlgorithms<R, S>) -> Self {
        Self { algorithms }
    }

    pub fn algorithms(&self) -> &OtAlgorithms<R, S> {
        &self.algorithms
    }

    pub fn repository(&self) -> &Arc<R> {
        self.algorithms.repository()
    }
}

#[async_trait]
impl<R, S> SyncNode<S::Diff> for RepositoryNode<R, S>
where
    R: OtRepository<S::Diff> + ?Sized + 'static,
    S: OtSystem,
    S::Diff: Serialize,
{
    async fn checkout(&self) -> Result<(CommitId, Vec<S::Diff>), NodeError> {
        let head = self.algorithms.merge_heads().await?;
        let diffs = self.algorithms.checkout(&head).await?;
        Ok((head, diffs))
    }

    async fn checkout_at(&self, id: &CommitId) -> Result<Vec<S::Diff>, NodeError> {
        Ok(self.algorithms.checkout(id).await?)
    }

    async fn pull(&self, old: &CommitId) -> Result<(CommitId, Vec<S::Diff>), NodeError> {
        let head = self.algorithms.merge_heads().await?;
        let diffs = self.algorithms.diff(old, &head).await?;
        Ok((head, diffs))
    }

    async fn push(&self, current: &CommitId, diffs: Vec<S::Diff>) -> Result<CommitId, NodeError> {
        if diffs.is_empty() {
            return Ok(*current);
        }
        let repository = self.algorithms.repository();
        let base = repository.load_commit(current).await?;
        let commit = repository.create_commit(*current, diffs, base.level() + 1)?;
        let id = commit.id();
        match repository.push(commit).await {
            Ok(()) => {
                log::debug!("Client pushed {} on top of {}", id.short(), current.short());
                Ok(id)
            }
            Err(e) if e.is_head_stale() => {
                log::debug!("Client push on {} rejected: stale head", current.short());
                Err(NodeError::Conflict)
            }
            Err(e) => Err(e.into()),
        }
    }
}
