//! In-memory repository
//!
//! An arena of commits keyed by id. The lock is only held for the duration
//! of a single operation, never across a caller's await points.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;

use super::{OtRepository, RepositoryError};
use crate::commit::{Commit, CommitId};

struct Arena<D> {
    commits: HashMap<CommitId, Commit<D>>,
    heads: BTreeSet<CommitId>,
    snapshots: HashMap<CommitId, Vec<D>>,
}

impl<D: Clone> Arena<D> {
    fn new() -> Self {
        Self {
            commits: HashMap::new(),
            heads: BTreeSet::new(),
            snapshots: HashMap::new(),
        }
    }

    /// Insert without the head check, after validating parents and level.
    fn insert(&mut self, commit: Commit<D>) -> Result<(), RepositoryError> {
        for parent in commit.parent_ids() {
            let parent_commit = self
                .commits
                .get(parent)
                .ok_or(RepositoryError::MissingParent(*parent))?;
            if parent_commit.level() >= commit.level() {
                return Err(RepositoryError::InvalidLevel {
                    id: commit.id(),
                    level: commit.level(),
                });
            }
        }
        if commit.is_root() && commit.level() != 0 {
            return Err(RepositoryError::InvalidLevel {
                id: commit.id(),
                level: commit.level(),
            });
        }

        for parent in commit.parent_ids() {
            self.heads.remove(parent);
        }
        self.heads.insert(commit.id());
        self.commits.insert(commit.id(), commit);
        Ok(())
    }
}

/// Repository kept entirely in memory.
pub struct InMemoryRepository<D> {
    arena: RwLock<Arena<D>>,
}

impl<D> InMemoryRepository<D>
where
    D: Clone + Serialize + Send + Sync + 'static,
{
    /// An empty repository; the first push must be a root commit.
    pub fn new() -> Self {
        Self {
            arena: RwLock::new(Arena::new()),
        }
    }

    /// A repository holding the root commit and its (empty) snapshot.
    pub fn with_root() -> Result<Self, RepositoryError> {
        let mut arena = Arena::new();
        let root = Commit::root()?;
        arena.snapshots.insert(root.id(), Vec::new());
        arena.insert(root)?;
        Ok(Self {
            arena: RwLock::new(arena),
        })
    }

    /// Accept a commit replicated from another repository.
    ///
    /// Unlike `push`, parents need not be heads: this is how concurrent
    /// branches written elsewhere enter the graph. Parents must be known and
    /// the id must match the content.
    pub async fn append(&self, commit: Commit<D>) -> Result<(), RepositoryError> {
        if !commit.verify()? {
            return Err(RepositoryError::Corrupt(commit.id()));
        }
        let mut arena = self.arena.write().await;
        if arena.commits.contains_key(&commit.id()) {
            return Ok(());
        }
        log::debug!(
            "Appending replicated commit {} at level {}",
            commit.id().short(),
            commit.level()
        );
        arena.insert(commit)
    }

    pub async fn commit_count(&self) -> usize {
        self.arena.read().await.commits.len()
    }

    pub async fn contains(&self, id: &CommitId) -> bool {
        self.arena.read().await.commits.contains_key(id)
    }
}

impl<D> Default for InMemoryRepository<D>
where
    D: Clone + Serialize + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<D> OtRepository<D> for InMemoryRepository<D>
where
    D: Clone + Serialize + Send + Sync + 'static,
{
    async fn push(&self, commit: Commit<D>) -> Result<(), RepositoryError> {
        let mut arena = self.arena.write().await;
        if arena.commits.contains_key(&commit.id()) {
            return Ok(());
        }

        let stale = if commit.is_root() {
            !arena.commits.is_empty()
        } else {
            commit.parent_ids().any(|p| !arena.heads.contains(p))
        };
        if stale {
            log::debug!(
                "Rejected push of {}: parents no longer heads",
                commit.id().short()
            );
            return Err(RepositoryError::HeadStale {
                declared: commit.parent_ids().copied().collect(),
                heads: arena.heads.iter().copied().collect(),
            });
        }

        log::debug!(
            "Pushed commit {} at level {} ({} parents)",
            commit.id().short(),
            commit.level(),
            commit.parents().len()
        );
        arena.insert(commit)
    }

    async fn get_heads(&self) -> Result<BTreeSet<CommitId>, RepositoryError> {
        Ok(self.arena.read().await.heads.clone())
    }

    async fn load_commit(&self, id: &CommitId) -> Result<Commit<D>, RepositoryError> {
        self.arena
            .read()
            .await
            .commits
            .get(id)
            .cloned()
            .ok_or(RepositoryError::NotFound(*id))
    }

    async fn load_snapshot(&self, id: &CommitId) -> Result<Option<Vec<D>>, RepositoryError> {
        Ok(self.arena.read().await.snapshots.get(id).cloned())
    }

    async fn save_snapshot(&self, id: &CommitId, diffs: Vec<D>) -> Result<(), RepositoryError> {
        let mut arena = self.arena.write().await;
        if !arena.commits.contains_key(id) {
            return Err(RepositoryError::NotFound(*id));
        }
        arena.snapshots.insert(*id, diffs);
        Ok(())
    }
}
