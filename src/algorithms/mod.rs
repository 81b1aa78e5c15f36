//! Graph algorithms over a commit repository
//!
//! Everything here is computed from the commit graph on demand: common
//! ancestors, diffs between commits, full checkouts and merge commits. The
//! only write is the merge-commit push, which is retried when another writer
//! moves the heads first.

mod frontier;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::commit::{Commit, CommitId};
use crate::config::RetryPolicy;
use crate::ot::{OtError, OtSystem};
use crate::repository::{OtRepository, RepositoryError};
use frontier::Frontier;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Transform(#[from] OtError),

    #[error("Commits share no common ancestor")]
    NoCommonAncestor,

    #[error("Repository has no heads")]
    EmptyHeads,

    #[error("Merge push still stale after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

/// Nearest commit reachable from every origin, with the diff path from it to
/// each origin.
#[derive(Clone, Debug)]
pub struct CommonAncestor<D> {
    pub base: CommitId,
    pub base_level: u64,
    pub paths: BTreeMap<CommitId, Vec<D>>,
}

/// Ancestor located by [`OtAlgorithms::find_parent`].
#[derive(Clone, Debug)]
pub struct FindResult<D> {
    pub commit: CommitId,
    pub level: u64,
    /// Diffs from `commit` to the commit the search started from.
    pub path: Vec<D>,
}

pub struct OtAlgorithms<R: ?Sized, S> {
    repository: Arc<R>,
    system: Arc<S>,
    merge_retry: RetryPolicy,
}

impl<R: ?Sized, S> Clone for OtAlgorithms<R, S> {
    fn clone(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
            system: Arc::clone(&self.system),
            merge_retry: self.merge_retry.clone(),
        }
    }
}

impl<R, S> OtAlgorithms<R, S>
where
    R: OtRepository<S::Diff> + ?Sized,
    S: OtSystem,
    S::Diff: Serialize,
{
    pub fn new(repository: Arc<R>, system: Arc<S>, merge_retry: RetryPolicy) -> Self {
        Self {
            repository,
            system,
            merge_retry,
        }
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repository
    }

    pub fn system(&self) -> &Arc<S> {
        &self.system
    }

    pub async fn find_common_ancestor(
        &self,
        origins: impl IntoIterator<Item = CommitId>,
    ) -> Result<CommonAncestor<S::Diff>, GraphError> {
        let mut frontier =
            Frontier::start(self.system.as_ref(), self.repository.as_ref(), origins).await?;
        if frontier.origin_count() == 0 {
            return Err(GraphError::EmptyHeads);
        }

        while let Some(visited) = frontier.pop() {
            if frontier.reached_by_all(&visited) {
                return Ok(CommonAncestor {
                    base: visited.commit.id(),
                    base_level: visited.commit.level(),
                    paths: visited.paths,
                });
            }
            frontier.expand(self.repository.as_ref(), &visited).await?;
        }
        Err(GraphError::NoCommonAncestor)
    }

    /// Diffs that turn the state of `from` into the state of `to`.
    pub async fn diff(&self, from: &CommitId, to: &CommitId) -> Result<Vec<S::Diff>, GraphError> {
        if from == to {
            return Ok(Vec::new());
        }
        let ancestor = self.find_common_ancestor([*from, *to]).await?;
        let up = ancestor.paths.get(from).map(Vec::as_slice).unwrap_or(&[]);
        let down = ancestor.paths.get(to).map(Vec::as_slice).unwrap_or(&[]);

        let mut diffs = self.system.invert_all(up);
        diffs.extend(down.iter().cloned());
        Ok(self.system.squash_all(&diffs))
    }

    /// Nearest ancestor of `start` (or `start` itself) matching `predicate`.
    pub async fn find_parent<F>(
        &self,
        start: &CommitId,
        predicate: F,
    ) -> Result<Option<FindResult<S::Diff>>, GraphError>
    where
        F: Fn(&Commit<S::Diff>) -> bool,
    {
        let mut frontier =
            Frontier::start(self.system.as_ref(), self.repository.as_ref(), [*start]).await?;
        while let Some(mut visited) = frontier.pop() {
            if predicate(&visited.commit) {
                return Ok(Some(FindResult {
                    commit: visited.commit.id(),
                    level: visited.commit.level(),
                    path: visited.paths.remove(start).unwrap_or_default(),
                }));
            }
            frontier.expand(self.repository.as_ref(), &visited).await?;
        }
        Ok(None)
    }

    /// Full state of `id` as a diff list from the empty document.
    ///
    /// Starts from the nearest stored snapshot; without one, replays from
    /// the root.
    pub async fn checkout(&self, id: &CommitId) -> Result<Vec<S::Diff>, GraphError> {
        let mut frontier =
            Frontier::start(self.system.as_ref(), self.repository.as_ref(), [*id]).await?;
        while let Some(mut visited) = frontier.pop() {
            let path = visited.paths.remove(id).unwrap_or_default();
            let snapshot = self.repository.load_snapshot(&visited.commit.id()).await?;
            if let Some(mut diffs) = snapshot {
                log::debug!(
                    "Checkout of {} from snapshot at {} (+{} diffs)",
                    id.short(),
                    visited.commit.id().short(),
                    path.len()
                );
                diffs.extend(path);
                return Ok(self.system.squash_all(&diffs));
            }
            if visited.commit.is_root() {
                return Ok(path);
            }
            visited.paths.insert(*id, path);
            frontier.expand(self.repository.as_ref(), &visited).await?;
        }
        Err(GraphError::NoCommonAncestor)
    }

    /// Store the checkout of `id` so later checkouts can start from it.
    pub async fn save_snapshot(&self, id: &CommitId) -> Result<(), GraphError> {
        let diffs = self.checkout(id).await?;
        self.repository.save_snapshot(id, diffs).await?;
        Ok(())
    }

    /// Merge the current heads into one.
    pub async fn merge_heads(&self) -> Result<CommitId, GraphError> {
        let heads = self.repository.get_heads().await?;
        self.merge(heads).await
    }

    /// Merge `heads` into a single commit and push it.
    ///
    /// A single head is returned as is. When another writer moves the heads
    /// before the push lands, the heads are re-read and the merge rebuilt,
    /// up to the configured number of attempts.
    pub async fn merge(&self, heads: BTreeSet<CommitId>) -> Result<CommitId, GraphError> {
        let max_attempts = self.merge_retry.max_attempts.max(1);
        let mut heads = heads;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let first = *heads.first().ok_or(GraphError::EmptyHeads)?;
            if heads.len() == 1 {
                return Ok(first);
            }

            let commit = self.build_merge(&heads).await?;
            let id = commit.id();
            match self.repository.push(commit).await {
                Ok(()) => {
                    log::info!(
                        "Merged {} heads (first {}) into {}",
                        heads.len(),
                        first.short(),
                        id.short()
                    );
                    return Ok(id);
                }
                Err(e) if e.is_head_stale() => {
                    if attempt >= max_attempts {
                        log::warn!("Giving up merge after {} stale pushes", attempt);
                        return Err(GraphError::RetriesExhausted { attempts: attempt });
                    }
                    log::debug!("Merge push stale (attempt {}), re-reading heads", attempt);
                    tokio::time::sleep(self.merge_retry.delay_for(attempt)).await;
                    heads = self.repository.get_heads().await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn build_merge(&self, heads: &BTreeSet<CommitId>) -> Result<Commit<S::Diff>, GraphError> {
        let ancestor = self.find_common_ancestor(heads.iter().copied()).await?;
        log::debug!(
            "Common ancestor of {} heads is {} at level {}",
            heads.len(),
            ancestor.base.short(),
            ancestor.base_level
        );

        let mut max_level = 0;
        let mut paths = Vec::with_capacity(heads.len());
        for head in heads {
            max_level = max_level.max(self.repository.load_commit(head).await?.level());
            let path = ancestor.paths.get(head).map(Vec::as_slice).unwrap_or(&[]);
            paths.push(self.system.squash_all(path));
        }

        // Fold heads left to right; `acc` is the merged path from the base.
        let mut acc = paths[0].clone();
        let mut contributions: Vec<Vec<S::Diff>> = vec![Vec::new()];
        for path in &paths[1..] {
            let transformed = self.system.transform_all(&acc, path)?;
            for contribution in contributions.iter_mut() {
                contribution.extend(transformed.right.iter().cloned());
            }
            contributions.push(transformed.left);
            acc.extend(transformed.right);
        }

        let parents: BTreeMap<CommitId, Vec<S::Diff>> = heads
            .iter()
            .copied()
            .zip(contributions.iter().map(|c| self.system.squash_all(c)))
            .collect();
        Ok(self.repository.create_merge_commit(parents, max_level + 1)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::OtState;
    use crate::repository::InMemoryRepository;
    use crate::systems::counter::{CounterDiff, CounterState, CounterSystem};

    type Repo = InMemoryRepository<CounterDiff>;

    fn setup() -> (Arc<Repo>, OtAlgorithms<Repo, CounterSystem>, Commit<CounterDiff>) {
        let repo = Arc::new(Repo::with_root().unwrap());
        let algorithms = OtAlgorithms::new(
            Arc::clone(&repo),
            Arc::new(CounterSystem),
            RetryPolicy::immediate(3),
        );
        (repo, algorithms, Commit::root().unwrap())
    }

    fn value_of(diffs: &[CounterDiff]) -> i64 {
        let mut state = CounterState::default();
        state.apply_all(diffs).unwrap();
        state.value()
    }

    async fn child(repo: &Repo, parent: &Commit<CounterDiff>, delta: i64) -> Commit<CounterDiff> {
        let commit = Commit::child_of(parent, vec![CounterDiff::Add(delta)]).unwrap();
        repo.append(commit.clone()).await.unwrap();
        commit
    }

    #[tokio::test]
    async fn test_linear_history_checkout_and_diff() {
        let (repo, algorithms, root) = setup();
        let a = child(&repo, &root, 1).await;
        let b = child(&repo, &a, 10).await;

        assert_eq!(value_of(&algorithms.checkout(&b.id()).await.unwrap()), 11);
        assert_eq!(algorithms.diff(&a.id(), &b.id()).await.unwrap(), vec![CounterDiff::Add(10)]);
        assert_eq!(algorithms.diff(&b.id(), &a.id()).await.unwrap(), vec![CounterDiff::Add(-10)]);
        assert!(algorithms.diff(&b.id(), &b.id()).await.unwrap().is_empty());

        // Single head merges to itself
        assert_eq!(algorithms.merge_heads().await.unwrap(), b.id());
    }

    #[tokio::test]
    async fn test_common_ancestor_of_fork() {
        let (repo, algorithms, root) = setup();
        let base = child(&repo, &root, 1).await;
        let left = child(&repo, &base, 10).await;
        let right = child(&repo, &base, 100).await;
        let right2 = child(&repo, &right, 1000).await;

        let ancestor = algorithms
            .find_common_ancestor([left.id(), right2.id()])
            .await
            .unwrap();
        assert_eq!(ancestor.base, base.id());
        assert_eq!(ancestor.base_level, 1);
        assert_eq!(ancestor.paths[&left.id()], vec![CounterDiff::Add(10)]);
        assert_eq!(ancestor.paths[&right2.id()], vec![CounterDiff::Add(1100)]);

        let diff = algorithms.diff(&left.id(), &right2.id()).await.unwrap();
        assert_eq!(diff, vec![CounterDiff::Add(1090)]);
    }

    #[tokio::test]
    async fn test_three_way_merge_contributions() {
        let (repo, algorithms, root) = setup();
        let a = child(&repo, &root, 1).await;
        let b = child(&repo, &root, 10).await;
        let c = child(&repo, &root, 100).await;
        assert_eq!(repo.get_heads().await.unwrap().len(), 3);

        let merged = algorithms.merge_heads().await.unwrap();
        let commit = repo.load_commit(&merged).await.unwrap();
        assert_eq!(commit.level(), 2);
        assert_eq!(commit.diffs_from(&a.id()).unwrap(), &[CounterDiff::Add(110)]);
        assert_eq!(commit.diffs_from(&b.id()).unwrap(), &[CounterDiff::Add(101)]);
        assert_eq!(commit.diffs_from(&c.id()).unwrap(), &[CounterDiff::Add(11)]);

        assert_eq!(value_of(&algorithms.checkout(&merged).await.unwrap()), 111);
        assert_eq!(repo.get_heads().await.unwrap().into_iter().collect::<Vec<_>>(), vec![merged]);
    }

    #[tokio::test]
    async fn test_find_parent_by_level() {
        let (repo, algorithms, root) = setup();
        let a = child(&repo, &root, 1).await;
        let b = child(&repo, &a, 2).await;
        let c = child(&repo, &b, 3).await;

        let found = algorithms
            .find_parent(&c.id(), |commit| commit.level() == 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.commit, a.id());
        assert_eq!(found.path, vec![CounterDiff::Add(5)]);

        let none = algorithms.find_parent(&c.id(), |_| false).await.unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_checkout_matches_replay() {
        let (repo, algorithms, root) = setup();
        let a = child(&repo, &root, 3).await;
        let b = child(&repo, &a, 4).await;
        let c = child(&repo, &b, 5).await;

        let replayed = algorithms.checkout(&c.id()).await.unwrap();
        algorithms.save_snapshot(&b.id()).await.unwrap();
        assert_eq!(repo.load_snapshot(&b.id()).await.unwrap(), Some(vec![CounterDiff::Add(7)]));

        let from_snapshot = algorithms.checkout(&c.id()).await.unwrap();
        assert_eq!(value_of(&from_snapshot), value_of(&replayed));
        assert_eq!(value_of(&from_snapshot), 12);
    }
}
