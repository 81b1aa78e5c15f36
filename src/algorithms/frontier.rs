//! Level-ordered backward walk over the commit graph.
//!
//! Commits are popped highest level first. Since every commit sits strictly
//! above its parents, once a commit is popped all of its descendants that
//! are reachable from the origins have already been popped, so its path set
//! is final.

use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};

use serde::Serialize;

use crate::commit::{Commit, CommitId};
use crate::ot::OtSystem;
use crate::repository::{OtRepository, RepositoryError};

/// A popped commit with the diff paths leading from it to each origin that
/// reaches it.
pub(crate) struct Visited<D> {
    pub commit: Commit<D>,
    pub paths: BTreeMap<CommitId, Vec<D>>,
}

pub(crate) struct Frontier<'a, S: OtSystem> {
    system: &'a S,
    origins: BTreeSet<CommitId>,
    queue: BinaryHeap<(u64, CommitId)>,
    pending: HashMap<CommitId, Visited<S::Diff>>,
}

impl<'a, S> Frontier<'a, S>
where
    S: OtSystem,
    S::Diff: Serialize,
{
    /// Seed the walk with the origin commits. Duplicate origins collapse.
    pub async fn start<R>(
        system: &'a S,
        repository: &R,
        origins: impl IntoIterator<Item = CommitId>,
    ) -> Result<Self, RepositoryError>
    where
        R: OtRepository<S::Diff> + ?Sized,
    {
        let mut frontier = Self {
            system,
            origins: BTreeSet::new(),
            queue: BinaryHeap::new(),
            pending: HashMap::new(),
        };
        for origin in origins {
            if !frontier.origins.insert(origin) {
                continue;
            }
            let commit = repository.load_commit(&origin).await?;
            let mut paths = BTreeMap::new();
            paths.insert(origin, Vec::new());
            frontier.queue.push((commit.level(), origin));
            frontier.pending.insert(origin, Visited { commit, paths });
        }
        Ok(frontier)
    }

    pub fn origin_count(&self) -> usize {
        self.origins.len()
    }

    /// Remove the highest queued commit.
    pub fn pop(&mut self) -> Option<Visited<S::Diff>> {
        let (_, id) = self.queue.pop()?;
        self.pending.remove(&id)
    }

    /// Whether every origin reaches `visited`.
    pub fn reached_by_all(&self, visited: &Visited<S::Diff>) -> bool {
        visited.paths.len() == self.origins.len()
    }

    /// Queue the parents of a popped commit, loading the ones not yet seen.
    pub async fn expand<R>(
        &mut self,
        repository: &R,
        visited: &Visited<S::Diff>,
    ) -> Result<(), RepositoryError>
    where
        R: OtRepository<S::Diff> + ?Sized,
    {
        for (parent, edge) in visited.commit.parents() {
            let extended: Vec<(CommitId, Vec<S::Diff>)> = visited
                .paths
                .iter()
                .map(|(origin, path)| {
                    let mut full = edge.clone();
                    full.extend(path.iter().cloned());
                    (*origin, self.system.squash_all(&full))
                })
                .collect();

            if let Some(seen) = self.pending.get_mut(parent) {
                for (origin, path) in extended {
                    seen.paths.entry(origin).or_insert(path);
                }
                continue;
            }

            let commit = repository.load_commit(parent).await?;
            self.queue.push((commit.level(), *parent));
            self.pending.insert(
                *parent,
                Visited {
                    commit,
                    paths: extended.into_iter().collect(),
                },
            );
        }
        Ok(())
    }
}
