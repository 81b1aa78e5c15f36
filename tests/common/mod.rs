//! Shared fixtures: instrumented repository and node wrappers, a
//! deliberately partial diff algebra, and dictionary and counter clients.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use otsync::systems::{CounterDiff, CounterState, CounterSystem, DictDiff, DictState, DictSystem};
use otsync::{
    Commit, CommitId, InMemoryRepository, NodeError, OtAlgorithms, OtError, OtRepository,
    OtState, OtSystem, RepositoryError, RepositoryNode, RetryPolicy, StateManager, SyncNode,
    TransformResult,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ---------------------------------------------------------------------------
// Repository wrapper
// ---------------------------------------------------------------------------

/// In-memory repository that records loads and can reject pushes.
pub struct TestRepository<D> {
    pub inner: InMemoryRepository<D>,
    loaded: Mutex<Vec<u64>>,
    pub pushes: AtomicUsize,
    /// Number of upcoming pushes to reject as stale.
    pub stale_pushes: AtomicUsize,
    /// Commits appended to `inner` when a push is rejected, simulating the
    /// writer that won the race.
    interference: Mutex<Vec<Commit<D>>>,
    pub unavailable: AtomicBool,
}

impl<D> TestRepository<D>
where
    D: Clone + Serialize + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: InMemoryRepository::with_root().unwrap(),
            loaded: Mutex::new(Vec::new()),
            pushes: AtomicUsize::new(0),
            stale_pushes: AtomicUsize::new(0),
            interference: Mutex::new(Vec::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn loaded_levels(&self) -> Vec<u64> {
        self.loaded.lock().unwrap().clone()
    }

    pub fn clear_loaded(&self) {
        self.loaded.lock().unwrap().clear();
    }

    pub fn interfere_with(&self, commit: Commit<D>) {
        self.interference.lock().unwrap().push(commit);
    }

    pub async fn append(&self, commit: &Commit<D>) {
        self.inner.append(commit.clone()).await.unwrap();
    }
}

#[async_trait]
impl<D> OtRepository<D> for TestRepository<D>
where
    D: Clone + Serialize + Send + Sync + 'static,
{
    async fn push(&self, commit: Commit<D>) -> Result<(), RepositoryError> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable("storage offline".into()));
        }
        let reject = self
            .stale_pushes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if reject {
            let winners: Vec<Commit<D>> = self.interference.lock().unwrap().drain(..).collect();
            for winner in winners {
                self.inner.append(winner).await?;
            }
            return Err(RepositoryError::HeadStale {
                declared: commit.parent_ids().copied().collect(),
                heads: self.inner.get_heads().await?.into_iter().collect(),
            });
        }
        self.inner.push(commit).await
    }

    async fn get_heads(&self) -> Result<BTreeSet<CommitId>, RepositoryError> {
        self.inner.get_heads().await
    }

    async fn load_commit(&self, id: &CommitId) -> Result<Commit<D>, RepositoryError> {
        let commit = self.inner.load_commit(id).await?;
        self.loaded.lock().unwrap().push(commit.level());
        Ok(commit)
    }

    async fn load_snapshot(&self, id: &CommitId) -> Result<Option<Vec<D>>, RepositoryError> {
        self.inner.load_snapshot(id).await
    }

    async fn save_snapshot(&self, id: &CommitId, diffs: Vec<D>) -> Result<(), RepositoryError> {
        self.inner.save_snapshot(id, diffs).await
    }
}

// ---------------------------------------------------------------------------
// Node wrapper
// ---------------------------------------------------------------------------

/// Sync node that counts calls and injects failures.
pub struct ScriptedNode<N: ?Sized> {
    inner: Arc<N>,
    pub pulls: AtomicUsize,
    pub pushes: AtomicUsize,
    pub offline: AtomicBool,
    /// Number of upcoming pushes answered with a conflict.
    pub conflicts: AtomicUsize,
    pub pull_delay_ms: AtomicU64,
    /// Diffs another writer lands on the same head before a conflict.
    interference: Mutex<Option<Vec<DictDiff>>>,
}

impl<N: SyncNode<DictDiff> + ?Sized> ScriptedNode<N> {
    pub fn new(inner: Arc<N>) -> Self {
        Self {
            inner,
            pulls: AtomicUsize::new(0),
            pushes: AtomicUsize::new(0),
            offline: AtomicBool::new(false),
            conflicts: AtomicUsize::new(0),
            pull_delay_ms: AtomicU64::new(0),
            interference: Mutex::new(None),
        }
    }

    pub fn conflict_once_with(&self, diffs: Vec<DictDiff>) {
        *self.interference.lock().unwrap() = Some(diffs);
        self.conflicts.store(1, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), NodeError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(NodeError::Network("link down".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl<N: SyncNode<DictDiff> + ?Sized> SyncNode<DictDiff> for ScriptedNode<N> {
    async fn checkout(&self) -> Result<(CommitId, Vec<DictDiff>), NodeError> {
        self.check_online()?;
        self.inner.checkout().await
    }

    async fn checkout_at(&self, id: &CommitId) -> Result<Vec<DictDiff>, NodeError> {
        self.check_online()?;
        self.inner.checkout_at(id).await
    }

    async fn pull(&self, old: &CommitId) -> Result<(CommitId, Vec<DictDiff>), NodeError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let delay = self.pull_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.check_online()?;
        self.inner.pull(old).await
    }

    async fn push(&self, current: &CommitId, diffs: Vec<DictDiff>) -> Result<CommitId, NodeError> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        let conflict = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if conflict {
            let winner = self.interference.lock().unwrap().take();
            if let Some(winner) = winner {
                self.inner.push(current, winner).await?;
            }
            return Err(NodeError::Conflict);
        }
        self.inner.push(current, diffs).await
    }
}

/// Sync node whose pushes can vanish on the way out or on the way back.
pub struct LossyNode<N: ?Sized> {
    inner: Arc<N>,
    pub pushes: AtomicUsize,
    /// Upcoming pushes dropped before reaching the inner node.
    pub lost_requests: AtomicUsize,
    /// Upcoming pushes delivered whose answer is then dropped.
    pub lost_replies: AtomicUsize,
}

impl<N: ?Sized> LossyNode<N> {
    pub fn new(inner: Arc<N>) -> Self {
        Self {
            inner,
            pushes: AtomicUsize::new(0),
            lost_requests: AtomicUsize::new(0),
            lost_replies: AtomicUsize::new(0),
        }
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl<D, N> SyncNode<D> for LossyNode<N>
where
    D: Send + 'static,
    N: SyncNode<D> + ?Sized,
{
    async fn checkout(&self) -> Result<(CommitId, Vec<D>), NodeError> {
        self.inner.checkout().await
    }

    async fn checkout_at(&self, id: &CommitId) -> Result<Vec<D>, NodeError> {
        self.inner.checkout_at(id).await
    }

    async fn pull(&self, old: &CommitId) -> Result<(CommitId, Vec<D>), NodeError> {
        self.inner.pull(old).await
    }

    async fn push(&self, current: &CommitId, diffs: Vec<D>) -> Result<CommitId, NodeError> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.lost_requests) {
            return Err(NodeError::Network("request lost".into()));
        }
        let pushed = self.inner.push(current, diffs).await?;
        if take_one(&self.lost_replies) {
            return Err(NodeError::Network("reply lost".into()));
        }
        Ok(pushed)
    }
}

// ---------------------------------------------------------------------------
// Algebra with undefined transforms
// ---------------------------------------------------------------------------

/// Dictionary algebra that refuses to reconcile writes to the same key.
#[derive(Clone, Copy, Debug, Default)]
pub struct StrictDictSystem;

impl OtSystem for StrictDictSystem {
    type Diff = DictDiff;

    fn transform(
        &self,
        left: &DictDiff,
        right: &DictDiff,
    ) -> Result<TransformResult<DictDiff>, OtError> {
        if left.key == right.key {
            return Err(OtError::undefined(left, right));
        }
        DictSystem.transform(left, right)
    }

    fn invert(&self, diff: &DictDiff) -> Vec<DictDiff> {
        DictSystem.invert(diff)
    }

    fn squash(&self, first: &DictDiff, second: &DictDiff) -> Option<DictDiff> {
        DictSystem.squash(first, second)
    }

    fn is_empty(&self, diff: &DictDiff) -> bool {
        DictSystem.is_empty(diff)
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub type DictServer<S = DictSystem> = RepositoryNode<InMemoryRepository<DictDiff>, S>;
pub type DictClient<S = DictSystem> = StateManager<ScriptedNode<DictServer<S>>, S, DictState>;

pub fn dict_server<S: OtSystem<Diff = DictDiff> + Default>() -> Arc<DictServer<S>> {
    Arc::new(RepositoryNode::new(OtAlgorithms::new(
        Arc::new(InMemoryRepository::with_root().unwrap()),
        Arc::new(S::default()),
        RetryPolicy::immediate(5),
    )))
}

pub fn dict_client<S: OtSystem<Diff = DictDiff> + Default>(
    server: &Arc<DictServer<S>>,
    retry: RetryPolicy,
) -> (DictClient<S>, Arc<ScriptedNode<DictServer<S>>>) {
    let node = Arc::new(ScriptedNode::new(Arc::clone(server)));
    let manager = StateManager::new(
        Arc::clone(&node),
        Arc::new(S::default()),
        DictState::default(),
        retry,
    );
    (manager, node)
}

pub fn entries<S: OtSystem<Diff = DictDiff>>(manager: &DictClient<S>) -> Vec<(String, String)> {
    manager.with_state(|state| {
        state
            .entries()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    })
}

pub type CounterServer = RepositoryNode<InMemoryRepository<CounterDiff>, CounterSystem>;
pub type CounterClient = StateManager<LossyNode<CounterServer>, CounterSystem, CounterState>;

pub fn counter_server() -> Arc<CounterServer> {
    Arc::new(RepositoryNode::new(OtAlgorithms::new(
        Arc::new(InMemoryRepository::with_root().unwrap()),
        Arc::new(CounterSystem),
        RetryPolicy::immediate(5),
    )))
}

pub fn counter_client(
    server: &Arc<CounterServer>,
) -> (CounterClient, Arc<LossyNode<CounterServer>>) {
    let node = Arc::new(LossyNode::new(Arc::clone(server)));
    let manager = StateManager::new(
        Arc::clone(&node),
        Arc::new(CounterSystem),
        CounterState::default(),
        RetryPolicy::immediate(3),
    );
    (manager, node)
}

/// Value of the server's merged head.
pub async fn server_value(server: &CounterServer) -> i64 {
    let (_, diffs) = server.checkout().await.unwrap();
    let mut state = CounterState::default();
    state.apply_all(&diffs).unwrap();
    state.value()
}

/// Distinct ids, for asserting heads.
pub fn ids(heads: impl IntoIterator<Item = CommitId>) -> HashSet<CommitId> {
    heads.into_iter().collect()
}
