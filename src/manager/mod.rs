//! Client-side document state
//!
//! A [`StateManager`] owns the local projection of one document, the head
//! it was last synced to and the diffs added since then. Local edits are
//! applied immediately; `sync()` exchanges them with a [`SyncNode`],
//! rebasing the pending edits over whatever arrived from other writers.

mod single_flight;

pub use single_flight::SingleFlight;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::commit::CommitId;
use crate::config::RetryPolicy;
use crate::node::{NodeError, SyncNode};
use crate::ot::{OtState, OtSystem};

/// Sync failure as seen by callers. Shared between concurrent `sync()`
/// callers, hence cloneable and carrying rendered messages only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Document has not been checked out")]
    NotCheckedOut,

    #[error("Manager is invalid and must be reset")]
    Invalid,

    #[error("Manager is stopped")]
    Stopped,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Sync failed after {attempts} conflicting pushes")]
    SyncFailed { attempts: u32 },

    #[error("Transform undefined: {0}")]
    TransformUndefined(String),

    #[error("Local state corrupted: {0}")]
    CorruptedState(String),

    #[error("Superseded by a concurrent checkout or reset")]
    Superseded,

    #[error("Remote error: {0}")]
    Remote(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManagerStatus {
    Uninitialized,
    Idle,
    Syncing,
    /// A transform or apply failed. Only `reset()` leaves this state.
    Invalid,
    Stopped,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManagerEvent {
    CheckedOut { head: CommitId },
    Rebased { head: CommitId },
    Pushed { head: CommitId },
    Invalidated { reason: String },
}

struct Local<D, St> {
    projection: St,
    head: Option<CommitId>,
    pending: Vec<D>,
    status: ManagerStatus,
    epoch: u64,
    unacked: Option<Unacked<D>>,
}

/// A push whose outcome never reached us. It is re-sent verbatim before the
/// next pull: commit ids are content hashes, so if the node stored it the
/// same commit is acknowledged instead of being applied a second time.
#[derive(Clone)]
struct Unacked<D> {
    base: CommitId,
    diffs: Vec<D>,
    /// Length of the pending prefix squashed into `diffs`.
    count: usize,
}

enum Attempt {
    Done(CommitId),
    Conflict,
}

struct Inner<N: ?Sized, S: OtSystem, St> {
    id: Uuid,
    node: Arc<N>,
    system: Arc<S>,
    retry: RetryPolicy,
    local: Mutex<Local<S::Diff, St>>,
    flight: SingleFlight<Result<CommitId, SyncError>>,
    events: broadcast::Sender<ManagerEvent>,
}

/// Handle to one document's client state. Clones share the same state.
pub struct StateManager<N: ?Sized, S: OtSystem, St> {
    inner: Arc<Inner<N, S, St>>,
}

impl<N: ?Sized, S: OtSystem, St> Clone for StateManager<N, S, St> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<N, S, St> StateManager<N, S, St>
where
    N: SyncNode<S::Diff> + ?Sized + 'static,
    S: OtSystem,
    St: OtState<S::Diff>,
{
    pub fn new(node: Arc<N>, system: Arc<S>, projection: St, retry: RetryPolicy) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                node,
                system,
                retry,
                local: Mutex::new(Local {
                    projection,
                    head: None,
                    pending: Vec::new(),
                    status: ManagerStatus::Uninitialized,
                    epoch: 0,
                    unacked: None,
                }),
                flight: SingleFlight::new(),
                events,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Load the current document from the node, replacing the local state.
    pub async fn checkout(&self) -> Result<CommitId, SyncError> {
        self.ensure_checkout_allowed()?;
        self.inner.checkout(None).await
    }

    /// Load the document as of commit `id`. The next `sync()` brings it up
    /// to the node's head.
    pub async fn checkout_at(&self, id: CommitId) -> Result<CommitId, SyncError> {
        self.ensure_checkout_allowed()?;
        self.inner.checkout(Some(id)).await
    }

    fn ensure_checkout_allowed(&self) -> Result<(), SyncError> {
        match self.inner.lock().status {
            ManagerStatus::Invalid => Err(SyncError::Invalid),
            ManagerStatus::Stopped => Err(SyncError::Stopped),
            _ => Ok(()),
        }
    }

    /// Apply a local edit and queue it for the next sync.
    pub fn add(&self, diff: S::Diff) -> Result<(), SyncError> {
        self.add_all(std::iter::once(diff))
    }

    pub fn add_all(&self, diffs: impl IntoIterator<Item = S::Diff>) -> Result<(), SyncError> {
        let mut local = self.inner.lock();
        match local.status {
            ManagerStatus::Uninitialized => return Err(SyncError::NotCheckedOut),
            ManagerStatus::Invalid => return Err(SyncError::Invalid),
            _ => {}
        }
        for diff in diffs {
            if self.inner.system.is_empty(&diff) {
                continue;
            }
            if let Err(e) = local.projection.apply(&diff) {
                self.inner.invalidate(&mut local, e.to_string());
                return Err(SyncError::CorruptedState(e.to_string()));
            }
            local.pending.push(diff);
        }
        Ok(())
    }

    /// Exchange pending edits with the node.
    ///
    /// Concurrent calls share one run and all observe its result.
    pub async fn sync(&self) -> Result<CommitId, SyncError> {
        {
            let local = self.inner.lock();
            match local.status {
                ManagerStatus::Uninitialized => return Err(SyncError::NotCheckedOut),
                ManagerStatus::Invalid => return Err(SyncError::Invalid),
                ManagerStatus::Stopped => return Err(SyncError::Stopped),
                ManagerStatus::Idle | ManagerStatus::Syncing => {}
            }
        }
        let inner = Arc::clone(&self.inner);
        self.inner
            .flight
            .join_or_start(move || async move { inner.run_sync().await })
            .await
    }

    /// Drop pending edits and check out again. The only way out of
    /// [`ManagerStatus::Invalid`].
    pub async fn reset(&self) -> Result<CommitId, SyncError> {
        {
            let mut local = self.inner.lock();
            if local.status == ManagerStatus::Stopped {
                return Err(SyncError::Stopped);
            }
            local.status = ManagerStatus::Uninitialized;
        }
        self.inner.checkout(None).await
    }

    /// Undo all pending edits locally, without contacting the node.
    pub fn discard_pending(&self) -> Result<usize, SyncError> {
        let mut local = self.inner.lock();
        match local.status {
            ManagerStatus::Uninitialized => return Err(SyncError::NotCheckedOut),
            ManagerStatus::Invalid => return Err(SyncError::Invalid),
            _ => {}
        }
        let count = local.pending.len();
        // A push already in flight must not adopt its result over the undo
        local.epoch += 1;
        let undo = self.inner.system.invert_all(&local.pending);
        if let Err(e) = local.projection.apply_all(&undo) {
            self.inner.invalidate(&mut local, e.to_string());
            return Err(SyncError::CorruptedState(e.to_string()));
        }
        local.pending.clear();
        local.unacked = None;
        Ok(count)
    }

    pub fn is_valid(&self) -> bool {
        self.status() != ManagerStatus::Invalid
    }

    pub fn status(&self) -> ManagerStatus {
        self.inner.lock().status
    }

    pub fn head(&self) -> Option<CommitId> {
        self.inner.lock().head
    }

    pub fn pending(&self) -> Vec<S::Diff> {
        self.inner.lock().pending.clone()
    }

    pub fn has_pending(&self) -> bool {
        !self.inner.lock().pending.is_empty()
    }

    /// Read the projection.
    pub fn with_state<R>(&self, f: impl FnOnce(&St) -> R) -> R {
        f(&self.inner.lock().projection)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }

    /// Refuse further syncs. A run already in flight completes.
    pub fn stop(&self) {
        let mut local = self.inner.lock();
        local.status = ManagerStatus::Stopped;
        log::info!("[{}] Stopped", self.inner.id);
    }

    /// Sync every `interval` until the manager is stopped or invalidated.
    pub fn spawn_sync_loop(&self, interval: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match manager.sync().await {
                    Ok(_) | Err(SyncError::Superseded) | Err(SyncError::NotCheckedOut) => {}
                    Err(SyncError::Stopped) => break,
                    Err(e @ SyncError::Invalid) => {
                        log::error!("[{}] Sync loop exiting: {}", manager.id(), e);
                        break;
                    }
                    Err(e) => log::warn!("[{}] Background sync failed: {}", manager.id(), e),
                }
            }
        })
    }
}

impl<N, S, St> Inner<N, S, St>
where
    N: SyncNode<S::Diff> + ?Sized + 'static,
    S: OtSystem,
    St: OtState<S::Diff>,
{
    fn lock(&self) -> MutexGuard<'_, Local<S::Diff, St>> {
        self.local.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ManagerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn invalidate(&self, local: &mut Local<S::Diff, St>, reason: String) {
        log::error!("[{}] Invalidating local state: {}", self.id, reason);
        local.status = ManagerStatus::Invalid;
        self.emit(ManagerEvent::Invalidated { reason });
    }

    async fn checkout(&self, at: Option<CommitId>) -> Result<CommitId, SyncError> {
        let epoch = {
            let mut local = self.lock();
            local.epoch += 1;
            local.epoch
        };

        let loaded = match at {
            None => self.node.checkout().await,
            Some(id) => self.node.checkout_at(&id).await.map(|diffs| (id, diffs)),
        };
        let (head, diffs) = loaded.map_err(|e| self.node_error(e))?;

        let mut local = self.lock();
        if local.epoch != epoch {
            return Err(SyncError::Superseded);
        }
        if !local.pending.is_empty() {
            log::warn!(
                "[{}] Dropping {} unsynced edits on checkout",
                self.id,
                local.pending.len()
            );
        }
        local.pending.clear();
        local.unacked = None;
        local.projection.init();
        if let Err(e) = local.projection.apply_all(&diffs) {
            self.invalidate(&mut local, e.to_string());
            return Err(SyncError::CorruptedState(e.to_string()));
        }
        local.head = Some(head);
        if local.status != ManagerStatus::Stopped {
            local.status = ManagerStatus::Idle;
        }
        log::info!("[{}] Checked out {}", self.id, head.short());
        self.emit(ManagerEvent::CheckedOut { head });
        Ok(head)
    }

    async fn run_sync(&self) -> Result<CommitId, SyncError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut conflicts = 0;
        loop {
            let (epoch, head) = {
                let mut local = self.lock();
                if local.status == ManagerStatus::Invalid {
                    return Err(SyncError::Invalid);
                }
                let head = local.head.ok_or(SyncError::NotCheckedOut)?;
                if local.status == ManagerStatus::Idle {
                    local.status = ManagerStatus::Syncing;
                }
                (local.epoch, head)
            };

            let outcome = self.attempt(epoch, head).await;
            match outcome {
                Ok(Attempt::Done(head)) => {
                    self.settle();
                    return Ok(head);
                }
                Ok(Attempt::Conflict) => {
                    conflicts += 1;
                    if conflicts >= max_attempts {
                        log::warn!("[{}] Sync gave up after {} conflicts", self.id, conflicts);
                        self.settle();
                        return Err(SyncError::SyncFailed {
                            attempts: conflicts,
                        });
                    }
                    log::debug!("[{}] Push conflict {}, retrying", self.id, conflicts);
                    tokio::time::sleep(self.retry.delay_for(conflicts)).await;
                }
                Err(e) => {
                    self.settle();
                    return Err(e);
                }
            }
        }
    }

    /// One pull, rebase and push round.
    async fn attempt(&self, epoch: u64, head: CommitId) -> Result<Attempt, SyncError> {
        let head = self.resend_unacked(epoch).await?.unwrap_or(head);
        let (remote_head, remote) = self.node.pull(&head).await.map_err(|e| self.node_error(e))?;

        let (head, pushed_count, diffs) = {
            let mut local = self.lock();
            if local.epoch != epoch {
                return Err(SyncError::Superseded);
            }
            if remote_head != head {
                self.rebase(&mut local, remote_head, &remote)?;
            }
            if local.pending.is_empty() {
                return Ok(Attempt::Done(remote_head));
            }
            let diffs = self.system.squash_all(&local.pending);
            local.unacked = Some(Unacked {
                base: remote_head,
                diffs: diffs.clone(),
                count: local.pending.len(),
            });
            (remote_head, local.pending.len(), diffs)
        };

        match self.node.push(&head, diffs).await {
            Ok(pushed) => self.acknowledge(epoch, pushed, pushed_count).map(Attempt::Done),
            Err(NodeError::Conflict) => {
                self.lock().unacked = None;
                Ok(Attempt::Conflict)
            }
            Err(e) => Err(self.push_failed(e)),
        }
    }

    /// Re-send a push left without an answer, returning the new head once
    /// the node acknowledges it.
    async fn resend_unacked(&self, epoch: u64) -> Result<Option<CommitId>, SyncError> {
        let unacked = self.lock().unacked.clone();
        let Some(unacked) = unacked else {
            return Ok(None);
        };
        log::debug!(
            "[{}] Re-sending unacknowledged push on {}",
            self.id,
            unacked.base.short()
        );
        match self.node.push(&unacked.base, unacked.diffs).await {
            Ok(pushed) => self.acknowledge(epoch, pushed, unacked.count).map(Some),
            Err(NodeError::Conflict) => {
                // A stored commit would have been accepted again, so it never landed
                let mut local = self.lock();
                if local.epoch != epoch {
                    return Err(SyncError::Superseded);
                }
                local.unacked = None;
                Ok(None)
            }
            Err(e) => Err(self.push_failed(e)),
        }
    }

    fn acknowledge(
        &self,
        epoch: u64,
        pushed: CommitId,
        count: usize,
    ) -> Result<CommitId, SyncError> {
        let mut local = self.lock();
        if local.epoch != epoch {
            return Err(SyncError::Superseded);
        }
        local.unacked = None;
        // Edits added while the push was in flight stay pending
        let count = count.min(local.pending.len());
        local.pending.drain(..count);
        local.head = Some(pushed);
        log::debug!("[{}] Pushed {} edits as {}", self.id, count, pushed.short());
        self.emit(ManagerEvent::Pushed { head: pushed });
        Ok(pushed)
    }

    /// Only a lost connection leaves the push outcome unknown.
    fn push_failed(&self, err: NodeError) -> SyncError {
        if !matches!(err, NodeError::Network(_)) {
            self.lock().unacked = None;
        }
        self.node_error(err)
    }

    /// Move the pending edits on top of `remote`, which leads from the
    /// current head to `remote_head`.
    fn rebase(
        &self,
        local: &mut Local<S::Diff, St>,
        remote_head: CommitId,
        remote: &[S::Diff],
    ) -> Result<(), SyncError> {
        let transformed = match self.system.transform_all(&local.pending, remote) {
            Ok(t) => t,
            Err(e) => {
                self.invalidate(local, e.to_string());
                return Err(SyncError::TransformUndefined(e.to_string()));
            }
        };
        if let Err(e) = local.projection.apply_all(&transformed.right) {
            self.invalidate(local, e.to_string());
            return Err(SyncError::CorruptedState(e.to_string()));
        }
        local.pending = transformed.left;
        local.head = Some(remote_head);
        log::debug!(
            "[{}] Rebased {} pending edits onto {}",
            self.id,
            local.pending.len(),
            remote_head.short()
        );
        self.emit(ManagerEvent::Rebased { head: remote_head });
        Ok(())
    }

    fn settle(&self) {
        let mut local = self.lock();
        if local.status == ManagerStatus::Syncing {
            local.status = ManagerStatus::Idle;
        }
    }

    fn node_error(&self, err: NodeError) -> SyncError {
        match err {
            NodeError::Network(reason) => SyncError::Network(reason),
            NodeError::Transform(e) => {
                let mut local = self.lock();
                self.invalidate(&mut local, e.to_string());
                SyncError::TransformUndefined(e.to_string())
            }
            NodeError::Conflict | NodeError::Graph(_) | NodeError::Codec(_) => {
                SyncError::Remote(err.to_string())
            }
        }
    }
}
