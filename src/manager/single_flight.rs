//! De-duplication of concurrent async work.

use std::future::Future;
use std::sync::{Mutex, PoisonError};

use futures_util::future::{BoxFuture, FutureExt, Shared};

/// Runs at most one instance of a task at a time.
///
/// Callers arriving while a task is in flight get a handle to that same task
/// and observe its result. Once it completes, the next caller starts a fresh
/// one. The task makes progress while at least one caller awaits it.
pub struct SingleFlight<T> {
    slot: Mutex<Option<Shared<BoxFuture<'static, T>>>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the task in flight, or start one built by `start`.
    pub fn join_or_start<F, Fut>(&self, start: F) -> Shared<BoxFuture<'static, T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(running) = slot.as_ref() {
            if running.peek().is_none() {
                return running.clone();
            }
        }
        let task = start().boxed().shared();
        *slot = Some(task.clone());
        task
    }

    pub fn is_running(&self) -> bool {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.as_ref().map_or(false, |task| task.peek().is_none())
    }
}
