//! Tracked background work for a connection
//!
//! Every background unit (reader loop, reconnect sleep, deferred reply) runs
//! with its own cancellation token and removes itself from the set when it
//! finishes. Cancelling the set waits for each task to stop, except the task
//! doing the cancelling.

use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

tokio::task_local! {
    static TASK_ID: u64;
}

struct TrackedTask {
    name: &'static str,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// Set of cancellable background tasks
#[derive(Clone, Default)]
pub struct TaskSet {
    tasks: Arc<DashMap<u64, TrackedTask>>,
    next_id: Arc<AtomicU64>,
}

impl TaskSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a tracked task, returning its cancellation token
    pub fn spawn<F>(&self, name: &'static str, future: F) -> CancellationToken
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.tasks.insert(
            id,
            TrackedTask {
                name,
                token: token.clone(),
                handle: None,
            },
        );

        let tasks = Arc::clone(&self.tasks);
        let task_token = token.clone();
        let handle = tokio::spawn(TASK_ID.scope(id, async move {
            tokio::select! {
                biased;
                () = task_token.cancelled() => {
                    tracing::debug!("Task {} ({}) cancelled", name, id);
                }
                () = future => {}
            }
            tasks.remove(&id);
        }));

        // A task that already finished has removed its own entry
        if let Some(mut entry) = self.tasks.get_mut(&id) {
            entry.handle = Some(handle);
        }
        token
    }

    /// Cancel every task and wait for each to stop
    ///
    /// When called from inside a tracked task, that task is left running.
    pub async fn cancel_all(&self) {
        let current = TASK_ID.try_with(|id| *id).ok();
        let ids: Vec<u64> = self
            .tasks
            .iter()
            .map(|entry| *entry.key())
            .filter(|id| Some(*id) != current)
            .collect();

        let mut handles = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, task)) = self.tasks.remove(&id) {
                tracing::debug!("Cancelling task {} ({})", task.name, id);
                task.token.cancel();
                handles.extend(task.handle);
            }
        }

        for handle in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::warn!("Background task panicked: {}", e);
                }
            }
        }
    }

    /// Number of live tasks
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
