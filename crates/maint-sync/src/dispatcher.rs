use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use maint_std::time::GetNow;
use tokio::task::JoinHandle;

use crate::{
    error::SyncError,
    lock::LockTable,
    task::{Outcome, Retention, TaskId, TaskRecord, TaskStatus, TaskStore},
};

pub const ALREADY_PROCESSING: &str = "already processing";

/// Result of handing work to [`TaskDispatcher::dispatch`].
#[derive(Debug)]
pub enum Dispatch {
    /// Work is running on its own task; the handle resolves once the status
    /// has been recorded.
    Started(JoinHandle<()>),
    /// The lock domain was busy. The work was dropped without running.
    Skipped,
}

/// Status-tracked, single-flight execution of background work.
///
/// Cheap to clone; clones share the task table and the lock table.
pub struct TaskDispatcher<C> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for TaskDispatcher<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<C> {
    tasks: TaskStore,
    locks: Arc<LockTable>,
    clock: C,
}

impl<C> TaskDispatcher<C>
where
    C: GetNow + Send + Sync + 'static,
{
    pub fn new(clock: C, retention: Retention) -> Self {
        Self {
            inner: Arc::new(Inner {
                tasks: TaskStore::new(retention),
                locks: Arc::new(LockTable::new()),
                clock,
            }),
        }
    }

    /// The lock table behind every dispatch. Work that fans out over several
    /// domains takes the inner domains from here.
    pub fn locks(&self) -> Arc<LockTable> {
        Arc::clone(&self.inner.locks)
    }

    /// Register a task and return its id. The task is queryable as
    /// `PENDING` right away.
    pub fn submit(&self) -> TaskId {
        self.inner.tasks.insert_pending(self.inner.clock.now())
    }

    /// Run `work` under `lock_domain` without waiting for the domain.
    ///
    /// If another task holds the domain, `task_id` is marked skipped and
    /// `work` is dropped. Errors and panics raised by `work` are recorded as
    /// `FAILED` and never reach the caller.
    pub fn dispatch<F>(&self, task_id: TaskId, lock_domain: &str, work: F) -> Dispatch
    where
        F: Future<Output = Result<Outcome, SyncError>> + Send + 'static,
    {
        let tasks = &self.inner.tasks;
        tasks.set_domain(&task_id, lock_domain);

        let Some(guard) = self.inner.locks.try_acquire(lock_domain) else {
            tracing::info!(task_id = %task_id, lock_domain, "Lock domain busy, skipping task");
            tasks.transition(
                &task_id,
                TaskStatus::Skipped {
                    reason: ALREADY_PROCESSING.to_string(),
                },
                self.inner.clock.now(),
            );
            return Dispatch::Skipped;
        };

        tasks.transition(&task_id, TaskStatus::Running, self.inner.clock.now());
        tracing::debug!(task_id = %task_id, lock_domain, "Task started");

        let inner = Arc::clone(&self.inner);
        let domain = lock_domain.to_string();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let outcome = match AssertUnwindSafe(work).catch_unwind().await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    tracing::error!(task_id = %task_id, lock_domain = %domain, error = %e, "Task failed");
                    Outcome::Failed(e.to_string())
                }
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    tracing::error!(task_id = %task_id, lock_domain = %domain, reason = %reason, "Task panicked");
                    Outcome::Failed(reason)
                }
            };
            tracing::info!(task_id = %task_id, lock_domain = %domain, outcome = ?outcome, "Task finished");
            inner
                .tasks
                .transition(&task_id, outcome.into(), inner.clock.now());
        });
        Dispatch::Started(handle)
    }

    /// `submit` followed by `dispatch`.
    pub fn spawn<F>(&self, lock_domain: &str, work: F) -> (TaskId, Dispatch)
    where
        F: Future<Output = Result<Outcome, SyncError>> + Send + 'static,
    {
        let id = self.submit();
        let dispatch = self.dispatch(id, lock_domain, work);
        (id, dispatch)
    }

    /// `None` for ids that were never issued or have been pruned.
    pub fn get_status(&self, task_id: &TaskId) -> Option<TaskRecord> {
        self.inner.tasks.get(task_id)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
