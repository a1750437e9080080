use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Opaque task identifier handed out by `submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Success { count: usize },
    Failed { reason: String },
    Skipped { reason: String },
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success { .. } | Self::Failed { .. } | Self::Skipped { .. }
        )
    }

    fn may_become(&self, next: &TaskStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            (Self::Pending, Self::Skipped { .. }) => true,
            (Self::Pending | Self::Running, next) if next.is_terminal() => true,
            _ => false,
        }
    }
}

/// What a unit of dispatched work reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Number of records handled.
    Success(usize),
    Failed(String),
    Skipped(String),
}

impl From<Outcome> for TaskStatus {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success(count) => Self::Success { count },
            Outcome::Failed(reason) => Self::Failed { reason },
            Outcome::Skipped(reason) => Self::Skipped { reason },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRecord {
    pub id: TaskId,
    /// Set once the task is dispatched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_domain: Option<String>,
    #[serde(flatten)]
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Bounded retention for the task table.
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    /// How long terminal tasks stay queryable.
    pub ttl: Duration,
    /// Hard cap on the number of records kept.
    pub max_tasks: usize,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            max_tasks: 10_000,
        }
    }
}

/// In-process task table.
pub struct TaskStore {
    tasks: Mutex<HashMap<TaskId, TaskRecord>>,
    retention: Retention,
}

impl TaskStore {
    pub fn new(retention: Retention) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            retention,
        }
    }

    pub fn insert_pending(&self, now: DateTime<Utc>) -> TaskId {
        let id = TaskId::new();
        let mut tasks = self.lock();
        prune(&mut tasks, &self.retention, now);
        tasks.insert(
            id,
            TaskRecord {
                id,
                lock_domain: None,
                status: TaskStatus::Pending,
                created_at: now,
                updated_at: now,
            },
        );
        id
    }

    pub fn set_domain(&self, id: &TaskId, domain: &str) {
        if let Some(record) = self.lock().get_mut(id) {
            record.lock_domain = Some(domain.to_string());
        }
    }

    /// Apply `next` if it is a legal forward transition. Returns whether the
    /// record changed.
    pub fn transition(&self, id: &TaskId, next: TaskStatus, now: DateTime<Utc>) -> bool {
        let mut tasks = self.lock();
        let Some(record) = tasks.get_mut(id) else {
            return false;
        };
        if !record.status.may_become(&next) {
            tracing::warn!(task_id = %id, from = ?record.status, to = ?next, "Ignoring illegal task transition");
            return false;
        }
        record.status = next;
        record.updated_at = now;
        true
    }

    pub fn get(&self, id: &TaskId) -> Option<TaskRecord> {
        self.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, TaskRecord>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Drop expired terminal tasks, then the oldest terminal tasks until there is
/// room for one more record. Live tasks are never evicted.
fn prune(tasks: &mut HashMap<TaskId, TaskRecord>, retention: &Retention, now: DateTime<Utc>) {
    let ttl = chrono::Duration::from_std(retention.ttl).unwrap_or(chrono::Duration::MAX);
    tasks.retain(|_, r| !r.status.is_terminal() || now - r.updated_at < ttl);

    if tasks.len() < retention.max_tasks {
        return;
    }
    let mut terminal: Vec<(DateTime<Utc>, TaskId)> = tasks
        .values()
        .filter(|r| r.status.is_terminal())
        .map(|r| (r.updated_at, r.id))
        .collect();
    terminal.sort();
    let excess = tasks.len() + 1 - retention.max_tasks;
    for (_, id) in terminal.into_iter().take(excess) {
        tasks.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[test]
    fn new_task_is_pending() {
        let store = TaskStore::new(Retention::default());
        let id = store.insert_pending(t0());
        let record = store.get(&id).unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.created_at, t0());
    }

    #[test]
    fn transitions_only_move_forward() {
        let store = TaskStore::new(Retention::default());
        let id = store.insert_pending(t0());

        assert!(store.transition(&id, TaskStatus::Running, t0()));
        assert!(!store.transition(&id, TaskStatus::Pending, t0()));
        assert!(store.transition(&id, TaskStatus::Success { count: 3 }, t0() + secs(1)));
        assert!(!store.transition(&id, TaskStatus::Failed { reason: "late".into() }, t0()));

        let record = store.get(&id).unwrap();
        assert_eq!(record.status, TaskStatus::Success { count: 3 });
        assert_eq!(record.updated_at, t0() + secs(1));
    }

    #[test]
    fn pending_may_be_skipped_directly() {
        let store = TaskStore::new(Retention::default());
        let id = store.insert_pending(t0());
        assert!(store.transition(&id, TaskStatus::Skipped { reason: "busy".into() }, t0()));
    }

    #[test]
    fn unknown_id_is_none() {
        let store = TaskStore::new(Retention::default());
        assert!(store.get(&TaskId::new()).is_none());
        assert!(!store.transition(&TaskId::new(), TaskStatus::Running, t0()));
    }

    #[test]
    fn expired_terminal_tasks_are_pruned_but_live_ones_stay() {
        let store = TaskStore::new(Retention {
            ttl: Duration::from_secs(60),
            max_tasks: 100,
        });
        let done = store.insert_pending(t0());
        store.transition(&done, TaskStatus::Success { count: 0 }, t0());
        let running = store.insert_pending(t0());
        store.transition(&running, TaskStatus::Running, t0());

        store.insert_pending(t0() + secs(61));

        assert!(store.get(&done).is_none());
        assert!(store.get(&running).is_some());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn cap_evicts_oldest_terminal_first() {
        let store = TaskStore::new(Retention {
            ttl: Duration::from_secs(3600),
            max_tasks: 3,
        });
        let a = store.insert_pending(t0());
        store.transition(&a, TaskStatus::Failed { reason: "x".into() }, t0());
        let b = store.insert_pending(t0() + secs(1));
        store.transition(&b, TaskStatus::Success { count: 1 }, t0() + secs(1));
        let c = store.insert_pending(t0() + secs(2));

        let d = store.insert_pending(t0() + secs(3));

        assert_eq!(store.len(), 3);
        assert!(store.get(&a).is_none());
        for id in [b, c, d] {
            assert!(store.get(&id).is_some());
        }
    }

    #[test]
    fn status_serializes_with_tag() {
        let json = serde_json::to_value(TaskStatus::Success { count: 7 }).unwrap();
        assert_eq!(json, serde_json::json!({"status": "SUCCESS", "count": 7}));
        let json = serde_json::to_value(TaskStatus::Pending).unwrap();
        assert_eq!(json, serde_json::json!({"status": "PENDING"}));
    }

    #[test]
    fn task_id_round_trips_through_display() {
        let id = TaskId::new();
        assert_eq!(id.to_string().parse::<TaskId>().unwrap(), id);
        assert!("nope".parse::<TaskId>().is_err());
    }
}
