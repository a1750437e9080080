use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use maint_std::time::GetNow;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;

use crate::trigger::{Trigger, TriggerInfo};

/// How often the timer task evaluates triggers. Cron resolution is one second.
pub const TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Work run when a trigger fires.
pub type Job = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`Job`].
pub fn job<F, Fut>(f: F) -> Job
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// Runtime trigger table.
pub trait Scheduler: Send + Sync + 'static {
    fn register(&self, trigger: Trigger, job: Job);

    /// Drop every trigger. Jobs already running are left alone; firings that
    /// were queued but have not started are discarded. Returns how many
    /// triggers were cancelled.
    fn cancel_all(&self) -> usize;

    fn live_triggers(&self) -> Vec<TriggerInfo>;
}

struct Slot {
    trigger: Trigger,
    job: Job,
    next_fire: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Table {
    /// Bumped by `cancel_all`; queued firings from an older generation never run.
    generation: u64,
    slots: Vec<Slot>,
}

struct Firing {
    generation: u64,
    trigger_id: String,
    job: Job,
}

/// Single timer task plus a bounded worker pool.
///
/// The timer only evaluates cron schedules and enqueues firings; it never
/// awaits a job. Workers pick firings off the queue, bounded by a semaphore.
pub struct TokioScheduler<C> {
    table: Mutex<Table>,
    queue_tx: mpsc::UnboundedSender<Firing>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<Firing>>>,
    clock: C,
    workers: usize,
}

/// Handles of the timer and worker-pool tasks started by [`TokioScheduler::start`].
pub struct SchedulerHandle {
    timer: JoinHandle<()>,
    pool: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn abort(&self) {
        self.timer.abort();
        self.pool.abort();
    }
}

impl<C> TokioScheduler<C>
where
    C: GetNow + Send + Sync + 'static,
{
    pub fn new(clock: C, workers: usize) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            table: Mutex::new(Table::default()),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            clock,
            workers: workers.max(1),
        })
    }

    /// Enqueue every trigger due at `now` and schedule its next firing.
    /// Returns the number of firings enqueued.
    pub fn fire_due(&self, now: DateTime<Utc>) -> usize {
        let mut table = lock(&self.table);
        let generation = table.generation;
        let mut fired = 0;
        for slot in table.slots.iter_mut() {
            if !slot.next_fire.is_some_and(|t| now >= t) {
                continue;
            }
            let firing = Firing {
                generation,
                trigger_id: slot.trigger.id().to_string(),
                job: Arc::clone(&slot.job),
            };
            if self.queue_tx.send(firing).is_err() {
                tracing::warn!(trigger_id = %slot.trigger.id(), "Worker pool gone, dropping firing");
            } else {
                fired += 1;
            }
            slot.next_fire = slot.trigger.next_after(now);
        }
        fired
    }

    /// Spawn the timer and worker-pool tasks. Calling it twice only starts the
    /// timer again; the queue has a single consumer.
    pub fn start(self: &Arc<Self>, tick: Duration) -> SchedulerHandle {
        let timer = {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(tick);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    interval.tick().await;
                    let fired = this.fire_due(this.clock.now());
                    if fired > 0 {
                        tracing::debug!(fired, "Triggers fired");
                    }
                }
            })
        };

        let queue = lock(&self.queue_rx).take();
        let pool = {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let Some(mut queue) = queue else {
                    tracing::warn!("Scheduler worker pool already running");
                    return;
                };
                let permits = Arc::new(Semaphore::new(this.workers));
                while let Some(firing) = queue.recv().await {
                    let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                        break;
                    };
                    if !this.is_current(firing.generation) {
                        tracing::debug!(
                            trigger_id = %firing.trigger_id,
                            "Discarding firing from a cancelled trigger set"
                        );
                        continue;
                    }
                    tokio::spawn(async move {
                        (firing.job)().await;
                        drop(permit);
                    });
                }
            })
        };

        SchedulerHandle { timer, pool }
    }

    fn is_current(&self, generation: u64) -> bool {
        lock(&self.table).generation == generation
    }
}

impl<C> Scheduler for TokioScheduler<C>
where
    C: GetNow + Send + Sync + 'static,
{
    fn register(&self, trigger: Trigger, job: Job) {
        let next_fire = trigger.next_after(self.clock.now());
        lock(&self.table).slots.push(Slot {
            trigger,
            job,
            next_fire,
        });
    }

    fn cancel_all(&self) -> usize {
        let mut table = lock(&self.table);
        table.generation += 1;
        let cancelled = table.slots.len();
        table.slots.clear();
        cancelled
    }

    fn live_triggers(&self) -> Vec<TriggerInfo> {
        lock(&self.table)
            .slots
            .iter()
            .map(|slot| TriggerInfo {
                id: slot.trigger.id().to_string(),
                expr: slot.trigger.expr().to_string(),
                next_fire: slot.next_fire,
            })
            .collect()
    }
}

/// A poisoned table only means a panic elsewhere while holding the lock; the
/// data is still a consistent trigger list.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
