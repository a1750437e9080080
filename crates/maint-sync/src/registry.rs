use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::{
    scheduler::{Job, Scheduler},
    trigger::{Trigger, TriggerInfo},
};

/// Declarative schedule entry; one trigger is registered per cron expression.
#[derive(Clone)]
pub struct ScheduleEntry {
    pub id: String,
    pub cron_expressions: Vec<String>,
    pub job: Job,
    pub enabled: bool,
}

impl std::fmt::Debug for ScheduleEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleEntry")
            .field("id", &self.id)
            .field("cron_expressions", &self.cron_expressions)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReloadSummary {
    pub cancelled: usize,
    pub registered: usize,
    pub failed: Vec<InvalidExpression>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidExpression {
    pub entry_id: String,
    pub expr: String,
    pub reason: String,
}

/// Owns the live trigger set and replaces it atomically on reload.
pub struct ScheduleRegistry<S> {
    scheduler: Arc<S>,
    reload_lock: Mutex<()>,
}

impl<S: Scheduler> ScheduleRegistry<S> {
    pub fn new(scheduler: Arc<S>) -> Self {
        Self {
            scheduler,
            reload_lock: Mutex::new(()),
        }
    }

    /// Cancel every trigger, then register the triggers derived from `entries`.
    ///
    /// Malformed expressions are logged and skipped; they never prevent the
    /// rest of the set from being installed. Concurrent reloads run one after
    /// the other.
    pub async fn reload(&self, entries: Vec<ScheduleEntry>) -> ReloadSummary {
        let _guard = self.reload_lock.lock().await;

        let mut summary = ReloadSummary::default();
        let mut parsed: Vec<(Trigger, Job)> = Vec::new();

        for entry in entries.iter().filter(|e| e.enabled) {
            for (index, expr) in entry.cron_expressions.iter().enumerate() {
                let expr = expr.trim();
                if expr.is_empty() {
                    continue;
                }
                match Trigger::parse(format!("{}#{index}", entry.id), expr) {
                    Ok(trigger) => parsed.push((trigger, Arc::clone(&entry.job))),
                    Err(e) => {
                        tracing::error!(entry_id = %entry.id, expr, error = %e, "Skipping invalid cron expression");
                        summary.failed.push(InvalidExpression {
                            entry_id: entry.id.clone(),
                            expr: expr.to_string(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        summary.cancelled = self.scheduler.cancel_all();
        for (trigger, job) in parsed {
            tracing::info!(trigger_id = %trigger.id(), expr = %trigger.expr(), "Trigger registered");
            self.scheduler.register(trigger, job);
            summary.registered += 1;
        }

        tracing::info!(
            registered = summary.registered,
            cancelled = summary.cancelled,
            failed = summary.failed.len(),
            "Schedule reloaded"
        );
        summary
    }

    pub fn live_triggers(&self) -> Vec<TriggerInfo> {
        self.scheduler.live_triggers()
    }
}
