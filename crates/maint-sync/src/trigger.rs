use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::SyncError;

/// A parsed cron expression bound to a schedule entry.
///
/// Expressions use the 6/7-field Quartz layout
/// (`sec min hour day-of-month month day-of-week [year]`). Quartz's `?`
/// placeholder is accepted and treated as `*`.
#[derive(Debug, Clone)]
pub struct Trigger {
    id: String,
    expr: String,
    schedule: cron::Schedule,
}

impl Trigger {
    pub fn parse(id: impl Into<String>, expr: &str) -> Result<Self, SyncError> {
        let schedule = cron::Schedule::from_str(&normalize(expr)).map_err(|e| {
            SyncError::InvalidCronExpression {
                expr: expr.to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self {
            id: id.into(),
            expr: expr.to_string(),
            schedule,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// First firing strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

/// Snapshot of a live trigger, as reported by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerInfo {
    pub id: String,
    pub expr: String,
    pub next_fire: Option<DateTime<Utc>>,
}

fn normalize(expr: &str) -> String {
    expr.split_whitespace()
        .map(|field| if field == "?" { "*" } else { field })
        .collect::<Vec<_>>()
        .join(" ")
}
