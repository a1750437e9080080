//! Watermark-driven incremental sync.
//!
//! One cycle for one topic:
//!
//! 1. load the topic row; disabled rows do nothing
//! 2. fetch rows at or after `last_sync_time`, dropping keys the dedup guard
//!    has already seen
//! 3. transform each row into a [`SyncEvent`]
//! 4. publish the batch and wait for acknowledgement, then mark the published
//!    keys in the dedup guard
//! 5. compare-and-set the watermark to the newest row seen
//!
//! Any failure in 2 to 4 ends the cycle with the watermark untouched, so the
//! next cycle replays the same window. Keys are only marked once their events
//! are acknowledged, so a replayed window is not swallowed by the guard.

use std::time::Duration;

use chrono::{DateTime, Utc};
use maint_std::time::GetNow;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    config::{SyncEvent, TopicConfig},
    dedup::{filter_unseen, mark_all},
    error::SyncError,
    lock::LockTable,
    task::Outcome,
    traits::{DedupStore, EventPublisher, RecordSource, SyncRunner, TopicStore},
    transform::Transforms,
    watermark::WatermarkUpdate,
};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub subject_prefix: String,
    pub dedup_ttl: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            subject_prefix: "maint".to_string(),
            dedup_ttl: Duration::from_secs(86_400),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CycleReport {
    Disabled {
        topic: String,
    },
    Synced {
        topic: String,
        fetched: usize,
        published: usize,
        watermark: WatermarkUpdate,
    },
}

impl CycleReport {
    pub fn published(&self) -> usize {
        match self {
            Self::Disabled { .. } => 0,
            Self::Synced { published, .. } => *published,
        }
    }
}

impl From<CycleReport> for Outcome {
    fn from(report: CycleReport) -> Self {
        match report {
            CycleReport::Disabled { topic } => Outcome::Skipped(format!("topic '{topic}' is disabled")),
            CycleReport::Synced { published, .. } => Outcome::Success(published),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopicFailure {
    pub topic: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub cycles: Vec<CycleReport>,
    pub failures: Vec<TopicFailure>,
    /// Topics whose own sync was running when the sweep reached them.
    pub skipped: Vec<String>,
}

impl From<SweepReport> for Outcome {
    /// A sweep with any failed topic is reported as failed, listing the topics.
    fn from(report: SweepReport) -> Self {
        if report.failures.is_empty() {
            return Outcome::Success(report.cycles.iter().map(CycleReport::published).sum());
        }
        let topics: Vec<&str> = report.failures.iter().map(|f| f.topic.as_str()).collect();
        Outcome::Failed(format!(
            "{} of {} topics failed: {}",
            report.failures.len(),
            report.failures.len() + report.cycles.len() + report.skipped.len(),
            topics.join(", ")
        ))
    }
}

#[derive(Clone)]
pub struct WatermarkSyncEngine<T, S, P, D, C> {
    topics: T,
    source: S,
    publisher: P,
    dedup: D,
    clock: C,
    transforms: Transforms,
    settings: EngineSettings,
}

impl<T, S, P, D, C> WatermarkSyncEngine<T, S, P, D, C>
where
    T: TopicStore,
    S: RecordSource,
    P: EventPublisher,
    D: DedupStore,
    C: GetNow + Clone + Send + Sync + 'static,
{
    pub fn new(topics: T, source: S, publisher: P, dedup: D, clock: C) -> Self {
        Self {
            topics,
            source,
            publisher,
            dedup,
            clock,
            transforms: Transforms::new(),
            settings: EngineSettings::default(),
        }
    }

    pub fn with_transforms(mut self, transforms: Transforms) -> Self {
        self.transforms = transforms;
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Run one cycle for `topic`.
    pub async fn run_topic(&self, topic: &str) -> Result<CycleReport, SyncError> {
        let row = self
            .topics
            .get_topic(topic)
            .await?
            .ok_or_else(|| SyncError::TopicNotFound(topic.to_string()))?;
        if !row.enabled {
            tracing::debug!(topic, "Topic disabled, nothing to sync");
            return Ok(CycleReport::Disabled {
                topic: topic.to_string(),
            });
        }

        let since = row.last_sync_time;
        let records = self.source.fetch(&row, since).await?;
        let fetched = records.len();
        let observed_max: Option<DateTime<Utc>> = records.iter().map(|r| r.synced_at).max();

        let records = if row.dedup {
            filter_unseen(&self.dedup, topic, records, |r| r.key.as_str()).await?
        } else {
            records
        };

        let sync_id = Uuid::new_v4().to_string();
        let events: Vec<SyncEvent> = records
            .iter()
            .map(|record| SyncEvent {
                topic: topic.to_string(),
                key: record.key.clone(),
                synced_at: record.synced_at,
                sync_id: sync_id.clone(),
                data: self.transforms.apply(topic, record),
            })
            .collect();

        if !events.is_empty() {
            let subject = row.subject(&self.settings.subject_prefix);
            self.publisher.publish_batch(&subject, &events).await?;
            if row.dedup {
                mark_all(
                    &self.dedup,
                    topic,
                    self.settings.dedup_ttl,
                    events.iter().map(|e| e.key.as_str()).collect::<Vec<_>>(),
                )
                .await?;
            }
        }

        let candidate = match observed_max {
            Some(max) => Some(max),
            None if row.advance_on_empty => Some(self.clock.now()),
            None => None,
        };
        let watermark = match candidate {
            Some(candidate) => self.topics.advance_watermark(topic, candidate).await?,
            None => WatermarkUpdate::Unchanged { current: since },
        };

        tracing::info!(
            topic,
            sync_id = %sync_id,
            fetched,
            published = events.len(),
            watermark = ?watermark.current(),
            advanced = watermark.advanced(),
            "Sync cycle complete"
        );
        Ok(CycleReport::Synced {
            topic: topic.to_string(),
            fetched,
            published: events.len(),
            watermark,
        })
    }

    /// Run every enabled topic once. A failing topic is logged and recorded;
    /// the remaining topics still run.
    ///
    /// Each topic runs holding its own domain in `locks`, the same table the
    /// dispatcher uses for single-topic syncs. A topic whose domain is busy is
    /// recorded as skipped.
    pub async fn sweep(&self, locks: &LockTable) -> Result<SweepReport, SyncError> {
        let rows = self.topics.list_topics().await?;
        let mut report = SweepReport::default();
        for row in rows.into_iter().filter(|r| r.enabled) {
            let Some(_guard) = locks.try_acquire(&row.topic) else {
                tracing::info!(topic = %row.topic, "Topic sync already running, sweep skips it");
                report.skipped.push(row.topic);
                continue;
            };
            match self.run_topic(&row.topic).await {
                Ok(cycle) => report.cycles.push(cycle),
                Err(e) => {
                    tracing::error!(topic = %row.topic, error = %e, "Topic sync failed");
                    report.failures.push(TopicFailure {
                        topic: row.topic,
                        reason: e.to_string(),
                    });
                }
            }
        }
        tracing::info!(
            synced = report.cycles.len(),
            failed = report.failures.len(),
            skipped = report.skipped.len(),
            "Sweep complete"
        );
        Ok(report)
    }
}

impl<T, S, P, D, C> SyncRunner for WatermarkSyncEngine<T, S, P, D, C>
where
    T: TopicStore,
    S: RecordSource,
    P: EventPublisher,
    D: DedupStore,
    C: GetNow + Clone + Send + Sync + 'static,
{
    async fn run_topic(&self, topic: &str) -> Result<CycleReport, SyncError> {
        WatermarkSyncEngine::run_topic(self, topic).await
    }

    async fn sweep(&self, locks: &LockTable) -> Result<SweepReport, SyncError> {
        WatermarkSyncEngine::sweep(self, locks).await
    }

    async fn list_topics(&self) -> Result<Vec<TopicConfig>, SyncError> {
        self.topics.list_topics().await
    }

    async fn get_topic(&self, topic: &str) -> Result<Option<TopicConfig>, SyncError> {
        self.topics.get_topic(topic).await
    }

    async fn clear_dedup(&self, domain: &str) -> Result<(), SyncError> {
        self.dedup.clear(domain).await
    }
}
