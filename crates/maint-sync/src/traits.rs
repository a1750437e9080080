use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{
    config::{SyncEvent, TopicConfig},
    engine::{CycleReport, SweepReport},
    error::SyncError,
    lock::LockTable,
    source::SourceRecord,
    watermark::WatermarkUpdate,
};

/// Hand a batch of events to the downstream bus.
///
/// Returns only once every event in the batch is acknowledged; the sync
/// engine advances the watermark after this resolves `Ok`.
pub trait EventPublisher: Send + Sync + Clone + 'static {
    fn publish_batch(
        &self,
        subject: &str,
        events: &[SyncEvent],
    ) -> impl Future<Output = Result<(), SyncError>> + Send;
}

/// The per-topic configuration table, including each topic's watermark.
pub trait TopicStore: Send + Sync + Clone + 'static {
    fn list_topics(&self) -> impl Future<Output = Result<Vec<TopicConfig>, SyncError>> + Send;

    fn get_topic(
        &self,
        topic: &str,
    ) -> impl Future<Output = Result<Option<TopicConfig>, SyncError>> + Send;

    /// Create or overwrite a row.
    fn put_topic(&self, config: &TopicConfig) -> impl Future<Output = Result<(), SyncError>> + Send;

    /// Conditionally move `last_sync_time` to `candidate`.
    ///
    /// Implementations must compare-and-set so a late writer holding an older
    /// value can never move the watermark backwards.
    fn advance_watermark(
        &self,
        topic: &str,
        candidate: DateTime<Utc>,
    ) -> impl Future<Output = Result<WatermarkUpdate, SyncError>> + Send;
}

/// Atomic add-if-absent over a TTL-bounded set of keys per domain.
pub trait DedupStore: Send + Sync + Clone + 'static {
    /// `true` on first sighting of `key` in `domain` within `ttl`.
    fn try_mark(
        &self,
        domain: &str,
        key: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, SyncError>> + Send;

    /// Whether `key` is currently marked in `domain`. Never marks.
    fn is_marked(&self, domain: &str, key: &str) -> impl Future<Output = Result<bool, SyncError>> + Send;

    /// Forget every key of `domain`.
    fn clear(&self, domain: &str) -> impl Future<Output = Result<(), SyncError>> + Send;
}

/// Upstream rows for a topic, at or after `since`.
pub trait RecordSource: Send + Sync + Clone + 'static {
    fn fetch(
        &self,
        topic: &TopicConfig,
        since: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<Vec<SourceRecord>, SyncError>> + Send;
}

/// What scheduled jobs and the control surface drive: one topic cycle or a
/// full sweep, plus read access to the topic table.
pub trait SyncRunner: Send + Sync + Clone + 'static {
    fn run_topic(&self, topic: &str) -> impl Future<Output = Result<CycleReport, SyncError>> + Send;

    fn sweep(&self, locks: &LockTable) -> impl Future<Output = Result<SweepReport, SyncError>> + Send;

    fn list_topics(&self) -> impl Future<Output = Result<Vec<TopicConfig>, SyncError>> + Send;

    fn get_topic(
        &self,
        topic: &str,
    ) -> impl Future<Output = Result<Option<TopicConfig>, SyncError>> + Send;

    fn clear_dedup(&self, domain: &str) -> impl Future<Output = Result<(), SyncError>> + Send;
}
