//! In-memory doubles for running the sync engine without NATS or a partner API.
//!
//! Enabled with the `test-support` feature:
//!
//! ```toml
//! [dev-dependencies]
//! maint-sync = { path = "...", features = ["test-support"] }
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{
    config::{SyncEvent, TopicConfig},
    error::SyncError,
    source::SourceRecord,
    traits::{EventPublisher, RecordSource, TopicStore},
    watermark::{WatermarkUpdate, next_watermark},
};

// ── MockTopicStore ────────────────────────────────────────────────────────────

/// Topic table held in memory. Watermark updates are compare-and-set under
/// one mutex, like the KV revision check.
#[derive(Clone, Default)]
pub struct MockTopicStore {
    rows: Arc<Mutex<BTreeMap<String, TopicConfig>>>,
    fail_list: Arc<Mutex<bool>>,
}

impl MockTopicStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_topics(topics: impl IntoIterator<Item = TopicConfig>) -> Self {
        let store = Self::new();
        for t in topics {
            store.insert(t);
        }
        store
    }

    pub fn insert(&self, topic: TopicConfig) {
        self.rows.lock().unwrap().insert(topic.topic.clone(), topic);
    }

    pub fn watermark(&self, topic: &str) -> Option<DateTime<Utc>> {
        self.rows
            .lock()
            .unwrap()
            .get(topic)
            .and_then(|t| t.last_sync_time)
    }

    /// Make `list_topics` fail until cleared.
    pub fn fail_list(&self, fail: bool) {
        *self.fail_list.lock().unwrap() = fail;
    }
}

impl TopicStore for MockTopicStore {
    async fn list_topics(&self) -> Result<Vec<TopicConfig>, SyncError> {
        if *self.fail_list.lock().unwrap() {
            return Err(SyncError::Kv("mock: topic table unavailable".to_string()));
        }
        Ok(self.rows.lock().unwrap().values().cloned().collect())
    }

    async fn get_topic(&self, topic: &str) -> Result<Option<TopicConfig>, SyncError> {
        Ok(self.rows.lock().unwrap().get(topic).cloned())
    }

    async fn put_topic(&self, config: &TopicConfig) -> Result<(), SyncError> {
        config.validate()?;
        self.insert(config.clone());
        Ok(())
    }

    async fn advance_watermark(
        &self,
        topic: &str,
        candidate: DateTime<Utc>,
    ) -> Result<WatermarkUpdate, SyncError> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .get_mut(topic)
            .ok_or_else(|| SyncError::TopicNotFound(topic.to_string()))?;
        let from = row.last_sync_time;
        Ok(match next_watermark(from, candidate) {
            Some(to) => {
                row.last_sync_time = Some(to);
                WatermarkUpdate::Advanced { from, to }
            }
            None => WatermarkUpdate::Unchanged { current: from },
        })
    }
}

// ── MockEventPublisher ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PublishedBatch {
    pub subject: String,
    pub events: Vec<SyncEvent>,
}

/// Records every batch; can be told to reject batches for given subjects.
#[derive(Clone, Default)]
pub struct MockEventPublisher {
    batches: Arc<Mutex<Vec<PublishedBatch>>>,
    failing: Arc<Mutex<HashSet<String>>>,
}

impl MockEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<PublishedBatch> {
        self.batches.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<SyncEvent> {
        self.batches()
            .into_iter()
            .flat_map(|b| b.events)
            .collect()
    }

    pub fn fail_subject(&self, subject: impl Into<String>) {
        self.failing.lock().unwrap().insert(subject.into());
    }

    /// Accept batches for `subject` again.
    pub fn recover_subject(&self, subject: &str) {
        self.failing.lock().unwrap().remove(subject);
    }
}

impl EventPublisher for MockEventPublisher {
    async fn publish_batch(&self, subject: &str, events: &[SyncEvent]) -> Result<(), SyncError> {
        if self.failing.lock().unwrap().contains(subject) {
            return Err(SyncError::Publish(format!("mock: {subject} rejected")));
        }
        self.batches.lock().unwrap().push(PublishedBatch {
            subject: subject.to_string(),
            events: events.to_vec(),
        });
        Ok(())
    }
}

// ── MockRecordSource ──────────────────────────────────────────────────────────

/// Canned rows per topic. Topics without rows return an empty batch.
#[derive(Clone, Default)]
pub struct MockRecordSource {
    rows: Arc<Mutex<HashMap<String, Result<Vec<SourceRecord>, String>>>>,
    calls: Arc<Mutex<Vec<(String, Option<DateTime<Utc>>)>>>,
    delay: Arc<Mutex<Option<Duration>>>,
}

impl MockRecordSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_rows(&self, topic: &str, rows: Vec<SourceRecord>) {
        self.rows.lock().unwrap().insert(topic.to_string(), Ok(rows));
    }

    pub fn set_failure(&self, topic: &str, reason: &str) {
        self.rows
            .lock()
            .unwrap()
            .insert(topic.to_string(), Err(reason.to_string()));
    }

    /// Every fetch sleeps for `delay` before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// `(topic, since)` of every fetch, in call order.
    pub fn calls(&self) -> Vec<(String, Option<DateTime<Utc>>)> {
        self.calls.lock().unwrap().clone()
    }
}

impl RecordSource for MockRecordSource {
    async fn fetch(
        &self,
        topic: &TopicConfig,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<SourceRecord>, SyncError> {
        self.calls
            .lock()
            .unwrap()
            .push((topic.topic.clone(), since));
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.rows.lock().unwrap().get(&topic.topic) {
            Some(Ok(rows)) => Ok(rows
                .iter()
                .filter(|r| since.is_none_or(|s| r.synced_at >= s))
                .cloned()
                .collect()),
            Some(Err(reason)) => Err(SyncError::Source {
                topic: topic.topic.clone(),
                reason: reason.clone(),
            }),
            None => Ok(Vec::new()),
        }
    }
}
