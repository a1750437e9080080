use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, kv};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::{
    config::{SyncEvent, TopicConfig},
    error::SyncError,
    kv::{dedup_bucket, get_or_create_dedup_bucket, load_topics, parse_topic, topic_key},
    nats::headers_with_trace_context,
    traits::{DedupStore, EventPublisher, TopicStore},
    watermark::{WatermarkUpdate, next_watermark},
};

const MSG_ID_HEADER: &str = "Nats-Msg-Id";

/// Attempts at the revision-checked watermark write before giving up.
const MAX_WATERMARK_ATTEMPTS: u32 = 5;

/// Publishes every event of the batch, then waits for all JetStream acks.
impl EventPublisher for jetstream::Context {
    async fn publish_batch(&self, subject: &str, events: &[SyncEvent]) -> Result<(), SyncError> {
        let mut acks = Vec::with_capacity(events.len());
        for event in events {
            let mut headers = headers_with_trace_context();
            headers.insert(MSG_ID_HEADER, event.msg_id().as_str());
            let payload = serde_json::to_vec(event)?;
            let ack = self
                .publish_with_headers(subject.to_string(), headers, Bytes::from(payload))
                .await
                .map_err(|e| SyncError::Publish(format!("{subject}: {e}")))?;
            acks.push(ack);
        }
        for ack in acks {
            let ack = ack
                .await
                .map_err(|e| SyncError::Publish(format!("{subject}: {e}")))?;
            if ack.duplicate {
                tracing::debug!(subject, seq = ack.sequence, "Event absorbed as duplicate");
            }
        }
        Ok(())
    }
}

/// Topic rows in the `sync_topics` bucket, watermarks in `sync_watermarks`.
///
/// A row's `last_sync_time` only seeds the watermark: once the topic has a
/// watermark entry, that entry is what readers see.
#[derive(Clone)]
pub struct KvTopicStore {
    topics: kv::Store,
    watermarks: kv::Store,
}

impl KvTopicStore {
    pub fn new(topics: kv::Store, watermarks: kv::Store) -> Self {
        Self { topics, watermarks }
    }

    pub fn store(&self) -> &kv::Store {
        &self.topics
    }

    async fn watermark_entry(&self, topic: &str) -> Result<Option<kv::Entry>, SyncError> {
        Ok(self
            .watermarks
            .entry(topic)
            .await
            .map_err(|e| SyncError::Kv(e.to_string()))?
            .filter(|e| e.operation == kv::Operation::Put))
    }

    async fn with_watermark(&self, mut row: TopicConfig) -> Result<TopicConfig, SyncError> {
        if let Some(entry) = self.watermark_entry(&row.topic).await? {
            row.last_sync_time = Some(serde_json::from_slice(&entry.value)?);
        }
        Ok(row)
    }
}

impl TopicStore for KvTopicStore {
    async fn list_topics(&self) -> Result<Vec<TopicConfig>, SyncError> {
        let rows = load_topics(&self.topics).await?;
        let mut topics = Vec::with_capacity(rows.len());
        for row in rows {
            topics.push(self.with_watermark(row).await?);
        }
        Ok(topics)
    }

    async fn get_topic(&self, topic: &str) -> Result<Option<TopicConfig>, SyncError> {
        let key = topic_key(topic);
        let raw = self
            .topics
            .get(&key)
            .await
            .map_err(|e| SyncError::Kv(e.to_string()))?;
        match raw.and_then(|raw| parse_topic(&key, &raw)) {
            Some(row) => Ok(Some(self.with_watermark(row).await?)),
            None => Ok(None),
        }
    }

    async fn put_topic(&self, config: &TopicConfig) -> Result<(), SyncError> {
        config.validate()?;
        let payload = serde_json::to_vec(config)?;
        self.topics
            .put(topic_key(&config.topic), Bytes::from(payload))
            .await
            .map_err(|e| SyncError::Kv(e.to_string()))?;
        Ok(())
    }

    /// Read-modify-write on the watermark entry, guarded by its revision. The
    /// first write uses `create`, so two first writers cannot both win. On a
    /// lost race the loop re-reads and re-compares.
    async fn advance_watermark(
        &self,
        topic: &str,
        candidate: DateTime<Utc>,
    ) -> Result<WatermarkUpdate, SyncError> {
        let seed = self
            .topics
            .get(topic_key(topic))
            .await
            .map_err(|e| SyncError::Kv(e.to_string()))?
            .and_then(|raw| parse_topic(&topic_key(topic), &raw))
            .ok_or_else(|| SyncError::TopicNotFound(topic.to_string()))?
            .last_sync_time;

        for attempt in 1..=MAX_WATERMARK_ATTEMPTS {
            let entry = self.watermark_entry(topic).await?;
            let from = match &entry {
                Some(entry) => Some(serde_json::from_slice(&entry.value)?),
                None => seed,
            };
            let Some(to) = next_watermark(from, candidate) else {
                return Ok(WatermarkUpdate::Unchanged { current: from });
            };
            let payload = Bytes::from(serde_json::to_vec(&to)?);

            let lost_race = match entry {
                Some(entry) => match self.watermarks.update(topic, payload, entry.revision).await {
                    Ok(_) => false,
                    Err(e) if e.kind() == kv::UpdateErrorKind::WrongLastRevision => true,
                    Err(e) => return Err(SyncError::Kv(e.to_string())),
                },
                None => match self.watermarks.create(topic, payload).await {
                    Ok(_) => false,
                    Err(e) if e.kind() == kv::CreateErrorKind::AlreadyExists => true,
                    Err(e) => return Err(SyncError::Kv(e.to_string())),
                },
            };
            if !lost_race {
                return Ok(WatermarkUpdate::Advanced { from, to });
            }
            tracing::debug!(topic, attempt, "Watermark changed underneath, retrying");
        }
        Err(SyncError::WatermarkContention {
            topic: topic.to_string(),
            attempts: MAX_WATERMARK_ATTEMPTS,
        })
    }
}

/// One KV bucket per dedup domain. `create` only succeeds for an absent key,
/// which makes it the atomic add-if-absent; the bucket `max_age` expires keys.
///
/// A bucket's TTL is fixed when it is created.
#[derive(Clone)]
pub struct KvDedupStore {
    js: jetstream::Context,
    buckets: Arc<Mutex<HashMap<String, kv::Store>>>,
}

impl KvDedupStore {
    pub fn new(js: jetstream::Context) -> Self {
        Self {
            js,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn bucket(&self, domain: &str, ttl: Duration) -> Result<kv::Store, SyncError> {
        let mut buckets = self.buckets.lock().await;
        if let Some(store) = buckets.get(domain) {
            return Ok(store.clone());
        }
        let store = get_or_create_dedup_bucket(&self.js, domain, ttl).await?;
        buckets.insert(domain.to_string(), store.clone());
        Ok(store)
    }
}

impl DedupStore for KvDedupStore {
    async fn try_mark(&self, domain: &str, key: &str, ttl: Duration) -> Result<bool, SyncError> {
        let store = self.bucket(domain, ttl).await?;
        match store.create(escape_key(key), Bytes::from_static(b"1")).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == kv::CreateErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(SyncError::Kv(e.to_string())),
        }
    }

    /// A domain whose bucket was never created has no marked keys.
    async fn is_marked(&self, domain: &str, key: &str) -> Result<bool, SyncError> {
        let cached = self.buckets.lock().await.get(domain).cloned();
        let store = match cached {
            Some(store) => store,
            None => match self.js.get_key_value(dedup_bucket(domain)).await {
                Ok(store) => store,
                Err(_) => return Ok(false),
            },
        };
        let value = store
            .get(escape_key(key))
            .await
            .map_err(|e| SyncError::Kv(e.to_string()))?;
        Ok(value.is_some())
    }

    async fn clear(&self, domain: &str) -> Result<(), SyncError> {
        self.buckets.lock().await.remove(domain);
        let bucket = dedup_bucket(domain);
        if self.js.get_key_value(&bucket).await.is_err() {
            return Ok(());
        }
        self.js
            .delete_key_value(&bucket)
            .await
            .map_err(|e| SyncError::Kv(e.to_string()))?;
        tracing::info!(domain, bucket = %bucket, "Dedup domain cleared");
        Ok(())
    }
}

/// Keeps `[-/_a-zA-Z0-9]`; every other byte becomes `=XX`, so distinct
/// business keys map to distinct KV keys.
fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'/') {
            out.push(char::from(b));
        } else {
            out.push_str(&format!("={b:02X}"));
        }
    }
    if out.is_empty() {
        out.push('=');
    }
    out
}
