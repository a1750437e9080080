use std::time::Duration;

use async_nats::jetstream::{self, kv, stream};
use futures::StreamExt;

use crate::{config::TopicConfig, error::SyncError};

pub const TOPICS_BUCKET: &str = "sync_topics";
pub const TOPICS_KEY_PREFIX: &str = "topics.";
pub const TOPICS_WATCH_PATTERN: &str = "topics.*";
pub const DEDUP_BUCKET_PREFIX: &str = "dedup_";
/// Watermarks live apart from the topic rows so advancing one does not
/// show up on the topic watch. Key = topic name.
pub const WATERMARKS_BUCKET: &str = "sync_watermarks";

/// JetStream drops a re-published `Nats-Msg-Id` seen within this window.
pub const DUPLICATE_WINDOW: Duration = Duration::from_secs(120);

pub fn topic_key(topic: &str) -> String {
    format!("{TOPICS_KEY_PREFIX}{topic}")
}

/// Bucket names only allow `[A-Za-z0-9_-]`.
pub fn dedup_bucket(domain: &str) -> String {
    let sanitized: String = domain
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("{DEDUP_BUCKET_PREFIX}{sanitized}")
}

pub async fn get_or_create_topics_bucket(js: &jetstream::Context) -> Result<kv::Store, SyncError> {
    get_or_create(
        js,
        kv::Config {
            bucket: TOPICS_BUCKET.to_string(),
            history: 5,
            ..Default::default()
        },
    )
    .await
}

pub async fn get_or_create_watermarks_bucket(js: &jetstream::Context) -> Result<kv::Store, SyncError> {
    get_or_create(
        js,
        kv::Config {
            bucket: WATERMARKS_BUCKET.to_string(),
            history: 5,
            ..Default::default()
        },
    )
    .await
}

/// Entries expire `ttl` after their last write; that expiry is the dedup TTL.
pub async fn get_or_create_dedup_bucket(
    js: &jetstream::Context,
    domain: &str,
    ttl: Duration,
) -> Result<kv::Store, SyncError> {
    get_or_create(
        js,
        kv::Config {
            bucket: dedup_bucket(domain),
            history: 1,
            max_age: ttl,
            ..Default::default()
        },
    )
    .await
}

/// Ensure the stream capturing every `<prefix>.>` event subject exists.
pub async fn get_or_create_events_stream(
    js: &jetstream::Context,
    name: &str,
    subject_prefix: &str,
) -> Result<(), SyncError> {
    let config = stream::Config {
        name: name.to_string(),
        subjects: vec![format!("{subject_prefix}.>")],
        duplicate_window: DUPLICATE_WINDOW,
        ..Default::default()
    };
    match js.create_stream(config).await {
        Ok(_) => Ok(()),
        Err(_) => js
            .get_stream(name)
            .await
            .map(|_| ())
            .map_err(|e| SyncError::Kv(e.to_string())),
    }
}

async fn get_or_create(js: &jetstream::Context, config: kv::Config) -> Result<kv::Store, SyncError> {
    let name = config.bucket.clone();
    match js.create_key_value(config).await {
        Ok(store) => Ok(store),
        Err(_) => js
            .get_key_value(&name)
            .await
            .map_err(|e| SyncError::Kv(e.to_string())),
    }
}

/// Watch every topic row. The watcher first replays the current value of
/// each key, then streams later changes.
pub async fn watch_topics(store: &kv::Store) -> Result<kv::Watch, SyncError> {
    store
        .watch_with_history(TOPICS_WATCH_PATTERN)
        .await
        .map_err(|e| SyncError::Kv(e.to_string()))
}

/// Read every row under `topics.*`. Rows that fail to parse or validate are
/// logged and left out.
pub async fn load_topics(store: &kv::Store) -> Result<Vec<TopicConfig>, SyncError> {
    let mut keys = store
        .keys()
        .await
        .map_err(|e| SyncError::Kv(e.to_string()))?;
    let mut names = Vec::new();
    while let Some(key) = keys.next().await {
        let key = key.map_err(|e| SyncError::Kv(e.to_string()))?;
        if key.starts_with(TOPICS_KEY_PREFIX) {
            names.push(key);
        }
    }

    let mut topics = Vec::with_capacity(names.len());
    for key in names {
        let Some(raw) = store
            .get(&key)
            .await
            .map_err(|e| SyncError::Kv(e.to_string()))?
        else {
            continue;
        };
        if let Some(topic) = parse_topic(&key, &raw) {
            topics.push(topic);
        }
    }
    topics.sort_by(|a, b| a.topic.cmp(&b.topic));
    Ok(topics)
}

pub(crate) fn parse_topic(key: &str, raw: &[u8]) -> Option<TopicConfig> {
    let topic: TopicConfig = match serde_json::from_slice(raw) {
        Ok(topic) => topic,
        Err(e) => {
            tracing::warn!(key, error = %e, "Failed to deserialize topic row");
            return None;
        }
    };
    if let Err(e) = topic.validate() {
        tracing::warn!(key, error = %e, "Invalid topic row");
        return None;
    }
    if topic_key(&topic.topic) != key {
        tracing::warn!(key, topic = %topic.topic, "Topic row stored under the wrong key");
        return None;
    }
    Some(topic)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_bucket_names_are_sanitized() {
        assert_eq!(dedup_bucket("equipment"), "dedup_equipment");
        assert_eq!(dedup_bucket("rotational-maint"), "dedup_rotational-maint");
        assert_eq!(dedup_bucket("a.b c"), "dedup_a_b_c");
    }

    #[test]
    fn parse_topic_checks_key_and_content() {
        let raw = br#"{"topic":"equipment","cron":"0 0 1 * * ?"}"#;
        assert!(parse_topic("topics.equipment", raw).is_some());
        assert!(parse_topic("topics.other", raw).is_none());
        assert!(parse_topic("topics.equipment", b"not json").is_none());
        assert!(parse_topic("topics.a.b", br#"{"topic":"a.b"}"#).is_none());
        assert!(parse_topic("topics.sweep", br#"{"topic":"sweep"}"#).is_none());
        assert!(parse_topic("topics.x", br#"{"topic":"x","subject":"*"}"#).is_none());
    }
}
