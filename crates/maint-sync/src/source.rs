use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

use crate::{config::TopicConfig, error::SyncError, traits::RecordSource};

/// Query parameter carrying the watermark on every partner request.
pub const SINCE_PARAM: &str = "lastSyncDateTime";

/// Wire format of [`SINCE_PARAM`] and of naive timestamps in responses.
pub const SINCE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One upstream row, keyed and timestamped by the topic's `key_field` and
/// `sync_field`.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub key: String,
    pub synced_at: DateTime<Utc>,
    pub body: Value,
}

impl SourceRecord {
    /// Pull key and sync timestamp out of a JSON row.
    pub fn from_row(topic: &TopicConfig, body: Value) -> Result<Self, String> {
        let key = match body.get(&topic.key_field) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(format!("missing or empty '{}'", topic.key_field)),
        };
        let synced_at = body
            .get(&topic.sync_field)
            .and_then(parse_timestamp)
            .ok_or_else(|| format!("missing or unreadable '{}'", topic.sync_field))?;
        Ok(Self {
            key,
            synced_at,
            body,
        })
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS` (read as UTC) and epoch millis.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(s, SINCE_FORMAT)
                    .ok()
                    .map(|naive| Utc.from_utc_datetime(&naive))
            }),
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

/// Partner REST endpoint: `GET <api_url>?<params>&lastSyncDateTime=...`
/// returning a JSON array, or an object with the array under `data`.
#[derive(Clone)]
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(timeout: Duration) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

impl RecordSource for HttpSource {
    async fn fetch(
        &self,
        topic: &TopicConfig,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<SourceRecord>, SyncError> {
        let source_error = |reason: String| SyncError::Source {
            topic: topic.topic.clone(),
            reason,
        };
        let url = topic
            .api_url
            .as_deref()
            .ok_or_else(|| source_error("no api_url configured".to_string()))?;

        let mut query: Vec<(String, String)> = topic
            .params
            .as_object()
            .into_iter()
            .flatten()
            .map(|(k, v)| {
                let v = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), v)
            })
            .collect();
        if let Some(since) = since {
            query.push((SINCE_PARAM.to_string(), since.format(SINCE_FORMAT).to_string()));
        }

        let response = self.client.get(url).query(&query).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(source_error(format!("HTTP {status}: {body}")));
        }
        let payload: Value = response.json().await?;
        let rows = match payload {
            Value::Array(rows) => rows,
            Value::Object(mut obj) => match obj.remove("data") {
                Some(Value::Array(rows)) => rows,
                _ => return Err(source_error("response has no 'data' array".to_string())),
            },
            _ => return Err(source_error("response is not a JSON array".to_string())),
        };

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match SourceRecord::from_row(topic, row) {
                // Inclusive lower bound, enforced even if the endpoint ignores it.
                Ok(record) if since.is_none_or(|s| record.synced_at >= s) => records.push(record),
                Ok(_) => {}
                Err(reason) => {
                    tracing::warn!(topic = %topic.topic, reason = %reason, "Skipping malformed source row")
                }
            }
        }
        tracing::debug!(topic = %topic.topic, count = records.len(), "Fetched source rows");
        Ok(records)
    }
}
