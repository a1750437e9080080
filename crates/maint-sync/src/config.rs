use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Cron written into a freshly created schedule file: 01:00:00 every day.
pub const DEFAULT_CRON: &str = "0 0 1 * * ?";

/// Separator between several cron expressions stored in one topic row.
pub const CRON_SEPARATOR: &str = "||";

/// Lock domain and schedule entry id of the full sweep. No topic may use it.
pub const SWEEP_DOMAIN: &str = "sweep";

/// Contents of the ad-hoc schedule file: `{"crons": ["0 0 1 * * ?", ...]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleFile {
    #[serde(default)]
    pub crons: Vec<String>,
}

impl ScheduleFile {
    pub fn with_default_entry() -> Self {
        Self {
            crons: vec![DEFAULT_CRON.to_string()],
        }
    }
}

/// One row of the per-topic configuration table, stored in NATS KV under
/// `topics.<topic>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicConfig {
    pub topic: String,
    #[serde(default)]
    pub description: String,
    /// Partner endpoint; rows without one are served by a database source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    /// Fixed query parameters sent with every fetch (JSON object).
    #[serde(default = "empty_object")]
    pub params: serde_json::Value,
    /// One or more cron expressions joined with `||`.
    #[serde(default)]
    pub cron: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,
    #[serde(default = "default_true", with = "flag")]
    pub enabled: bool,
    /// Move the watermark to "now" after a successful cycle that fetched nothing.
    #[serde(default, with = "flag")]
    pub advance_on_empty: bool,
    /// Filter fetched rows through the dedup guard (domain = topic).
    #[serde(default, with = "flag")]
    pub dedup: bool,
    /// Replaces `<topic>` in the `<prefix>.<topic>` publish subject. May hold
    /// several tokens (`partner.feedback`); the prefix always stays, so the
    /// events stream captures the subject.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default = "default_key_field")]
    pub key_field: String,
    #[serde(default = "default_sync_field")]
    pub sync_field: String,
}

impl TopicConfig {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            description: String::new(),
            api_url: None,
            params: empty_object(),
            cron: String::new(),
            last_sync_time: None,
            enabled: true,
            advance_on_empty: false,
            dedup: false,
            subject: None,
            key_field: default_key_field(),
            sync_field: default_sync_field(),
        }
    }

    /// Trimmed, non-empty cron expressions of this row.
    pub fn cron_expressions(&self) -> Vec<String> {
        split_cron_expressions(&self.cron)
    }

    pub fn subject(&self, prefix: &str) -> String {
        let suffix = self.subject.as_deref().unwrap_or(&self.topic);
        format!("{prefix}.{suffix}")
    }

    /// Topic names end up in KV keys and NATS subjects.
    pub fn validate(&self) -> Result<(), SyncError> {
        let invalid = |reason: &str| SyncError::InvalidTopicConfig {
            topic: self.topic.clone(),
            reason: reason.to_string(),
        };
        if self.topic.is_empty() {
            return Err(invalid("topic must not be empty"));
        }
        if self
            .topic
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '.' | '*' | '>'))
        {
            return Err(invalid("topic must not contain whitespace, '.', '*' or '>'"));
        }
        if self.topic == SWEEP_DOMAIN {
            return Err(invalid("topic name is reserved for the full sweep"));
        }
        if let Some(subject) = &self.subject {
            let bad_token = |token: &str| {
                token.is_empty() || token.chars().any(|c| c.is_whitespace() || matches!(c, '*' | '>'))
            };
            if subject.split('.').any(bad_token) {
                return Err(invalid(
                    "subject must be dot-separated non-empty tokens without whitespace, '*' or '>'",
                ));
            }
        }
        if !self.params.is_object() {
            return Err(invalid("params must be a JSON object"));
        }
        Ok(())
    }
}

pub fn split_cron_expressions(raw: &str) -> Vec<String> {
    raw.split(CRON_SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Event published downstream for every synced source row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub topic: String,
    pub key: String,
    pub synced_at: DateTime<Utc>,
    /// Unique per sync cycle.
    pub sync_id: String,
    pub data: serde_json::Value,
}

impl SyncEvent {
    /// Stable across replays of the same row version; used as `Nats-Msg-Id`.
    pub fn msg_id(&self) -> String {
        format!(
            "{}:{}:{}",
            self.topic,
            self.key,
            self.synced_at.timestamp_millis()
        )
    }
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

fn default_true() -> bool {
    true
}

fn default_key_field() -> String {
    "id".to_string()
}

fn default_sync_field() -> String {
    "updateTime".to_string()
}

/// The legacy table stores flags as `0`/`1`; rows written by hand often use
/// booleans. Accept both, write `0`/`1`.
mod flag {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Int(i64),
        Str(String),
    }

    pub fn serialize<S: Serializer>(value: &bool, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u8(u8::from(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Bool(b) => Ok(b),
            Raw::Int(0) => Ok(false),
            Raw::Int(1) => Ok(true),
            Raw::Str(s) if s == "0" => Ok(false),
            Raw::Str(s) if s == "1" => Ok(true),
            Raw::Int(n) => Err(D::Error::custom(format!("flag must be 0 or 1, got {n}"))),
            Raw::Str(s) => Err(D::Error::custom(format!("flag must be 0 or 1, got {s:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_multiple_cron_expressions() {
        let mut row = TopicConfig::new("equipment");
        row.cron = "0 0 1 * * ? || 0 30 12 * * ?||".to_string();
        assert_eq!(row.cron_expressions(), vec!["0 0 1 * * ?", "0 30 12 * * ?"]);
    }

    #[test]
    fn blank_cron_yields_no_expressions() {
        assert!(split_cron_expressions("  ").is_empty());
        assert!(split_cron_expressions("||").is_empty());
    }

    #[test]
    fn enabled_accepts_integers_and_booleans() {
        let row: TopicConfig =
            serde_json::from_str(r#"{"topic":"a","enabled":0,"dedup":"1"}"#).unwrap();
        assert!(!row.enabled);
        assert!(row.dedup);

        let row: TopicConfig = serde_json::from_str(r#"{"topic":"a","enabled":true}"#).unwrap();
        assert!(row.enabled);
    }

    #[test]
    fn enabled_rejects_other_integers() {
        assert!(serde_json::from_str::<TopicConfig>(r#"{"topic":"a","enabled":2}"#).is_err());
    }

    #[test]
    fn minimal_row_gets_defaults() {
        let row: TopicConfig = serde_json::from_str(r#"{"topic":"feedback"}"#).unwrap();
        assert!(row.enabled);
        assert!(!row.advance_on_empty);
        assert_eq!(row.key_field, "id");
        assert_eq!(row.sync_field, "updateTime");
        assert!(row.params.is_object());
        assert!(row.last_sync_time.is_none());
    }

    #[test]
    fn flags_serialize_as_integers() {
        let json = serde_json::to_value(TopicConfig::new("a")).unwrap();
        assert_eq!(json["enabled"], 1);
        assert_eq!(json["dedup"], 0);
    }

    #[test]
    fn subject_defaults_to_prefix_and_topic() {
        let mut row = TopicConfig::new("inspection");
        assert_eq!(row.subject("maint"), "maint.inspection");
        row.subject = Some("partner.inspection".to_string());
        assert_eq!(row.subject("maint"), "maint.partner.inspection");
    }

    #[test]
    fn subject_override_stays_under_the_prefix() {
        let mut row = TopicConfig::new("inspection");
        for good in ["partner", "partner.inspection", "a-b.c_d"] {
            row.subject = Some(good.to_string());
            assert!(row.validate().is_ok(), "{good}");
            assert!(row.subject("maint").starts_with("maint."));
        }
        for bad in ["", ".partner", "partner.", "a..b", "a.*", ">", "a b"] {
            row.subject = Some(bad.to_string());
            assert!(row.validate().is_err(), "{bad:?}");
        }
    }

    #[test]
    fn sweep_is_a_reserved_topic_name() {
        let err = TopicConfig::new(SWEEP_DOMAIN).validate().unwrap_err();
        assert!(err.to_string().contains("reserved"));
        assert!(TopicConfig::new("sweeper").validate().is_ok());
    }

    #[test]
    fn topic_with_subject_tokens_is_rejected() {
        let err = TopicConfig::new("a.b").validate().unwrap_err();
        assert!(err.to_string().contains("a.b"));
        assert!(TopicConfig::new("").validate().is_err());
        assert!(TopicConfig::new("rotational-maintenance").validate().is_ok());
    }

    #[test]
    fn msg_id_is_stable_for_same_row_version() {
        let at = DateTime::parse_from_rfc3339("2024-03-01T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let a = SyncEvent {
            topic: "t".into(),
            key: "42".into(),
            synced_at: at,
            sync_id: "one".into(),
            data: serde_json::json!({}),
        };
        let mut b = a.clone();
        b.sync_id = "two".into();
        assert_eq!(a.msg_id(), b.msg_id());
    }

    #[test]
    fn schedule_file_default_entry() {
        let file = ScheduleFile::with_default_entry();
        assert_eq!(file.crons, vec![DEFAULT_CRON]);
        let json = serde_json::to_string(&file).unwrap();
        assert_eq!(json, r#"{"crons":["0 0 1 * * ?"]}"#);
    }
}
