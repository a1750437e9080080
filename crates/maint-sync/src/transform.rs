use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::source::SourceRecord;

/// Maps one source row to the `data` payload of its event. Must be pure.
pub type TransformFn = Arc<dyn Fn(&SourceRecord) -> Value + Send + Sync>;

/// Per-topic transforms. Topics without one publish the row body unchanged.
#[derive(Clone, Default)]
pub struct Transforms {
    by_topic: HashMap<String, TransformFn>,
}

impl Transforms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F>(mut self, topic: impl Into<String>, f: F) -> Self
    where
        F: Fn(&SourceRecord) -> Value + Send + Sync + 'static,
    {
        self.by_topic.insert(topic.into(), Arc::new(f));
        self
    }

    pub fn apply(&self, topic: &str, record: &SourceRecord) -> Value {
        match self.by_topic.get(topic) {
            Some(f) => f(record),
            None => record.body.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;

    fn record(body: Value) -> SourceRecord {
        SourceRecord {
            key: "1".into(),
            synced_at: Utc::now(),
            body,
        }
    }

    #[test]
    fn unknown_topic_passes_body_through() {
        let body = json!({"id": 1, "name": "pump"});
        assert_eq!(Transforms::new().apply("equipment", &record(body.clone())), body);
    }

    #[test]
    fn registered_transform_is_applied_per_topic() {
        let transforms = Transforms::new().with("feedback", |r: &SourceRecord| {
            json!({"ref": r.key, "state": r.body["status"]})
        });
        let r = record(json!({"status": "closed", "noise": true}));

        assert_eq!(
            transforms.apply("feedback", &r),
            json!({"ref": "1", "state": "closed"})
        );
        assert_eq!(transforms.apply("equipment", &r), r.body);
    }
}
