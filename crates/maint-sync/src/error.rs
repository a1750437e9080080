use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("NATS connection error: {0}")]
    Connect(String),

    #[error("KV error: {0}")]
    Kv(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCronExpression { expr: String, reason: String },

    #[error("Invalid topic config '{topic}': {reason}")]
    InvalidTopicConfig { topic: String, reason: String },

    #[error("Topic '{0}' not found")]
    TopicNotFound(String),

    #[error("Source error for topic '{topic}': {reason}")]
    Source { topic: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Watermark for topic '{topic}' kept changing underneath {attempts} update attempts")]
    WatermarkContention { topic: String, attempts: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
