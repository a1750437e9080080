//! # maint-sync
//!
//! Cron-driven incremental sync between the maintenance database, partner
//! HTTP APIs and NATS.
//!
//! ## Features
//!
//! - Ad-hoc sweep schedules from a JSON file and per-topic cron expressions
//!   from the `sync_topics` NATS KV bucket, both hot-reloaded.
//! - Reload replaces the whole trigger set; firings queued by the old set are
//!   dropped.
//! - Every task runs under a lock domain. A second task for a busy domain is
//!   recorded as `SKIPPED` instead of queueing.
//! - Per-topic watermarks only move forward, guarded by the KV revision.
//! - Optional per-domain dedup of business keys with a TTL.
//! - Events go to JetStream with a `Nats-Msg-Id`, so replays of the boundary
//!   record are absorbed by the stream.
//!
//! ## Topic row example (JSON stored in NATS KV under key `topics.equipment`)
//!
//! ```json
//! {
//!   "topic": "equipment",
//!   "api_url": "https://partner.example.com/api/equipment",
//!   "params": { "plant": "P01" },
//!   "cron": "0 0 1 * * ? || 0 0 13 * * ?",
//!   "enabled": 1,
//!   "advance_on_empty": false,
//!   "dedup": true
//! }
//! ```
//!
//! ## Schedule file example
//!
//! ```json
//! { "crons": ["0 0 1 * * ?"] }
//! ```

pub mod config;
pub mod dedup;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod kv;
pub mod lock;
pub mod nats;
pub mod nats_impls;
pub mod registry;
pub mod schedule_file;
pub mod scheduler;
pub mod server;
pub mod service;
pub mod settings;
pub mod source;
pub mod task;
pub mod traits;
pub mod transform;
pub mod trigger;
pub mod watermark;

#[cfg(any(test, feature = "test-support"))]
pub mod mocks;

pub use config::{ScheduleFile, SyncEvent, TopicConfig};
pub use dispatcher::{Dispatch, TaskDispatcher};
pub use engine::{CycleReport, EngineSettings, SweepReport, WatermarkSyncEngine};
pub use error::SyncError;
pub use registry::{ReloadSummary, ScheduleEntry, ScheduleRegistry};
pub use scheduler::{Scheduler, TokioScheduler};
pub use service::SyncService;
pub use settings::SyncConfig;
pub use task::{Outcome, TaskId, TaskRecord, TaskStatus};
pub use traits::{DedupStore, EventPublisher, RecordSource, SyncRunner, TopicStore};
