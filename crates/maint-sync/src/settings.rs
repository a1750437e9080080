use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use maint_std::env::ReadEnv;

use crate::nats::NatsConfig;

const ENV_SCHEDULE_FILE: &str = "MAINT_SYNC_SCHEDULE_FILE";
const ENV_HTTP_PORT: &str = "MAINT_SYNC_HTTP_PORT";
const ENV_WORKERS: &str = "MAINT_SYNC_WORKERS";
const ENV_SUBJECT_PREFIX: &str = "MAINT_SYNC_SUBJECT_PREFIX";
const ENV_STREAM: &str = "MAINT_SYNC_STREAM";
const ENV_DEDUP_BACKEND: &str = "MAINT_SYNC_DEDUP_BACKEND";
const ENV_DEDUP_TTL_SECS: &str = "MAINT_SYNC_DEDUP_TTL_SECS";
const ENV_TASK_RETENTION_SECS: &str = "MAINT_SYNC_TASK_RETENTION_SECS";
const ENV_HTTP_TIMEOUT_SECS: &str = "MAINT_SYNC_HTTP_TIMEOUT_SECS";

const DEFAULT_SCHEDULE_FILE: &str = "config/schedule.json";
const DEFAULT_HTTP_PORT: u16 = 8080;
const DEFAULT_WORKERS: usize = 4;
const DEFAULT_SUBJECT_PREFIX: &str = "maint";
const DEFAULT_STREAM: &str = "MAINT_SYNC";
const DEFAULT_DEDUP_TTL_SECS: u64 = 86_400;
const DEFAULT_TASK_RETENTION_SECS: u64 = 3_600;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupBackend {
    /// KV bucket per domain; shared by every instance.
    Nats,
    /// Process-local.
    Memory,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub schedule_file: PathBuf,
    pub http_port: u16,
    pub workers: usize,
    pub subject_prefix: String,
    pub stream: String,
    pub dedup_backend: DedupBackend,
    pub dedup_ttl: Duration,
    pub task_retention: Duration,
    pub http_timeout: Duration,
    pub nats: NatsConfig,
}

impl SyncConfig {
    /// Unset or unparsable values fall back to their defaults.
    pub fn from_env<E: ReadEnv>(env: &E) -> Self {
        let dedup_backend = match env.var(ENV_DEDUP_BACKEND).as_deref() {
            Ok("memory") => DedupBackend::Memory,
            Ok("nats") | Err(_) => DedupBackend::Nats,
            Ok(other) => {
                tracing::warn!(value = other, "Unknown {ENV_DEDUP_BACKEND}, using nats");
                DedupBackend::Nats
            }
        };
        Self {
            schedule_file: env
                .var(ENV_SCHEDULE_FILE)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_SCHEDULE_FILE)),
            http_port: parsed(env, ENV_HTTP_PORT, DEFAULT_HTTP_PORT),
            workers: parsed(env, ENV_WORKERS, DEFAULT_WORKERS).max(1),
            subject_prefix: non_empty(env, ENV_SUBJECT_PREFIX, DEFAULT_SUBJECT_PREFIX),
            stream: non_empty(env, ENV_STREAM, DEFAULT_STREAM),
            dedup_backend,
            dedup_ttl: Duration::from_secs(parsed(env, ENV_DEDUP_TTL_SECS, DEFAULT_DEDUP_TTL_SECS)),
            task_retention: Duration::from_secs(parsed(
                env,
                ENV_TASK_RETENTION_SECS,
                DEFAULT_TASK_RETENTION_SECS,
            )),
            http_timeout: Duration::from_secs(parsed(
                env,
                ENV_HTTP_TIMEOUT_SECS,
                DEFAULT_HTTP_TIMEOUT_SECS,
            )),
            nats: NatsConfig::from_env(env),
        }
    }
}

fn parsed<E: ReadEnv, T: FromStr + Copy>(env: &E, key: &str, default: T) -> T {
    match env.var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "Invalid number, using default");
            default
        }),
        Err(_) => default,
    }
}

fn non_empty<E: ReadEnv>(env: &E, key: &str, default: &str) -> String {
    env.var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
mod tests {
    use maint_std::env::InMemoryEnv;

    use super::*;

    #[test]
    fn defaults() {
        let config = SyncConfig::from_env(&InMemoryEnv::new());
        assert_eq!(config.schedule_file, PathBuf::from("config/schedule.json"));
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.workers, 4);
        assert_eq!(config.subject_prefix, "maint");
        assert_eq!(config.stream, "MAINT_SYNC");
        assert_eq!(config.dedup_backend, DedupBackend::Nats);
        assert_eq!(config.dedup_ttl, Duration::from_secs(86_400));
        assert_eq!(config.task_retention, Duration::from_secs(3_600));
        assert_eq!(config.http_timeout, Duration::from_secs(30));
    }

    #[test]
    fn overrides_are_read() {
        let env = InMemoryEnv::new();
        env.set("MAINT_SYNC_SCHEDULE_FILE", "/etc/maint/schedule.json");
        env.set("MAINT_SYNC_HTTP_PORT", "9090");
        env.set("MAINT_SYNC_WORKERS", "8");
        env.set("MAINT_SYNC_DEDUP_BACKEND", "memory");
        env.set("MAINT_SYNC_DEDUP_TTL_SECS", "60");
        env.set("NATS_URL", "nats.internal:4222");

        let config = SyncConfig::from_env(&env);

        assert_eq!(config.schedule_file, PathBuf::from("/etc/maint/schedule.json"));
        assert_eq!(config.http_port, 9090);
        assert_eq!(config.workers, 8);
        assert_eq!(config.dedup_backend, DedupBackend::Memory);
        assert_eq!(config.dedup_ttl, Duration::from_secs(60));
        assert_eq!(config.nats.servers, vec!["nats.internal:4222"]);
    }

    #[test]
    fn bad_numbers_fall_back() {
        let env = InMemoryEnv::new();
        env.set("MAINT_SYNC_HTTP_PORT", "eighty");
        env.set("MAINT_SYNC_WORKERS", "0");
        env.set("MAINT_SYNC_SUBJECT_PREFIX", "  ");

        let config = SyncConfig::from_env(&env);

        assert_eq!(config.http_port, 8080);
        assert_eq!(config.workers, 1);
        assert_eq!(config.subject_prefix, "maint");
    }
}
