//! NATS connection settings, connect, and trace-context headers.

use std::path::PathBuf;
use std::time::Duration;

use async_nats::{Client, ConnectOptions, Event, HeaderMap};
use maint_std::env::ReadEnv;
use opentelemetry::propagation::Injector;
use tracing::{Span, info, instrument, warn};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::error::SyncError;

const ENV_NATS_URL: &str = "NATS_URL";
const ENV_NATS_CREDS: &str = "NATS_CREDS";
const ENV_NATS_NKEY: &str = "NATS_NKEY";
const ENV_NATS_USER: &str = "NATS_USER";
const ENV_NATS_PASSWORD: &str = "NATS_PASSWORD";
const ENV_NATS_TOKEN: &str = "NATS_TOKEN";

const DEFAULT_NATS_URL: &str = "localhost:4222";

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Resolved from the environment in this order: credentials file, NKey,
/// user/password, token, none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NatsAuth {
    Credentials(PathBuf),
    NKey(String),
    UserPassword { user: String, password: String },
    Token(String),
    None,
}

impl NatsAuth {
    pub fn description(&self) -> &'static str {
        match self {
            Self::Credentials(_) => "credentials file",
            Self::NKey(_) => "NKey",
            Self::UserPassword { .. } => "user/password",
            Self::Token(_) => "token",
            Self::None => "none",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NatsConfig {
    pub servers: Vec<String>,
    pub auth: NatsAuth,
}

impl NatsConfig {
    /// `NATS_URL` may list several servers separated by commas.
    pub fn from_env<E: ReadEnv>(env: &E) -> Self {
        let servers = env
            .var(ENV_NATS_URL)
            .unwrap_or_else(|_| DEFAULT_NATS_URL.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        Self {
            servers,
            auth: auth_from_env(env),
        }
    }
}

fn auth_from_env<E: ReadEnv>(env: &E) -> NatsAuth {
    if let Ok(path) = env.var(ENV_NATS_CREDS) {
        return NatsAuth::Credentials(PathBuf::from(path));
    }
    if let Ok(seed) = env.var(ENV_NATS_NKEY) {
        return NatsAuth::NKey(seed);
    }
    if let (Ok(user), Ok(password)) = (env.var(ENV_NATS_USER), env.var(ENV_NATS_PASSWORD)) {
        return NatsAuth::UserPassword { user, password };
    }
    if let Ok(token) = env.var(ENV_NATS_TOKEN) {
        return NatsAuth::Token(token);
    }
    NatsAuth::None
}

fn reconnect_delay(attempts: usize) -> Duration {
    let secs = 2u64.saturating_pow(u32::try_from(attempts).unwrap_or(u32::MAX));
    Duration::from_secs(secs.min(MAX_RECONNECT_DELAY.as_secs()))
}

async fn handle_event(event: Event) {
    match event {
        Event::Connected => info!("NATS connected"),
        Event::Disconnected => warn!("NATS disconnected, will reconnect"),
        Event::ServerError(err) => warn!(error = %err, "NATS server error"),
        Event::ClientError(err) => warn!(error = %err, "NATS client error"),
        Event::SlowConsumer(sid) => warn!(sid, "NATS slow consumer"),
        Event::LameDuckMode => warn!("NATS server entering lame duck mode"),
        Event::Closed => info!("NATS connection closed"),
        Event::Draining => info!("NATS connection draining"),
    }
}

#[instrument(name = "nats.connect", skip(config), fields(servers = ?config.servers, auth = %config.auth.description()))]
pub async fn connect(config: &NatsConfig) -> Result<Client, SyncError> {
    let options = match &config.auth {
        NatsAuth::Credentials(path) => ConnectOptions::with_credentials_file(path.clone())
            .await
            .map_err(|e| SyncError::Connect(format!("credentials file {}: {e}", path.display())))?,
        NatsAuth::NKey(seed) => ConnectOptions::with_nkey(seed.clone()),
        NatsAuth::UserPassword { user, password } => {
            ConnectOptions::with_user_and_password(user.clone(), password.clone())
        }
        NatsAuth::Token(token) => ConnectOptions::with_token(token.clone()),
        NatsAuth::None => ConnectOptions::new(),
    };

    let client = options
        .retry_on_initial_connect()
        .connection_timeout(CONNECTION_TIMEOUT)
        .reconnect_delay_callback(reconnect_delay)
        .event_callback(|event| async move { handle_event(event).await })
        .connect(&config.servers)
        .await
        .map_err(|e| SyncError::Connect(format!("{:?}: {e}", config.servers)))?;
    info!("Connected to NATS");
    Ok(client)
}

struct HeaderMapCarrier<'a>(&'a mut HeaderMap);

impl Injector for HeaderMapCarrier<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key, value.as_str());
    }
}

/// Headers carrying the current span's OpenTelemetry context.
pub fn headers_with_trace_context() -> HeaderMap {
    let mut headers = HeaderMap::new();
    let cx = Span::current().context();
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&cx, &mut HeaderMapCarrier(&mut headers));
    });
    headers
}
