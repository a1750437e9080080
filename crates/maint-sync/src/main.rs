use std::sync::Arc;

use async_nats::jetstream;
use maint_std::{SystemClock, SystemEnv, SystemFs};
use maint_sync::{
    EngineSettings, SyncConfig, SyncError, SyncService, TaskDispatcher, TokioScheduler,
    WatermarkSyncEngine,
    dedup::MemoryDedupStore,
    kv::{
        get_or_create_events_stream, get_or_create_topics_bucket, get_or_create_watermarks_bucket,
        watch_topics,
    },
    nats::connect,
    nats_impls::{KvDedupStore, KvTopicStore},
    schedule_file::ScheduleFileStore,
    scheduler::TICK_INTERVAL,
    server,
    settings::DedupBackend,
    source::HttpSource,
    task::Retention,
    traits::DedupStore,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = SyncConfig::from_env(&SystemEnv);

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "maint-sync exited with error");
        std::process::exit(1);
    }
}

async fn run(config: SyncConfig) -> Result<(), SyncError> {
    let nats = connect(&config.nats).await?;
    let js = jetstream::new(nats);

    get_or_create_events_stream(&js, &config.stream, &config.subject_prefix).await?;
    let topics_kv = get_or_create_topics_bucket(&js).await?;
    let topics = KvTopicStore::new(topics_kv.clone(), get_or_create_watermarks_bucket(&js).await?);

    match config.dedup_backend {
        DedupBackend::Nats => {
            let dedup = KvDedupStore::new(js.clone());
            start(config, js, topics, topics_kv, dedup).await
        }
        DedupBackend::Memory => {
            tracing::warn!("Using process-local dedup; keys are not shared between instances");
            start(config, js, topics, topics_kv, MemoryDedupStore::new(SystemClock)).await
        }
    }
}

async fn start<D: DedupStore>(
    config: SyncConfig,
    js: jetstream::Context,
    topics: KvTopicStore,
    topics_kv: jetstream::kv::Store,
    dedup: D,
) -> Result<(), SyncError> {
    let engine = WatermarkSyncEngine::new(
        topics,
        HttpSource::new(config.http_timeout)?,
        js,
        dedup,
        SystemClock,
    )
    .with_settings(EngineSettings {
        subject_prefix: config.subject_prefix.clone(),
        dedup_ttl: config.dedup_ttl,
    });

    let scheduler = TokioScheduler::new(SystemClock, config.workers);
    let scheduler_handle = scheduler.start(TICK_INTERVAL);

    let service = Arc::new(SyncService::new(
        engine,
        TaskDispatcher::new(
            SystemClock,
            Retention {
                ttl: config.task_retention,
                ..Retention::default()
            },
        ),
        scheduler,
        ScheduleFileStore::new(SystemFs, config.schedule_file.clone()),
    ));

    let summary = service.reload().await;
    tracing::info!(
        registered = summary.registered,
        failed = summary.failed.len(),
        workers = config.workers,
        "Schedule loaded"
    );

    // The watch replays every current row first; that burst collapses into
    // one extra reload. Watermark writes go to their own bucket and never
    // reach this watch.
    let watcher = {
        let service = Arc::clone(&service);
        let changes = watch_topics(&topics_kv).await?;
        tokio::spawn(async move { service.reload_on_changes(Box::pin(changes)).await })
    };

    let result = server::serve(config.http_port, server::router(service), shutdown_signal()).await;

    tracing::info!("Shutting down");
    watcher.abort();
    scheduler_handle.abort();
    result
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c  => {}
        _ = sigterm => {}
    }
}
