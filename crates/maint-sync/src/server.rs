use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use maint_std::fs::{ExistsFile, ReadFile, WriteFile};
use maint_std::time::GetNow;
use serde_json::json;
use tracing::{info, instrument};

use crate::{
    config::ScheduleFile,
    error::SyncError,
    scheduler::Scheduler,
    service::SyncService,
    task::TaskId,
    traits::SyncRunner,
};

type Shared<R, C, F, S> = Arc<SyncService<R, C, F, S>>;

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::TopicNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidCronExpression { .. } | Self::InvalidTopicConfig { .. } => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn router<R, C, F, S>(service: Shared<R, C, F, S>) -> Router
where
    R: SyncRunner,
    C: GetNow + Send + Sync + 'static,
    F: ReadFile + WriteFile + ExistsFile + Send + Sync + 'static,
    S: Scheduler,
{
    Router::new()
        .route("/health", get(health))
        .route("/schedule", get(get_schedule::<R, C, F, S>).post(put_schedule::<R, C, F, S>))
        .route("/schedule/reload", post(reload::<R, C, F, S>))
        .route("/topics", get(list_topics::<R, C, F, S>))
        .route("/topics/{topic}/sync", post(sync_topic::<R, C, F, S>))
        .route("/sweep", post(sweep::<R, C, F, S>))
        .route("/tasks/{id}", get(task_status::<R, C, F, S>))
        .route("/dedup/{domain}", delete(clear_dedup::<R, C, F, S>))
        .with_state(service)
}

/// Listen on `0.0.0.0:port` until `shutdown` resolves.
pub async fn serve(
    port: u16,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), SyncError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Control surface listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn get_schedule<R, C, F, S>(State(svc): State<Shared<R, C, F, S>>) -> Json<ScheduleFile>
where
    R: SyncRunner,
    C: GetNow + Send + Sync + 'static,
    F: ReadFile + WriteFile + ExistsFile + Send + Sync + 'static,
    S: Scheduler,
{
    Json(svc.schedule())
}

#[instrument(name = "schedule.replace", skip_all)]
async fn put_schedule<R, C, F, S>(
    State(svc): State<Shared<R, C, F, S>>,
    Json(file): Json<ScheduleFile>,
) -> Result<Response, SyncError>
where
    R: SyncRunner,
    C: GetNow + Send + Sync + 'static,
    F: ReadFile + WriteFile + ExistsFile + Send + Sync + 'static,
    S: Scheduler,
{
    let summary = svc.replace_schedule(&file).await?;
    Ok(Json(summary).into_response())
}

#[instrument(name = "schedule.reload", skip_all)]
async fn reload<R, C, F, S>(State(svc): State<Shared<R, C, F, S>>) -> Response
where
    R: SyncRunner,
    C: GetNow + Send + Sync + 'static,
    F: ReadFile + WriteFile + ExistsFile + Send + Sync + 'static,
    S: Scheduler,
{
    Json(svc.reload().await).into_response()
}

async fn list_topics<R, C, F, S>(State(svc): State<Shared<R, C, F, S>>) -> Result<Response, SyncError>
where
    R: SyncRunner,
    C: GetNow + Send + Sync + 'static,
    F: ReadFile + WriteFile + ExistsFile + Send + Sync + 'static,
    S: Scheduler,
{
    Ok(Json(svc.topics().await?).into_response())
}

#[instrument(name = "topic.sync", skip(svc))]
async fn sync_topic<R, C, F, S>(
    State(svc): State<Shared<R, C, F, S>>,
    Path(topic): Path<String>,
) -> Result<Response, SyncError>
where
    R: SyncRunner,
    C: GetNow + Send + Sync + 'static,
    F: ReadFile + WriteFile + ExistsFile + Send + Sync + 'static,
    S: Scheduler,
{
    let task_id = svc.submit_topic_sync(&topic).await?;
    info!(task_id = %task_id, "Manual sync accepted");
    Ok(accepted(task_id))
}

#[instrument(name = "sweep", skip_all)]
async fn sweep<R, C, F, S>(State(svc): State<Shared<R, C, F, S>>) -> Response
where
    R: SyncRunner,
    C: GetNow + Send + Sync + 'static,
    F: ReadFile + WriteFile + ExistsFile + Send + Sync + 'static,
    S: Scheduler,
{
    let task_id = svc.submit_sweep();
    info!(task_id = %task_id, "Manual sweep accepted");
    accepted(task_id)
}

async fn task_status<R, C, F, S>(
    State(svc): State<Shared<R, C, F, S>>,
    Path(id): Path<String>,
) -> Response
where
    R: SyncRunner,
    C: GetNow + Send + Sync + 'static,
    F: ReadFile + WriteFile + ExistsFile + Send + Sync + 'static,
    S: Scheduler,
{
    match id.parse::<TaskId>().ok().and_then(|id| svc.task_status(&id)) {
        Some(record) => Json(record).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({ "status": "NOT_FOUND" }))).into_response(),
    }
}

#[instrument(name = "dedup.clear", skip(svc))]
async fn clear_dedup<R, C, F, S>(
    State(svc): State<Shared<R, C, F, S>>,
    Path(domain): Path<String>,
) -> Result<StatusCode, SyncError>
where
    R: SyncRunner,
    C: GetNow + Send + Sync + 'static,
    F: ReadFile + WriteFile + ExistsFile + Send + Sync + 'static,
    S: Scheduler,
{
    svc.clear_dedup(&domain).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn accepted(task_id: TaskId) -> Response {
    (StatusCode::ACCEPTED, Json(json!({ "task_id": task_id }))).into_response()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use maint_std::fs::MemFs;
    use maint_std::time::MockClock;
    use serde_json::Value;
    use tower::ServiceExt as _;

    use super::*;
    use crate::config::TopicConfig;
    use crate::dedup::MemoryDedupStore;
    use crate::dispatcher::TaskDispatcher;
    use crate::engine::WatermarkSyncEngine;
    use crate::mocks::{MockEventPublisher, MockRecordSource, MockTopicStore};
    use crate::schedule_file::ScheduleFileStore;
    use crate::scheduler::TokioScheduler;
    use crate::task::Retention;
    use crate::traits::DedupStore;

    type Engine = WatermarkSyncEngine<
        MockTopicStore,
        MockRecordSource,
        MockEventPublisher,
        MemoryDedupStore<MockClock>,
        MockClock,
    >;

    struct Fixture {
        app: Router,
        dedup: MemoryDedupStore<MockClock>,
        fs: MemFs,
    }

    fn fixture() -> Fixture {
        let clock = MockClock::new();
        let dedup = MemoryDedupStore::new(clock.clone());
        let mut equipment = TopicConfig::new("equipment");
        equipment.cron = "0 0 1 * * ?".to_string();
        let engine: Engine = WatermarkSyncEngine::new(
            MockTopicStore::with_topics([equipment]),
            MockRecordSource::new(),
            MockEventPublisher::new(),
            dedup.clone(),
            clock.clone(),
        );
        let fs = MemFs::new();
        let service = SyncService::new(
            engine,
            TaskDispatcher::new(clock.clone(), Retention::default()),
            TokioScheduler::new(clock, 1),
            ScheduleFileStore::new(fs.clone(), "schedule.json"),
        );
        Fixture {
            app: router(Arc::new(service)),
            dedup,
            fs,
        }
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_is_ok() {
        let f = fixture();
        let response = f
            .app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn schedule_round_trips_through_the_file() {
        let f = fixture();

        let (status, summary) = call(
            &f.app,
            "POST",
            "/schedule",
            Some(json!({"crons": ["0 0 2 * * ?", "nope"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["registered"], 2, "one file trigger plus the equipment topic");
        assert_eq!(summary["failed"].as_array().unwrap().len(), 1);
        assert!(f.fs.get("schedule.json").unwrap().contains("0 0 2 * * ?"));

        let (status, file) = call(&f.app, "GET", "/schedule", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(file, json!({"crons": ["0 0 2 * * ?", "nope"]}));
    }

    #[tokio::test]
    async fn reload_reports_registered_triggers() {
        let f = fixture();
        let (status, summary) = call(&f.app, "POST", "/schedule/reload", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["registered"], 2);
        assert_eq!(summary["cancelled"], 0);
    }

    #[tokio::test]
    async fn topics_are_listed() {
        let f = fixture();
        let (status, topics) = call(&f.app, "GET", "/topics", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(topics[0]["topic"], "equipment");
    }

    #[tokio::test]
    async fn manual_sync_returns_a_task_id() {
        let f = fixture();

        let (status, body) = call(&f.app, "POST", "/topics/equipment/sync", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let task_id = body["task_id"].as_str().unwrap().to_string();

        let mut record = Value::Null;
        for _ in 0..100 {
            let (status, body) = call(&f.app, "GET", &format!("/tasks/{task_id}"), None).await;
            assert_eq!(status, StatusCode::OK);
            record = body;
            if record["status"] == "SUCCESS" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(record["status"], "SUCCESS");
        assert_eq!(record["lock_domain"], "equipment");
    }

    #[tokio::test]
    async fn unknown_topic_is_404_without_a_task() {
        let f = fixture();
        let (status, body) = call(&f.app, "POST", "/topics/nope/sync", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.get("task_id").is_none());
    }

    #[tokio::test]
    async fn sweep_is_accepted() {
        let f = fixture();
        let (status, body) = call(&f.app, "POST", "/sweep", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body["task_id"].is_string());
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let f = fixture();
        let (status, body) = call(
            &f.app,
            "GET",
            "/tasks/00000000-0000-4000-8000-000000000000",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({"status": "NOT_FOUND"}));

        let (status, _) = call(&f.app, "GET", "/tasks/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn dedup_domain_can_be_cleared() {
        let f = fixture();
        let ttl = Duration::from_secs(60);
        assert!(f.dedup.try_mark("equipment", "k1", ttl).await.unwrap());

        let (status, _) = call(&f.app, "DELETE", "/dedup/equipment", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        assert!(f.dedup.try_mark("equipment", "k1", ttl).await.unwrap());
    }

    #[test]
    fn errors_map_to_status_codes() {
        let not_found = SyncError::TopicNotFound("x".into()).into_response();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let bad = SyncError::InvalidCronExpression {
            expr: "x".into(),
            reason: "y".into(),
        }
        .into_response();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let internal = SyncError::Kv("down".into()).into_response();
        assert_eq!(internal.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
