use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use maint_std::fs::{ExistsFile, ReadFile, WriteFile};
use maint_std::time::GetNow;

use crate::{
    config::{SWEEP_DOMAIN, ScheduleFile, TopicConfig},
    dispatcher::{Dispatch, TaskDispatcher},
    error::SyncError,
    registry::{ReloadSummary, ScheduleEntry, ScheduleRegistry},
    schedule_file::ScheduleFileStore,
    scheduler::{Job, Scheduler, job},
    task::{Outcome, TaskId, TaskRecord},
    traits::SyncRunner,
    trigger::TriggerInfo,
};

/// Quiet period after a topic-table change before reloading, so a burst of
/// edits causes one reload.
pub const RELOAD_DEBOUNCE: Duration = Duration::from_millis(250);

/// Ties the schedule sources, the trigger registry, the dispatcher and the
/// sync engine together.
pub struct SyncService<R, C, F, S> {
    runner: R,
    dispatcher: TaskDispatcher<C>,
    registry: ScheduleRegistry<S>,
    schedule_file: ScheduleFileStore<F>,
}

impl<R, C, F, S> SyncService<R, C, F, S>
where
    R: SyncRunner,
    C: GetNow + Send + Sync + 'static,
    F: ReadFile + WriteFile + ExistsFile + Send + Sync + 'static,
    S: Scheduler,
{
    pub fn new(
        runner: R,
        dispatcher: TaskDispatcher<C>,
        scheduler: Arc<S>,
        schedule_file: ScheduleFileStore<F>,
    ) -> Self {
        Self {
            runner,
            dispatcher,
            registry: ScheduleRegistry::new(scheduler),
            schedule_file,
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Entries from the schedule file (full sweeps) and from every enabled
    /// topic row. An unreadable topic table contributes no entries.
    pub async fn schedule_entries(&self) -> Vec<ScheduleEntry> {
        let file = self.schedule_file.load();
        let mut entries = vec![ScheduleEntry {
            id: SWEEP_DOMAIN.to_string(),
            cron_expressions: file.crons,
            job: self.sweep_job(),
            enabled: true,
        }];

        match self.runner.list_topics().await {
            Ok(topics) => entries.extend(topics.into_iter().map(|t| ScheduleEntry {
                id: t.topic.clone(),
                cron_expressions: t.cron_expressions(),
                job: self.topic_job(&t.topic),
                enabled: t.enabled,
            })),
            Err(e) => tracing::error!(error = %e, "Failed to read topic table, scheduling file entries only"),
        }
        entries
    }

    pub async fn reload(&self) -> ReloadSummary {
        let entries = self.schedule_entries().await;
        self.registry.reload(entries).await
    }

    pub fn schedule(&self) -> ScheduleFile {
        self.schedule_file.load()
    }

    /// Persist a new ad-hoc schedule and reload every trigger from it.
    pub async fn replace_schedule(&self, file: &ScheduleFile) -> Result<ReloadSummary, SyncError> {
        self.schedule_file.save(file)?;
        Ok(self.reload().await)
    }

    pub fn live_triggers(&self) -> Vec<TriggerInfo> {
        self.registry.live_triggers()
    }

    pub async fn topics(&self) -> Result<Vec<TopicConfig>, SyncError> {
        self.runner.list_topics().await
    }

    /// Manual sync of one topic. Unknown topics are rejected before a task
    /// id is issued.
    pub async fn submit_topic_sync(&self, topic: &str) -> Result<TaskId, SyncError> {
        if self.runner.get_topic(topic).await?.is_none() {
            return Err(SyncError::TopicNotFound(topic.to_string()));
        }
        let (id, _) = dispatch_topic(&self.dispatcher, &self.runner, topic);
        Ok(id)
    }

    pub fn submit_sweep(&self) -> TaskId {
        let (id, _) = dispatch_sweep(&self.dispatcher, &self.runner);
        id
    }

    pub fn task_status(&self, id: &TaskId) -> Option<TaskRecord> {
        self.dispatcher.get_status(id)
    }

    pub async fn clear_dedup(&self, domain: &str) -> Result<(), SyncError> {
        self.runner.clear_dedup(domain).await
    }

    /// Reload after every burst of items from `changes`, until it ends.
    pub async fn reload_on_changes<St>(&self, changes: St)
    where
        St: Stream + Unpin,
    {
        let mut changes = changes;
        while changes.next().await.is_some() {
            loop {
                match tokio::time::timeout(RELOAD_DEBOUNCE, changes.next()).await {
                    Ok(Some(_)) => continue,
                    Ok(None) | Err(_) => break,
                }
            }
            tracing::info!("Topic table changed, reloading schedule");
            self.reload().await;
        }
        tracing::warn!("Topic change stream ended");
    }

    fn sweep_job(&self) -> Job {
        let dispatcher = self.dispatcher.clone();
        let runner = self.runner.clone();
        job(move || {
            let (_, dispatch) = dispatch_sweep(&dispatcher, &runner);
            wait(dispatch)
        })
    }

    fn topic_job(&self, topic: &str) -> Job {
        let dispatcher = self.dispatcher.clone();
        let runner = self.runner.clone();
        let topic = topic.to_string();
        job(move || {
            let (_, dispatch) = dispatch_topic(&dispatcher, &runner, &topic);
            wait(dispatch)
        })
    }
}

fn dispatch_topic<R, C>(dispatcher: &TaskDispatcher<C>, runner: &R, topic: &str) -> (TaskId, Dispatch)
where
    R: SyncRunner,
    C: GetNow + Send + Sync + 'static,
{
    let runner = runner.clone();
    let name = topic.to_string();
    dispatcher.spawn(topic, async move { runner.run_topic(&name).await.map(Outcome::from) })
}

fn dispatch_sweep<R, C>(dispatcher: &TaskDispatcher<C>, runner: &R) -> (TaskId, Dispatch)
where
    R: SyncRunner,
    C: GetNow + Send + Sync + 'static,
{
    let runner = runner.clone();
    let locks = dispatcher.locks();
    dispatcher.spawn(SWEEP_DOMAIN, async move { runner.sweep(&locks).await.map(Outcome::from) })
}

/// Scheduled jobs hold their worker slot until the dispatched work is done.
async fn wait(dispatch: Dispatch) {
    if let Dispatch::Started(handle) = dispatch
        && let Err(e) = handle.await
    {
        tracing::error!(error = %e, "Dispatched task did not complete");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::{TimeZone, Utc};
    use maint_std::fs::MemFs;
    use maint_std::time::MockClock;
    use serde_json::json;

    use super::*;
    use crate::dedup::MemoryDedupStore;
    use crate::engine::WatermarkSyncEngine;
    use crate::mocks::{MockEventPublisher, MockRecordSource, MockTopicStore};
    use crate::scheduler::TokioScheduler;
    use crate::source::SourceRecord;
    use crate::task::{Retention, TaskStatus};

    type Engine = WatermarkSyncEngine<
        MockTopicStore,
        MockRecordSource,
        MockEventPublisher,
        MemoryDedupStore<MockClock>,
        MockClock,
    >;
    type Service = SyncService<Engine, MockClock, MemFs, TokioScheduler<MockClock>>;

    const PATH: &str = "/etc/maint/schedule.json";

    struct Fixture {
        service: Service,
        topics: MockTopicStore,
        source: MockRecordSource,
        fs: MemFs,
    }

    fn topic(name: &str, cron: &str) -> TopicConfig {
        let mut t = TopicConfig::new(name);
        t.cron = cron.to_string();
        t
    }

    fn fixture(rows: Vec<TopicConfig>) -> Fixture {
        let clock = MockClock::new();
        let topics = MockTopicStore::with_topics(rows);
        let source = MockRecordSource::new();
        let engine = WatermarkSyncEngine::new(
            topics.clone(),
            source.clone(),
            MockEventPublisher::new(),
            MemoryDedupStore::new(clock.clone()),
            clock.clone(),
        );
        let fs = MemFs::new();
        let service = SyncService::new(
            engine,
            TaskDispatcher::new(clock.clone(), Retention::default()),
            TokioScheduler::new(clock, 2),
            ScheduleFileStore::new(fs.clone(), PATH),
        );
        Fixture {
            service,
            topics,
            source,
            fs,
        }
    }

    fn live_ids(service: &Service) -> BTreeSet<String> {
        service.live_triggers().into_iter().map(|t| t.id).collect()
    }

    async fn wait_terminal(service: &Service, id: &TaskId) -> TaskStatus {
        for _ in 0..100 {
            let status = service.task_status(id).unwrap().status;
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} never finished");
    }

    #[tokio::test]
    async fn reload_registers_file_and_enabled_topic_triggers() {
        let mut off = topic("off", "0 0 3 * * ?");
        off.enabled = false;
        let f = fixture(vec![
            topic("equipment", "0 0 1 * * ? || 0 0 13 * * ?"),
            topic("feedback", "0 */5 * * * ?"),
            off,
        ]);

        let summary = f.service.reload().await;

        assert_eq!(summary.registered, 4);
        assert_eq!(
            live_ids(&f.service),
            BTreeSet::from([
                "sweep#0".to_string(),
                "equipment#0".to_string(),
                "equipment#1".to_string(),
                "feedback#0".to_string(),
            ])
        );
        assert!(f.fs.get(PATH).is_some(), "default schedule file written");
    }

    #[tokio::test]
    async fn unreadable_topic_table_still_schedules_file_entries() {
        let f = fixture(vec![topic("equipment", "0 0 1 * * ?")]);
        f.topics.fail_list(true);

        let summary = f.service.reload().await;

        assert_eq!(summary.registered, 1);
        assert_eq!(live_ids(&f.service), BTreeSet::from(["sweep#0".to_string()]));
    }

    #[tokio::test]
    async fn replace_schedule_persists_and_reloads() {
        let f = fixture(vec![]);
        f.service.reload().await;

        let summary = f
            .service
            .replace_schedule(&ScheduleFile {
                crons: vec!["0 0 2 * * ?".into(), "0 30 2 * * ?".into(), "bogus".into()],
            })
            .await
            .unwrap();

        assert_eq!(summary.registered, 2);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(f.service.schedule().crons.len(), 3);
        assert_eq!(summary.cancelled, 1);
    }

    #[tokio::test]
    async fn manual_sync_of_unknown_topic_is_rejected() {
        let f = fixture(vec![]);
        let err = f.service.submit_topic_sync("nope").await.unwrap_err();
        assert!(matches!(err, SyncError::TopicNotFound(_)));
    }

    #[tokio::test]
    async fn manual_sync_runs_to_success() {
        let f = fixture(vec![topic("equipment", "")]);
        f.source.set_rows(
            "equipment",
            vec![SourceRecord {
                key: "1".into(),
                synced_at: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
                body: json!({"id": 1}),
            }],
        );

        let id = f.service.submit_topic_sync("equipment").await.unwrap();

        assert_eq!(wait_terminal(&f.service, &id).await, TaskStatus::Success { count: 1 });
        assert_eq!(
            f.service.task_status(&id).unwrap().lock_domain.as_deref(),
            Some("equipment")
        );
    }

    #[tokio::test]
    async fn sweep_with_failing_topic_is_failed() {
        let f = fixture(vec![topic("equipment", ""), topic("feedback", "")]);
        f.source.set_failure("feedback", "timeout");

        let id = f.service.submit_sweep();

        match wait_terminal(&f.service, &id).await {
            TaskStatus::Failed { reason } => assert!(reason.contains("feedback")),
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[tokio::test]
    async fn sweep_and_topic_sync_never_run_one_topic_twice() {
        let f = fixture(vec![topic("equipment", ""), topic("feedback", "")]);
        f.source.set_delay(Duration::from_millis(100));

        let sweep = f.service.submit_sweep();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let single = f.service.submit_topic_sync("equipment").await.unwrap();

        wait_terminal(&f.service, &sweep).await;
        wait_terminal(&f.service, &single).await;

        let equipment_fetches = f
            .source
            .calls()
            .into_iter()
            .filter(|(topic, _)| topic == "equipment")
            .count();
        assert_eq!(equipment_fetches, 1);
        assert!(matches!(
            f.service.task_status(&single).unwrap().status,
            TaskStatus::Skipped { .. }
        ));
    }

    #[tokio::test]
    async fn burst_of_changes_reloads_once_per_burst() {
        let f = fixture(vec![topic("equipment", "0 0 1 * * ?")]);
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<()>();
        for _ in 0..5 {
            tx.send(()).unwrap();
        }
        f.topics.insert(topic("feedback", "0 0 2 * * ?"));
        drop(tx);

        f.service
            .reload_on_changes(tokio_stream_from(rx))
            .await;

        assert!(live_ids(&f.service).contains("feedback#0"));
    }

    fn tokio_stream_from(
        mut rx: tokio::sync::mpsc::UnboundedReceiver<()>,
    ) -> impl Stream<Item = ()> + Unpin {
        Box::pin(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)))
    }
}
