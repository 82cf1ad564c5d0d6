//! Worker runtime driven end to end against the in-memory store with a
//! scripted extractor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use crawlfleet::error::ExtractionError;
use crawlfleet::extraction::{ExtractionRequest, Extractor};
use crawlfleet::scheduler::{
    HeartbeatMonitor, JobRepository, JobStatus, MonitorConfig, SubmitRequest, Worker,
    WorkerConfig, WorkerRegistry, WorkerStatus,
};
use crawlfleet::store::{Keyspace, MemoryStore};
use crawlfleet::utils::shutdown_channel;
use serde_json::json;
use uuid::Uuid;

/// Succeeds, fails, hangs or takes a while depending on the template id.
#[derive(Default)]
struct ScriptedExtractor {
    calls: AtomicUsize,
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    async fn execute(&self, request: &ExtractionRequest) -> Result<serde_json::Value, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match request.template_id.as_str() {
            "broken" => Err(ExtractionError::Failure("selector not found".into())),
            "slow" => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(json!({}))
            }
            "lengthy" => {
                tokio::time::sleep(Duration::from_millis(800)).await;
                Ok(json!({"url": request.target_url, "items": 5}))
            }
            _ => Ok(json!({"url": request.target_url, "items": 2})),
        }
    }
}

struct Runtime {
    repository: JobRepository,
    registry: WorkerRegistry,
    extractor: Arc<ScriptedExtractor>,
}

fn runtime() -> Runtime {
    let store = Arc::new(MemoryStore::new());
    let keys = Keyspace::new("rt");
    Runtime {
        repository: JobRepository::new(store.clone(), keys.clone()),
        registry: WorkerRegistry::new(store, keys),
        extractor: Arc::new(ScriptedExtractor::default()),
    }
}

fn fast_config() -> WorkerConfig {
    WorkerConfig::new("it")
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_idle_backoff(Duration::from_millis(20))
        .with_default_job_timeout(Duration::from_millis(200))
}

impl Runtime {
    fn worker(&self) -> Arc<Worker> {
        Arc::new(Worker::new(
            self.registry.clone(),
            self.repository.clone(),
            self.extractor.clone(),
            fast_config(),
        ))
    }

    async fn submit(&self, template: &str, max_retries: u32) -> Uuid {
        self.repository
            .submit(
                SubmitRequest::new(template, template, "https://example.com/page")
                    .with_max_retries(max_retries),
            )
            .await
            .unwrap()
    }

    /// Polls until the job reaches `status`.
    async fn wait_status(&self, id: Uuid, status: JobStatus) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.repository.get(id).await.unwrap().status != status {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job did not reach the expected status");
    }

    /// Polls until every job is terminal.
    async fn wait_terminal(&self, ids: &[Uuid]) {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let mut done = true;
                for id in ids {
                    if !self.repository.get(*id).await.unwrap().status.is_terminal() {
                        done = false;
                    }
                }
                if done {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("jobs did not finish in time");
    }
}

#[tokio::test]
async fn worker_processes_jobs_and_deregisters() {
    let rt = runtime();
    let ids = [
        rt.submit("ok", 3).await,
        rt.submit("ok", 3).await,
        rt.submit("ok", 3).await,
    ];

    let worker = rt.worker();
    let (tx, rx) = shutdown_channel();
    let handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run(rx).await }
    });

    rt.wait_terminal(&ids).await;
    for id in ids {
        let job = rt.repository.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result.unwrap()["items"], 2);
        assert!(job.started_at.is_some());
        assert!(job.assigned_worker.is_none());
    }

    let worker_id = worker.worker_id().unwrap();
    assert!(rt.repository.active_job_ids(&worker_id).await.unwrap().is_empty());

    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    assert!(worker.worker_id().is_none());
    assert!(rt.registry.list().await.unwrap().is_empty());
    let stats = worker.stats();
    assert_eq!(stats.jobs_completed, 3);
    assert_eq!(stats.success_rate(), 1.0);
}

#[tokio::test]
async fn failures_follow_the_retry_budget() {
    let rt = runtime();
    let id = rt.submit("broken", 1).await;

    let worker = rt.worker();
    let (tx, rx) = shutdown_channel();
    let handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run(rx).await }
    });

    rt.wait_terminal(&[id]).await;
    let job = rt.repository.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 1);
    assert!(job.error.unwrap().contains("selector not found"));
    assert_eq!(rt.extractor.calls.load(Ordering::SeqCst), 2);

    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
    assert_eq!(worker.stats().jobs_failed, 2);
}

#[tokio::test]
async fn hung_extraction_times_out() {
    let rt = runtime();
    let slow = rt.submit("slow", 0).await;
    let next = rt.submit("ok", 0).await;

    let worker = rt.worker();
    let (tx, rx) = shutdown_channel();
    let handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run(rx).await }
    });

    rt.wait_terminal(&[slow, next]).await;
    let job = rt.repository.get(slow).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("timed out"));
    assert_eq!(
        rt.repository.get(next).await.unwrap().status,
        JobStatus::Completed
    );

    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
    let stats = worker.stats();
    assert_eq!(stats.jobs_timed_out, 1);
    assert_eq!(stats.jobs_completed, 1);
}

#[tokio::test]
async fn stale_registration_is_replaced() {
    let rt = runtime();
    let monitor = HeartbeatMonitor::new(
        rt.registry.clone(),
        rt.repository.clone(),
        MonitorConfig::default(),
    );

    let worker = rt.worker();
    let mut ids = worker.subscribe_id();
    let (tx, rx) = shutdown_channel();
    let handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run(rx).await }
    });

    let first = tokio::time::timeout(Duration::from_secs(5), ids.wait_for(|id| id.is_some()))
        .await
        .unwrap()
        .unwrap()
        .clone()
        .unwrap();

    // Pretend the worker went silent for an hour.
    let report = monitor
        .run_cycle(Utc::now() + chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(report.workers_marked_stale, 1);

    let second = tokio::time::timeout(
        Duration::from_secs(5),
        ids.wait_for(|id| id.as_deref().is_some_and(|id| id != first)),
    )
    .await
    .unwrap()
    .unwrap()
    .clone()
    .unwrap();
    assert_ne!(first, second);
    assert_eq!(
        rt.registry.get(&first).await.unwrap().status,
        WorkerStatus::Stale
    );

    // The new registration keeps pulling work.
    let id = rt.submit("ok", 0).await;
    rt.wait_terminal(&[id]).await;
    assert_eq!(rt.repository.get(id).await.unwrap().status, JobStatus::Completed);

    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
    assert!(rt.registry.get(&second).await.is_err());
}

#[tokio::test]
async fn shutdown_before_any_work() {
    let rt = runtime();
    let worker = rt.worker();
    let (tx, rx) = shutdown_channel();
    tx.send(true).unwrap();

    worker.run(rx).await.unwrap();
    assert!(rt.registry.list().await.unwrap().is_empty());
    assert_eq!(worker.stats().total_processed(), 0);
}

#[tokio::test]
async fn heartbeats_continue_while_draining_after_shutdown() {
    let rt = runtime();
    let id = rt
        .repository
        .submit(
            SubmitRequest::new("lengthy", "lengthy", "https://example.com/page")
                .with_config(json!({"timeout_seconds": 5}))
                .with_max_retries(0),
        )
        .await
        .unwrap();
    let monitor = HeartbeatMonitor::new(
        rt.registry.clone(),
        rt.repository.clone(),
        MonitorConfig::default().with_stale_threshold(Duration::from_millis(250)),
    );

    let worker = rt.worker();
    let (tx, rx) = shutdown_channel();
    let handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run(rx).await }
    });

    rt.wait_status(id, JobStatus::Running).await;
    let worker_id = worker.worker_id().unwrap();
    tx.send(true).unwrap();

    let before = rt.registry.get(&worker_id).await.unwrap().last_heartbeat;
    tokio::time::sleep(Duration::from_millis(400)).await;
    let after = rt.registry.get(&worker_id).await.unwrap().last_heartbeat;
    assert!(after > before, "heartbeat stopped while the job was in flight");

    // Longer than the stale threshold since shutdown, yet the worker is live.
    let report = monitor.run_cycle(Utc::now()).await.unwrap();
    assert_eq!(report.workers_marked_stale, 0);
    assert_eq!(report.reclaimed.total_released(), 0);
    assert_eq!(rt.repository.get(id).await.unwrap().status, JobStatus::Running);

    handle.await.unwrap().unwrap();
    let job = rt.repository.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 0);
    assert_eq!(job.result.unwrap()["items"], 5);

    let stats = worker.stats();
    assert_eq!(stats.jobs_completed, 1);
    assert_eq!(stats.ownership_lost, 0);
    assert!(rt.registry.list().await.unwrap().is_empty());
}
