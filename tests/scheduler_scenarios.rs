//! End-to-end queue, reclaim and cancellation scenarios against the
//! in-memory coordination store.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use crawlfleet::error::{JobError, StoreError};
use crawlfleet::scheduler::{
    CancelOutcome, FailureOutcome, HeartbeatMonitor, JobRepository, JobService, JobStatus,
    MonitorConfig, SubmitRequest, WorkerRegistry, WorkerStatus,
};
use crawlfleet::store::{CoordinationStore, Keyspace, MemoryStore};
use uuid::Uuid;

/// In-memory store that remembers every key read with `get`.
#[derive(Default)]
struct ReadTrackingStore {
    inner: MemoryStore,
    reads: Mutex<Vec<String>>,
}

impl ReadTrackingStore {
    fn take_reads(&self) -> Vec<String> {
        std::mem::take(&mut *self.reads.lock().unwrap())
    }
}

#[async_trait]
impl CoordinationStore for ReadTrackingStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.reads.lock().unwrap().push(key.to_string());
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.delete(key).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool, StoreError> {
        self.inner.compare_and_swap(key, expected, new).await
    }

    async fn queue_push(&self, queue: &str, member: &str, priority: i32) -> Result<bool, StoreError> {
        self.inner.queue_push(queue, member, priority).await
    }

    async fn queue_pop(&self, queue: &str) -> Result<Option<String>, StoreError> {
        self.inner.queue_pop(queue).await
    }

    async fn queue_remove(&self, queue: &str, member: &str) -> Result<bool, StoreError> {
        self.inner.queue_remove(queue, member).await
    }

    async fn queue_contains(&self, queue: &str, member: &str) -> Result<bool, StoreError> {
        self.inner.queue_contains(queue, member).await
    }

    async fn queue_len(&self, queue: &str) -> Result<usize, StoreError> {
        self.inner.queue_len(queue).await
    }

    async fn queue_peek(&self, queue: &str, limit: usize) -> Result<Vec<(String, i32)>, StoreError> {
        self.inner.queue_peek(queue, limit).await
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.inner.set_add(key, member).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.inner.set_remove(key, member).await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.inner.set_members(key).await
    }

    async fn set_len(&self, key: &str) -> Result<usize, StoreError> {
        self.inner.set_len(key).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    repository: JobRepository,
    registry: WorkerRegistry,
    monitor: HeartbeatMonitor,
    service: JobService,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let keys = Keyspace::new("it");
    let repository = JobRepository::new(store.clone(), keys.clone());
    let registry = WorkerRegistry::new(store.clone(), keys);
    let monitor = HeartbeatMonitor::new(
        registry.clone(),
        repository.clone(),
        MonitorConfig::default(),
    );
    let service = JobService::new(repository.clone(), registry.clone());
    Harness {
        store,
        repository,
        registry,
        monitor,
        service,
    }
}

fn request(name: &str) -> SubmitRequest {
    SubmitRequest::new(name, "tpl-articles", format!("https://example.com/{}", name))
}

/// Every job is queued, held by exactly its owner, or terminal.
async fn assert_no_job_lost(h: &Harness, ids: &[Uuid]) {
    for id in ids {
        let job = h.repository.get(*id).await.unwrap();
        match job.status {
            JobStatus::Pending | JobStatus::Retrying => {
                assert!(h.repository.queue().contains(*id).await.unwrap(), "{} not queued", id);
                assert!(job.assigned_worker.is_none());
            }
            JobStatus::Assigned | JobStatus::Running => {
                let owner = job.assigned_worker.clone().unwrap();
                assert!(h.repository.active_job_ids(&owner).await.unwrap().contains(id));
                assert!(!h.repository.queue().contains(*id).await.unwrap());
            }
            _ => {
                assert!(job.status.is_terminal());
                assert!(job.assigned_worker.is_none());
                assert!(!h.repository.queue().contains(*id).await.unwrap());
            }
        }
    }
}

#[tokio::test]
async fn priorities_dequeue_highest_first() {
    let h = harness();
    let low = h.service.submit(request("low").with_priority(1)).await.unwrap();
    let high = h.service.submit(request("high").with_priority(10)).await.unwrap();
    let mid = h.service.submit(request("mid").with_priority(5)).await.unwrap();

    let mut order = Vec::new();
    while let Some(job) = h.repository.pop_next().await.unwrap() {
        order.push(job.id);
    }
    assert_eq!(order, vec![high, mid, low]);
}

#[tokio::test]
async fn equal_priorities_dequeue_in_submission_order() {
    let h = harness();
    let mut submitted = Vec::new();
    for i in 0..5 {
        submitted.push(h.service.submit(request(&format!("job{}", i))).await.unwrap());
    }

    let mut order = Vec::new();
    while let Some(job) = h.repository.pop_next().await.unwrap() {
        order.push(job.id);
    }
    assert_eq!(order, submitted);
}

#[tokio::test]
async fn retry_budget_is_enforced() {
    let h = harness();
    let worker = h.registry.register("w").await.unwrap();
    let id = h
        .service
        .submit(request("flaky").with_max_retries(3))
        .await
        .unwrap();

    for attempt in 1..=4u32 {
        let job = h.repository.claim_next(&worker.id).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        h.repository.mark_running(id, &worker.id).await.unwrap();
        let (job, outcome) = h
            .repository
            .mark_failed(id, &worker.id, "HTTP 503")
            .await
            .unwrap();

        if attempt <= 3 {
            assert_eq!(outcome, FailureOutcome::Requeued { retry_count: attempt });
            assert_eq!(job.status, JobStatus::Retrying);
        } else {
            assert_eq!(outcome, FailureOutcome::Exhausted);
            assert_eq!(job.status, JobStatus::Failed);
        }
    }

    assert!(h.repository.claim_next(&worker.id).await.unwrap().is_none());
    let job = h.service.get_status(id).await.unwrap();
    assert_eq!(job.retry_count, 3);
    assert_eq!(job.error.as_deref(), Some("HTTP 503"));
    assert_no_job_lost(&h, &[id]).await;
}

#[tokio::test]
async fn stale_worker_jobs_return_to_the_queue() {
    let h = harness();
    let worker = h.registry.register("crashed").await.unwrap();
    let a = h.service.submit(request("a")).await.unwrap();
    let b = h.service.submit(request("b")).await.unwrap();
    h.repository.claim_next(&worker.id).await.unwrap();
    h.repository.claim_next(&worker.id).await.unwrap();
    h.repository.mark_running(a, &worker.id).await.unwrap();
    assert_eq!(h.repository.active_job_ids(&worker.id).await.unwrap().len(), 2);

    let later = worker.last_heartbeat + ChronoDuration::seconds(121);
    let report = h.monitor.run_cycle(later).await.unwrap();
    assert_eq!(report.workers_marked_stale, 1);
    assert_eq!(report.reclaimed.requeued, 2);

    for id in [a, b] {
        let job = h.service.get_status(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.assigned_worker.is_none());
    }
    let record = h.registry.get(&worker.id).await.unwrap();
    assert_eq!(record.status, WorkerStatus::Stale);
    assert!(h.repository.active_job_ids(&worker.id).await.unwrap().is_empty());
    assert_no_job_lost(&h, &[a, b]).await;
}

#[tokio::test]
async fn reclaim_twice_changes_nothing() {
    let h = harness();
    let worker = h.registry.register("crashed").await.unwrap();
    let ids = [
        h.service.submit(request("a")).await.unwrap(),
        h.service.submit(request("b")).await.unwrap(),
    ];
    h.repository.claim_next(&worker.id).await.unwrap();
    h.repository.claim_next(&worker.id).await.unwrap();

    let later = worker.last_heartbeat + ChronoDuration::seconds(300);
    h.monitor.run_cycle(later).await.unwrap();
    let mut first = Vec::new();
    for id in ids {
        first.push(h.repository.get(id).await.unwrap());
    }
    let depth = h.repository.queue().len().await.unwrap();

    let again = h.repository.reclaim_worker_jobs(&worker.id, later).await.unwrap();
    assert_eq!(again.total_released(), 0);
    let report = h.monitor.run_cycle(later).await.unwrap();
    assert!(report.is_quiet());

    assert_eq!(h.repository.queue().len().await.unwrap(), depth);
    for (id, before) in ids.iter().zip(first) {
        assert_eq!(h.repository.get(*id).await.unwrap(), before);
    }
}

#[tokio::test]
async fn cancel_only_affects_queued_jobs() {
    let h = harness();
    let worker = h.registry.register("w").await.unwrap();
    let running = h.service.submit(request("running")).await.unwrap();
    let queued = h.service.submit(request("queued")).await.unwrap();
    h.repository.claim_next(&worker.id).await.unwrap();

    assert_eq!(h.service.cancel(queued).await.unwrap(), CancelOutcome::Cancelled);
    assert_eq!(
        h.service.get_status(queued).await.unwrap().status,
        JobStatus::Cancelled
    );
    assert!(!h.repository.queue().contains(queued).await.unwrap());

    assert_eq!(
        h.service.cancel(running).await.unwrap(),
        CancelOutcome::AlreadyAssigned
    );
    h.repository.mark_running(running, &worker.id).await.unwrap();
    let job = h
        .repository
        .mark_completed(running, &worker.id, serde_json::json!({"items": 3}))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    assert_eq!(
        h.service.cancel(running).await.unwrap(),
        CancelOutcome::AlreadyFinished
    );
    assert!(h.service.cancel(Uuid::new_v4()).await.is_err());
    assert_no_job_lost(&h, &[running, queued]).await;
}

#[tokio::test]
async fn concurrent_claims_assign_each_job_once() {
    let h = harness();
    let mut ids = Vec::new();
    for i in 0..40 {
        ids.push(h.service.submit(request(&format!("job{}", i))).await.unwrap());
    }

    let mut handles = Vec::new();
    for n in 0..8 {
        let repository = h.repository.clone();
        let registry = h.registry.clone();
        handles.push(tokio::spawn(async move {
            let worker = registry.register(&format!("w{}", n)).await.unwrap();
            let mut claimed = Vec::new();
            while let Some(job) = repository.claim_next(&worker.id).await.unwrap() {
                assert_eq!(job.assigned_worker.as_deref(), Some(worker.id.as_str()));
                claimed.push(job.id);
                tokio::task::yield_now().await;
            }
            (worker.id, claimed)
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        let (worker_id, claimed) = handle.await.unwrap();
        let held: HashSet<Uuid> = h
            .repository
            .active_job_ids(&worker_id)
            .await
            .unwrap()
            .into_iter()
            .collect();
        assert_eq!(held, claimed.iter().copied().collect());
        for id in claimed {
            assert!(seen.insert(id), "job {} claimed twice", id);
        }
    }
    assert_eq!(seen.len(), ids.len());
    assert_no_job_lost(&h, &ids).await;
}

#[tokio::test]
async fn crashes_within_budget_never_lose_jobs() {
    let h = harness();
    let mut ids = Vec::new();
    for i in 0..6 {
        ids.push(
            h.service
                .submit(request(&format!("job{}", i)).with_max_retries(1))
                .await
                .unwrap(),
        );
    }

    // Two workers crash holding everything they claimed.
    for name in ["first", "second"] {
        let worker = h.registry.register(name).await.unwrap();
        for _ in 0..3 {
            h.repository.claim_next(&worker.id).await.unwrap();
        }
        assert_no_job_lost(&h, &ids).await;

        let later = worker.last_heartbeat + ChronoDuration::seconds(200);
        h.monitor.run_cycle(later).await.unwrap();
        assert_no_job_lost(&h, &ids).await;
    }

    // A healthy worker drains the rest.
    let worker = h.registry.register("healthy").await.unwrap();
    while let Some(job) = h.repository.claim_next(&worker.id).await.unwrap() {
        h.repository.mark_running(job.id, &worker.id).await.unwrap();
        h.repository
            .mark_completed(job.id, &worker.id, serde_json::json!({}))
            .await
            .unwrap();
    }

    for id in &ids {
        let job = h.repository.get(*id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed, "job {}", id);
    }
    let stats = h.service.queue_stats().await.unwrap();
    assert_eq!(stats.pending_jobs, 0);
    assert_eq!(stats.total_jobs, 6);
}

#[tokio::test]
async fn reclaim_past_budget_fails_the_job() {
    let h = harness();
    let id = h
        .service
        .submit(request("fragile").with_max_retries(0))
        .await
        .unwrap();
    let worker = h.registry.register("w").await.unwrap();
    h.repository.claim_next(&worker.id).await.unwrap();

    let report = h
        .monitor
        .run_cycle(worker.last_heartbeat + ChronoDuration::seconds(121))
        .await
        .unwrap();
    assert_eq!(report.reclaimed.failed, 1);
    assert_eq!(h.repository.get(id).await.unwrap().status, JobStatus::Failed);
    assert_no_job_lost(&h, &[id]).await;
}

#[tokio::test]
async fn store_outage_surfaces_as_errors() {
    let h = harness();
    h.store.set_available(false);
    let err = h.service.submit(request("a")).await.unwrap_err();
    assert!(err.is_transient());
    assert!(h.service.queue_stats().await.is_err());

    h.store.set_available(true);
    let id = h.service.submit(request("a")).await.unwrap();
    assert_eq!(h.service.queue_stats().await.unwrap().pending_jobs, 1);
    assert_no_job_lost(&h, &[id]).await;
}

#[tokio::test]
async fn monitor_cycle_skips_finished_records() {
    let store = Arc::new(ReadTrackingStore::default());
    let keys = Keyspace::new("it");
    let repository = JobRepository::new(store.clone(), keys.clone());
    let registry = WorkerRegistry::new(store.clone(), keys.clone());
    let monitor = HeartbeatMonitor::new(
        registry.clone(),
        repository.clone(),
        MonitorConfig::default(),
    );

    let worker = registry.register("w").await.unwrap();
    let mut finished = Vec::new();
    for i in 0..5 {
        let id = repository.submit(request(&format!("done{}", i))).await.unwrap();
        repository.claim_next(&worker.id).await.unwrap();
        repository.mark_running(id, &worker.id).await.unwrap();
        repository
            .mark_completed(id, &worker.id, serde_json::json!({}))
            .await
            .unwrap();
        finished.push(id);
    }
    let cancelled = repository.submit(request("cancelled")).await.unwrap();
    repository.cancel(cancelled).await.unwrap();
    finished.push(cancelled);
    let waiting = repository.submit(request("waiting")).await.unwrap();

    store.take_reads();
    let report = monitor.run_cycle(Utc::now()).await.unwrap();
    assert!(report.is_quiet());

    let reads = store.take_reads();
    for id in &finished {
        assert!(!reads.contains(&keys.job(id)), "finished job {} was read", id);
    }
    assert!(reads.contains(&keys.job(waiting)));

    let counts = repository.status_counts().await.unwrap();
    assert_eq!(counts.completed, 5);
    assert_eq!(counts.cancelled, 1);
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.total, 7);
}

#[tokio::test]
async fn finished_jobs_expire_after_retention() {
    let h = harness();
    let worker = h.registry.register("w").await.unwrap();
    let done = h.service.submit(request("done")).await.unwrap();
    h.repository.claim_next(&worker.id).await.unwrap();
    h.repository.mark_running(done, &worker.id).await.unwrap();
    h.repository
        .mark_completed(done, &worker.id, serde_json::json!({}))
        .await
        .unwrap();
    let waiting = h.service.submit(request("waiting")).await.unwrap();

    let report = h.monitor.run_cycle(Utc::now()).await.unwrap();
    assert_eq!(report.jobs_pruned, 0);

    let later = Utc::now() + ChronoDuration::days(8);
    let report = h.monitor.run_cycle(later).await.unwrap();
    assert_eq!(report.jobs_pruned, 1);
    assert!(matches!(
        h.service.get_status(done).await,
        Err(JobError::NotFound(_))
    ));
    assert_eq!(h.service.get_status(waiting).await.unwrap().status, JobStatus::Pending);

    let stats = h.service.queue_stats().await.unwrap();
    assert_eq!(stats.total_jobs, 1);
    assert_eq!(stats.pending_jobs, 1);
    assert_no_job_lost(&h, &[waiting]).await;
}
