//! Job record repository.
//!
//! All job state changes go through this type. Each transition is a single
//! optimistic read-modify-write on the job's key (`compare_and_swap`), and the
//! queue and per-worker job sets are updated around it in a fixed order:
//!
//! - assignment: record first, then add to the worker's job set
//! - release (complete / fail / reclaim): remove from the worker's job set
//!   first, then the record, then re-queue if the retry policy says so
//!
//! With that ordering a worker's job set only ever contains ids whose record
//! names that worker. Crashes between the steps leave either a record pointing
//! at a worker that no longer lists it, or a queued-state record without a
//! queue entry; the heartbeat monitor's reconciliation pass repairs both.
//!
//! Every job id is also listed in the index set of its current status. A
//! status change adds the id to the new set before removing it from the old
//! one, so an interrupted change leaves the id listed twice rather than not at
//! all. `jobs_with_status` moves such entries to the set the record agrees
//! with. Finished jobs are additionally bucketed by the day they finished,
//! which lets `prune_finished` drop expired records without reading the
//! ones it keeps.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::job::{CancelOutcome, FailureOutcome, Job, JobStatus, SubmitRequest};
use super::queue::PriorityQueue;
use crate::error::{JobError, StoreError};
use crate::store::{CoordinationStore, Keyspace};

/// Bound on optimistic retries for a single record update.
const MAX_UPDATE_ATTEMPTS: usize = 16;

/// Concurrent record reads when listing jobs.
const LIST_CONCURRENCY: usize = 16;

/// Format of the finished-day bucket names.
const DAY_FORMAT: &str = "%Y-%m-%d";

/// Per-status job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub total: usize,
    pub pending: usize,
    pub assigned: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub retrying: usize,
    pub cancelled: usize,
}

impl JobCounts {
    pub fn from_status_counts(entries: impl IntoIterator<Item = (JobStatus, usize)>) -> Self {
        let mut counts = Self::default();
        for (status, n) in entries {
            counts.total += n;
            let slot = match status {
                JobStatus::Pending => &mut counts.pending,
                JobStatus::Assigned => &mut counts.assigned,
                JobStatus::Running => &mut counts.running,
                JobStatus::Completed => &mut counts.completed,
                JobStatus::Failed => &mut counts.failed,
                JobStatus::Retrying => &mut counts.retrying,
                JobStatus::Cancelled => &mut counts.cancelled,
            };
            *slot += n;
        }
        counts
    }

    /// Jobs waiting for a worker (`pending` plus `retrying`).
    pub fn waiting(&self) -> usize {
        self.pending + self.retrying
    }

    /// Returns the count for a single status.
    pub fn get(&self, status: JobStatus) -> usize {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Assigned => self.assigned,
            JobStatus::Running => self.running,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Retrying => self.retrying,
            JobStatus::Cancelled => self.cancelled,
        }
    }
}

/// Result of reclaiming the jobs of one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    /// Jobs returned to the queue.
    pub requeued: usize,
    /// Jobs whose retry budget was exhausted by the reclaim.
    pub failed: usize,
    /// Listed ids that no longer belonged to the worker.
    pub skipped: usize,
}

impl ReclaimReport {
    pub fn merge(&mut self, other: ReclaimReport) {
        self.requeued += other.requeued;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }

    pub fn total_released(&self) -> usize {
        self.requeued + self.failed
    }
}

/// Typed accessor for job records, the queue and per-worker job sets.
#[derive(Clone)]
pub struct JobRepository {
    store: Arc<dyn CoordinationStore>,
    keys: Keyspace,
    queue: PriorityQueue,
}

impl JobRepository {
    pub fn new(store: Arc<dyn CoordinationStore>, keys: Keyspace) -> Self {
        let queue = PriorityQueue::new(Arc::clone(&store), &keys);
        Self { store, keys, queue }
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub fn keys(&self) -> &Keyspace {
        &self.keys
    }

    pub fn queue(&self) -> &PriorityQueue {
        &self.queue
    }

    /// Validates and stores a new `pending` job, then queues it.
    ///
    /// # Errors
    ///
    /// `JobError::Validation` before any write; store errors are propagated
    /// so the caller can retry the submission.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Uuid, JobError> {
        request.validate()?;

        let job = Job::from_request(request, Utc::now());
        let key = self.keys.job(job.id);
        let encoded = serde_json::to_string(&job).map_err(StoreError::from)?;

        if !self.store.compare_and_swap(&key, None, Some(&encoded)).await? {
            return Err(JobError::Validation(format!("job id {} already exists", job.id)));
        }
        self.index_status(&job, None).await?;
        self.queue.push(job.id, job.priority).await?;

        info!(
            job_id = %job.id,
            name = %job.name,
            priority = job.priority,
            "Job submitted"
        );
        Ok(job.id)
    }

    /// Loads a job record.
    pub async fn get(&self, job_id: Uuid) -> Result<Job, JobError> {
        let key = self.keys.job(job_id);
        let raw = self
            .store
            .get(&key)
            .await?
            .ok_or(JobError::NotFound(job_id))?;
        Ok(decode(&key, &raw)?)
    }

    /// Pops the highest-priority queued job.
    ///
    /// Entries whose record is gone or no longer in a queued state are
    /// discarded. Returns `None` when there is no work.
    pub async fn pop_next(&self) -> Result<Option<Job>, JobError> {
        while let Some(job_id) = self.queue.pop().await? {
            match self.get(job_id).await {
                Ok(job) if job.status.is_queued() => return Ok(Some(job)),
                Ok(job) => {
                    debug!(job_id = %job_id, status = %job.status, "Discarding stale queue entry");
                }
                Err(JobError::NotFound(_)) => {
                    warn!(job_id = %job_id, "Queue entry without job record");
                }
                // The record keeps its queued status, so reconciliation
                // re-queues it once the stale threshold has passed.
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// `pending|retrying -> assigned` and adds the job to the worker's set.
    pub async fn mark_assigned(&self, job_id: Uuid, worker_id: &str) -> Result<Job, JobError> {
        let (job, ()) = self
            .update(job_id, |job| job.assign(worker_id, Utc::now()))
            .await?;
        self.store
            .set_add(&self.keys.worker_jobs(worker_id), &job_id.to_string())
            .await?;
        Ok(job)
    }

    /// Pops the next job and assigns it to `worker_id`.
    ///
    /// Jobs that were cancelled or claimed between the pop and the assignment
    /// are skipped.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>, JobError> {
        while let Some(job) = self.pop_next().await? {
            match self.mark_assigned(job.id, worker_id).await {
                Ok(assigned) => {
                    debug!(worker_id = %worker_id, job_id = %job.id, "Job assigned");
                    return Ok(Some(assigned));
                }
                Err(JobError::InvalidTransition { .. }) | Err(JobError::NotFound(_)) => {
                    debug!(job_id = %job.id, "Job changed state before assignment, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// `assigned -> running`, only for the owning worker.
    pub async fn mark_running(&self, job_id: Uuid, worker_id: &str) -> Result<Job, JobError> {
        let (job, ()) = self
            .update(job_id, |job| job.start(worker_id, Utc::now()))
            .await?;
        Ok(job)
    }

    /// Records a successful extraction, only for the owning worker.
    pub async fn mark_completed(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<Job, JobError> {
        self.release_from_worker(job_id, worker_id).await?;
        let (job, ()) = self
            .update(job_id, |job| job.complete(worker_id, result.clone(), Utc::now()))
            .await?;
        info!(worker_id = %worker_id, job_id = %job_id, "Job completed");
        Ok(job)
    }

    /// Records a failed attempt, only for the owning worker.
    ///
    /// Re-queues the job with its original priority while the retry budget
    /// allows; otherwise the job ends terminally `failed`.
    pub async fn mark_failed(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
    ) -> Result<(Job, FailureOutcome), JobError> {
        self.release_from_worker(job_id, worker_id).await?;
        let (job, outcome) = self
            .update(job_id, |job| job.fail(worker_id, error, Utc::now()))
            .await?;
        self.after_failure(&job, outcome).await?;
        Ok((job, outcome))
    }

    /// Cancels a job that is still queued.
    ///
    /// Assigned and running jobs are left alone and run to completion or
    /// timeout.
    pub async fn cancel(&self, job_id: Uuid) -> Result<CancelOutcome, JobError> {
        match self.update(job_id, |job| job.cancel(Utc::now())).await {
            Ok(_) => {
                self.queue.remove(job_id).await?;
                info!(job_id = %job_id, "Job cancelled");
                Ok(CancelOutcome::Cancelled)
            }
            Err(JobError::InvalidTransition { from, .. }) if from.is_terminal() => {
                Ok(CancelOutcome::AlreadyFinished)
            }
            Err(JobError::InvalidTransition { .. }) => Ok(CancelOutcome::AlreadyAssigned),
            Err(e) => Err(e),
        }
    }

    /// Releases one job from a lost worker.
    ///
    /// Returns `None` when the job no longer belongs to `worker_id`, which
    /// makes repeated reclaims no-ops.
    pub async fn reclaim_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<FailureOutcome>, JobError> {
        self.release_from_worker(job_id, worker_id).await?;
        match self.update(job_id, |job| job.reclaim(worker_id, now)).await {
            Ok((job, outcome)) => {
                self.after_failure(&job, outcome).await?;
                Ok(Some(outcome))
            }
            Err(JobError::NotOwner { .. }) | Err(JobError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Releases every job listed in a worker's job set.
    pub async fn reclaim_worker_jobs(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ReclaimReport, JobError> {
        let set_key = self.keys.worker_jobs(worker_id);
        let mut report = ReclaimReport::default();

        for member in self.store.set_members(&set_key).await? {
            let Ok(job_id) = Uuid::parse_str(&member) else {
                warn!(worker_id = %worker_id, member = %member, "Dropping malformed job id");
                self.store.set_remove(&set_key, &member).await?;
                report.skipped += 1;
                continue;
            };

            match self.reclaim_job(job_id, worker_id, now).await? {
                Some(FailureOutcome::Requeued { .. }) => report.requeued += 1,
                Some(FailureOutcome::Exhausted) => report.failed += 1,
                None => report.skipped += 1,
            }
        }

        Ok(report)
    }

    /// Re-enqueues a queued-state job that lost its queue entry.
    ///
    /// Returns `false` if the job is no longer in a queued state or already
    /// has an entry.
    pub async fn requeue_orphan(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<bool, JobError> {
        let (job, queued) = self
            .update(job_id, |job| {
                if job.status.is_queued() {
                    job.touch(now);
                    Ok(true)
                } else {
                    Ok(false)
                }
            })
            .await?;
        if !queued {
            return Ok(false);
        }
        Ok(self.queue.push(job.id, job.priority).await?)
    }

    /// Ids currently listed in a worker's job set.
    pub async fn active_job_ids(&self, worker_id: &str) -> Result<Vec<Uuid>, JobError> {
        Ok(self
            .store
            .set_members(&self.keys.worker_jobs(worker_id))
            .await?
            .iter()
            .filter_map(|member| Uuid::parse_str(member).ok())
            .collect())
    }

    /// Loads the jobs listed in the index of `status`.
    ///
    /// Only that status's records are read. Index entries that disagree
    /// with their record are moved to the matching index, and entries whose
    /// record is gone are dropped; neither is returned.
    pub async fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<Job>, JobError> {
        let index = self.keys.jobs_with_status(status.as_str());
        let members = self.store.set_members(&index).await?;
        let listed: Vec<(String, Option<Job>)> = stream::iter(members)
            .map(|member| async move {
                let Ok(job_id) = Uuid::parse_str(&member) else {
                    return Ok::<_, JobError>((member, None));
                };
                match self.get(job_id).await {
                    Ok(job) => Ok((member, Some(job))),
                    Err(JobError::NotFound(_)) => Ok((member, None)),
                    Err(e) => Err(e),
                }
            })
            .buffer_unordered(LIST_CONCURRENCY)
            .try_collect()
            .await?;

        let mut jobs = Vec::with_capacity(listed.len());
        for (member, job) in listed {
            match job {
                Some(job) if job.status == status => jobs.push(job),
                Some(job) => {
                    debug!(
                        job_id = %job.id,
                        listed = %status,
                        status = %job.status,
                        "Moving job to its status index"
                    );
                    self.index_status(&job, Some(status)).await?;
                }
                None => {
                    warn!(member = %member, status = %status, "Dropping index entry without job record");
                    self.store.set_remove(&index, &member).await?;
                }
            }
        }
        Ok(jobs)
    }

    /// Counts jobs by status from the index sizes.
    ///
    /// A job whose status change is in flight may be counted under both
    /// statuses until the change completes.
    pub async fn status_counts(&self) -> Result<JobCounts, JobError> {
        let mut entries = Vec::with_capacity(JobStatus::ALL.len());
        for status in JobStatus::ALL {
            let n = self
                .store
                .set_len(&self.keys.jobs_with_status(status.as_str()))
                .await?;
            entries.push((status, n));
        }
        Ok(JobCounts::from_status_counts(entries))
    }

    /// Number of job records currently kept.
    pub async fn total_jobs(&self) -> Result<usize, JobError> {
        Ok(self.status_counts().await?.total)
    }

    /// Deletes finished jobs older than `retention`.
    ///
    /// Works a whole day bucket at a time: only buckets for days entirely
    /// before `now - retention` are opened, so retained records are never
    /// read. Returns the number of records deleted.
    pub async fn prune_finished(
        &self,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, JobError> {
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
        else {
            return Ok(0);
        };
        let cutoff_day = cutoff.date_naive();
        let days_key = self.keys.finished_days();
        let mut pruned = 0;

        for day in self.store.set_members(&days_key).await? {
            match NaiveDate::parse_from_str(&day, DAY_FORMAT) {
                Ok(date) if date >= cutoff_day => continue,
                Ok(_) => {}
                Err(_) => {
                    warn!(day = %day, "Dropping malformed finished-day entry");
                    self.store.set_remove(&days_key, &day).await?;
                    continue;
                }
            }

            let bucket = self.keys.finished_on(&day);
            for member in self.store.set_members(&bucket).await? {
                if let Ok(job_id) = Uuid::parse_str(&member) {
                    if self.delete_finished(job_id).await? {
                        pruned += 1;
                    }
                }
                self.store.set_remove(&bucket, &member).await?;
            }
            if self.store.set_len(&bucket).await? == 0 {
                self.store.set_remove(&days_key, &day).await?;
            }
        }

        if pruned > 0 {
            info!(pruned = pruned, retention_secs = retention.as_secs(), "Pruned finished jobs");
        }
        Ok(pruned)
    }

    /// Deletes a terminal record and its index entry.
    async fn delete_finished(&self, job_id: Uuid) -> Result<bool, JobError> {
        let key = self.keys.job(job_id);
        let member = job_id.to_string();
        let Some(raw) = self.store.get(&key).await? else {
            for status in JobStatus::ALL.into_iter().filter(JobStatus::is_terminal) {
                self.store
                    .set_remove(&self.keys.jobs_with_status(status.as_str()), &member)
                    .await?;
            }
            return Ok(false);
        };
        let job = match decode(&key, &raw) {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Skipping unreadable finished job");
                return Ok(false);
            }
        };
        if !job.status.is_terminal() {
            return Ok(false);
        }
        if !self.store.compare_and_swap(&key, Some(&raw), None).await? {
            return Ok(false);
        }
        self.store
            .set_remove(&self.keys.jobs_with_status(job.status.as_str()), &member)
            .await?;
        Ok(true)
    }

    /// Lists the job under its current status, then unlists it from
    /// `previous`.
    async fn index_status(&self, job: &Job, previous: Option<JobStatus>) -> Result<(), StoreError> {
        let member = job.id.to_string();
        self.store
            .set_add(&self.keys.jobs_with_status(job.status.as_str()), &member)
            .await?;
        if job.status.is_terminal() {
            let day = job
                .completed_at
                .unwrap_or(job.updated_at)
                .format(DAY_FORMAT)
                .to_string();
            self.store.set_add(&self.keys.finished_days(), &day).await?;
            self.store
                .set_add(&self.keys.finished_on(&day), &member)
                .await?;
        }
        if let Some(previous) = previous.filter(|previous| *previous != job.status) {
            self.store
                .set_remove(&self.keys.jobs_with_status(previous.as_str()), &member)
                .await?;
        }
        Ok(())
    }

    async fn release_from_worker(&self, job_id: Uuid, worker_id: &str) -> Result<(), JobError> {
        self.store
            .set_remove(&self.keys.worker_jobs(worker_id), &job_id.to_string())
            .await?;
        Ok(())
    }

    async fn after_failure(&self, job: &Job, outcome: FailureOutcome) -> Result<(), JobError> {
        match outcome {
            FailureOutcome::Requeued { retry_count } => {
                self.queue.push(job.id, job.priority).await?;
                warn!(
                    job_id = %job.id,
                    retry_count = retry_count,
                    max_retries = job.max_retries,
                    error = ?job.error,
                    "Job failed, requeued for retry"
                );
            }
            FailureOutcome::Exhausted => {
                warn!(
                    job_id = %job.id,
                    max_retries = job.max_retries,
                    error = ?job.error,
                    "Job failed, retry budget exhausted"
                );
            }
        }
        Ok(())
    }

    /// Applies `apply` to the current record and writes it back atomically,
    /// then moves the job between status indexes if its status changed.
    ///
    /// On a concurrent write the record is re-read and `apply` runs again.
    /// Errors returned by `apply` abort without writing.
    async fn update<T, F>(&self, job_id: Uuid, mut apply: F) -> Result<(Job, T), JobError>
    where
        F: FnMut(&mut Job) -> Result<T, JobError> + Send,
        T: Send,
    {
        let key = self.keys.job(job_id);

        for attempt in 0..MAX_UPDATE_ATTEMPTS {
            let raw = self
                .store
                .get(&key)
                .await?
                .ok_or(JobError::NotFound(job_id))?;
            let mut job = decode(&key, &raw)?;
            let previous = job.status;
            let output = apply(&mut job)?;
            let encoded = serde_json::to_string(&job).map_err(StoreError::from)?;

            if self
                .store
                .compare_and_swap(&key, Some(&raw), Some(&encoded))
                .await?
            {
                if job.status != previous {
                    self.index_status(&job, Some(previous)).await?;
                }
                return Ok((job, output));
            }
            debug!(job_id = %job_id, attempt = attempt + 1, "Concurrent job update, retrying");
        }

        Err(StoreError::Contention(key).into())
    }
}

fn decode(key: &str, raw: &str) -> Result<Job, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn repository() -> JobRepository {
        JobRepository::new(Arc::new(MemoryStore::new()), Keyspace::new("test"))
    }

    fn request(name: &str, priority: i32) -> SubmitRequest {
        SubmitRequest::new(name, "tpl", "https://example.com/page").with_priority(priority)
    }

    #[tokio::test]
    async fn test_submit_writes_pending_record_and_queue_entry() {
        let repo = repository();
        let id = repo.submit(request("a", 4)).await.unwrap();

        let job = repo.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(repo.queue().contains(id).await.unwrap());
        assert_eq!(repo.total_jobs().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalid_submission_writes_nothing() {
        let repo = repository();
        let err = repo
            .submit(SubmitRequest::new("", "tpl", "https://example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
        assert_eq!(repo.total_jobs().await.unwrap(), 0);
        assert!(repo.queue().is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_get_unknown_job() {
        let repo = repository();
        let id = Uuid::new_v4();
        assert!(matches!(repo.get(id).await, Err(JobError::NotFound(x)) if x == id));
    }

    #[tokio::test]
    async fn test_pop_next_on_empty_queue() {
        let repo = repository();
        assert!(repo.pop_next().await.unwrap().is_none());
        assert!(repo.claim_next("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_tracks_worker_set() {
        let repo = repository();
        let id = repo.submit(request("a", 0)).await.unwrap();

        let job = repo.claim_next("w1").await.unwrap().expect("job");
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Assigned);
        assert_eq!(repo.active_job_ids("w1").await.unwrap(), vec![id]);
        assert!(!repo.queue().contains(id).await.unwrap());

        repo.mark_running(id, "w1").await.unwrap();
        let done = repo
            .mark_completed(id, "w1", serde_json::json!({"rows": 2}))
            .await
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(repo.active_job_ids("w1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_failed_requeues_with_same_priority() {
        let repo = repository();
        let id = repo.submit(request("a", 9)).await.unwrap();
        repo.claim_next("w1").await.unwrap();
        repo.mark_running(id, "w1").await.unwrap();

        let (job, outcome) = repo.mark_failed(id, "w1", "HTTP 503").await.unwrap();
        assert_eq!(outcome, FailureOutcome::Requeued { retry_count: 1 });
        assert_eq!(job.status, JobStatus::Retrying);
        assert!(job.assigned_worker.is_none());

        let entries = repo.queue().peek(1).await.unwrap();
        assert_eq!(entries[0].job_id, id);
        assert_eq!(entries[0].priority, 9);
        assert!(repo.active_job_ids("w1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_owner_cannot_report() {
        let repo = repository();
        let id = repo.submit(request("a", 0)).await.unwrap();
        repo.claim_next("w1").await.unwrap();

        repo.reclaim_job(id, "w1", Utc::now()).await.unwrap();
        let err = repo
            .mark_completed(id, "w1", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::NotOwner { .. }));
        assert_eq!(repo.get(id).await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_cancel_outcomes() {
        let repo = repository();
        let queued = repo.submit(request("queued", 0)).await.unwrap();
        assert_eq!(repo.cancel(queued).await.unwrap(), CancelOutcome::Cancelled);
        assert!(!repo.queue().contains(queued).await.unwrap());
        assert_eq!(
            repo.cancel(queued).await.unwrap(),
            CancelOutcome::AlreadyFinished
        );

        let taken = repo.submit(request("taken", 0)).await.unwrap();
        repo.claim_next("w1").await.unwrap();
        assert_eq!(
            repo.cancel(taken).await.unwrap(),
            CancelOutcome::AlreadyAssigned
        );

        assert!(matches!(
            repo.cancel(Uuid::new_v4()).await,
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_requeue_orphan() {
        let repo = repository();
        let id = repo.submit(request("a", 2)).await.unwrap();
        // Simulate a claimer that died between pop and assignment.
        repo.queue().pop().await.unwrap();

        assert!(repo.requeue_orphan(id, Utc::now()).await.unwrap());
        assert!(repo.queue().contains(id).await.unwrap());
        assert!(!repo.requeue_orphan(id, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_transitions_move_status_index() {
        let repo = repository();
        let id = repo.submit(request("a", 0)).await.unwrap();
        let listed = |status: JobStatus| {
            let repo = repo.clone();
            async move {
                repo.store()
                    .set_members(&repo.keys().jobs_with_status(status.as_str()))
                    .await
                    .unwrap()
            }
        };
        assert_eq!(listed(JobStatus::Pending).await, vec![id.to_string()]);

        repo.claim_next("w1").await.unwrap();
        repo.mark_running(id, "w1").await.unwrap();
        assert!(listed(JobStatus::Pending).await.is_empty());
        assert!(listed(JobStatus::Assigned).await.is_empty());
        assert_eq!(listed(JobStatus::Running).await, vec![id.to_string()]);

        let done = repo
            .mark_completed(id, "w1", serde_json::Value::Null)
            .await
            .unwrap();
        assert!(listed(JobStatus::Running).await.is_empty());
        assert_eq!(listed(JobStatus::Completed).await, vec![id.to_string()]);

        let day = done.completed_at.unwrap().format(DAY_FORMAT).to_string();
        let days = repo.store().set_members(&repo.keys().finished_days()).await.unwrap();
        assert_eq!(days, vec![day.clone()]);
        let bucket = repo.store().set_members(&repo.keys().finished_on(&day)).await.unwrap();
        assert_eq!(bucket, vec![id.to_string()]);
    }

    #[tokio::test]
    async fn test_jobs_with_status_repairs_index() {
        let repo = repository();
        let id = repo.submit(request("a", 0)).await.unwrap();
        let running = repo.keys().jobs_with_status("running");
        // Left behind by an interrupted status change.
        repo.store().set_add(&running, &id.to_string()).await.unwrap();
        repo.store()
            .set_add(&running, &Uuid::new_v4().to_string())
            .await
            .unwrap();

        assert!(repo.jobs_with_status(JobStatus::Running).await.unwrap().is_empty());
        assert_eq!(repo.store().set_len(&running).await.unwrap(), 0);

        let pending = repo.jobs_with_status(JobStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
    }

    #[tokio::test]
    async fn test_prune_finished_keeps_recent_and_live_jobs() {
        let repo = repository();
        let done = repo.submit(request("done", 0)).await.unwrap();
        repo.claim_next("w1").await.unwrap();
        repo.mark_running(done, "w1").await.unwrap();
        repo.mark_completed(done, "w1", serde_json::Value::Null)
            .await
            .unwrap();
        let cancelled = repo.submit(request("cancelled", 0)).await.unwrap();
        repo.cancel(cancelled).await.unwrap();
        let live = repo.submit(request("live", 0)).await.unwrap();

        let retention = Duration::from_secs(7 * 24 * 60 * 60);
        assert_eq!(repo.prune_finished(retention, Utc::now()).await.unwrap(), 0);
        assert!(repo.get(done).await.is_ok());

        let later = Utc::now() + chrono::Duration::days(9);
        assert_eq!(repo.prune_finished(retention, later).await.unwrap(), 2);
        assert!(matches!(repo.get(done).await, Err(JobError::NotFound(_))));
        assert!(matches!(repo.get(cancelled).await, Err(JobError::NotFound(_))));
        assert_eq!(repo.get(live).await.unwrap().status, JobStatus::Pending);

        let counts = repo.status_counts().await.unwrap();
        assert_eq!(counts.total, 1);
        assert_eq!(counts.completed, 0);
        assert_eq!(counts.cancelled, 0);
        assert_eq!(repo.store().set_len(&repo.keys().finished_days()).await.unwrap(), 0);
        assert_eq!(repo.prune_finished(retention, later).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_status_counts() {
        let repo = repository();
        repo.submit(request("a", 0)).await.unwrap();
        repo.submit(request("b", 0)).await.unwrap();
        let c = repo.submit(request("c", 5)).await.unwrap();
        repo.claim_next("w1").await.unwrap();
        repo.mark_running(c, "w1").await.unwrap();

        let counts = repo.status_counts().await.unwrap();
        assert_eq!(counts.total, 3);
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.running, 1);
        assert_eq!(counts.get(JobStatus::Running), 1);
    }
}
