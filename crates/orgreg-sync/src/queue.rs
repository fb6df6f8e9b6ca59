//! Job queue seam plus the in-process tokio implementation used by the CLI and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use orgreg_storage::BackoffPolicy;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::job::{
    BatchCallbacks, BatchId, BatchStatus, Continuation, Job, JobContext, JobOutcome, PendingBatch,
};

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn dispatch(&self, job: Job) -> Result<(), PipelineError>;
    async fn dispatch_after(&self, job: Job, delay: Duration) -> Result<(), PipelineError>;
    async fn dispatch_batch(&self, batch: PendingBatch) -> Result<BatchId, PipelineError>;
    async fn batch_status(&self, id: BatchId) -> Result<Option<BatchStatus>, PipelineError>;
    async fn cancel_batch(&self, id: BatchId) -> Result<(), PipelineError>;
}

/// Executes jobs and the continuations of the batches they belong to.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job, ctx: &JobContext) -> Result<JobOutcome, PipelineError>;

    async fn resume(
        &self,
        continuation: &Continuation,
        batch: &BatchStatus,
        ctx: &JobContext,
    ) -> Result<(), PipelineError>;
}

#[derive(Debug, Clone, Copy)]
pub struct QueuePolicy {
    pub concurrency: usize,
    /// Delay and bound for re-running failed jobs; released runs are not counted.
    pub backoff: BackoffPolicy,
    /// How long a finished batch stays readable through `batch_status`.
    pub finished_batch_retention: Duration,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            concurrency: 8,
            backoff: BackoffPolicy::default(),
            finished_batch_retention: Duration::from_secs(60 * 60),
        }
    }
}

struct BatchRecord {
    name: String,
    total_jobs: usize,
    pending_jobs: usize,
    failed_jobs: usize,
    cancelled: bool,
    finished_at: Option<Instant>,
    callbacks: BatchCallbacks,
}

impl BatchRecord {
    fn status(&self, id: BatchId) -> BatchStatus {
        BatchStatus {
            id,
            name: self.name.clone(),
            total_jobs: self.total_jobs,
            pending_jobs: self.pending_jobs,
            failed_jobs: self.failed_jobs,
            cancelled: self.cancelled,
            finished: self.finished_at.is_some(),
        }
    }
}

struct Inner {
    handler: Arc<dyn JobHandler>,
    policy: QueuePolicy,
    permits: Semaphore,
    batches: Mutex<HashMap<BatchId, BatchRecord>>,
    in_flight: AtomicUsize,
    idle: Notify,
}

#[derive(Clone)]
pub struct LocalQueue {
    inner: Arc<Inner>,
}

impl LocalQueue {
    pub fn new(handler: Arc<dyn JobHandler>, policy: QueuePolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                handler,
                policy,
                permits: Semaphore::new(policy.concurrency.max(1)),
                batches: Mutex::new(HashMap::new()),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Resolves once no job, delayed job or continuation is left to run.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn context(&self, batch_id: Option<BatchId>, attempt: u32) -> JobContext {
        JobContext {
            queue: Arc::new(self.clone()),
            batch_id,
            attempt,
        }
    }

    fn with_batches<T>(&self, f: impl FnOnce(&mut HashMap<BatchId, BatchRecord>) -> T) -> T {
        let mut batches = self
            .inner
            .batches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut batches)
    }

    fn spawn(&self, job: Job, batch_id: Option<BatchId>, delay: Option<Duration>) {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let queue = self.clone();
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            queue.run(job, batch_id).await;
            queue.task_done();
        });
    }

    fn task_done(&self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }

    async fn run(&self, job: Job, batch_id: Option<BatchId>) {
        let mut attempt = 1u32;
        let mut failures = 0u32;
        loop {
            let ctx = self.context(batch_id, attempt);
            let result = {
                let Ok(_permit) = self.inner.permits.acquire().await else {
                    return;
                };
                let budget = job.timeout();
                match tokio::time::timeout(budget, self.inner.handler.handle(&job, &ctx)).await {
                    Ok(result) => result,
                    Err(_) => Err(PipelineError::Timeout {
                        job: job.name(),
                        budget,
                    }),
                }
            };

            match result {
                Ok(JobOutcome::Released { delay }) => {
                    debug!(job = job.name(), attempt, ?delay, "job released back to queue");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Ok(outcome) => {
                    debug!(job = job.name(), attempt, ?outcome, "job finished");
                    self.finish_job(batch_id, true).await;
                    return;
                }
                Err(err) => {
                    failures += 1;
                    let timed_out = matches!(err, PipelineError::Timeout { .. });
                    let retry = err.is_retryable()
                        && !(timed_out && job.fail_on_timeout())
                        && self.inner.policy.backoff.allows_retry(failures as usize);
                    if retry {
                        let delay = self
                            .inner
                            .policy
                            .backoff
                            .delay_for_attempt(failures.saturating_sub(1) as usize);
                        warn!(job = job.name(), attempt, error = %err, ?delay, "job failed; retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    error!(job = job.name(), attempt, error = %err, "job failed");
                    self.finish_job(batch_id, false).await;
                    return;
                }
            }
        }
    }

    /// Record a finished batch job; the job that empties the batch runs its continuations.
    async fn finish_job(&self, batch_id: Option<BatchId>, succeeded: bool) {
        let Some(id) = batch_id else {
            return;
        };
        let completed = self.with_batches(|batches| {
            let record = batches.get_mut(&id)?;
            record.pending_jobs = record.pending_jobs.saturating_sub(1);
            if !succeeded {
                record.failed_jobs += 1;
                record.cancelled = true;
            }
            if record.pending_jobs > 0 || record.finished_at.is_some() {
                return None;
            }
            record.finished_at = Some(Instant::now());
            Some((record.status(id), std::mem::take(&mut record.callbacks)))
        });

        if let Some((status, callbacks)) = completed {
            self.complete_batch(status, callbacks).await;
        }
    }

    async fn complete_batch(&self, status: BatchStatus, callbacks: BatchCallbacks) {
        info!(
            batch = %status.id,
            name = %status.name,
            total = status.total_jobs,
            failed = status.failed_jobs,
            cancelled = status.cancelled,
            "batch finished"
        );
        let ctx = self.context(Some(status.id), 1);
        let mut failed = status.has_failures();

        if !failed && !status.cancelled {
            for continuation in &callbacks.then {
                if let Err(err) = self.resume(continuation, &status, &ctx).await {
                    error!(batch = %status.id, continuation = continuation.name(), error = %err, "batch continuation failed");
                    failed = true;
                    break;
                }
            }
        }
        if failed {
            for continuation in &callbacks.catch {
                if let Err(err) = self.resume(continuation, &status, &ctx).await {
                    error!(batch = %status.id, continuation = continuation.name(), error = %err, "batch failure handler failed");
                }
            }
        }
        for continuation in &callbacks.finally {
            if let Err(err) = self.resume(continuation, &status, &ctx).await {
                error!(batch = %status.id, continuation = continuation.name(), error = %err, "batch cleanup failed");
            }
        }
    }

    async fn resume(
        &self,
        continuation: &Continuation,
        status: &BatchStatus,
        ctx: &JobContext,
    ) -> Result<(), PipelineError> {
        debug!(batch = %status.id, continuation = continuation.name(), "running batch continuation");
        self.inner.handler.resume(continuation, status, ctx).await
    }
}

#[async_trait]
impl JobQueue for LocalQueue {
    async fn dispatch(&self, job: Job) -> Result<(), PipelineError> {
        self.spawn(job, None, None);
        Ok(())
    }

    async fn dispatch_after(&self, job: Job, delay: Duration) -> Result<(), PipelineError> {
        self.spawn(job, None, Some(delay));
        Ok(())
    }

    async fn dispatch_batch(&self, batch: PendingBatch) -> Result<BatchId, PipelineError> {
        let id = BatchId::new();
        let PendingBatch {
            name,
            jobs,
            callbacks,
        } = batch;
        let total_jobs = jobs.len();
        let retention = self.inner.policy.finished_batch_retention;
        self.with_batches(|batches| {
            batches.retain(|_, record| {
                record
                    .finished_at
                    .map_or(true, |finished_at| finished_at.elapsed() < retention)
            });
            batches.insert(
                id,
                BatchRecord {
                    name,
                    total_jobs,
                    pending_jobs: total_jobs,
                    failed_jobs: 0,
                    cancelled: false,
                    finished_at: None,
                    callbacks: callbacks.clone(),
                },
            )
        });

        if total_jobs == 0 {
            // Nothing will report back, so finish the empty batch here.
            let status = self.with_batches(|batches| {
                batches.get_mut(&id).map(|record| {
                    record.finished_at = Some(Instant::now());
                    record.callbacks = BatchCallbacks::default();
                    record.status(id)
                })
            });
            if let Some(status) = status {
                self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
                let queue = self.clone();
                tokio::spawn(async move {
                    queue.complete_batch(status, callbacks).await;
                    queue.task_done();
                });
            }
            return Ok(id);
        }

        for job in jobs {
            self.spawn(job, Some(id), None);
        }
        Ok(id)
    }

    async fn batch_status(&self, id: BatchId) -> Result<Option<BatchStatus>, PipelineError> {
        Ok(self.with_batches(|batches| batches.get(&id).map(|record| record.status(id))))
    }

    async fn cancel_batch(&self, id: BatchId) -> Result<(), PipelineError> {
        let found = self.with_batches(|batches| {
            batches
                .get_mut(&id)
                .map(|record| record.cancelled = true)
                .is_some()
        });
        if !found {
            return Err(PipelineError::Queue(format!("unknown batch {id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ImportDatasetJob, SyncFallbackJob};
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct Recorder {
        runs: AtomicU32,
        fail_paths: Vec<String>,
        release_first: bool,
        resumed: Mutex<Vec<(String, usize, bool)>>,
        attempts: Mutex<Vec<u32>>,
    }

    fn import_job(path: &str) -> Job {
        Job::ImportDataset(ImportDatasetJob {
            csv_path: path.into(),
            extract_dir: "/tmp/x".into(),
        })
    }

    #[async_trait]
    impl JobHandler for Recorder {
        async fn handle(&self, job: &Job, ctx: &JobContext) -> Result<JobOutcome, PipelineError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.attempts.lock().expect("lock").push(ctx.attempt);
            if self.release_first && ctx.attempt == 1 {
                return Ok(JobOutcome::Released {
                    delay: Duration::from_millis(5),
                });
            }
            if let Job::ImportDataset(import) = job {
                if self
                    .fail_paths
                    .iter()
                    .any(|p| import.csv_path.to_string_lossy() == p.as_str())
                {
                    return Err(PipelineError::Timeout {
                        job: "import_dataset",
                        budget: Duration::from_millis(1),
                    });
                }
            }
            Ok(JobOutcome::Completed)
        }

        async fn resume(
            &self,
            continuation: &Continuation,
            batch: &BatchStatus,
            _ctx: &JobContext,
        ) -> Result<(), PipelineError> {
            self.resumed.lock().expect("lock").push((
                continuation.name().to_string(),
                batch.failed_jobs,
                batch.cancelled,
            ));
            Ok(())
        }
    }

    fn fast_policy() -> QueuePolicy {
        QueuePolicy {
            concurrency: 4,
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            finished_batch_retention: Duration::from_secs(60),
        }
    }

    fn callbacks() -> BatchCallbacks {
        BatchCallbacks {
            then: vec![Continuation::FinishChunkBatch {
                work_prefix: "then".into(),
            }],
            catch: vec![Continuation::ReportChunkFailure { url: "catch".into() }],
            finally: vec![Continuation::ReportImportFailure {
                csv_path: "finally".into(),
            }],
        }
    }

    #[tokio::test]
    async fn successful_batch_runs_then_and_finally() {
        let recorder = Arc::new(Recorder::default());
        let queue = LocalQueue::new(recorder.clone(), fast_policy());
        let id = queue
            .dispatch_batch(PendingBatch {
                name: "ok".into(),
                jobs: vec![import_job("a"), import_job("b"), import_job("c")],
                callbacks: callbacks(),
            })
            .await
            .expect("dispatch");
        queue.wait_idle().await;

        let status = queue.batch_status(id).await.expect("status").expect("batch");
        assert!(status.finished);
        assert_eq!(status.progress(), 100);
        let resumed = recorder.resumed.lock().expect("lock").clone();
        let names: Vec<&str> = resumed.iter().map(|(n, _, _)| n.as_str()).collect();
        assert_eq!(names, vec!["finish_chunk_batch", "report_import_failure"]);
    }

    #[tokio::test]
    async fn failed_job_is_retried_then_fails_the_batch() {
        let recorder = Arc::new(Recorder {
            fail_paths: vec!["bad".into()],
            ..Recorder::default()
        });
        let queue = LocalQueue::new(recorder.clone(), fast_policy());
        let id = queue
            .dispatch_batch(PendingBatch {
                name: "failing".into(),
                jobs: vec![import_job("good"), import_job("bad")],
                callbacks: callbacks(),
            })
            .await
            .expect("dispatch");
        queue.wait_idle().await;

        // one run for the good job, three attempts for the bad one
        assert_eq!(recorder.runs.load(Ordering::SeqCst), 4);
        let status = queue.batch_status(id).await.expect("status").expect("batch");
        assert_eq!(status.failed_jobs, 1);
        assert!(status.cancelled);
        let resumed = recorder.resumed.lock().expect("lock").clone();
        let names: Vec<&str> = resumed.iter().map(|(n, _, _)| n.as_str()).collect();
        assert_eq!(names, vec!["report_chunk_failure", "report_import_failure"]);
    }

    #[tokio::test]
    async fn cancelled_batch_skips_then() {
        let recorder = Arc::new(Recorder {
            release_first: true,
            ..Recorder::default()
        });
        let queue = LocalQueue::new(recorder.clone(), fast_policy());
        let id = queue
            .dispatch_batch(PendingBatch {
                name: "cancelled".into(),
                jobs: vec![import_job("a")],
                callbacks: callbacks(),
            })
            .await
            .expect("dispatch");
        queue.cancel_batch(id).await.expect("cancel");
        queue.wait_idle().await;

        let resumed = recorder.resumed.lock().expect("lock").clone();
        assert_eq!(
            resumed,
            vec![("report_import_failure".to_string(), 0, true)]
        );
    }

    #[tokio::test]
    async fn released_job_reruns_with_next_attempt() {
        let recorder = Arc::new(Recorder {
            release_first: true,
            ..Recorder::default()
        });
        let queue = LocalQueue::new(recorder.clone(), fast_policy());
        queue
            .dispatch(Job::SyncFallback(SyncFallbackJob {
                url: "http://x".into(),
                csv_filter: "csv".into(),
                work_prefix: "registry".into(),
            }))
            .await
            .expect("dispatch");
        queue.wait_idle().await;

        assert_eq!(recorder.attempts.lock().expect("lock").clone(), vec![1, 2]);
    }

    #[tokio::test]
    async fn empty_batch_completes_immediately() {
        let recorder = Arc::new(Recorder::default());
        let queue = LocalQueue::new(recorder.clone(), fast_policy());
        queue
            .dispatch_batch(PendingBatch {
                name: "empty".into(),
                jobs: Vec::new(),
                callbacks: callbacks(),
            })
            .await
            .expect("dispatch");
        queue.wait_idle().await;

        assert_eq!(recorder.runs.load(Ordering::SeqCst), 0);
        assert_eq!(recorder.resumed.lock().expect("lock").len(), 2);
    }

    #[tokio::test]
    async fn finished_batches_are_evicted_after_retention() {
        let policy = QueuePolicy {
            finished_batch_retention: Duration::from_millis(20),
            ..fast_policy()
        };
        let queue = LocalQueue::new(Arc::new(Recorder::default()), policy);
        let batch = || PendingBatch {
            name: "short-lived".into(),
            jobs: vec![import_job("a")],
            callbacks: BatchCallbacks::default(),
        };
        let first = queue.dispatch_batch(batch()).await.expect("dispatch");
        queue.wait_idle().await;
        assert!(queue.batch_status(first).await.expect("status").is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        let second = queue.dispatch_batch(batch()).await.expect("dispatch");
        queue.wait_idle().await;

        assert!(queue.batch_status(first).await.expect("status").is_none());
        assert!(queue.batch_status(second).await.expect("status").is_some());
    }

    #[tokio::test]
    async fn cancelling_unknown_batch_is_an_error() {
        let queue = LocalQueue::new(Arc::new(Recorder::default()), fast_policy());
        assert!(queue.cancel_batch(BatchId::new()).await.is_err());
    }
}
