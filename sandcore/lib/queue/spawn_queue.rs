use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::{sync::Notify, time};
use tokio_util::sync::CancellationToken;

use crate::{
    config::QueueConfig,
    models::{Sandbox, SpawnOptions},
    utils::generate_job_id,
    SandcoreError, SandcoreResult,
};

use super::{JobStatus, QueueStats, SpawnJob, CANCELLED_MESSAGE};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Deadline of [`SpawnQueue::enqueue_and_wait`] when none is given.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Number of jobs [`SpawnQueue::recent_jobs`] returns when no limit is given.
pub const DEFAULT_RECENT_LIMIT: usize = 20;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Runs the spawn pipeline for one job.
#[async_trait]
pub trait SpawnHandler: Send + Sync {
    /// Spawns a sandbox.
    async fn spawn(&self, options: SpawnOptions) -> SandcoreResult<Sandbox>;
}

/// A FIFO spawn queue with a concurrency limit and per-job retries.
///
/// Cloning is cheap; clones share the same jobs.
#[derive(Clone)]
pub struct SpawnQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    handler: Arc<dyn SpawnHandler>,
    max_concurrent: usize,
    max_retries: u32,
    retry_delay: Duration,
    state: Mutex<QueueState>,
    changed: Notify,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, SpawnJob>,
    pending: VecDeque<String>,
    running: usize,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SpawnQueue {
    /// Creates a queue dispatching to `handler`. The concurrency limit comes from `config` or,
    /// when unset, is derived from `max_sandboxes`.
    pub fn new(handler: Arc<dyn SpawnHandler>, config: &QueueConfig, max_sandboxes: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                handler,
                max_concurrent: config.effective_max_concurrent(max_sandboxes),
                max_retries: config.get_max_retries(),
                retry_delay: Duration::from_millis(config.get_retry_delay_ms()),
                state: Mutex::new(QueueState::default()),
                changed: Notify::new(),
            }),
        }
    }

    /// Queues a spawn and returns the job id. Must be called from within a tokio runtime.
    pub fn enqueue(&self, options: SpawnOptions) -> String {
        let id = generate_job_id();
        {
            let mut state = self.inner.lock();
            state
                .jobs
                .insert(id.clone(), SpawnJob::new(id.clone(), options));
            state.pending.push_back(id.clone());
            tracing::info!(
                job_id = %id,
                queued = state.pending.len(),
                running = state.running,
                "spawn job queued"
            );
        }

        QueueInner::dispatch(&self.inner);
        id
    }

    /// Queues a spawn and waits for its outcome.
    ///
    /// When `timeout` elapses first the job is cancelled, which only takes effect while it is
    /// still queued, and [`SandcoreError::SpawnTimeout`] is returned.
    pub async fn enqueue_and_wait(
        &self,
        options: SpawnOptions,
        timeout: Option<Duration>,
    ) -> SandcoreResult<Sandbox> {
        let deadline = time::Instant::now() + timeout.unwrap_or(DEFAULT_WAIT_TIMEOUT);
        let id = self.enqueue(options);

        loop {
            let changed = self.inner.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if let Some(job) = self.get_job(&id) {
                if job.is_terminal() {
                    return job_outcome(job);
                }
            } else {
                return Err(SandcoreError::SpawnFailed {
                    job_id: id,
                    message: "job was removed before it finished".to_string(),
                });
            }

            if time::timeout_at(deadline, changed).await.is_err() {
                self.cancel(&id);
                tracing::warn!(job_id = %id, "spawn job timed out");
                return Err(SandcoreError::SpawnTimeout);
            }
        }
    }

    /// A snapshot of job `id`.
    pub fn get_job(&self, id: &str) -> Option<SpawnJob> {
        self.inner.lock().jobs.get(id).cloned()
    }

    /// Counters over all remembered jobs.
    pub fn get_stats(&self) -> QueueStats {
        let state = self.inner.lock();
        let mut stats = QueueStats {
            max_concurrent: self.inner.max_concurrent,
            ..Default::default()
        };

        for job in state.jobs.values() {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }

        stats
    }

    /// Cancels a queued job. Running and finished jobs are left alone and `false` is returned.
    pub fn cancel(&self, id: &str) -> bool {
        let cancelled = {
            let mut state = self.inner.lock();
            let Some(job) = state.jobs.get_mut(id) else {
                return false;
            };
            if job.status != JobStatus::Queued {
                return false;
            }

            job.status = JobStatus::Failed;
            job.error = Some(CANCELLED_MESSAGE.to_string());
            job.completed_at = Some(Utc::now());
            state.pending.retain(|pending| pending != id);
            true
        };

        if cancelled {
            tracing::info!(job_id = id, "spawn job cancelled");
            self.inner.changed.notify_waiters();
        }

        cancelled
    }

    /// Queued jobs in dispatch order.
    pub fn queued_jobs(&self) -> Vec<SpawnJob> {
        let state = self.inner.lock();
        state
            .pending
            .iter()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect()
    }

    /// Jobs being spawned.
    pub fn running_jobs(&self) -> Vec<SpawnJob> {
        self.inner
            .lock()
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Running)
            .cloned()
            .collect()
    }

    /// The most recently finished jobs, newest first.
    pub fn recent_jobs(&self, limit: Option<usize>) -> Vec<SpawnJob> {
        let mut finished: Vec<_> = self
            .inner
            .lock()
            .jobs
            .values()
            .filter(|job| job.is_terminal())
            .cloned()
            .collect();

        finished.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        finished.truncate(limit.unwrap_or(DEFAULT_RECENT_LIMIT));
        finished
    }

    /// Forgets finished jobs older than `max_age` and returns how many were removed.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };

        let mut state = self.inner.lock();
        let before = state.jobs.len();
        state.jobs.retain(|_, job| {
            !(job.is_terminal() && job.completed_at.is_some_and(|at| at < cutoff))
        });

        let removed = before - state.jobs.len();
        if removed > 0 {
            tracing::debug!(removed, "cleaned up spawn jobs");
        }
        removed
    }

    /// The concurrency limit.
    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// Runs [`SpawnQueue::cleanup`] every `interval` until `shutdown` is cancelled.
    pub async fn run_cleanup(
        &self,
        shutdown: CancellationToken,
        interval: Duration,
        retention: Duration,
    ) {
        tracing::info!(
            interval_secs = interval.as_secs(),
            retention_secs = retention.as_secs(),
            "job cleanup started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = time::sleep(interval) => {}
            }
            self.cleanup(retention);
        }

        tracing::info!("job cleanup stopped");
    }
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Starts queued jobs while slots are free.
    fn dispatch(this: &Arc<Self>) {
        let mut started = Vec::new();
        {
            let mut state = this.lock();
            while state.running < this.max_concurrent {
                let Some(id) = state.pending.pop_front() else {
                    break;
                };
                let Some(job) = state.jobs.get_mut(&id) else {
                    continue;
                };
                if job.status != JobStatus::Queued {
                    continue;
                }

                job.status = JobStatus::Running;
                job.started_at = Some(Utc::now());
                started.push((id, job.options.clone()));
                state.running += 1;
            }
        }

        for (id, options) in started {
            let inner = this.clone();
            tokio::spawn(async move {
                inner.run(id, options).await;
            });
        }
    }

    async fn run(self: Arc<Self>, id: String, options: SpawnOptions) {
        tracing::info!(job_id = %id, "spawn job started");
        self.changed.notify_waiters();

        let outcome = loop {
            // Each attempt runs on its own task so a panicking handler fails the job instead of
            // taking the slot with it.
            let attempt = tokio::spawn({
                let handler = self.handler.clone();
                let options = options.clone();
                async move { handler.spawn(options).await }
            });

            let result = match attempt.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(job_id = %id, error = %e, "spawn handler aborted");
                    break Err(SandcoreError::custom(anyhow::anyhow!(
                        "spawn handler aborted: {e}"
                    )));
                }
            };

            match result {
                Ok(sandbox) => break Ok(sandbox),
                Err(e) => {
                    let retry_count = {
                        let mut state = self.lock();
                        match state.jobs.get_mut(&id) {
                            Some(job) if job.retry_count < self.max_retries => {
                                job.retry_count += 1;
                                Some(job.retry_count)
                            }
                            _ => None,
                        }
                    };

                    match retry_count {
                        Some(retry) => {
                            tracing::warn!(
                                job_id = %id,
                                retry,
                                max_retries = self.max_retries,
                                error = %e,
                                "spawn attempt failed, retrying"
                            );
                            time::sleep(self.retry_delay).await;
                        }
                        None => break Err(e),
                    }
                }
            }
        };

        {
            let mut state = self.lock();
            if let Some(job) = state.jobs.get_mut(&id) {
                job.completed_at = Some(Utc::now());
                match outcome {
                    Ok(sandbox) => {
                        tracing::info!(job_id = %id, sandbox_id = %sandbox.id, "spawn job completed");
                        job.status = JobStatus::Completed;
                        job.result = Some(sandbox);
                    }
                    Err(e) => {
                        tracing::error!(job_id = %id, error = %e, "spawn job failed");
                        job.status = JobStatus::Failed;
                        job.error = Some(e.to_string());
                    }
                }
            }
            state.running -= 1;
        }

        self.changed.notify_waiters();
        Self::dispatch(&self);
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn job_outcome(job: SpawnJob) -> SandcoreResult<Sandbox> {
    if job.is_cancelled() {
        return Err(SandcoreError::JobCancelled);
    }

    match (job.status, job.result) {
        (JobStatus::Completed, Some(sandbox)) => Ok(sandbox),
        _ => Err(SandcoreError::SpawnFailed {
            job_id: job.id,
            message: job.error.unwrap_or_else(|| "unknown error".to_string()),
        }),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::models::{SandboxRuntime, SandboxStatus};

    /// Sleeps, tracks concurrency and fails the first `failures` calls.
    struct FakeHandler {
        delay: Duration,
        failures: AtomicUsize,
        calls: AtomicUsize,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FakeHandler {
        fn new(delay_ms: u64, failures: usize) -> Arc<Self> {
            Arc::new(Self {
                delay: Duration::from_millis(delay_ms),
                failures: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SpawnHandler for FakeHandler {
        async fn spawn(&self, options: SpawnOptions) -> SandcoreResult<Sandbox> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(active, Ordering::SeqCst);

            time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(SandcoreError::ResourceExhausted(format!("attempt {call}")));
            }

            let mut sandbox =
                Sandbox::creating(format!("sbx{call}"), options.workspace_id, SandboxRuntime::default());
            sandbox.status = SandboxStatus::Running;
            Ok(sandbox)
        }
    }

    fn queue(handler: Arc<FakeHandler>, max_concurrent: usize) -> SpawnQueue {
        let config = QueueConfig::builder()
            .max_concurrent(max_concurrent)
            .retry_delay_ms(10)
            .build();
        SpawnQueue::new(handler, &config, 20)
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() -> anyhow::Result<()> {
        let handler = FakeHandler::new(50, 0);
        let queue = queue(handler.clone(), 2);

        let waits: Vec<_> = (0..6)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    queue
                        .enqueue_and_wait(SpawnOptions::default(), Some(Duration::from_secs(5)))
                        .await
                })
            })
            .collect();

        for wait in waits {
            assert_eq!(wait.await??.status, SandboxStatus::Running);
        }

        assert_eq!(handler.peak.load(Ordering::SeqCst), 2);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 6);

        let stats = queue.get_stats();
        assert_eq!(stats.completed, 6);
        assert_eq!(stats.max_concurrent, 2);
        assert_eq!(queue.recent_jobs(Some(4)).len(), 4);

        Ok(())
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() -> anyhow::Result<()> {
        let handler = FakeHandler::new(1, 2);
        let queue = queue(handler.clone(), 1);

        let sandbox = queue
            .enqueue_and_wait(SpawnOptions::default(), Some(Duration::from_secs(5)))
            .await?;
        assert_eq!(sandbox.id, "sbx2");

        let job = queue.recent_jobs(None).remove(0);
        assert_eq!(job.retry_count, 2);
        assert_eq!(job.status, JobStatus::Completed);

        Ok(())
    }

    #[tokio::test]
    async fn test_final_failure_is_recorded() -> anyhow::Result<()> {
        let handler = FakeHandler::new(1, 10);
        let queue = queue(handler.clone(), 1);

        let err = queue
            .enqueue_and_wait(SpawnOptions::default(), Some(Duration::from_secs(5)))
            .await
            .unwrap_err();

        match err {
            SandcoreError::SpawnFailed { job_id, message } => {
                assert!(message.contains("attempt 2"));
                let job = queue.get_job(&job_id).unwrap();
                assert_eq!(job.status, JobStatus::Failed);
                assert_eq!(job.retry_count, QueueConfig::default().get_max_retries());
                assert_eq!(
                    handler.calls.load(Ordering::SeqCst),
                    job.retry_count as usize + 1
                );
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_only_affects_queued_jobs() -> anyhow::Result<()> {
        let handler = FakeHandler::new(200, 0);
        let queue = queue(handler.clone(), 1);

        let running = queue.enqueue(SpawnOptions::default());
        let queued = queue.enqueue(SpawnOptions::default());

        assert_eq!(queue.queued_jobs().len(), 1);
        assert_eq!(queue.running_jobs()[0].id, running);

        assert!(!queue.cancel(&running));
        assert!(queue.cancel(&queued));
        assert!(!queue.cancel(&queued));
        assert!(!queue.cancel("missing"));

        let job = queue.get_job(&queued).unwrap();
        assert!(job.is_cancelled());
        assert!(queue.queued_jobs().is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_wait_timeout_cancels_queued_job() -> anyhow::Result<()> {
        let handler = FakeHandler::new(300, 0);
        let queue = queue(handler.clone(), 1);

        let _blocker = queue.enqueue(SpawnOptions::default());
        let err = queue
            .enqueue_and_wait(SpawnOptions::default(), Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, SandcoreError::SpawnTimeout));

        let stats = queue.get_stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.queued, 0);

        time::sleep(Duration::from_millis(400)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_cleanup_forgets_old_finished_jobs() -> anyhow::Result<()> {
        let handler = FakeHandler::new(1, 0);
        let queue = queue(handler, 2);

        queue
            .enqueue_and_wait(SpawnOptions::default(), None)
            .await?;
        assert_eq!(queue.cleanup(Duration::from_secs(3600)), 0);

        time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.cleanup(Duration::from_millis(5)), 1);
        assert_eq!(queue.get_stats(), QueueStats {
            max_concurrent: 2,
            ..Default::default()
        });

        Ok(())
    }

    /// Panics on its first call and succeeds afterwards.
    struct PanickingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SpawnHandler for PanickingHandler {
        async fn spawn(&self, options: SpawnOptions) -> SandcoreResult<Sandbox> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("handler blew up");
            }
            let mut sandbox =
                Sandbox::creating("sbx-ok".to_string(), options.workspace_id, SandboxRuntime::default());
            sandbox.status = SandboxStatus::Running;
            Ok(sandbox)
        }
    }

    #[tokio::test]
    async fn test_panicking_handler_fails_job_and_frees_slot() -> anyhow::Result<()> {
        let handler = Arc::new(PanickingHandler {
            calls: AtomicUsize::new(0),
        });
        let config = QueueConfig::builder()
            .max_concurrent(1)
            .retry_delay_ms(10)
            .build();
        let queue = SpawnQueue::new(handler.clone(), &config, 20);

        let err = queue
            .enqueue_and_wait(SpawnOptions::default(), Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        let job_id = match err {
            SandcoreError::SpawnFailed { job_id, message } => {
                assert!(message.contains("aborted"));
                job_id
            }
            other => panic!("unexpected error: {other}"),
        };

        let job = queue.get_job(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.completed_at.is_some());
        assert!(queue.running_jobs().is_empty());

        let sandbox = queue
            .enqueue_and_wait(SpawnOptions::default(), Some(Duration::from_secs(5)))
            .await?;
        assert_eq!(sandbox.id, "sbx-ok");
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);

        let stats = queue.get_stats();
        assert_eq!((stats.completed, stats.failed, stats.running), (1, 1, 0));

        Ok(())
    }

    #[tokio::test]
    async fn test_cleanup_loop_runs_until_shutdown() -> anyhow::Result<()> {
        let handler = FakeHandler::new(1, 0);
        let queue = queue(handler, 2);
        queue
            .enqueue_and_wait(SpawnOptions::default(), None)
            .await?;

        let shutdown = CancellationToken::new();
        let cleaner = tokio::spawn({
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            async move {
                queue
                    .run_cleanup(shutdown, Duration::from_millis(10), Duration::from_millis(5))
                    .await
            }
        });

        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.get_stats().completed, 0);

        shutdown.cancel();
        time::timeout(Duration::from_secs(1), cleaner).await??;

        Ok(())
    }
}
