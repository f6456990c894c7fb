use crate::config::DispatcherConfig;
use crate::scheduler::handler::{invoke_with_deadline, JobHandler};
use crate::scheduler::history::{truncate_error, Execution, ExecutionStatus};
use crate::scheduler::jobs::{ClaimOutcome, JobDefinition, JobStore};
use crate::scheduler::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// What one tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    pub claimed: usize,
    /// Due jobs another tick or instance claimed first.
    pub lost: usize,
    /// Occurrences consumed without running because the job was still busy.
    pub overlapping: usize,
    /// Due jobs left for a later tick because the worker pool was full.
    pub deferred: usize,
    pub reaped: usize,
    /// One task per claimed occurrence, covering all of its attempts.
    pub tasks: Vec<JoinHandle<()>>,
}

/// Polls the job store, claims due occurrences and runs them on a bounded
/// worker pool.
///
/// Constructed once per process and handed its store and handler, so tests
/// can drive [`Dispatcher::tick`] directly.
#[derive(Clone)]
pub struct Dispatcher {
    store: JobStore,
    handler: Arc<dyn JobHandler>,
    permits: Arc<Semaphore>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(store: JobStore, handler: Arc<dyn JobHandler>, config: DispatcherConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            store,
            handler,
            permits,
            config,
        }
    }

    /// Main dispatcher loop. Polls every `poll_interval_secs` until `shutdown`
    /// broadcasts `true`. Store errors are logged and retried next tick.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.config.poll_interval_secs,
            max_concurrent = self.config.max_concurrent,
            "Dispatcher started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick(Utc::now()) {
                        Ok(report) if report.claimed + report.overlapping + report.reaped > 0 => {
                            debug!(
                                claimed = report.claimed,
                                lost = report.lost,
                                overlapping = report.overlapping,
                                deferred = report.deferred,
                                reaped = report.reaped,
                                "tick finished"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!("Dispatcher tick failed: {}", e),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Dispatcher shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Claim every due job and start its occurrence in the background.
    ///
    /// Only the store query and the claim transactions happen inline; handler
    /// invocations run on spawned tasks.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();

        match self.store.reap_abandoned(now, self.config.abandon_grace()) {
            Ok(n) => report.reaped = n,
            Err(e) => warn!("Failed to reap abandoned executions: {}", e),
        }

        for job in self.store.due_jobs(now)? {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                report.deferred += 1;
                continue;
            };

            match self.store.claim(&job, now) {
                Ok(ClaimOutcome::Claimed { job, execution }) => {
                    info!(
                        job_id = %job.id,
                        execution_id = %execution.id,
                        next_run_at = ?job.next_run_at,
                        "Job claimed"
                    );
                    report.claimed += 1;
                    report.tasks.push(self.spawn_occurrence(job, execution, permit));
                }
                Ok(ClaimOutcome::Lost) => {
                    debug!(job_id = %job.id, "Occurrence already claimed elsewhere");
                    report.lost += 1;
                }
                Ok(ClaimOutcome::Overlapping) => {
                    warn!(job_id = %job.id, "Previous invocation still running, occurrence skipped");
                    report.overlapping += 1;
                }
                Err(e) => {
                    error!(job_id = %job.id, "Failed to claim job: {}", e);
                }
            }
        }

        Ok(report)
    }

    fn spawn_occurrence(
        &self,
        job: JobDefinition,
        execution: Execution,
        permit: OwnedSemaphorePermit,
    ) -> JoinHandle<()> {
        let store = self.store.clone();
        let handler = self.handler.clone();
        let max_error_len = self.config.max_error_len;

        tokio::spawn(async move {
            run_occurrence(&store, handler.as_ref(), &job, execution, max_error_len).await;
            drop(permit);
        })
    }
}

/// Run attempt 0 and any retries of one occurrence, recording each outcome.
async fn run_occurrence(
    store: &JobStore,
    handler: &dyn JobHandler,
    job: &JobDefinition,
    first: Execution,
    max_error_len: usize,
) {
    let timeout = Duration::from_secs(u64::from(job.timeout_seconds));
    let mut execution = first;

    loop {
        let attempt = execution.retry_attempt;
        debug!(job_id = %job.id, execution_id = %execution.id, attempt, path = %job.path, "Invoking handler");

        let result = invoke_with_deadline(handler, &job.path, timeout).await;
        let (status, message) = match &result {
            Ok(()) => (ExecutionStatus::Success, None),
            Err(e) => (e.status(), Some(truncate_error(&e.to_string(), max_error_len))),
        };
        let now = Utc::now();

        if status == ExecutionStatus::Success || attempt >= job.retry_count {
            match store.finish(execution.id, status, message.as_deref(), now) {
                Ok(true) => match status {
                    ExecutionStatus::Success => {
                        info!(job_id = %job.id, execution_id = %execution.id, attempt, "Job succeeded")
                    }
                    _ => warn!(
                        job_id = %job.id,
                        execution_id = %execution.id,
                        attempt,
                        %status,
                        error = message.as_deref().unwrap_or_default(),
                        "Job failed, no retries left"
                    ),
                },
                Ok(false) => warn!(execution_id = %execution.id, "Execution already terminal, outcome dropped"),
                Err(e) => error!(execution_id = %execution.id, "Failed to record execution: {}", e),
            }
            return;
        }

        match store.finish_and_retry(&execution, status, message.as_deref(), now) {
            Ok(Some(retry)) => {
                warn!(
                    job_id = %job.id,
                    execution_id = %execution.id,
                    attempt,
                    %status,
                    error = message.as_deref().unwrap_or_default(),
                    "Job failed, retrying"
                );
                execution = retry;
            }
            Ok(None) => {
                info!(job_id = %job.id, execution_id = %execution.id, "Retry not started, job disabled or execution already terminal");
                return;
            }
            Err(e) => {
                error!(execution_id = %execution.id, "Failed to record execution: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::jobs::NewJob;
    use crate::storage::open_pool;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Fails the first `failures` calls, then succeeds.
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl JobHandler for Flaky {
        async fn invoke(&self, _path: &str, _timeout: Duration) -> anyhow::Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                anyhow::bail!("attempt {n} failed: {}", "x".repeat(100));
            }
            Ok(())
        }
    }

    struct Panics;

    #[async_trait::async_trait]
    impl JobHandler for Panics {
        async fn invoke(&self, _path: &str, _timeout: Duration) -> anyhow::Result<()> {
            panic!("handler bug");
        }
    }

    struct Hangs;

    #[async_trait::async_trait]
    impl JobHandler for Hangs {
        async fn invoke(&self, _path: &str, _timeout: Duration) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn setup(handler: Arc<dyn JobHandler>, config: DispatcherConfig) -> (Dispatcher, JobStore, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(dir.path().join("jobs.db").to_str().unwrap()).unwrap();
        let store = JobStore::new(pool);
        (Dispatcher::new(store.clone(), handler, config), store, dir)
    }

    fn job(retries: u32, timeout: u32) -> NewJob {
        NewJob {
            project_id: "proj".into(),
            name: "sync".into(),
            schedule: "* * * * *".into(),
            timezone: "UTC".into(),
            path: "/cron/sync".into(),
            enabled: true,
            timeout_seconds: Some(timeout),
            retry_count: Some(retries),
        }
    }

    // Created two minutes ago, so the first occurrence is already due.
    fn create_due(store: &JobStore, new: NewJob) -> JobDefinition {
        store.create(new, Utc::now() - chrono::Duration::minutes(2)).unwrap()
    }

    async fn drain(report: TickReport) {
        for task in report.tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_success_is_recorded() {
        let handler = Arc::new(Flaky { failures: 0, calls: AtomicUsize::new(0) });
        let (dispatcher, store, _dir) = setup(handler.clone(), DispatcherConfig::default());
        let created = create_due(&store, job(0, 10));
        let now = Utc::now();

        let report = dispatcher.tick(now).unwrap();
        assert_eq!(report.claimed, 1);
        drain(report).await;

        let history = store.executions(created.id, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, ExecutionStatus::Success);
        assert!(history[0].finished_at.is_some());
        assert!(store.get(created.id).unwrap().next_run_at.unwrap() > now);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let handler = Arc::new(Flaky { failures: 1, calls: AtomicUsize::new(0) });
        let (dispatcher, store, _dir) = setup(handler, DispatcherConfig::default());
        let created = create_due(&store, job(3, 10));

        let report = dispatcher.tick(Utc::now()).unwrap();
        let scheduled = store.get(created.id).unwrap().next_run_at;
        drain(report).await;

        let history = store.executions(created.id, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].retry_attempt, 1);
        assert_eq!(history[0].status, ExecutionStatus::Success);
        assert_eq!(history[1].retry_attempt, 0);
        assert_eq!(history[1].status, ExecutionStatus::Failed);
        // Retries leave the schedule alone.
        assert_eq!(store.get(created.id).unwrap().next_run_at, scheduled);
    }

    #[tokio::test]
    async fn test_error_message_is_bounded() {
        let handler = Arc::new(Flaky { failures: 1, calls: AtomicUsize::new(0) });
        let config = DispatcherConfig {
            max_error_len: 20,
            ..DispatcherConfig::default()
        };
        let (dispatcher, store, _dir) = setup(handler, config);
        let created = create_due(&store, job(0, 10));

        drain(dispatcher.tick(Utc::now()).unwrap()).await;

        let history = store.executions(created.id, 10).unwrap();
        let error = history[0].error.as_deref().unwrap();
        assert_eq!(error.chars().count(), 20);
        assert!(error.starts_with("attempt 0 failed"));
    }

    #[tokio::test]
    async fn test_panicking_handler_is_recorded_and_retried() {
        let (dispatcher, store, _dir) = setup(Arc::new(Panics), DispatcherConfig::default());
        let created = create_due(&store, job(2, 10));

        let report = dispatcher.tick(Utc::now()).unwrap();
        assert_eq!(report.claimed, 1);
        for task in report.tasks {
            assert!(task.await.is_ok(), "occurrence task must not unwind");
        }

        let history = store.executions(created.id, 10).unwrap();
        assert_eq!(history.len(), 3);
        for e in &history {
            assert_eq!(e.status, ExecutionStatus::Failed);
            assert_eq!(e.error.as_deref(), Some("handler panicked: handler bug"));
        }

        // Nothing is left running, so the next occurrence is claimed normally.
        let next = store.get(created.id).unwrap().next_run_at.unwrap();
        let report = dispatcher.tick(next).unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.overlapping, 0);
        for task in report.tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_handler_times_out() {
        let (dispatcher, store, _dir) = setup(Arc::new(Hangs), DispatcherConfig::default());
        let created = create_due(&store, job(0, 2));

        drain(dispatcher.tick(Utc::now()).unwrap()).await;

        let history = store.executions(created.id, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, ExecutionStatus::Timeout);
        assert_eq!(history[0].error.as_deref(), Some("handler timed out after 2s"));
    }

    #[tokio::test]
    async fn test_second_tick_does_not_reclaim() {
        let handler = Arc::new(Flaky { failures: 0, calls: AtomicUsize::new(0) });
        let (dispatcher, store, _dir) = setup(handler.clone(), DispatcherConfig::default());
        create_due(&store, job(0, 10));
        let now = Utc::now();

        let first = dispatcher.tick(now).unwrap();
        let second = dispatcher.tick(now).unwrap();
        assert_eq!(first.claimed, 1);
        assert_eq!(second.claimed, 0);
        drain(first).await;
        drain(second).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_full_pool_defers_without_claiming() {
        let config = DispatcherConfig {
            max_concurrent: 1,
            ..DispatcherConfig::default()
        };
        let (dispatcher, store, _dir) = setup(Arc::new(Hangs), config);
        create_due(&store, job(0, 300));
        create_due(&store, job(0, 300));
        let now = Utc::now();

        let report = dispatcher.tick(now).unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.deferred, 1);

        // The deferred job is still due and keeps its occurrence.
        assert_eq!(store.due_jobs(now).unwrap().len(), 1);
        for task in report.tasks {
            task.abort();
        }
    }

    #[tokio::test]
    async fn test_disabled_job_is_not_dispatched() {
        let handler = Arc::new(Flaky { failures: 0, calls: AtomicUsize::new(0) });
        let (dispatcher, store, _dir) = setup(handler.clone(), DispatcherConfig::default());
        let created = create_due(&store, job(0, 10));
        store.set_enabled(created.id, false, Utc::now()).unwrap();

        let report = dispatcher.tick(Utc::now() + chrono::Duration::days(1)).unwrap();
        assert_eq!(report.claimed, 0);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let handler = Arc::new(Flaky { failures: 0, calls: AtomicUsize::new(0) });
        let (dispatcher, _store, _dir) = setup(handler, DispatcherConfig::default());
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(dispatcher.run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("dispatcher did not stop")
            .unwrap();
    }
}
