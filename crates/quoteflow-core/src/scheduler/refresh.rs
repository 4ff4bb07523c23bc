//! Refresh scheduler: runs jobs on their interval and writes results to the cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};

use super::SchedulerError;
use super::job::{ExecutionTrigger, JobDefinition, JobOutcome, JobStatus, PREFETCH_PREFIX, Priority};
use crate::cache::TieredCache;
use crate::events::{CoreEvent, EventBus};
use crate::metrics;

/// Configuration for the refresh scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to look for due jobs.
    /// Default: 10 seconds
    pub tick_interval: Duration,

    /// Bootstrap delay for medium priority jobs.
    /// Default: 2 seconds
    pub medium_delay: Duration,

    /// Bootstrap delay for low priority jobs.
    /// Default: 5 seconds
    pub low_delay: Duration,

    /// Retry `n` is delayed by `backoff_base * n`.
    /// Default: 5 seconds
    pub backoff_base: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            medium_delay: Duration::from_secs(2),
            low_delay: Duration::from_secs(5),
            backoff_base: Duration::from_secs(5),
        }
    }
}

struct JobState {
    definition: JobDefinition,
    retry_count: u32,
    running: bool,
    retry_pending: bool,
    run_count: u64,
    failure_count: u64,
    last_run_at: Option<Instant>,
    last_success_at: Option<Instant>,
    last_error: Option<String>,
}

impl JobState {
    fn new(definition: JobDefinition) -> Self {
        Self {
            definition,
            retry_count: 0,
            running: false,
            retry_pending: false,
            run_count: 0,
            failure_count: 0,
            last_run_at: None,
            last_success_at: None,
            last_error: None,
        }
    }

    fn is_due(&self, now: Instant) -> bool {
        !self.running
            && self
                .last_run_at
                .is_none_or(|at| now.saturating_duration_since(at) >= self.definition.interval)
    }

    fn status(&self, now: Instant) -> JobStatus {
        let ago = |at: Option<Instant>| at.map(|t| now.saturating_duration_since(t).as_millis() as u64);
        JobStatus {
            name: self.definition.name.clone(),
            priority: self.definition.priority,
            interval_ms: self.definition.interval.as_millis() as u64,
            cache_key: self.definition.cache_key.clone(),
            retry_count: self.retry_count,
            max_retries: self.definition.max_retries,
            running: self.running,
            retry_pending: self.retry_pending,
            run_count: self.run_count,
            failure_count: self.failure_count,
            last_run_ago_ms: ago(self.last_run_at),
            last_success_ago_ms: ago(self.last_success_at),
            last_error: self.last_error.clone(),
        }
    }
}

type JobTable = Mutex<HashMap<String, JobState>>;

/// Clears the job's `running` flag when the execution ends, however it ends.
struct RunningGuard<'a> {
    jobs: &'a JobTable,
    name: &'a str,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if let Some(state) = self.jobs.lock().get_mut(self.name) {
            state.running = false;
        }
    }
}

/// Runs registered refresh jobs and stores their results in the cache.
///
/// At most one execution per job is in flight at any time. A failing job
/// leaves previously cached data untouched.
pub struct RefreshScheduler {
    jobs: JobTable,
    cache: Arc<TieredCache>,
    config: SchedulerConfig,
    events: Option<EventBus>,
}

impl RefreshScheduler {
    pub fn new(cache: Arc<TieredCache>, config: SchedulerConfig) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            cache,
            config,
            events: None,
        }
    }

    /// Publish job outcomes on `events`.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Add a job. Names must be unique.
    pub fn register_job(&self, definition: JobDefinition) -> Result<(), SchedulerError> {
        definition.validate()?;

        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&definition.name) {
            return Err(SchedulerError::DuplicateJob(definition.name));
        }

        info!(
            job = %definition.name,
            interval_secs = definition.interval.as_secs(),
            priority = %definition.priority,
            max_retries = definition.max_retries,
            "Registered refresh job"
        );
        jobs.insert(definition.name.clone(), JobState::new(definition));
        Ok(())
    }

    /// Start bootstrap runs and the periodic tick in background tasks.
    ///
    /// Returns a shutdown sender that can be used to stop the tick.
    pub fn start(self: &Arc<Self>) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let stages = [
            (Priority::High, Duration::ZERO),
            (Priority::Medium, self.config.medium_delay),
            (Priority::Low, self.config.low_delay),
        ];
        for (priority, delay) in stages {
            let names = self.job_names_with_priority(priority);
            if names.is_empty() {
                continue;
            }
            debug!(%priority, jobs = names.len(), delay_ms = delay.as_millis() as u64, "Scheduling bootstrap runs");

            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                for name in names {
                    scheduler.spawn_execution(name, ExecutionTrigger::Bootstrap);
                }
            });
        }

        let scheduler = Arc::clone(self);
        let period = self.config.tick_interval;
        tokio::spawn(async move {
            info!(tick_secs = period.as_secs(), "Refresh scheduler started");

            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        scheduler.dispatch_due();
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!("Refresh scheduler shutting down");
                            break;
                        }
                    }
                }
            }
        });

        shutdown_tx
    }

    /// Spawn an execution for every job whose interval has elapsed.
    ///
    /// Returns the number of executions spawned.
    pub fn dispatch_due(self: &Arc<Self>) -> usize {
        let now = Instant::now();
        let due: Vec<String> = self
            .jobs
            .lock()
            .values()
            .filter(|state| state.is_due(now))
            .map(|state| state.definition.name.clone())
            .collect();

        for name in &due {
            self.spawn_execution(name.clone(), ExecutionTrigger::Interval);
        }
        due.len()
    }

    /// Execute a job now and wait for the outcome.
    pub async fn execute_job(self: &Arc<Self>, name: &str) -> Result<JobOutcome, SchedulerError> {
        self.run(name, ExecutionTrigger::Manual).await
    }

    /// Execute a job now regardless of its interval.
    pub async fn force_refresh(self: &Arc<Self>, name: &str) -> Result<JobOutcome, SchedulerError> {
        info!(job = %name, "Forced refresh requested");
        self.run(name, ExecutionTrigger::Forced).await
    }

    /// Read the data prefetched for `topic` (stored under `prefetch:<topic>`).
    pub async fn get_prefetched(&self, topic: &str) -> Option<Arc<Vec<u8>>> {
        self.cache.get(&format!("{PREFETCH_PREFIX}{topic}")).await
    }

    pub async fn get_prefetched_json<T: DeserializeOwned>(&self, topic: &str) -> Option<T> {
        self.cache.get_json(&format!("{PREFETCH_PREFIX}{topic}")).await
    }

    pub fn job_status(&self, name: &str) -> Result<JobStatus, SchedulerError> {
        self.jobs
            .lock()
            .get(name)
            .map(|state| state.status(Instant::now()))
            .ok_or_else(|| SchedulerError::JobNotFound(name.to_string()))
    }

    /// Status of every job, highest priority first, then by name.
    pub fn job_statuses(&self) -> Vec<JobStatus> {
        let now = Instant::now();
        let mut statuses: Vec<JobStatus> =
            self.jobs.lock().values().map(|state| state.status(now)).collect();
        statuses.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        statuses
    }

    fn job_names_with_priority(&self, priority: Priority) -> Vec<String> {
        let mut names: Vec<String> = self
            .jobs
            .lock()
            .values()
            .filter(|state| state.definition.priority == priority)
            .map(|state| state.definition.name.clone())
            .collect();
        names.sort();
        names
    }

    fn spawn_execution(self: &Arc<Self>, name: String, trigger: ExecutionTrigger) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = scheduler.run(&name, trigger).await {
                warn!(job = %name, ?trigger, error = %e, "Refresh job execution skipped");
            }
        });
    }

    fn schedule_retry(self: &Arc<Self>, name: String, attempt: u32, delay: Duration) {
        debug!(job = %name, attempt, delay_ms = delay.as_millis() as u64, "Scheduling retry");
        if let Some(events) = &self.events {
            events.publish(CoreEvent::RetryScheduled {
                job: name.clone(),
                attempt,
                delay,
            });
        }

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = scheduler.run(&name, ExecutionTrigger::Retry).await {
                warn!(job = %name, error = %e, "Retry skipped");
            }
        });
    }

    async fn run(
        self: &Arc<Self>,
        name: &str,
        trigger: ExecutionTrigger,
    ) -> Result<JobOutcome, SchedulerError> {
        let definition = {
            let mut jobs = self.jobs.lock();
            let state = jobs
                .get_mut(name)
                .ok_or_else(|| SchedulerError::JobNotFound(name.to_string()))?;

            if trigger == ExecutionTrigger::Retry {
                state.retry_pending = false;
            }
            if state.running {
                debug!(job = %name, ?trigger, "Refresh job already running, skipping");
                return Ok(JobOutcome::AlreadyRunning);
            }
            // A regular interval run starts a fresh retry budget once the old one is spent.
            if trigger == ExecutionTrigger::Interval
                && state.retry_count >= state.definition.max_retries
            {
                state.retry_count = 0;
            }

            state.running = true;
            state.run_count += 1;
            state.last_run_at = Some(Instant::now());
            state.definition.clone()
        };
        let guard = RunningGuard {
            jobs: &self.jobs,
            name,
        };

        debug!(job = %name, ?trigger, "Executing refresh job");
        let started = Instant::now();
        let fetched = (definition.fetch)().await;
        let elapsed = started.elapsed();

        match fetched {
            Ok(data) => {
                let bytes = data.len();
                let tags: Vec<&str> = definition.tags.iter().map(String::as_str).collect();
                self.cache
                    .set(&definition.cache_key, data, definition.ttl, &tags)
                    .await;

                if let Some(state) = self.jobs.lock().get_mut(name) {
                    state.retry_count = 0;
                    state.last_success_at = Some(Instant::now());
                    state.last_error = None;
                }
                drop(guard);

                info!(job = %name, bytes, duration_ms = elapsed.as_millis() as u64, "Refresh job succeeded");
                metrics::record_refresh(name, "success", elapsed);
                if let Some(events) = &self.events {
                    events.publish(CoreEvent::JobSucceeded {
                        job: name.to_string(),
                        duration: elapsed,
                        bytes,
                    });
                }
                Ok(JobOutcome::Succeeded { bytes })
            }
            Err(e) => {
                let error = format!("{e:#}");
                let (retry_count, retry_delay) = {
                    let mut jobs = self.jobs.lock();
                    match jobs.get_mut(name) {
                        Some(state) => {
                            let should_retry = state.retry_count < state.definition.max_retries;
                            state.retry_count += 1;
                            state.failure_count += 1;
                            state.last_error = Some(error.clone());
                            state.retry_pending = should_retry;
                            let delay = should_retry
                                .then(|| self.config.backoff_base * state.retry_count);
                            (state.retry_count, delay)
                        }
                        None => (0, None),
                    }
                };
                drop(guard);

                if retry_delay.is_some() {
                    warn!(job = %name, retry_count, error = %error, "Refresh job failed");
                } else {
                    error!(job = %name, retry_count, error = %error, "Refresh job failed, retries exhausted");
                }
                metrics::record_refresh(name, "failure", elapsed);
                if let Some(events) = &self.events {
                    events.publish(CoreEvent::JobFailed {
                        job: name.to_string(),
                        error: error.clone(),
                        retry_count,
                    });
                }

                if let Some(delay) = retry_delay {
                    self.schedule_retry(name.to_string(), retry_count, delay);
                }
                Ok(JobOutcome::Failed {
                    error,
                    retry_scheduled: retry_delay.is_some(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scheduler() -> Arc<RefreshScheduler> {
        let cache = Arc::new(TieredCache::new_local(CacheConfig::default()));
        Arc::new(RefreshScheduler::new(cache, SchedulerConfig::default()))
    }

    fn counting_job(name: &str, calls: Arc<AtomicUsize>, fail: bool) -> JobDefinition {
        JobDefinition::new(name, Duration::from_secs(30), move || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if fail {
                    anyhow::bail!("upstream unavailable");
                }
                Ok(b"{}".to_vec())
            }
        })
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let scheduler = scheduler();
        let calls = Arc::new(AtomicUsize::new(0));
        scheduler
            .register_job(counting_job("prices", Arc::clone(&calls), false))
            .unwrap();
        let err = scheduler
            .register_job(counting_job("prices", calls, false))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateJob(ref n) if n == "prices"));
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let scheduler = scheduler();
        let err = scheduler.force_refresh("missing").await.unwrap_err();
        assert!(matches!(err, SchedulerError::JobNotFound(_)));
        assert!(scheduler.job_status("missing").is_err());
    }

    #[tokio::test]
    async fn test_success_writes_cache_and_resets_retries() {
        let scheduler = scheduler();
        let calls = Arc::new(AtomicUsize::new(0));
        scheduler
            .register_job(counting_job("prices", Arc::clone(&calls), false))
            .unwrap();

        let outcome = scheduler.execute_job("prices").await.unwrap();
        assert_eq!(outcome, JobOutcome::Succeeded { bytes: 2 });
        assert_eq!(scheduler.get_prefetched("prices").await.unwrap().as_slice(), b"{}");

        let status = scheduler.job_status("prices").unwrap();
        assert_eq!(status.retry_count, 0);
        assert_eq!(status.run_count, 1);
        assert!(!status.running);
        assert!(status.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_execution_is_skipped() {
        let scheduler = scheduler();
        let job = JobDefinition::new("slow", Duration::from_secs(30), || async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(b"1".to_vec())
        });
        scheduler.register_job(job).unwrap();

        let first = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.execute_job("slow").await })
        };
        tokio::task::yield_now().await;

        let second = scheduler.execute_job("slow").await.unwrap();
        assert_eq!(second, JobOutcome::AlreadyRunning);

        let first = first.await.unwrap().unwrap();
        assert_eq!(first, JobOutcome::Succeeded { bytes: 1 });
        assert!(!scheduler.job_status("slow").unwrap().running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_schedules_retry_with_linear_backoff() {
        let scheduler = scheduler();
        let calls = Arc::new(AtomicUsize::new(0));
        scheduler
            .register_job(counting_job("prices", Arc::clone(&calls), true).with_max_retries(1))
            .unwrap();

        let outcome = scheduler.execute_job("prices").await.unwrap();
        assert!(matches!(
            outcome,
            JobOutcome::Failed {
                retry_scheduled: true,
                ..
            }
        ));
        let status = scheduler.job_status("prices").unwrap();
        assert_eq!(status.retry_count, 1);
        assert!(status.retry_pending);

        // First retry waits backoff_base * 1.
        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let status = scheduler.job_status("prices").unwrap();
        assert_eq!(status.retry_count, 2);
        assert!(!status.retry_pending);
        assert_eq!(status.failure_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_due_respects_interval() {
        let scheduler = scheduler();
        let calls = Arc::new(AtomicUsize::new(0));
        scheduler
            .register_job(counting_job("prices", Arc::clone(&calls), false))
            .unwrap();

        assert_eq!(scheduler.dispatch_due(), 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(scheduler.dispatch_due(), 0);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(scheduler.dispatch_due(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_runs_by_priority() {
        let scheduler = scheduler();
        let high = Arc::new(AtomicUsize::new(0));
        let low = Arc::new(AtomicUsize::new(0));
        scheduler
            .register_job(counting_job("high", Arc::clone(&high), false).with_priority(Priority::High))
            .unwrap();
        scheduler
            .register_job(counting_job("low", Arc::clone(&low), false).with_priority(Priority::Low))
            .unwrap();

        let shutdown = scheduler.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(high.load(Ordering::SeqCst), 1);
        assert_eq!(low.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(low.load(Ordering::SeqCst), 1);

        let _ = shutdown.send(true);
        let statuses = scheduler.job_statuses();
        assert_eq!(statuses[0].name, "high");
        assert_eq!(statuses[1].name, "low");
    }
}
