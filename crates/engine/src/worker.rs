//! Worker orchestrator.
//!
//! Runs the poll -> claim -> execute loop with bounded concurrency, the
//! stale-recovery sweep, and the drain-on-shutdown contract. Executions are
//! independent tasks that never synchronize with each other; the poll tick
//! keeps its cadence regardless of in-flight work.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use chronos_core::{process_host, Job, WorkerId};
use chronos_store::{JobStore, LockStore};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::WorkerEvent;
use crate::executor::{ExecutionOutcome, JobExecutor};
use crate::lock::LockManager;
use crate::picker::JobPicker;
use crate::registry::HandlerRegistry;
use crate::stats::{WorkerStats, WorkerStatsSnapshot};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Running,
    Paused,
    Draining,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: WorkerId,
    /// Cadence of the poll tick.
    pub poll_interval: Duration,
    /// In-flight execution cap for this worker.
    pub concurrency: usize,
    /// Default stale-lock threshold / handler deadline applied to new jobs
    /// by the API layer. The sweep itself honors each job's own value.
    pub lock_timeout_ms: i64,
    pub stale_sweep_interval: Duration,
    /// How long `stop()` waits for in-flight jobs before releasing them.
    pub drain_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::generate(),
            poll_interval: Duration::from_secs(5),
            concurrency: 5,
            lock_timeout_ms: 300_000,
            stale_sweep_interval: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    /// Read overrides from the environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = env_number("CHRONOS_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(n) = env_number("CHRONOS_CONCURRENCY") {
            config.concurrency = (n as usize).max(1);
        }
        if let Some(ms) = env_number("CHRONOS_LOCK_TIMEOUT_MS") {
            config.lock_timeout_ms = ms as i64;
        }
        if let Ok(id) = std::env::var("CHRONOS_WORKER_ID") {
            if !id.is_empty() {
                config.worker_id = WorkerId::new(id);
            }
        }
        config
    }

    /// Whether `DISABLE_WORKER` suppresses worker startup (used when the
    /// same binary only serves the API).
    pub fn disabled_by_env() -> bool {
        std::env::var("DISABLE_WORKER")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}

fn env_number(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.parse().ok()
}

pub struct Worker {
    config: WorkerConfig,
    store: Arc<dyn JobStore>,
    lock_store: Arc<dyn LockStore>,
    picker: Arc<JobPicker>,
    executor: Arc<JobExecutor>,
    locks: Arc<LockManager>,
    stats: Arc<WorkerStats>,
    events: broadcast::Sender<WorkerEvent>,
    state: Mutex<WorkerState>,
    shutdown: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn JobStore>,
        lock_store: Arc<dyn LockStore>,
        registry: Arc<HandlerRegistry>,
        config: WorkerConfig,
    ) -> Arc<Self> {
        let worker_id = config.worker_id.clone();
        let picker = Arc::new(JobPicker::new(store.clone(), worker_id.clone()));
        let executor = Arc::new(JobExecutor::new(
            store.clone(),
            registry,
            worker_id.clone(),
            process_host(),
        ));
        let locks = Arc::new(LockManager::new(lock_store.clone(), worker_id));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Arc::new(Self {
            config,
            store,
            lock_store,
            picker,
            executor,
            locks,
            stats: Arc::new(WorkerStats::new()),
            events,
            state: Mutex::new(WorkerState::Stopped),
            shutdown: CancellationToken::new(),
            loops: Mutex::new(Vec::new()),
        })
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.config.worker_id
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot(Utc::now())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    pub fn picker(&self) -> &Arc<JobPicker> {
        &self.picker
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Start the poll and stale-recovery loops. No-op unless stopped.
    pub fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            if *state != WorkerState::Stopped {
                return;
            }
            *state = WorkerState::Running;
        }
        self.stats.mark_started(Utc::now());
        info!(
            worker_id = %self.config.worker_id,
            concurrency = self.config.concurrency,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "worker started"
        );
        self.emit(WorkerEvent::Started {
            worker_id: self.config.worker_id.to_string(),
        });

        let poll = tokio::spawn(Arc::clone(self).poll_loop());
        let sweep = tokio::spawn(Arc::clone(self).sweep_loop());
        let mut loops = self.loops.lock().unwrap_or_else(|p| p.into_inner());
        loops.push(poll);
        loops.push(sweep);
    }

    /// Stop picking new jobs; in-flight executions finish normally.
    pub fn pause(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if *state == WorkerState::Running {
            *state = WorkerState::Paused;
            drop(state);
            info!(worker_id = %self.config.worker_id, "worker paused");
            self.emit(WorkerEvent::Paused);
        }
    }

    pub fn resume(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if *state == WorkerState::Paused {
            *state = WorkerState::Running;
            drop(state);
            info!(worker_id = %self.config.worker_id, "worker resumed");
            self.emit(WorkerEvent::Resumed);
        }
    }

    /// Drain and stop: cease polling immediately, wait up to
    /// `drain_timeout` for in-flight jobs, then release whatever this
    /// worker still holds so another worker can pick it up.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            match *state {
                WorkerState::Stopped | WorkerState::Draining => return,
                _ => *state = WorkerState::Draining,
            }
        }
        info!(worker_id = %self.config.worker_id, "worker draining");
        self.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> = {
            let mut loops = self.loops.lock().unwrap_or_else(|p| p.into_inner());
            loops.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }

        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = WorkerState::Stopped;
        info!(worker_id = %self.config.worker_id, "worker stopped");
        self.emit(WorkerEvent::Stopped {
            worker_id: self.config.worker_id.to_string(),
        });
    }

    fn is_picking(&self) -> bool {
        self.state() == WorkerState::Running
    }

    fn emit(&self, event: WorkerEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    async fn poll_loop(self: Arc<Self>) {
        let mut inflight: JoinSet<()> = JoinSet::new();
        let mut tick = tokio::time::interval(self.config.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tick.tick() => {
                    while inflight.try_join_next().is_some() {}
                    if !self.is_picking() {
                        continue;
                    }
                    let free = self.config.concurrency.saturating_sub(inflight.len());
                    if free == 0 {
                        debug!(worker_id = %self.config.worker_id, "concurrency saturated, skipping tick");
                        continue;
                    }
                    match self.picker.pick_many(free).await {
                        Ok(jobs) => {
                            for job in jobs {
                                self.spawn_execution(&mut inflight, job);
                            }
                        }
                        Err(e) => {
                            warn!(worker_id = %self.config.worker_id, error = %e, "pick failed");
                            self.emit(WorkerEvent::Error { message: e.to_string() });
                        }
                    }
                }
            }
        }

        self.drain(inflight).await;
    }

    async fn drain(&self, mut inflight: JoinSet<()>) {
        if !inflight.is_empty() {
            info!(
                worker_id = %self.config.worker_id,
                in_flight = inflight.len(),
                "waiting for in-flight jobs"
            );
            let deadline = tokio::time::sleep(self.config.drain_timeout);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => {
                        warn!(
                            worker_id = %self.config.worker_id,
                            abandoned = inflight.len(),
                            "drain deadline reached, releasing held jobs"
                        );
                        break;
                    }
                    joined = inflight.join_next() => {
                        if joined.is_none() {
                            break;
                        }
                    }
                }
            }
            inflight.abort_all();
        }

        // Anything still QUEUED/RUNNING under our lock goes back to
        // SCHEDULED so another worker can retry it.
        match self.picker.release_all().await {
            Ok(0) => {}
            Ok(n) => info!(worker_id = %self.config.worker_id, released = n, "released held jobs"),
            Err(e) => warn!(worker_id = %self.config.worker_id, error = %e, "release_all failed"),
        }
        if let Err(e) = self.locks.release_all().await {
            warn!(worker_id = %self.config.worker_id, error = %e, "lock release_all failed");
        }
    }

    fn spawn_execution(self: &Arc<Self>, inflight: &mut JoinSet<()>, job: Job) {
        let attempt = job.retry_count;
        self.stats.job_started();
        self.emit(WorkerEvent::JobStart {
            job_id: job.id,
            task_type: job.task_type.clone(),
            attempt,
        });

        let worker = Arc::clone(self);
        let was_retry = attempt > 0;
        inflight.spawn(async move {
            let outcome = worker.executor.execute(job).await;
            let now = Utc::now();
            match outcome {
                ExecutionOutcome::Succeeded {
                    job_id,
                    result,
                    duration_ms,
                } => {
                    worker.stats.job_succeeded(duration_ms, was_retry, now);
                    worker.emit(WorkerEvent::JobComplete {
                        job_id,
                        result,
                        duration_ms,
                    });
                }
                ExecutionOutcome::Retrying {
                    job_id,
                    error,
                    attempt,
                    next_retry_at,
                    remaining_retries,
                } => {
                    worker.stats.job_retrying(now);
                    worker.emit(WorkerEvent::JobRetry {
                        job_id,
                        error,
                        attempt,
                        next_retry_at,
                        remaining_retries,
                    });
                }
                ExecutionOutcome::Failed {
                    job_id,
                    error,
                    attempt,
                    reason,
                } => {
                    worker.stats.job_failed(now);
                    worker.emit(WorkerEvent::JobFailed {
                        job_id,
                        error,
                        attempt,
                        reason: reason.as_str().to_string(),
                    });
                }
                ExecutionOutcome::Lost { job_id, error } => {
                    worker.stats.job_lost();
                    worker.emit(WorkerEvent::JobError { job_id, error });
                }
            }
        });
    }

    /// Reclaims work abandoned by crashed workers and evicts expired
    /// records. Safe to run on every worker concurrently.
    async fn sweep_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.config.stale_sweep_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The immediate first tick would race workers that are mid-claim at
        // startup; skip it.
        tick.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tick.tick() => {
                    match self.picker.recover_stale(None).await {
                        Ok(0) => {}
                        Ok(n) => info!(worker_id = %self.config.worker_id, recovered = n, "recovered stale jobs"),
                        Err(e) => {
                            warn!(worker_id = %self.config.worker_id, error = %e, "stale recovery failed");
                            self.emit(WorkerEvent::Error { message: e.to_string() });
                        }
                    }
                    let now = Utc::now();
                    if let Err(e) = self.store.purge_expired(now).await {
                        warn!(worker_id = %self.config.worker_id, error = %e, "ttl purge failed");
                    }
                    if let Err(e) = self.lock_store.purge_expired_locks(now).await {
                        warn!(worker_id = %self.config.worker_id, error = %e, "lock purge failed");
                    }
                }
            }
        }
    }
}
