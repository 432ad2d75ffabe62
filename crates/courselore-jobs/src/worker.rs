//! Job worker: sweep, release, drain.
//!
//! One cycle, for each job kind in turn:
//!
//! 1. delete jobs past `expires_at` (EXPIRED)
//! 2. release claims older than the claim timeout (TIMED OUT), dropping
//!    notification claims a pending job already covers (SUPERSEDED)
//! 3. claim, process and delete due jobs until none is left
//!
//! The clock is read once for the sweeps and again for every claim, so a job
//! claimed late in a long drain carries the time it was actually claimed.
//!
//! A failing job is left claimed; the timeout sweep of a later cycle hands it
//! out again, and `expires_at` bounds how long that can go on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use courselore_core::defaults::{JOB_CLAIM_TIMEOUT_SECS, JOB_IDLE_INTERVAL_MS, JOB_THROTTLE_MS};
use courselore_core::{Error, Job, JobKind, Result};
use courselore_db::Database;

use crate::handler::{JobContext, JobHandler, JobResult};

/// Capacity of the worker event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep after a cycle, unless woken earlier.
    pub idle_interval_ms: u64,
    /// Pause between two jobs of one drain.
    pub throttle_ms: u64,
    /// Age after which a claim is considered abandoned.
    pub claim_timeout_secs: i64,
    /// Whether to enable job processing.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_interval_ms: JOB_IDLE_INTERVAL_MS,
            throttle_ms: JOB_THROTTLE_MS,
            claim_timeout_secs: JOB_CLAIM_TIMEOUT_SECS,
            enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `JOB_IDLE_INTERVAL_MS` | `120000` | Sleep between cycles |
    /// | `JOB_THROTTLE_MS` | `100` | Pause between jobs |
    /// | `JOB_CLAIM_TIMEOUT_SECS` | `120` | Release claims older than this |
    pub fn from_env() -> Self {
        let enabled = std::env::var("JOB_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let idle_interval_ms = std::env::var("JOB_IDLE_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(JOB_IDLE_INTERVAL_MS);

        let throttle_ms = std::env::var("JOB_THROTTLE_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(JOB_THROTTLE_MS);

        let claim_timeout_secs = std::env::var("JOB_CLAIM_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(JOB_CLAIM_TIMEOUT_SECS)
            .max(1);

        Self {
            idle_interval_ms,
            throttle_ms,
            claim_timeout_secs,
            enabled,
        }
    }

    pub fn with_idle_interval(mut self, ms: u64) -> Self {
        self.idle_interval_ms = ms;
        self
    }

    pub fn with_throttle(mut self, ms: u64) -> Self {
        self.throttle_ms = ms;
        self
    }

    pub fn with_claim_timeout(mut self, secs: i64) -> Self {
        self.claim_timeout_secs = secs;
        self
    }

    /// Enable or disable job processing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    fn claim_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.claim_timeout_secs)
    }
}

/// Event emitted by the job worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    JobExpired { job_id: i64, kind: JobKind },
    JobTimedOut { job_id: i64, kind: JobKind },
    JobSuperseded { job_id: i64, kind: JobKind },
    JobStarted { job_id: i64, kind: JobKind },
    JobSucceeded { job_id: i64, kind: JobKind },
    JobFailed { job_id: i64, kind: JobKind, error: String },
    /// A full sweep-and-drain cycle finished.
    CycleCompleted(CycleStats),
    WorkerStarted,
    WorkerStopped,
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub expired: usize,
    pub timed_out: usize,
    pub superseded: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker to shut down gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Wait for the worker task to finish.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| Error::Internal(format!("Job worker task failed: {e}")))
    }

    /// Cut the current idle sleep short.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

/// Job worker that drains both queues.
pub struct JobWorker {
    db: Database,
    config: WorkerConfig,
    handlers: Arc<RwLock<HashMap<JobKind, Arc<dyn JobHandler>>>>,
    event_tx: broadcast::Sender<WorkerEvent>,
    wake: Arc<Notify>,
}

impl JobWorker {
    /// Create a new job worker. It wakes whenever the database's job
    /// repository queues work.
    pub fn new(db: Database, config: WorkerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let wake = db.jobs.job_notify();
        Self {
            db,
            config,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            wake,
        }
    }

    /// Register a handler for a job kind.
    pub async fn register_handler<H: JobHandler + 'static>(&self, handler: H) {
        let kind = handler.kind();
        let mut handlers = self.handlers.write().await;
        handlers.insert(kind, Arc::new(handler));
        debug!(%kind, "Registered job handler");
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// The signal that cuts the idle sleep short.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();
        let wake = self.wake.clone();

        let task = tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
            wake,
            task,
        }
    }

    #[instrument(skip(self, shutdown_rx))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Job worker is disabled, not starting");
            return;
        }

        info!(
            idle_interval_ms = self.config.idle_interval_ms,
            throttle_ms = self.config.throttle_ms,
            claim_timeout_secs = self.config.claim_timeout_secs,
            "Job worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let idle = Duration::from_millis(self.config.idle_interval_ms);
        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!("Job worker received shutdown signal");
                break;
            }

            self.run_cycle(Utc::now).await;

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Job worker received shutdown signal");
                    break;
                }
                _ = self.wake.notified() => {
                    debug!("Job worker woken");
                }
                _ = sleep(idle) => {}
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Job worker stopped");
    }

    /// Run exactly one sweep-and-drain cycle with the clock frozen at `now`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> CycleStats {
        self.run_cycle(|| now).await
    }

    /// Run exactly one sweep-and-drain cycle over every job kind, reading
    /// `clock` before each sweep and each claim.
    ///
    /// Store errors are logged and end the current kind's pass; they never
    /// escape the cycle.
    pub async fn run_cycle<C>(&self, clock: C) -> CycleStats
    where
        C: Fn() -> DateTime<Utc> + Sync,
    {
        let mut stats = CycleStats::default();
        for kind in JobKind::ALL {
            if let Err(e) = self.cycle_kind(kind, &clock, &mut stats).await {
                error!(error = %e, %kind, "Job cycle aborted");
            }
        }
        let _ = self.event_tx.send(WorkerEvent::CycleCompleted(stats));
        stats
    }

    async fn cycle_kind<C>(&self, kind: JobKind, clock: &C, stats: &mut CycleStats) -> Result<()>
    where
        C: Fn() -> DateTime<Utc> + Sync,
    {
        let now = clock();
        for job_id in self.db.jobs.expire(kind, now).await? {
            info!(job_kind = %kind, job_id, "EXPIRED");
            let _ = self.event_tx.send(WorkerEvent::JobExpired { job_id, kind });
            stats.expired += 1;
        }

        let swept = self
            .db
            .jobs
            .release_timed_out(kind, now, self.config.claim_timeout())
            .await?;
        for job_id in swept.superseded {
            info!(job_kind = %kind, job_id, "SUPERSEDED");
            let _ = self.event_tx.send(WorkerEvent::JobSuperseded { job_id, kind });
            stats.superseded += 1;
        }
        for job_id in swept.released {
            warn!(job_kind = %kind, job_id, "TIMED OUT");
            let _ = self.event_tx.send(WorkerEvent::JobTimedOut { job_id, kind });
            stats.timed_out += 1;
        }

        let throttle = Duration::from_millis(self.config.throttle_ms);
        loop {
            let now = clock();
            let Some(job) = self.db.jobs.claim_next(kind, now).await? else {
                break;
            };
            if self.execute(job, now).await {
                stats.succeeded += 1;
            } else {
                stats.failed += 1;
            }
            if !throttle.is_zero() {
                sleep(throttle).await;
            }
        }
        Ok(())
    }

    /// Process one claimed job. Returns whether it succeeded.
    async fn execute(&self, job: Job, now: DateTime<Utc>) -> bool {
        let start = Instant::now();
        let job_id = job.id();
        let kind = job.kind();

        info!(job_kind = %kind, job_id, "STARTED");
        let _ = self.event_tx.send(WorkerEvent::JobStarted { job_id, kind });

        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(&kind).cloned()
        };

        let result = match handler {
            Some(handler) => {
                let timeout = Duration::from_secs(self.config.claim_timeout_secs.max(1) as u64);
                match tokio::time::timeout(timeout, handler.execute(JobContext::new(job, now)))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => JobResult::Failed(format!(
                        "Job exceeded timeout of {}s",
                        self.config.claim_timeout_secs
                    )),
                }
            }
            None => JobResult::Failed(format!("No handler for job kind: {kind}")),
        };

        match result {
            JobResult::Success => {
                if let Err(e) = self.db.jobs.complete(kind, job_id).await {
                    error!(error = %e, job_kind = %kind, job_id, "Failed to delete finished job");
                    return false;
                }
                info!(
                    job_kind = %kind,
                    job_id,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "SUCCEEDED"
                );
                let _ = self.event_tx.send(WorkerEvent::JobSucceeded { job_id, kind });
                true
            }
            JobResult::Failed(error) => {
                error!(
                    job_kind = %kind,
                    job_id,
                    %error,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "FAILED"
                );
                let _ = self.event_tx.send(WorkerEvent::JobFailed {
                    job_id,
                    kind,
                    error,
                });
                false
            }
        }
    }
}

/// Builder for creating a job worker with handlers.
pub struct WorkerBuilder {
    db: Database,
    config: WorkerConfig,
    handlers: Vec<Box<dyn JobHandler>>,
}

impl WorkerBuilder {
    /// Create a new worker builder.
    pub fn new(db: Database) -> Self {
        Self {
            db,
            config: WorkerConfig::default(),
            handlers: Vec::new(),
        }
    }

    /// Set the worker configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a handler.
    pub fn with_handler<H: JobHandler + 'static>(mut self, handler: H) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Build and return the worker.
    pub async fn build(self) -> JobWorker {
        let worker = JobWorker::new(self.db, self.config);

        for handler in self.handlers {
            let kind = handler.kind();
            let mut handlers = worker.handlers.write().await;
            handlers.insert(kind, Arc::from(handler));
        }

        worker
    }
}
