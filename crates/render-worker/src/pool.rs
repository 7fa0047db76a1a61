//! Per-type worker pools.
//!
//! Each pool bounds concurrency with a semaphore and job starts with a GCRA
//! rate limiter. A permit is taken before dequeuing, so the job popped is the
//! highest-priority one at the moment a slot frees up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use governor::DefaultDirectRateLimiter;
use tokio::sync::{mpsc, watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

use render_models::{ControlAction, ControlCommand, Job, JobId, JobStatus, JobType};
use render_queue::{FailOutcome, RenderJobQueue};

use crate::config::{PoolConfig, WorkerConfig};
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::metrics;
use crate::pipeline::{PipelineControl, PipelineState};
use crate::processor::{JobContext, JobProcessor, QuietCalls};
use crate::retry::FailureTracker;

#[derive(Clone)]
struct ActiveJob {
    control: PipelineControl,
    token: String,
    /// Serializes this worker's writes to the job record.
    writes: Arc<Mutex<()>>,
}

/// Controls of the jobs running in this process, keyed by job id.
#[derive(Clone, Default)]
pub struct ControlRegistry {
    jobs: Arc<Mutex<HashMap<JobId, ActiveJob>>>,
}

impl ControlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn register(&self, job_id: &JobId, active: ActiveJob) {
        self.jobs.lock().await.insert(job_id.clone(), active);
    }

    async fn unregister(&self, job_id: &JobId) {
        self.jobs.lock().await.remove(job_id);
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Apply a control command if the job runs here. Returns whether it did.
    pub async fn apply(&self, command: &ControlCommand, queue: &RenderJobQueue) -> bool {
        let Some(active) = self.jobs.lock().await.get(&command.job_id).cloned() else {
            return false;
        };

        let _write = active.writes.lock().await;
        let (changed, status) = match command.action {
            ControlAction::Pause => (active.control.pause(), Some(JobStatus::Paused)),
            ControlAction::Resume => (active.control.resume(), Some(JobStatus::Active)),
            ControlAction::Cancel => (active.control.cancel(), None),
        };
        debug!(job_id = %command.job_id, action = ?command.action, changed, "Control command applied");

        if let (true, Some(status)) = (changed, status) {
            // Progress is monotonic, so 0 keeps the current value.
            if let Err(e) = queue
                .monitor()
                .publish_as(&command.job_id, &active.token, Some(status), 0)
                .await
            {
                warn!(job_id = %command.job_id, "Failed to publish {}: {}", status, e);
            }
        }
        changed
    }
}

/// Route control commands from the queue to locally running jobs.
pub async fn run_control_listener(
    queue: Arc<RenderJobQueue>,
    registry: ControlRegistry,
    mut shutdown: watch::Receiver<bool>,
) -> WorkerResult<()> {
    let mut commands = queue.control_commands().await?;
    info!("Control listener started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            command = commands.next() => match command {
                Some(command) => {
                    registry.apply(&command, &queue).await;
                }
                None => {
                    warn!("Control channel closed");
                    break;
                }
            },
        }
    }
    Ok(())
}

/// Fixed-size pool consuming one job type.
pub struct WorkerPool {
    config: PoolConfig,
    worker: WorkerConfig,
    queue: Arc<RenderJobQueue>,
    processor: Arc<dyn JobProcessor>,
    registry: ControlRegistry,
    semaphore: Arc<Semaphore>,
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl WorkerPool {
    pub fn new(
        config: PoolConfig,
        worker: WorkerConfig,
        queue: Arc<RenderJobQueue>,
        processor: Arc<dyn JobProcessor>,
        registry: ControlRegistry,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
        let limiter = Arc::new(config.rate_limiter());
        Self {
            config,
            worker,
            queue,
            processor,
            registry,
            semaphore,
            limiter,
        }
    }

    pub fn job_type(&self) -> JobType {
        self.config.job_type
    }

    pub fn active_jobs(&self) -> usize {
        self.config.concurrency.max(1) - self.semaphore.available_permits()
    }

    /// Consume jobs until `shutdown` flips, then drain running jobs up to
    /// the shutdown timeout. Jobs still running after that are aborted and
    /// later re-queued by the stall detector.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> WorkerResult<()> {
        let job_type = self.job_type();
        info!(
            job_type = job_type.as_str(),
            concurrency = self.config.concurrency,
            rate_limit = self.config.rate_limit,
            rate_window_secs = self.config.rate_window.as_secs(),
            "Worker pool started"
        );

        let mut tasks = JoinSet::new();
        loop {
            reap(&mut tasks);
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => permit
                    .map_err(|_| WorkerError::config_error("pool semaphore closed"))?,
                _ = shutdown.changed() => break,
            };

            let next = tokio::select! {
                next = self.next_job() => next,
                _ = shutdown.changed() => break,
            };

            match next {
                Ok(Some(job)) => self.spawn_job(&mut tasks, job, permit),
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(self.worker.poll_interval) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(job_type = job_type.as_str(), "Failed to fetch next job: {}", e);
                    tokio::time::sleep(self.worker.poll_interval.max(Duration::from_secs(1))).await;
                }
            }
        }

        info!(
            job_type = job_type.as_str(),
            running = tasks.len(),
            "Worker pool stopping, waiting for running jobs"
        );
        let drained = tokio::time::timeout(self.worker.shutdown_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                job_type = job_type.as_str(),
                aborted = tasks.len(),
                "Shutdown timeout reached, aborting running jobs"
            );
            tasks.abort_all();
        }
        info!(job_type = job_type.as_str(), "Worker pool stopped");
        Ok(())
    }

    async fn next_job(&self) -> WorkerResult<Option<Job>> {
        let job_type = self.job_type();
        self.queue.promote_due(job_type).await?;
        if self.queue.ready_len(job_type).await? == 0 {
            return Ok(None);
        }
        self.limiter.until_ready().await;
        Ok(self.queue.dequeue(job_type).await?)
    }

    fn spawn_job(&self, tasks: &mut JoinSet<()>, job: Job, permit: OwnedSemaphorePermit) {
        let Some(token) = job.worker_token.clone() else {
            warn!(job_id = %job.id, "Dequeued job without a worker token");
            return;
        };

        let runner = JobRunner {
            queue: self.queue.clone(),
            processor: self.processor.clone(),
            registry: self.registry.clone(),
            heartbeat_interval: self.worker.heartbeat_interval,
        };
        let semaphore = self.semaphore.clone();
        let concurrency = self.config.concurrency.max(1);
        let job_type = self.job_type();
        let span = JobLogger::new(&job.id, job.job_type, job.attempts).span();

        metrics::set_pool_active(job_type.as_str(), concurrency - semaphore.available_permits());
        tasks.spawn(
            async move {
                runner.run(job, token).await;
                drop(permit);
                metrics::set_pool_active(job_type.as_str(), concurrency - semaphore.available_permits());
            }
            .instrument(span),
        );
    }
}

fn reap(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        if let Err(e) = result {
            if e.is_panic() {
                error!("Job task panicked: {}", e);
            }
        }
    }
}

/// Runs one job attempt and settles it with the queue.
struct JobRunner {
    queue: Arc<RenderJobQueue>,
    processor: Arc<dyn JobProcessor>,
    registry: ControlRegistry,
    heartbeat_interval: Duration,
}

impl JobRunner {
    async fn run(self, job: Job, token: String) {
        let logger = JobLogger::new(&job.id, job.job_type, job.attempts);
        logger.started(&format!(
            "attempt {}/{} priority {}",
            job.attempts, job.max_attempts, job.priority_score
        ));

        let control = PipelineControl::new();
        control.start();
        let writes = Arc::new(Mutex::new(()));
        self.registry
            .register(
                &job.id,
                ActiveJob {
                    control: control.clone(),
                    token: token.clone(),
                    writes: writes.clone(),
                },
            )
            .await;

        // A cancel sent before registration never reached the registry.
        match self.queue.cancel_requested(&job.id).await {
            Ok(true) => {
                logger.progress("cancel requested before start");
                control.cancel();
            }
            Ok(false) => {}
            Err(e) => logger.warning(&format!("could not read cancel request: {e}")),
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = JobContext::new(control.clone(), logger.clone(), tx);
        let forwarder = tokio::spawn(forward_progress(
            self.queue.clone(),
            job.id.clone(),
            token.clone(),
            control.clone(),
            writes,
            self.heartbeat_interval,
            rx,
        ));
        let liveness = tokio::spawn(liveness_loop(
            self.queue.clone(),
            job.id.clone(),
            token.clone(),
            control.clone(),
            ctx.quiet_calls(),
            self.heartbeat_interval,
        ));

        let started = Instant::now();
        let result = if control.state() == PipelineState::Cancelled {
            Err(WorkerError::Cancelled)
        } else {
            self.processor.process(&job, &ctx).await
        };
        drop(ctx);

        let _ = forwarder.await;
        liveness.abort();
        self.registry.unregister(&job.id).await;

        let elapsed = started.elapsed().saturating_sub(control.paused_duration());
        self.settle(&job, &token, result, elapsed, &logger).await;
    }

    async fn settle(
        &self,
        job: &Job,
        token: &str,
        result: WorkerResult<render_models::JobResult>,
        elapsed: Duration,
        logger: &JobLogger,
    ) {
        let job_type = job.job_type.as_str();

        let settled = match result {
            Ok(output) => {
                let url = output.artifact_url.clone();
                match self.queue.complete(&job.id, token, output).await {
                    Ok(true) => {
                        metrics::record_job_completed(job_type, elapsed.as_secs_f64());
                        logger.completed(&format!("{} in {:?}", url, elapsed));
                        Ok(())
                    }
                    Ok(false) => {
                        logger.warning("finished after losing ownership; result dropped");
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) if e.is_cancelled() => match self.queue.mark_cancelled(&job.id, token).await {
                Ok(owned) => {
                    if owned {
                        metrics::record_job_cancelled(job_type);
                        logger.progress("cancelled");
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Err(e) => {
                let message = e.to_string();
                let outcome = self
                    .queue
                    .fail_or_retry(&job.id, token, &message, e.failed_stage(), e.is_retryable())
                    .await;
                match outcome {
                    Ok(FailOutcome::Retrying { attempt, delay }) => {
                        metrics::record_job_retried(job_type);
                        logger.warning(&format!(
                            "attempt {} failed, retrying in {:?}: {}",
                            attempt, delay, message
                        ));
                        Ok(())
                    }
                    Ok(FailOutcome::Failed) => {
                        metrics::record_job_failed(job_type);
                        logger.failed(&message);
                        Ok(())
                    }
                    Ok(FailOutcome::NotOwner) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        };

        if let Err(e) = settled {
            // The heartbeat is gone, so the stall detector picks the job up.
            error!(job_id = %job.id, "Failed to record job outcome: {}", e);
        }
    }
}

/// Persist processor progress under the attempt's token and refresh the
/// heartbeat from it. Losing ownership cancels the local run.
async fn forward_progress(
    queue: Arc<RenderJobQueue>,
    job_id: JobId,
    token: String,
    control: PipelineControl,
    writes: Arc<Mutex<()>>,
    heartbeat_interval: Duration,
    mut rx: mpsc::UnboundedReceiver<u8>,
) {
    let mut last = None;
    let mut last_beat: Option<Instant> = None;
    while let Some(percent) = rx.recv().await {
        if last != Some(percent) {
            last = Some(percent);
            let published = {
                let _write = writes.lock().await;
                queue.monitor().publish_as(&job_id, &token, None, percent).await
            };
            match published {
                Ok(Some(_)) => {}
                Ok(None) => {
                    warn!(job_id = %job_id, "Lost ownership, stopping local run");
                    control.cancel();
                    continue;
                }
                Err(e) => warn!(job_id = %job_id, "Failed to publish progress: {}", e),
            }
        }

        if last_beat.map_or(true, |at| at.elapsed() >= heartbeat_interval) {
            match queue.heartbeat(&job_id).await {
                Ok(()) => last_beat = Some(Instant::now()),
                Err(e) => debug!(job_id = %job_id, "Heartbeat failed: {}", e),
            }
        }
    }
}

/// Periodic ownership check for a running job.
///
/// Progress reports keep a working job alive. This loop only refreshes the
/// heartbeat while the job is paused or inside a quiet call, so a stage that
/// hangs without output goes stale and the stall detector requeues it. The
/// local run is cancelled once the job is requeued elsewhere, finished, or a
/// cancel was requested.
async fn liveness_loop(
    queue: Arc<RenderJobQueue>,
    job_id: JobId,
    token: String,
    control: PipelineControl,
    quiet: QuietCalls,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    let mut failures = FailureTracker::new(3);
    loop {
        ticker.tick().await;

        let owned = match queue.get_job(&job_id).await {
            Ok(job) => job.is_some_and(|job| {
                job.worker_token.as_deref() == Some(token.as_str()) && !job.status.is_terminal()
            }),
            Err(e) => {
                if failures.record_failure() {
                    warn!(job_id = %job_id, "Liveness check failed: {}", e);
                }
                continue;
            }
        };
        if !owned {
            warn!(job_id = %job_id, "Lost ownership, stopping local run");
            control.cancel();
            return;
        }
        if matches!(queue.cancel_requested(&job_id).await, Ok(true)) && control.cancel() {
            debug!(job_id = %job_id, "Applied pending cancel request");
        }

        if control.state() == PipelineState::Paused || quiet.in_flight() {
            match queue.heartbeat(&job_id).await {
                Ok(()) => failures.record_success(),
                Err(e) => {
                    if failures.record_failure() {
                        warn!(job_id = %job_id, "Heartbeat failed: {}", e);
                    }
                }
            }
        } else {
            failures.record_success();
        }
    }
}
