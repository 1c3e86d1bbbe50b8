//! Worker pool that turns queued envelopes into fragment logs.
//!
//! Each worker runs as an independent async task: claim an envelope, resolve
//! its engine, stream fragments into the envelope's log, then ack or fail the
//! delivery. While generating, the worker heartbeats its lease. A separate
//! reaper task collects deliveries whose lease ran out, seals their logs with
//! an error terminal and hands them to the queue's retry policy.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Graceful shutdown with broadcast channel
//! - Lease heartbeat; a worker that loses its lease stops without writing
//! - Per-job deadline enforced on the engine stream
//! - Pool statistics tracking

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ProduceError;
use crate::fragment::producer::{
    seal_abandoned, FragmentProducer, LogRetention, ProduceSummary, ABANDONED_REASON,
};
use crate::fragment::store::LogStore;
use crate::llm::{with_deadline, EngineRegistry, GenerationRequest};
use crate::metrics::MetricsCollector;

use super::job::JobPhase;
use super::queue::{Delivery, FailOutcome, QueueError, WorkQueue};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A queue operation failed.
    #[error("Queue operation failed: {0}")]
    Queue(#[from] QueueError),

    /// Pool configuration is unusable.
    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// How long a claim waits for work before checking for shutdown.
    pub poll_interval: Duration,
    /// Maximum time a single generation may run.
    pub job_timeout: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
    /// Lease length the queue grants; a worker that cannot extend it for
    /// this long treats it as lost.
    pub lease: Duration,
    /// How often a busy worker extends its lease.
    pub heartbeat_interval: Duration,
    /// How often the reaper looks for expired leases.
    pub reap_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 20,
            poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(600),
            shutdown_timeout: Duration::from_secs(60),
            lease: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(20),
            reap_interval: Duration::from_secs(5),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the job timeout.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets the lease and heartbeats three times per lease.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self.heartbeat_interval = lease / 3;
        self
    }

    /// Sets the reaper interval.
    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently processing jobs.
    pub active_workers: usize,
    /// Jobs that reached a success terminal and were acked.
    pub jobs_completed: u64,
    /// Jobs that ended with an error and were failed to the queue.
    pub jobs_failed: u64,
    /// Jobs abandoned because the worker's lease was revoked.
    pub leases_lost: u64,
    /// Deliveries the reaper sealed and failed.
    pub jobs_reaped: u64,
    /// Average job processing duration.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of jobs processed (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    leases_lost: AtomicU64,
    jobs_reaped: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            leases_lost: AtomicU64::new(0),
            jobs_reaped: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record_completion(&self, duration: Duration) {
        self.jobs_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.jobs_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_lease_lost(&self) {
        self.leases_lost.fetch_add(1, Ordering::SeqCst);
    }

    fn record_reaped(&self, count: usize) {
        self.jobs_reaped.fetch_add(count as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total_jobs = completed + failed;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            jobs_completed: completed,
            jobs_failed: failed,
            leases_lost: self.leases_lost.load(Ordering::SeqCst),
            jobs_reaped: self.jobs_reaped.load(Ordering::SeqCst),
            average_job_duration: average_duration,
        }
    }
}

fn record_fail_outcome(metrics: &MetricsCollector, outcome: &FailOutcome) {
    match outcome {
        FailOutcome::Redelivered(_) => metrics.record_redelivery(),
        FailOutcome::DeadLettered => metrics.record_dead_letter(),
        FailOutcome::NotHeld => {}
    }
}

/// Seals and fails deliveries whose worker stopped heartbeating.
#[derive(Clone)]
pub struct StallReaper {
    queue: Arc<dyn WorkQueue>,
    store: Arc<dyn LogStore>,
    retention: LogRetention,
    metrics: MetricsCollector,
}

impl StallReaper {
    pub fn new(queue: Arc<dyn WorkQueue>, store: Arc<dyn LogStore>, retention: LogRetention) -> Self {
        Self {
            queue,
            store,
            retention,
            metrics: MetricsCollector::new(),
        }
    }

    /// Revokes expired leases and settles each delivery. Returns how many
    /// deliveries were settled.
    pub async fn sweep(&self) -> Result<usize, QueueError> {
        let stalled = self.queue.reap_stalled().await?;
        let count = stalled.len();
        for delivery in stalled {
            self.settle(delivery).await;
        }

        if let Ok(stats) = self.queue.stats().await {
            self.metrics.update_queue_depth(&stats);
        }
        Ok(count)
    }

    /// Settles deliveries left without a lease by a previous process.
    pub async fn recover(&self) -> Result<usize, QueueError> {
        let orphans = self.queue.recover_orphans().await?;
        let count = orphans.len();
        for delivery in orphans {
            self.settle(delivery).await;
        }
        Ok(count)
    }

    async fn settle(&self, delivery: Delivery) {
        let job_id = delivery.envelope.job_id;
        let address = delivery.envelope.log_address.clone();

        // Readers of the abandoned log must see an end before the job
        // moves on under a new address.
        match seal_abandoned(Arc::clone(&self.store), &address, self.retention).await {
            Ok(Some(terminal_id)) => {
                self.metrics.record_orphan_sealed();
                info!(job_id = %job_id, log_address = %address, terminal_id = %terminal_id, "Sealed abandoned log");
            }
            Ok(None) => {
                debug!(job_id = %job_id, log_address = %address, "Abandoned log already terminated");
            }
            Err(e) => {
                warn!(job_id = %job_id, log_address = %address, error = %e, "Failed to seal abandoned log");
            }
        }

        match self.queue.fail(delivery, ABANDONED_REASON).await {
            Ok(outcome) => {
                record_fail_outcome(&self.metrics, &outcome);
                info!(job_id = %job_id, outcome = ?outcome, "Settled stalled delivery");
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to settle stalled delivery");
            }
        }
    }
}

/// Worker pool that manages multiple workers processing jobs from a queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<dyn WorkQueue>,
    store: Arc<dyn LogStore>,
    engines: Arc<EngineRegistry>,
    retention: LogRetention,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
    metrics: MetricsCollector,
}

impl WorkerPool {
    /// Creates a new worker pool over a queue, a log store and the engines
    /// jobs are routed to.
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<dyn WorkQueue>,
        store: Arc<dyn LogStore>,
        engines: Arc<EngineRegistry>,
        retention: LogRetention,
    ) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            queue,
            store,
            engines,
            retention,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
            metrics: MetricsCollector::new(),
        }
    }

    /// Reaper sharing this pool's queue, store and retention.
    pub fn reaper(&self) -> StallReaper {
        StallReaper::new(Arc::clone(&self.queue), Arc::clone(&self.store), self.retention)
    }

    /// Starts all workers and the reaper.
    ///
    /// Deliveries orphaned by a previous process are settled first.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }
        if self.config.num_workers == 0 {
            return Err(PoolError::InvalidConfig("num_workers must be at least 1".to_string()));
        }
        if self.config.heartbeat_interval.is_zero() {
            return Err(PoolError::InvalidConfig("heartbeat interval must be non-zero".to_string()));
        }
        if self.config.heartbeat_interval >= self.config.lease {
            return Err(PoolError::InvalidConfig(
                "heartbeat interval must be shorter than the lease".to_string(),
            ));
        }

        let reaper = self.reaper();
        match reaper.recover().await {
            Ok(recovered) if recovered > 0 => {
                info!(recovered = recovered, "Recovered orphaned deliveries");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Failed to recover orphaned deliveries");
            }
        }

        for i in 0..self.config.num_workers {
            let worker = Worker {
                id: format!("worker-{}", i),
                queue: Arc::clone(&self.queue),
                store: Arc::clone(&self.store),
                engines: Arc::clone(&self.engines),
                retention: self.retention,
                shutdown_rx: self.shutdown_tx.subscribe(),
                config: self.config.clone(),
                stats: Arc::clone(&self.stats),
                metrics: self.metrics.clone(),
            };

            self.worker_handles.push(tokio::spawn(worker.run()));
        }

        let handle = tokio::spawn(run_reaper(
            reaper,
            self.config.reap_interval,
            self.shutdown_tx.subscribe(),
            Arc::clone(&self.stats),
        ));
        self.worker_handles.push(handle);

        self.is_running.store(true, Ordering::SeqCst);
        self.metrics.update_workers(self.config.num_workers);
        info!(num_workers = self.config.num_workers, "Worker pool started");

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers finish the job they are on before stopping.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let shutdown_future = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        self.metrics.update_workers(0);

        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    /// Returns a reference to the work queue.
    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }
}

async fn run_reaper(
    reaper: StallReaper,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
    stats: Arc<SharedPoolStats>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => match reaper.sweep().await {
                Ok(0) => {}
                Ok(reaped) => {
                    stats.record_reaped(reaped);
                    warn!(reaped = reaped, "Reaped stalled deliveries");
                }
                Err(e) => error!(error = %e, "Failed to reap stalled deliveries"),
            },
        }
    }

    debug!("Reaper stopped");
}

/// How a generation run ended from the worker's point of view.
enum RunEnd {
    Finished(Result<ProduceSummary, ProduceError>),
    LeaseLost,
}

/// A single worker that processes jobs from the queue.
struct Worker {
    id: String,
    queue: Arc<dyn WorkQueue>,
    store: Arc<dyn LogStore>,
    engines: Arc<EngineRegistry>,
    retention: LogRetention,
    shutdown_rx: broadcast::Receiver<()>,
    config: WorkerPoolConfig,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    /// Claims and processes jobs until a shutdown signal is received.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.queue.claim(self.config.poll_interval).await {
                Ok(Some(delivery)) => {
                    self.process(delivery).await;
                }
                Ok(None) => {
                    debug!(worker_id = %self.id, "No jobs available");
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to claim job");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    async fn process(&self, delivery: Delivery) {
        let envelope = delivery.envelope.clone();
        let job_id = envelope.job_id;
        let start_time = Instant::now();

        info!(
            worker_id = %self.id,
            job_id = %job_id,
            log_address = %envelope.log_address,
            model = %envelope.model,
            attempt = envelope.attempt,
            phase = %JobPhase::Claimed,
            "Processing job"
        );

        self.stats.increment_active();
        self.metrics.inc_jobs_in_progress();

        let producer = FragmentProducer::new(
            Arc::clone(&self.store),
            envelope.log_address.clone(),
            self.retention,
        );

        let end = match self.engines.resolve(envelope.model) {
            Ok(engine) => {
                debug!(worker_id = %self.id, job_id = %job_id, engine = engine.name(), phase = %JobPhase::Generating, "Generating");
                let fragments = with_deadline(
                    engine.generate(GenerationRequest::from(&envelope)),
                    self.config.job_timeout,
                );
                self.heartbeat_while(&delivery, producer.run(fragments)).await
            }
            Err(e) => {
                let reason = e.to_string();
                if let Err(log_err) = producer.abort(reason).await {
                    warn!(worker_id = %self.id, job_id = %job_id, error = %log_err, "Failed to write error terminal");
                }
                RunEnd::Finished(Err(ProduceError::Engine(e)))
            }
        };

        let duration = start_time.elapsed();
        self.stats.decrement_active();
        self.metrics.dec_jobs_in_progress();

        match end {
            RunEnd::Finished(Ok(summary)) => {
                if let Err(e) = self.queue.ack(delivery).await {
                    error!(worker_id = %self.id, job_id = %job_id, error = %e, "Failed to ack job");
                }
                self.stats.record_completion(duration);
                self.metrics
                    .record_job(envelope.model, "completed", duration.as_secs_f64());
                info!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    fragments = summary.fragments,
                    duration_ms = duration.as_millis(),
                    phase = %JobPhase::Completed,
                    "Job completed successfully"
                );
            }
            RunEnd::Finished(Err(e)) => {
                self.stats.record_failure(duration);
                self.metrics
                    .record_job(envelope.model, "failed", duration.as_secs_f64());

                match self.queue.fail(delivery, &e.to_string()).await {
                    Ok(outcome) => {
                        record_fail_outcome(&self.metrics, &outcome);
                        match outcome {
                            FailOutcome::Redelivered(next) => warn!(
                                worker_id = %self.id,
                                job_id = %job_id,
                                next_job_id = %next.job_id,
                                error = %e,
                                remaining_attempts = envelope.remaining_attempts(),
                                phase = %JobPhase::Failed,
                                "Job failed, redelivered"
                            ),
                            FailOutcome::DeadLettered => error!(
                                worker_id = %self.id,
                                job_id = %job_id,
                                error = %e,
                                phase = %JobPhase::Failed,
                                "Job failed, moved to dead letter queue"
                            ),
                            FailOutcome::NotHeld => warn!(
                                worker_id = %self.id,
                                job_id = %job_id,
                                error = %e,
                                "Job failed after its claim was revoked"
                            ),
                        }
                    }
                    Err(queue_err) => {
                        error!(
                            worker_id = %self.id,
                            job_id = %job_id,
                            error = %queue_err,
                            "Failed to settle failed job"
                        );
                    }
                }
            }
            RunEnd::LeaseLost => {
                self.stats.record_lease_lost();
                self.metrics
                    .record_job(envelope.model, "lease_lost", duration.as_secs_f64());
                warn!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    "Lease lost, abandoned job without writing a terminal"
                );
            }
        }
    }

    /// Drives `run` while extending the lease. Dropping `run` on lease loss
    /// drops the producer, so no terminal is written by this worker.
    ///
    /// The lease counts as lost when the queue says so, when extensions
    /// keep failing until the lease would run out before the next
    /// heartbeat, or when the log store refuses an append because the
    /// reaper already sealed the log.
    async fn heartbeat_while<F>(&self, delivery: &Delivery, run: F) -> RunEnd
    where
        F: Future<Output = Result<ProduceSummary, ProduceError>>,
    {
        let job_id = delivery.envelope.job_id;
        tokio::pin!(run);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; the claim just started the lease.
        heartbeat.tick().await;
        let mut extended_at = tokio::time::Instant::now();

        loop {
            tokio::select! {
                result = &mut run => return match result {
                    Err(ProduceError::Log(e)) if e.is_fenced() => RunEnd::LeaseLost,
                    result => RunEnd::Finished(result),
                },
                _ = heartbeat.tick() => match self.queue.extend_lease(delivery).await {
                    Ok(true) => extended_at = tokio::time::Instant::now(),
                    Ok(false) => return RunEnd::LeaseLost,
                    Err(e) => {
                        let unrenewed = extended_at.elapsed();
                        if unrenewed + self.config.heartbeat_interval >= self.config.lease {
                            warn!(worker_id = %self.id, job_id = %job_id, error = %e, unrenewed_ms = unrenewed.as_millis(), "Lease cannot be renewed in time, stopping");
                            return RunEnd::LeaseLost;
                        }
                        warn!(worker_id = %self.id, job_id = %job_id, error = %e, "Failed to extend lease");
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::memory_store::MemoryLogStore;
    use crate::fragment::record::{Cursor, Outcome};
    use crate::llm::EchoEngine;
    use crate::scheduler::job::{JobEnvelope, ModelSelector};
    use crate::scheduler::memory_queue::MemoryWorkQueue;
    use crate::scheduler::queue::QueueConfig;

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();

        assert_eq!(config.num_workers, 20);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.job_timeout, Duration::from_secs(600));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(60));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(20));
        assert_eq!(config.lease, Duration::from_secs(60));
    }

    #[test]
    fn test_worker_pool_config_builder() {
        let config = WorkerPoolConfig::new(8)
            .with_poll_interval(Duration::from_secs(5))
            .with_job_timeout(Duration::from_secs(3600))
            .with_shutdown_timeout(Duration::from_secs(120))
            .with_lease(Duration::from_secs(30))
            .with_reap_interval(Duration::from_secs(2));

        assert_eq!(config.num_workers, 8);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.job_timeout, Duration::from_secs(3600));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(120));
        assert_eq!(config.lease, Duration::from_secs(30));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.reap_interval, Duration::from_secs(2));
    }

    #[test]
    fn test_success_rate_counts_only_settled_jobs() {
        let stats = PoolStats {
            num_workers: 3,
            active_workers: 1,
            jobs_completed: 9,
            jobs_failed: 3,
            leases_lost: 4,
            jobs_reaped: 2,
            average_job_duration: Duration::from_millis(850),
        };

        assert_eq!(stats.total_processed(), 12);
        assert!((stats.success_rate() - 75.0).abs() < 1e-9);
        assert_eq!(PoolStats::default().success_rate(), 0.0);
    }

    #[test]
    fn test_shared_stats_track_lease_outcomes() {
        let stats = SharedPoolStats::new();

        stats.increment_active();
        stats.record_completion(Duration::from_millis(300));
        stats.record_failure(Duration::from_millis(900));
        stats.record_lease_lost();
        stats.record_lease_lost();
        stats.record_reaped(3);

        let snapshot = stats.to_pool_stats(2);
        assert_eq!(snapshot.num_workers, 2);
        assert_eq!(snapshot.active_workers, 1);
        assert_eq!(snapshot.total_processed(), 2);
        assert_eq!(snapshot.leases_lost, 2);
        assert_eq!(snapshot.jobs_reaped, 3);
        assert_eq!(snapshot.average_job_duration, Duration::from_millis(600));

        stats.decrement_active();
        assert_eq!(stats.to_pool_stats(2).active_workers, 0);
    }

    #[test]
    fn test_pool_error_display() {
        assert!(PoolError::AlreadyRunning.to_string().contains("already running"));
        assert!(PoolError::NotRunning.to_string().contains("not running"));
        assert!(PoolError::ShutdownTimeout(Duration::from_secs(60))
            .to_string()
            .contains("60"));
    }

    fn pool(queue: Arc<MemoryWorkQueue>, store: Arc<MemoryLogStore>, workers: usize) -> WorkerPool {
        let engines = EngineRegistry::new().with_engine(ModelSelector::Echo, Arc::new(EchoEngine::new()));
        WorkerPool::new(
            WorkerPoolConfig::new(workers)
                .with_poll_interval(Duration::from_millis(20))
                .with_shutdown_timeout(Duration::from_secs(5)),
            queue,
            store,
            Arc::new(engines),
            LogRetention::default(),
        )
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let mut pool = pool(Arc::new(MemoryWorkQueue::default()), Arc::new(MemoryLogStore::new()), 2);

        assert!(matches!(pool.shutdown().await, Err(PoolError::NotRunning)));
        pool.start().await.unwrap();
        assert!(pool.is_running());
        assert!(matches!(pool.start().await, Err(PoolError::AlreadyRunning)));

        pool.shutdown().await.unwrap();
        assert!(!pool.is_running());
    }

    #[tokio::test]
    async fn test_zero_workers_rejected() {
        let mut pool = pool(Arc::new(MemoryWorkQueue::default()), Arc::new(MemoryLogStore::new()), 0);
        assert!(matches!(pool.start().await, Err(PoolError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_unrouted_model_fails_job() {
        let queue = Arc::new(MemoryWorkQueue::default());
        let store = Arc::new(MemoryLogStore::new());
        let envelope = JobEnvelope::new("c", "hi", ModelSelector::Gpt4o, "u", "log").with_max_attempts(1);
        let address = envelope.log_address.clone();
        queue.enqueue(envelope).await.unwrap();

        let mut pool = pool(Arc::clone(&queue), Arc::clone(&store), 1);
        pool.start().await.unwrap();

        let mut dead = 0;
        for _ in 0..100 {
            dead = queue.stats().await.unwrap().dead_letter_jobs;
            if dead == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        pool.shutdown().await.unwrap();

        assert_eq!(dead, 1);
        let last = store.last(&address).await.unwrap().unwrap();
        assert_eq!(last.outcome().map(|(o, _)| o), Some(Outcome::Error));
        assert_eq!(pool.stats().jobs_failed, 1);
    }

    #[tokio::test]
    async fn test_reaper_seals_and_redelivers() {
        let queue = Arc::new(MemoryWorkQueue::new(
            QueueConfig::default().with_lease(Duration::from_millis(30)),
        ));
        let store = Arc::new(MemoryLogStore::new());
        queue
            .enqueue(JobEnvelope::new("c", "hi", ModelSelector::Echo, "u", "log"))
            .await
            .unwrap();

        // A worker that claims and then goes silent.
        let stalled = queue.claim(Duration::ZERO).await.unwrap().unwrap();
        let address = stalled.envelope.log_address.clone();
        let mut producer = FragmentProducer::new(store.clone(), address.clone(), LogRetention::default());
        producer.append("partial").await.unwrap();
        drop(producer);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let reaper = StallReaper::new(queue.clone(), store.clone(), LogRetention::default());
        assert_eq!(reaper.sweep().await.unwrap(), 1);

        let records = store
            .read_after(&address, Cursor::Start, Duration::ZERO, 10)
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[1].outcome(),
            Some((Outcome::Error, Some(ABANDONED_REASON)))
        );

        let redelivered = queue.claim(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(redelivered.envelope.attempt, 2);
        assert_ne!(redelivered.envelope.log_address, address);

        // Sweeping again does not touch the sealed log.
        assert_eq!(reaper.sweep().await.unwrap(), 0);
    }
}
