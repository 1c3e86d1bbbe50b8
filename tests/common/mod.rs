//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use fragment_relay::error::{EngineError, LogError};
use fragment_relay::fragment::{
    Cursor, FragmentRecord, LogRetention, LogState, LogStore, MemoryLogStore, NewRecord,
    ReaderConfig, RecordId,
};
use fragment_relay::llm::{EngineRegistry, FragmentStream, GenerationEngine, GenerationRequest};
use fragment_relay::scheduler::{
    DeadLetterEntry, Delivery, FailOutcome, JobEnvelope, LogAddress, MemoryWorkQueue, QueueError,
    QueueStats, WorkQueue, WorkerPool, WorkerPoolConfig,
};

/// One action of a scripted generation.
#[derive(Debug, Clone)]
pub enum Step {
    Emit(String),
    Fail(String),
    Pause(Duration),
    Hang,
}

pub fn emit(fragment: &str) -> Step {
    Step::Emit(fragment.to_string())
}

pub fn emit_all(fragments: &[&str]) -> Vec<Step> {
    fragments.iter().map(|f| emit(f)).collect()
}

/// Engine that plays back one script per `generate` call. When the queued
/// scripts run out, the fallback script is replayed.
pub struct ScriptedEngine {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    fallback: Vec<Step>,
    calls: AtomicUsize,
}

impl ScriptedEngine {
    pub fn repeating(script: Vec<Step>) -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            fallback: script,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn sequence(scripts: Vec<Vec<Step>>, fallback: Vec<Step>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            fallback,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl GenerationEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn generate(&self, _request: GenerationRequest) -> FragmentStream {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        let stream = async_stream::stream! {
            for step in script {
                match step {
                    Step::Emit(fragment) => yield Ok(fragment),
                    Step::Fail(reason) => {
                        yield Err(EngineError::Failed(reason));
                        break;
                    }
                    Step::Pause(pause) => tokio::time::sleep(pause).await,
                    Step::Hang => futures::future::pending::<()>().await,
                }
            }
        };
        stream.boxed()
    }
}

/// Log store that counts appends on the way through.
#[derive(Default)]
pub struct CountingStore {
    pub inner: MemoryLogStore,
    appends: AtomicUsize,
}

impl CountingStore {
    pub fn appends(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogStore for CountingStore {
    async fn append(
        &self,
        address: &LogAddress,
        record: NewRecord,
        ttl: Duration,
    ) -> Result<RecordId, LogError> {
        self.appends.fetch_add(1, Ordering::SeqCst);
        self.inner.append(address, record, ttl).await
    }

    async fn read_after(
        &self,
        address: &LogAddress,
        after: Cursor,
        max_wait: Duration,
        limit: usize,
    ) -> Result<Vec<FragmentRecord>, LogError> {
        self.inner.read_after(address, after, max_wait, limit).await
    }

    async fn expire(&self, address: &LogAddress, ttl: Duration) -> Result<(), LogError> {
        self.inner.expire(address, ttl).await
    }

    async fn inspect(&self, address: &LogAddress) -> Result<LogState, LogError> {
        self.inner.inspect(address).await
    }

    async fn last(&self, address: &LogAddress) -> Result<Option<FragmentRecord>, LogError> {
        self.inner.last(address).await
    }

    async fn ttl(&self, address: &LogAddress) -> Result<Option<Duration>, LogError> {
        self.inner.ttl(address).await
    }
}

/// Memory queue whose lease extensions always fail, as if the queue's
/// backend were unreachable from the worker while it generates.
pub struct LeaseOutageQueue {
    pub inner: MemoryWorkQueue,
    extend_attempts: AtomicUsize,
}

impl LeaseOutageQueue {
    pub fn new(inner: MemoryWorkQueue) -> Self {
        Self {
            inner,
            extend_attempts: AtomicUsize::new(0),
        }
    }

    pub fn extend_attempts(&self) -> usize {
        self.extend_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkQueue for LeaseOutageQueue {
    async fn enqueue(&self, envelope: JobEnvelope) -> Result<(), QueueError> {
        self.inner.enqueue(envelope).await
    }

    async fn claim(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        self.inner.claim(wait).await
    }

    async fn extend_lease(&self, _delivery: &Delivery) -> Result<bool, QueueError> {
        self.extend_attempts.fetch_add(1, Ordering::SeqCst);
        Err(QueueError::ConnectionFailed("connection refused".to_string()))
    }

    async fn ack(&self, delivery: Delivery) -> Result<(), QueueError> {
        self.inner.ack(delivery).await
    }

    async fn fail(&self, delivery: Delivery, reason: &str) -> Result<FailOutcome, QueueError> {
        self.inner.fail(delivery, reason).await
    }

    async fn reap_stalled(&self) -> Result<Vec<Delivery>, QueueError> {
        self.inner.reap_stalled().await
    }

    async fn recover_orphans(&self) -> Result<Vec<Delivery>, QueueError> {
        self.inner.recover_orphans().await
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.inner.stats().await
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        self.inner.dead_letters(limit).await
    }
}

pub const LIVE_TTL: Duration = Duration::from_secs(300);
pub const ERROR_TTL: Duration = Duration::from_secs(5);

pub fn retention() -> LogRetention {
    LogRetention::new(LIVE_TTL, ERROR_TTL).unwrap()
}

pub fn reader_config() -> ReaderConfig {
    ReaderConfig::default()
        .with_poll_wait(Duration::from_millis(20))
        .with_max_idle(Duration::from_secs(3))
        .with_transport_retries(3, Duration::from_millis(5))
        .with_attach_grace(Duration::from_secs(3))
}

pub fn pool_config(workers: usize) -> WorkerPoolConfig {
    WorkerPoolConfig::new(workers)
        .with_poll_interval(Duration::from_millis(20))
        .with_job_timeout(Duration::from_secs(10))
        .with_shutdown_timeout(Duration::from_secs(5))
        .with_reap_interval(Duration::from_millis(30))
}

pub async fn start_pool(
    config: WorkerPoolConfig,
    queue: Arc<dyn WorkQueue>,
    store: Arc<dyn LogStore>,
    engine: Arc<dyn GenerationEngine>,
) -> WorkerPool {
    let mut pool = WorkerPool::new(
        config,
        queue,
        store,
        Arc::new(EngineRegistry::serving_all(engine)),
        retention(),
    );
    pool.start().await.unwrap();
    pool
}

/// Polls `check` until it returns true or `limit` passes.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Every record currently in the log.
pub async fn records(store: &dyn LogStore, address: &LogAddress) -> Vec<FragmentRecord> {
    store
        .read_after(address, Cursor::Start, Duration::ZERO, 10_000)
        .await
        .unwrap()
}

pub fn payloads(records: &[FragmentRecord]) -> Vec<String> {
    records
        .iter()
        .filter_map(|r| r.payload().map(str::to_string))
        .collect()
}
