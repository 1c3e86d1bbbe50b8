//! Fragment reader: tails one job's log for a viewer.
//!
//! # Protocol
//!
//! ```text
//!   tail(address, cursor)
//!        │
//!        ▼
//!   inspect ── Missing ──► NotFound
//!        ├── Empty ────► Empty
//!        ▼
//!   ┌─► read_after(cursor, wait) ── transport error ──► backoff, retry ──► Transport
//!   │        │
//!   │        ├── records ──► emit in id order, advance cursor ── terminal ──► end
//!   │        │
//!   │        └── nothing ──► idle ≥ max_idle ? ──► IdleTimeout
//!   └────────────────────────────┘
//! ```
//!
//! The reader never writes and the producer never learns about readers.
//! Dropping the returned [`FragmentTail`] is the only cancellation signal.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::{BoxStream, Stream};
use futures::StreamExt;
use pin_project_lite::pin_project;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::record::{Cursor, FragmentRecord};
use super::store::{LogState, LogStore};
use super::viewers::{ViewerGuard, ViewerRegistry};
use crate::error::{LogError, ReadError};
use crate::metrics::MetricsCollector;
use crate::scheduler::job::LogAddress;

/// Reader tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderConfig {
    /// Longest single bounded-wait read.
    pub poll_wait: Duration,
    /// Give up after this long without a new record.
    pub max_idle: Duration,
    /// Records requested per read.
    pub batch_size: usize,
    /// Retries for a transport failure before surfacing it.
    pub transport_retries: u32,
    /// Fixed pause between transport retries.
    pub retry_backoff: Duration,
    /// How long the pre-check waits for a missing log to appear.
    /// Zero fails immediately with `NotFound`.
    pub attach_grace: Duration,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            poll_wait: Duration::from_secs(1),
            max_idle: Duration::from_secs(60),
            batch_size: 100,
            transport_retries: 3,
            retry_backoff: Duration::from_millis(250),
            attach_grace: Duration::ZERO,
        }
    }
}

impl ReaderConfig {
    /// Sets the per-read wait.
    pub fn with_poll_wait(mut self, wait: Duration) -> Self {
        self.poll_wait = wait;
        self
    }

    /// Sets the idle bound.
    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    /// Sets the read batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Sets the transport retry policy.
    pub fn with_transport_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.transport_retries = retries;
        self.retry_backoff = backoff;
        self
    }

    /// Sets how long to wait for a not-yet-created log.
    pub fn with_attach_grace(mut self, grace: Duration) -> Self {
        self.attach_grace = grace;
        self
    }
}

/// Attaches tailing cursors to fragment logs.
#[derive(Clone)]
pub struct FragmentReader {
    store: Arc<dyn LogStore>,
    config: ReaderConfig,
    viewers: ViewerRegistry,
}

impl FragmentReader {
    /// Creates a reader with its own viewer registry.
    pub fn new(store: Arc<dyn LogStore>, config: ReaderConfig) -> Self {
        Self {
            store,
            config,
            viewers: ViewerRegistry::new(),
        }
    }

    /// Shares an existing viewer registry.
    pub fn with_registry(mut self, viewers: ViewerRegistry) -> Self {
        self.viewers = viewers;
        self
    }

    pub fn viewers(&self) -> &ViewerRegistry {
        &self.viewers
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// Checks the log and returns a stream of its records from `from` on.
    ///
    /// The stream ends after the terminal sentinel, or with a single
    /// `IdleTimeout` / `Transport` error. It cannot be restarted; call
    /// `tail` again with the last seen id to resume.
    ///
    /// # Errors
    ///
    /// `NotFound` if no log exists at `address`, `Empty` if it holds no
    /// records, `Transport` if the store stays unreachable.
    pub async fn tail(&self, address: &LogAddress, from: Cursor) -> Result<FragmentTail, ReadError> {
        let metrics = MetricsCollector::new();

        if let Err(e) = self.precheck(address).await {
            metrics.record_reader_exit(e.kind());
            info!(log_address = %address, error = %e, "Reader pre-check failed");
            return Err(e);
        }

        let guard = self.viewers.register(address);
        debug!(log_address = %address, viewer_id = %guard.viewer_id(), from = %from, "Reader attached");

        let inner = poll_log(Arc::clone(&self.store), address.clone(), from, self.config);
        Ok(FragmentTail {
            inner,
            guard,
            address: address.clone(),
        })
    }

    async fn precheck(&self, address: &LogAddress) -> Result<(), ReadError> {
        let deadline = Instant::now() + self.config.attach_grace;

        loop {
            let state = with_retry(&self.config, || self.store.inspect(address)).await?;
            match state {
                LogState::Populated(_) => return Ok(()),
                LogState::Empty => return Err(ReadError::Empty(address.clone())),
                LogState::Missing if Instant::now() >= deadline => {
                    return Err(ReadError::NotFound(address.clone()));
                }
                LogState::Missing => {
                    let pause = self.config.poll_wait.min(Duration::from_millis(100));
                    tokio::time::sleep(pause).await;
                }
            }
        }
    }
}

/// Runs `op`, retrying transport failures with a fixed backoff.
async fn with_retry<T, F, Fut>(config: &ReaderConfig, mut op: F) -> Result<T, ReadError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LogError>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempts <= config.transport_retries => {
                warn!(attempt = attempts, error = %e, "Log store unreachable, retrying");
                tokio::time::sleep(config.retry_backoff).await;
            }
            Err(e) if e.is_transient() => {
                return Err(ReadError::Transport {
                    attempts,
                    source: e,
                })
            }
            Err(e) => return Err(ReadError::Corrupt(e)),
        }
    }
}

fn poll_log(
    store: Arc<dyn LogStore>,
    address: LogAddress,
    from: Cursor,
    config: ReaderConfig,
) -> BoxStream<'static, Result<FragmentRecord, ReadError>> {
    let metrics = MetricsCollector::new();

    let stream = async_stream::stream! {
        let mut cursor = from;
        let mut expected = match from {
            Cursor::Start => Some(0),
            Cursor::After(_) => None,
        };
        let mut idle_since = Instant::now();
        let mut idle_polls: u32 = 0;

        'tail: loop {
            let wait = config.poll_wait.min(config.max_idle.saturating_sub(idle_since.elapsed()));
            let read = with_retry(&config, || {
                store.read_after(&address, cursor, wait, config.batch_size)
            })
            .await;

            let batch = match read {
                Ok(batch) => batch,
                Err(e) => {
                    metrics.record_reader_exit(e.kind());
                    warn!(log_address = %address, error = %e, "Reader stopped");
                    yield Err(e);
                    break 'tail;
                }
            };

            if batch.is_empty() {
                idle_polls += 1;
                let idle = idle_since.elapsed();
                if idle >= config.max_idle {
                    metrics.record_reader_exit("idle_timeout");
                    info!(log_address = %address, idle_ms = idle.as_millis() as u64, polls = idle_polls, "Reader idle timeout");
                    yield Err(ReadError::IdleTimeout {
                        address: address.clone(),
                        idle,
                        polls: idle_polls,
                    });
                    break 'tail;
                }
                continue;
            }

            idle_polls = 0;
            idle_since = Instant::now();

            for record in batch {
                if let Some(want) = expected {
                    if record.sequence != want {
                        metrics.record_gap();
                        warn!(log_address = %address, expected = want, found = record.sequence, "Sequence gap");
                    }
                }
                expected = Some(record.sequence + 1);
                cursor = Cursor::After(record.id);

                let terminal = record.is_terminal();
                yield Ok(record);
                if terminal {
                    metrics.record_reader_exit("terminal");
                    break 'tail;
                }
            }
        }
    };

    stream.boxed()
}

pin_project! {
    /// Records of one log, in id order, ending at the terminal sentinel.
    ///
    /// Holds a viewer registration for as long as it lives.
    pub struct FragmentTail {
        #[pin]
        inner: BoxStream<'static, Result<FragmentRecord, ReadError>>,
        guard: ViewerGuard,
        address: LogAddress,
    }
}

impl FragmentTail {
    pub fn address(&self) -> &LogAddress {
        &self.address
    }

    pub fn viewer_id(&self) -> Uuid {
        self.guard.viewer_id()
    }
}

impl std::fmt::Debug for FragmentTail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragmentTail")
            .field("guard", &self.guard)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl Stream for FragmentTail {
    type Item = Result<FragmentRecord, ReadError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx)
    }
}
