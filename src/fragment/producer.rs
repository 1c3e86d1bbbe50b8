//! Fragment producer: the single writer of a job's log.
//!
//! Every fragment append resets the log's TTL to the live retention in the
//! same store operation. The run ends with exactly one terminal sentinel:
//! success keeps the live retention, error shortens it. `complete` and
//! `abort` consume the producer, so this producer writes nothing after its
//! terminal, and the store refuses appends to a log another writer has
//! already sealed.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::record::{NewRecord, Outcome, RecordId};
use super::store::LogStore;
use crate::error::{LogError, ProduceError};
use crate::llm::FragmentStream;
use crate::metrics::MetricsCollector;
use crate::scheduler::job::LogAddress;

/// Reason written when the stall reaper seals an abandoned log.
pub const ABANDONED_REASON: &str = "abandoned: worker stalled";

/// Attempts `seal_abandoned` makes when a late fragment races its terminal.
const SEAL_ATTEMPTS: usize = 5;

/// Invalid retention settings.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RetentionError {
    #[error("TTLs must be non-zero")]
    ZeroTtl,

    #[error("Error TTL {error:?} must be shorter than live TTL {live:?}")]
    ErrorNotShorter { live: Duration, error: Duration },
}

/// How long logs are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRetention {
    /// Applied after every fragment and after a success terminal.
    pub live_ttl: Duration,
    /// Applied after an error terminal.
    pub error_ttl: Duration,
}

impl Default for LogRetention {
    fn default() -> Self {
        Self {
            live_ttl: Duration::from_secs(900),
            error_ttl: Duration::from_secs(60),
        }
    }
}

impl LogRetention {
    /// Builds a retention policy, rejecting an error TTL that is not
    /// strictly shorter than the live TTL.
    pub fn new(live_ttl: Duration, error_ttl: Duration) -> Result<Self, RetentionError> {
        if live_ttl.is_zero() || error_ttl.is_zero() {
            return Err(RetentionError::ZeroTtl);
        }
        if error_ttl >= live_ttl {
            return Err(RetentionError::ErrorNotShorter {
                live: live_ttl,
                error: error_ttl,
            });
        }
        Ok(Self {
            live_ttl,
            error_ttl,
        })
    }
}

/// Result of a run that reached a success terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProduceSummary {
    /// Fragments appended before the terminal.
    pub fragments: u64,
    /// Id of the success terminal.
    pub terminal_id: RecordId,
}

/// Writes one job's fragments and terminal into its log.
pub struct FragmentProducer {
    store: Arc<dyn LogStore>,
    address: LogAddress,
    retention: LogRetention,
    next_sequence: u64,
    metrics: MetricsCollector,
}

impl FragmentProducer {
    /// Creates a producer for a fresh log.
    pub fn new(store: Arc<dyn LogStore>, address: LogAddress, retention: LogRetention) -> Self {
        Self::resume(store, address, retention, 0)
    }

    /// Creates a producer that continues numbering at `next_sequence`.
    pub fn resume(
        store: Arc<dyn LogStore>,
        address: LogAddress,
        retention: LogRetention,
        next_sequence: u64,
    ) -> Self {
        Self {
            store,
            address,
            retention,
            next_sequence,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn address(&self) -> &LogAddress {
        &self.address
    }

    /// Number of records appended so far (fragments only).
    pub fn fragments_written(&self) -> u64 {
        self.next_sequence
    }

    /// Appends one fragment and refreshes the live TTL.
    pub async fn append(&mut self, payload: impl Into<String>) -> Result<RecordId, LogError> {
        let sequence = self.next_sequence;
        let id = self
            .store
            .append(
                &self.address,
                NewRecord::fragment(sequence, payload),
                self.retention.live_ttl,
            )
            .await?;
        self.next_sequence += 1;

        self.metrics.record_fragment_appended();
        debug!(log_address = %self.address, sequence = sequence, record_id = %id, "Appended fragment");
        Ok(id)
    }

    /// Writes the success terminal. Retention stays at the live TTL.
    pub async fn complete(self) -> Result<RecordId, LogError> {
        let ttl = self.retention.live_ttl;
        self.finish(Outcome::Success, None, ttl).await
    }

    /// Writes the error terminal and shortens retention to the error TTL.
    pub async fn abort(self, reason: impl Into<String>) -> Result<RecordId, LogError> {
        let ttl = self.retention.error_ttl;
        self.finish(Outcome::Error, Some(reason.into()), ttl).await
    }

    async fn finish(
        self,
        outcome: Outcome,
        reason: Option<String>,
        ttl: Duration,
    ) -> Result<RecordId, LogError> {
        let record = NewRecord::terminal(self.next_sequence, outcome, reason.clone());
        let id = self.store.append(&self.address, record, ttl).await?;

        self.metrics.record_terminal(outcome);
        info!(
            log_address = %self.address,
            outcome = %outcome,
            reason = ?reason,
            fragments = self.next_sequence,
            "Wrote terminal"
        );
        Ok(id)
    }

    /// Drains an engine stream into the log and closes it.
    ///
    /// Engine failures and append failures both end the log with an error
    /// terminal and are returned, so the caller can hand the envelope to
    /// the queue's retry policy. A failed terminal append is never retried:
    /// it may have landed. A fenced append means another writer owns the
    /// log now, so nothing more is attempted.
    pub async fn run(mut self, mut fragments: FragmentStream) -> Result<ProduceSummary, ProduceError> {
        while let Some(item) = fragments.next().await {
            let fragment = match item {
                Ok(fragment) => fragment,
                Err(e) => {
                    self.abort_quietly(e.to_string()).await;
                    return Err(e.into());
                }
            };

            if let Err(e) = self.append(fragment).await {
                if e.is_fenced() {
                    warn!(log_address = %self.address, error = %e, "Log taken over, stopping");
                } else {
                    self.abort_quietly(format!("log append failed: {}", e)).await;
                }
                return Err(e.into());
            }
        }

        let fragments = self.next_sequence;
        let terminal_id = self.complete().await?;
        Ok(ProduceSummary {
            fragments,
            terminal_id,
        })
    }

    async fn abort_quietly(self, reason: String) {
        let address = self.address.clone();
        if let Err(e) = self.abort(reason).await {
            warn!(log_address = %address, error = %e, "Failed to write error terminal");
        }
    }
}

/// Closes a log whose worker stopped heartbeating.
///
/// Appends an error terminal unless the newest record already is one, and
/// applies the error TTL. Returns the terminal id when one was written. A
/// fragment from the stalled worker that lands between reading the newest
/// record and appending the terminal makes the store refuse the terminal;
/// the newest record is then read again.
pub async fn seal_abandoned(
    store: Arc<dyn LogStore>,
    address: &LogAddress,
    retention: LogRetention,
) -> Result<Option<RecordId>, LogError> {
    let mut attempt = 1;
    loop {
        let next_sequence = match store.last(address).await? {
            Some(record) if record.is_terminal() => return Ok(None),
            Some(record) => record.sequence + 1,
            None => 0,
        };

        let producer =
            FragmentProducer::resume(Arc::clone(&store), address.clone(), retention, next_sequence);
        match producer.abort(ABANDONED_REASON).await {
            Ok(id) => return Ok(Some(id)),
            Err(LogError::Sealed { .. }) => return Ok(None),
            Err(e @ LogError::OutOfSequence { .. }) if attempt < SEAL_ATTEMPTS => {
                debug!(log_address = %address, attempt = attempt, error = %e, "Late fragment raced the seal");
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
