//! Work queue contract.
//!
//! The rest of the relay depends on one property of the queue:
//! **at-least-once, single-active-consumer delivery with bounded retries.**
//!
//! - `claim` hands an envelope to exactly one worker and starts its lease
//! - the worker extends the lease while it generates
//! - `ack` removes the envelope; `fail` either redelivers it as a new job or
//!   moves it to the dead letter list once attempts are exhausted
//! - leases that run out are collected by `reap_stalled` so the envelope can
//!   be failed on the stalled worker's behalf
//! - the dead letter list is bounded by `QueueConfig::dead_letter_limit`
//!   and expires after `QueueConfig::dead_letter_ttl` without additions
//!
//! Backends: [`super::redis_queue::RedisWorkQueue`] and
//! [`super::memory_queue::MemoryWorkQueue`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::job::JobEnvelope;

/// Default name of the work queue.
pub const DEFAULT_QUEUE_NAME: &str = "relay:jobs";

/// Default number of dead letter entries kept.
pub const DEFAULT_DEAD_LETTER_LIMIT: usize = 1000;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize or parse an envelope.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

/// Queue tuning shared by all backends.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Name of the queue (prefix for backend keys).
    pub queue_name: String,
    /// How long a claim stays valid without a heartbeat.
    pub lease: Duration,
    /// Pause between empty polls inside a claim.
    pub poll_interval: Duration,
    /// Newest dead letter entries kept; older ones are dropped.
    pub dead_letter_limit: usize,
    /// Dead letters are dropped once nothing has been added for this long.
    pub dead_letter_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            lease: Duration::from_secs(60),
            poll_interval: Duration::from_millis(250),
            dead_letter_limit: DEFAULT_DEAD_LETTER_LIMIT,
            dead_letter_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl QueueConfig {
    /// Sets the queue name.
    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    /// Sets the lease duration.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets how many dead letter entries are kept (at least one).
    pub fn with_dead_letter_limit(mut self, limit: usize) -> Self {
        self.dead_letter_limit = limit.max(1);
        self
    }

    /// Sets how long the dead letter list survives without additions.
    pub fn with_dead_letter_ttl(mut self, ttl: Duration) -> Self {
        self.dead_letter_ttl = ttl;
        self
    }
}

/// A claimed envelope.
///
/// `token` identifies the claim to the backend; pass the delivery back
/// unchanged to `ack`, `fail` or `extend_lease`.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub envelope: JobEnvelope,
    pub token: String,
}

/// What `fail` did with an envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// A new envelope (new job id and log address) was queued.
    Redelivered(JobEnvelope),
    /// Attempts are exhausted; the envelope is in the dead letter list.
    DeadLettered,
    /// The claim was no longer held (already settled elsewhere); nothing changed.
    NotHeld,
}

/// An envelope that exhausted its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub envelope: JobEnvelope,
    pub error: String,
    pub moved_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(envelope: JobEnvelope, error: impl Into<String>) -> Self {
        Self {
            envelope,
            error: error.into(),
            moved_at: Utc::now(),
        }
    }
}

/// Statistics about queue state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Name of the queue.
    pub queue_name: String,
    /// Number of envelopes waiting to be claimed.
    pub pending_jobs: usize,
    /// Number of envelopes currently claimed.
    pub processing_jobs: usize,
    /// Number of envelopes in the dead letter list.
    pub dead_letter_jobs: usize,
}

impl QueueStats {
    /// Returns the total number of envelopes in all lists.
    pub fn total_jobs(&self) -> usize {
        self.pending_jobs + self.processing_jobs + self.dead_letter_jobs
    }
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Adds an envelope at the tail of the queue.
    async fn enqueue(&self, envelope: JobEnvelope) -> Result<(), QueueError>;

    /// Claims the oldest envelope, waiting up to `wait` for one to arrive.
    async fn claim(&self, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Pushes the lease deadline forward.
    ///
    /// Returns `false` if the claim is no longer held, in which case the
    /// worker must stop touching the job.
    async fn extend_lease(&self, delivery: &Delivery) -> Result<bool, QueueError>;

    /// Removes a successfully processed envelope.
    async fn ack(&self, delivery: Delivery) -> Result<(), QueueError>;

    /// Settles a failed attempt: redeliver as a new job, or dead-letter.
    async fn fail(&self, delivery: Delivery, reason: &str) -> Result<FailOutcome, QueueError>;

    /// Revokes expired leases and returns those deliveries.
    ///
    /// The caller is expected to `fail` each one.
    async fn reap_stalled(&self) -> Result<Vec<Delivery>, QueueError>;

    /// Returns claimed envelopes that hold no lease at all, left behind by
    /// a process that died between reaping and failing them.
    async fn recover_orphans(&self) -> Result<Vec<Delivery>, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Newest dead letter entries, up to `limit`.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::ModelSelector;

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::ConnectionFailed("refused".to_string());
        assert_eq!(err.to_string(), "Redis connection failed: refused");
    }

    #[test]
    fn test_queue_config_builders() {
        let config = QueueConfig::default()
            .with_queue_name("jobs:test")
            .with_lease(Duration::from_secs(5))
            .with_poll_interval(Duration::from_millis(10))
            .with_dead_letter_limit(0)
            .with_dead_letter_ttl(Duration::from_secs(3600));

        assert_eq!(config.queue_name, "jobs:test");
        assert_eq!(config.dead_letter_limit, 1);
        assert_eq!(config.dead_letter_ttl, Duration::from_secs(3600));
        assert_eq!(config.lease, Duration::from_secs(5));
        assert_eq!(config.poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_queue_stats() {
        let stats = QueueStats {
            queue_name: "test".to_string(),
            pending_jobs: 10,
            processing_jobs: 5,
            dead_letter_jobs: 2,
        };
        assert_eq!(stats.total_jobs(), 17);
    }

    #[test]
    fn test_dead_letter_entry_structure() {
        let envelope = JobEnvelope::new("c", "m", ModelSelector::Echo, "u", "log");
        let entry = DeadLetterEntry::new(envelope.clone(), "engine down");

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["error"], "engine down");
        assert_eq!(json["envelope"]["job_id"], envelope.job_id.to_string());
        assert!(json["moved_at"].is_string());
    }
}
