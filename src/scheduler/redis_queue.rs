//! Redis-backed work queue with leases.
//!
//! # Queue Structure
//!
//! - `{queue_name}`: pending envelopes (LPUSH in, RPOPLPUSH out)
//! - `{queue_name}:processing`: claimed envelopes
//! - `{queue_name}:leases`: sorted set of claimed envelopes scored by lease
//!   deadline (unix millis)
//! - `{queue_name}:dead_letter`: envelopes that exhausted their attempts,
//!   newest first, trimmed to `dead_letter_limit` and expiring after
//!   `dead_letter_ttl` without additions
//!
//! # Reliability
//!
//! Claiming moves the envelope to the processing list and records its
//! lease in one Lua script, so a claimed envelope always has a lease until
//! it is acked, failed or reaped. Failing removes the processing entry and
//! queues the follow-up (redelivery or dead letter) atomically, and only if
//! the entry was still there, so two parties settling the same delivery
//! cannot both requeue it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::job::JobEnvelope;
use super::queue::{
    DeadLetterEntry, Delivery, FailOutcome, QueueConfig, QueueError, QueueStats, WorkQueue,
};

/// KEYS: pending, processing, leases. ARGV: lease deadline.
const CLAIM_SCRIPT: &str = r#"
local token = redis.call('RPOPLPUSH', KEYS[1], KEYS[2])
if token then
    redis.call('ZADD', KEYS[3], ARGV[1], token)
end
return token
"#;

/// KEYS: leases. ARGV: token, new deadline.
const EXTEND_SCRIPT: &str = r#"
if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
    redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
    return 1
end
return 0
"#;

/// KEYS: processing, leases, target list. ARGV: token, payload, push side,
/// then a length cap and TTL seconds for the target (0 leaves it alone).
const SETTLE_SCRIPT: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then
    return 0
end
redis.call('ZREM', KEYS[2], ARGV[1])
if ARGV[3] == 'right' then
    redis.call('RPUSH', KEYS[3], ARGV[2])
else
    redis.call('LPUSH', KEYS[3], ARGV[2])
end
if tonumber(ARGV[4]) > 0 then
    redis.call('LTRIM', KEYS[3], 0, tonumber(ARGV[4]) - 1)
end
if tonumber(ARGV[5]) > 0 then
    redis.call('EXPIRE', KEYS[3], ARGV[5])
end
return 1
"#;

/// Where a settled envelope goes.
enum SettleTarget {
    /// Back to the head of the pending list.
    Retry,
    /// Onto the capped, expiring dead letter list.
    DeadLetter,
}

/// Redis work queue with lease-based stall detection.
pub struct RedisWorkQueue {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    config: QueueConfig,
    processing_queue: String,
    lease_set: String,
    dead_letter_queue: String,
    claim_script: Script,
    extend_script: Script,
    settle_script: Script,
}

impl RedisWorkQueue {
    /// Connects to Redis and creates a new work queue.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, config: QueueConfig) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, config))
    }

    /// Creates a queue from an existing ConnectionManager.
    ///
    /// Useful when sharing one connection with the log store.
    pub fn from_connection(redis: ConnectionManager, config: QueueConfig) -> Self {
        let name = config.queue_name.clone();
        Self {
            redis,
            processing_queue: format!("{}:processing", name),
            lease_set: format!("{}:leases", name),
            dead_letter_queue: format!("{}:dead_letter", name),
            config,
            claim_script: Script::new(CLAIM_SCRIPT),
            extend_script: Script::new(EXTEND_SCRIPT),
            settle_script: Script::new(SETTLE_SCRIPT),
        }
    }

    /// Returns the queue name.
    pub fn queue_name(&self) -> &str {
        &self.config.queue_name
    }

    fn lease_deadline(&self) -> i64 {
        Utc::now().timestamp_millis() + self.config.lease.as_millis() as i64
    }

    async fn settle(
        &self,
        token: &str,
        target: SettleTarget,
        payload: &str,
    ) -> Result<bool, QueueError> {
        // Right end is the next to be popped: a retry runs first. Dead
        // letters are pushed left so the newest sit at index 0 and LTRIM
        // drops the oldest.
        let (key, side, cap, ttl_secs) = match target {
            SettleTarget::Retry => (&self.config.queue_name, "right", 0, 0),
            SettleTarget::DeadLetter => (
                &self.dead_letter_queue,
                "left",
                self.config.dead_letter_limit,
                self.config.dead_letter_ttl.as_secs().max(1),
            ),
        };

        let mut conn = self.redis.clone();
        let settled: i64 = self
            .settle_script
            .key(&self.processing_queue)
            .key(&self.lease_set)
            .key(key)
            .arg(token)
            .arg(payload)
            .arg(side)
            .arg(cap)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(settled == 1)
    }

    /// Parses a claimed payload, dead-lettering it if it is not an envelope.
    async fn parse_claimed(&self, token: String) -> Result<Option<Delivery>, QueueError> {
        match serde_json::from_str::<JobEnvelope>(&token) {
            Ok(envelope) => Ok(Some(Delivery { envelope, token })),
            Err(e) => {
                error!(queue = %self.config.queue_name, error = %e, "Unparseable envelope, moving to dead letter");
                let entry = serde_json::json!({
                    "raw": token,
                    "error": e.to_string(),
                    "moved_at": Utc::now().to_rfc3339(),
                });
                self.settle(&token, SettleTarget::DeadLetter, &entry.to_string())
                    .await?;
                Ok(None)
            }
        }
    }

    /// Returns the number of envelopes waiting.
    pub async fn len(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(&self.config.queue_name).await?;
        Ok(len)
    }

    /// Returns the number of envelopes currently claimed.
    pub async fn processing_len(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(&self.processing_queue).await?;
        Ok(len)
    }

    /// Returns the number of dead-lettered envelopes.
    pub async fn dead_letter_len(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(&self.dead_letter_queue).await?;
        Ok(len)
    }

    /// Deletes every key of this queue.
    ///
    /// **Warning**: This permanently deletes all envelopes. Use with caution.
    pub async fn clear(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.del(&self.config.queue_name)
            .del(&self.processing_queue)
            .del(&self.lease_set)
            .del(&self.dead_letter_queue);
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn enqueue(&self, envelope: JobEnvelope) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(&envelope)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(&self.config.queue_name, serialized)
            .await?;
        debug!(queue = %self.config.queue_name, job_id = %envelope.job_id, "Enqueued envelope");
        Ok(())
    }

    async fn claim(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + wait;

        loop {
            let mut conn = self.redis.clone();
            let token: Option<String> = self
                .claim_script
                .key(&self.config.queue_name)
                .key(&self.processing_queue)
                .key(&self.lease_set)
                .arg(self.lease_deadline())
                .invoke_async(&mut conn)
                .await?;

            if let Some(token) = token {
                if let Some(delivery) = self.parse_claimed(token).await? {
                    return Ok(Some(delivery));
                }
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    async fn extend_lease(&self, delivery: &Delivery) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let extended: i64 = self
            .extend_script
            .key(&self.lease_set)
            .arg(&delivery.token)
            .arg(self.lease_deadline())
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn ack(&self, delivery: Delivery) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(&self.processing_queue, 1, &delivery.token)
            .zrem(&self.lease_set, &delivery.token);
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }

    async fn fail(&self, delivery: Delivery, reason: &str) -> Result<FailOutcome, QueueError> {
        let envelope = &delivery.envelope;

        if envelope.should_retry() {
            let next = envelope.redeliver();
            let serialized = serde_json::to_string(&next)?;
            if !self
                .settle(&delivery.token, SettleTarget::Retry, &serialized)
                .await?
            {
                return Ok(FailOutcome::NotHeld);
            }
            info!(
                queue = %self.config.queue_name,
                job_id = %envelope.job_id,
                next_job_id = %next.job_id,
                attempt = next.attempt,
                "Redelivered envelope"
            );
            Ok(FailOutcome::Redelivered(next))
        } else {
            let entry = DeadLetterEntry::new(envelope.clone(), reason);
            let serialized = serde_json::to_string(&entry)?;
            if !self
                .settle(&delivery.token, SettleTarget::DeadLetter, &serialized)
                .await?
            {
                return Ok(FailOutcome::NotHeld);
            }
            warn!(
                queue = %self.config.queue_name,
                job_id = %envelope.job_id,
                attempts = envelope.attempt,
                error = reason,
                "Moved envelope to dead letter queue"
            );
            Ok(FailOutcome::DeadLettered)
        }
    }

    async fn reap_stalled(&self) -> Result<Vec<Delivery>, QueueError> {
        let mut conn = self.redis.clone();
        let now = Utc::now().timestamp_millis();

        let expired: Vec<String> = conn
            .zrangebyscore(&self.lease_set, "-inf", now)
            .await?;

        let mut reaped = Vec::new();
        for token in expired {
            // Only the caller whose ZREM succeeds owns the stalled delivery.
            let removed: usize = conn.zrem(&self.lease_set, &token).await?;
            if removed == 0 {
                continue;
            }
            match serde_json::from_str::<JobEnvelope>(&token) {
                Ok(envelope) => reaped.push(Delivery { envelope, token }),
                Err(e) => warn!(error = %e, "Skipping unparseable stalled envelope"),
            }
        }

        Ok(reaped)
    }

    async fn recover_orphans(&self) -> Result<Vec<Delivery>, QueueError> {
        let mut conn = self.redis.clone();
        let claimed: Vec<String> = conn.lrange(&self.processing_queue, 0, -1).await?;

        let mut orphans = Vec::new();
        for token in claimed {
            let score: Option<f64> = conn.zscore(&self.lease_set, &token).await?;
            if score.is_some() {
                continue;
            }
            if let Ok(envelope) = serde_json::from_str::<JobEnvelope>(&token) {
                orphans.push(Delivery { envelope, token });
            }
        }

        Ok(orphans)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let (queue_len, processing_len, dead_letter_len) =
            tokio::try_join!(self.len(), self.processing_len(), self.dead_letter_len())?;

        Ok(QueueStats {
            queue_name: self.config.queue_name.clone(),
            pending_jobs: queue_len,
            processing_jobs: processing_len,
            dead_letter_jobs: dead_letter_len,
        })
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let data: Vec<String> = conn
            .lrange(&self.dead_letter_queue, 0, limit as isize - 1)
            .await?;

        // Raw entries for unparseable payloads are skipped here.
        Ok(data
            .iter()
            .filter_map(|s| serde_json::from_str(s).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripts_reference_expected_keys() {
        assert!(CLAIM_SCRIPT.contains("RPOPLPUSH"));
        assert!(CLAIM_SCRIPT.contains("KEYS[3]"));
        assert!(SETTLE_SCRIPT.contains("LREM"));
        assert!(SETTLE_SCRIPT.contains("LTRIM"));
        assert!(SETTLE_SCRIPT.contains("EXPIRE"));
        assert!(EXTEND_SCRIPT.contains("ZSCORE"));
    }
}
