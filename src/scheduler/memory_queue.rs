//! In-process work queue with the same lease and retry semantics as the
//! Redis queue. Used for single-process deployments and tests.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::job::JobEnvelope;
use super::queue::{
    DeadLetterEntry, Delivery, FailOutcome, QueueConfig, QueueError, QueueStats, WorkQueue,
};

#[derive(Debug)]
struct Claim {
    envelope: JobEnvelope,
    /// `None` once the lease has been reaped.
    lease_deadline: Option<Instant>,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<JobEnvelope>,
    claimed: HashMap<String, Claim>,
    dead_letters: Vec<DeadLetterEntry>,
}

/// Work queue held in process memory.
#[derive(Debug)]
pub struct MemoryWorkQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    available: Notify,
}

impl Default for MemoryWorkQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl MemoryWorkQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
        }
    }

    /// Appends a dead letter, dropping entries past the retention and the
    /// oldest entries beyond the cap.
    fn push_dead_letter(&self, state: &mut QueueState, entry: DeadLetterEntry) {
        let ttl = self.config.dead_letter_ttl;
        let now = entry.moved_at;
        state
            .dead_letters
            .retain(|old| (now - old.moved_at).to_std().map_or(true, |age| age < ttl));
        state.dead_letters.push(entry);

        let overflow = state
            .dead_letters
            .len()
            .saturating_sub(self.config.dead_letter_limit);
        state.dead_letters.drain(..overflow);
    }

    fn token_of(envelope: &JobEnvelope) -> String {
        envelope.job_id.to_string()
    }

    async fn try_claim(&self) -> Option<Delivery> {
        let mut state = self.state.lock().await;
        let envelope = state.pending.pop_front()?;
        let token = Self::token_of(&envelope);
        state.claimed.insert(
            token.clone(),
            Claim {
                envelope: envelope.clone(),
                lease_deadline: Some(Instant::now() + self.config.lease),
            },
        );
        Some(Delivery { envelope, token })
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn enqueue(&self, envelope: JobEnvelope) -> Result<(), QueueError> {
        debug!(queue = %self.config.queue_name, job_id = %envelope.job_id, "Enqueued envelope");
        self.state.lock().await.pending.push_back(envelope);
        self.available.notify_one();
        Ok(())
    }

    async fn claim(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_claim().await {
                return Ok(Some(delivery));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn extend_lease(&self, delivery: &Delivery) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        match state.claimed.get_mut(&delivery.token) {
            Some(Claim {
                lease_deadline: Some(deadline),
                ..
            }) => {
                *deadline = Instant::now() + self.config.lease;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ack(&self, delivery: Delivery) -> Result<(), QueueError> {
        self.state.lock().await.claimed.remove(&delivery.token);
        Ok(())
    }

    async fn fail(&self, delivery: Delivery, reason: &str) -> Result<FailOutcome, QueueError> {
        let mut state = self.state.lock().await;
        let Some(claim) = state.claimed.remove(&delivery.token) else {
            return Ok(FailOutcome::NotHeld);
        };
        let envelope = claim.envelope;

        if envelope.should_retry() {
            let next = envelope.redeliver();
            state.pending.push_front(next.clone());
            drop(state);
            self.available.notify_one();

            info!(
                queue = %self.config.queue_name,
                job_id = %envelope.job_id,
                next_job_id = %next.job_id,
                attempt = next.attempt,
                "Redelivered envelope"
            );
            Ok(FailOutcome::Redelivered(next))
        } else {
            warn!(
                queue = %self.config.queue_name,
                job_id = %envelope.job_id,
                attempts = envelope.attempt,
                error = reason,
                "Moved envelope to dead letter queue"
            );
            self.push_dead_letter(&mut state, DeadLetterEntry::new(envelope, reason));
            Ok(FailOutcome::DeadLettered)
        }
    }

    async fn reap_stalled(&self) -> Result<Vec<Delivery>, QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let mut reaped = Vec::new();
        for (token, claim) in state.claimed.iter_mut() {
            if claim.lease_deadline.is_some_and(|deadline| deadline <= now) {
                claim.lease_deadline = None;
                reaped.push(Delivery {
                    envelope: claim.envelope.clone(),
                    token: token.clone(),
                });
            }
        }

        Ok(reaped)
    }

    async fn recover_orphans(&self) -> Result<Vec<Delivery>, QueueError> {
        let state = self.state.lock().await;
        Ok(state
            .claimed
            .iter()
            .filter(|(_, claim)| claim.lease_deadline.is_none())
            .map(|(token, claim)| Delivery {
                envelope: claim.envelope.clone(),
                token: token.clone(),
            })
            .collect())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.state.lock().await;
        Ok(QueueStats {
            queue_name: self.config.queue_name.clone(),
            pending_jobs: state.pending.len(),
            processing_jobs: state.claimed.len(),
            dead_letter_jobs: state.dead_letters.len(),
        })
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let state = self.state.lock().await;
        Ok(state.dead_letters.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::ModelSelector;
    use std::sync::Arc;

    fn envelope(message: &str) -> JobEnvelope {
        JobEnvelope::new("conv", message, ModelSelector::Echo, "user", "log")
    }

    fn queue() -> MemoryWorkQueue {
        MemoryWorkQueue::new(QueueConfig::default().with_lease(Duration::from_millis(50)))
    }

    #[tokio::test]
    async fn test_fifo_claim() {
        let q = queue();
        q.enqueue(envelope("first")).await.unwrap();
        q.enqueue(envelope("second")).await.unwrap();

        let a = q.claim(Duration::ZERO).await.unwrap().unwrap();
        let b = q.claim(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(a.envelope.message, "first");
        assert_eq!(b.envelope.message, "second");
        assert!(q.claim(Duration::ZERO).await.unwrap().is_none());

        let stats = q.stats().await.unwrap();
        assert_eq!(stats.pending_jobs, 0);
        assert_eq!(stats.processing_jobs, 2);
    }

    #[tokio::test]
    async fn test_claim_waits_for_enqueue() {
        let q = Arc::new(queue());
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.claim(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        q.enqueue(envelope("late")).await.unwrap();

        let delivery = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.envelope.message, "late");
    }

    #[tokio::test]
    async fn test_single_active_consumer() {
        let q = Arc::new(queue());
        q.enqueue(envelope("only")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let q = Arc::clone(&q);
            handles.push(tokio::spawn(async move {
                q.claim(Duration::from_millis(30)).await.unwrap()
            }));
        }

        let mut claimed = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
    }

    #[tokio::test]
    async fn test_ack_removes() {
        let q = queue();
        q.enqueue(envelope("done")).await.unwrap();
        let delivery = q.claim(Duration::ZERO).await.unwrap().unwrap();
        q.ack(delivery).await.unwrap();
        assert_eq!(q.stats().await.unwrap().total_jobs(), 0);
    }

    #[tokio::test]
    async fn test_fail_redelivers_then_dead_letters() {
        let q = queue();
        q.enqueue(envelope("flaky").with_max_attempts(2)).await.unwrap();

        let first = q.claim(Duration::ZERO).await.unwrap().unwrap();
        let outcome = q.fail(first.clone(), "boom").await.unwrap();
        let FailOutcome::Redelivered(next) = outcome else {
            panic!("expected redelivery, got {:?}", outcome);
        };
        assert_ne!(next.job_id, first.envelope.job_id);
        assert_ne!(next.log_address, first.envelope.log_address);

        let second = q.claim(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(second.envelope, next);
        assert_eq!(q.fail(second, "boom again").await.unwrap(), FailOutcome::DeadLettered);

        let stats = q.stats().await.unwrap();
        assert_eq!(stats.pending_jobs, 0);
        assert_eq!(stats.processing_jobs, 0);
        assert_eq!(stats.dead_letter_jobs, 1);

        let dead = q.dead_letters(10).await.unwrap();
        assert_eq!(dead[0].error, "boom again");
        assert_eq!(dead[0].envelope.attempt, 2);
    }

    #[tokio::test]
    async fn test_dead_letters_are_capped() {
        let q = MemoryWorkQueue::new(QueueConfig::default().with_dead_letter_limit(2));
        for message in ["one", "two", "three"] {
            q.enqueue(envelope(message).with_max_attempts(1)).await.unwrap();
            let delivery = q.claim(Duration::ZERO).await.unwrap().unwrap();
            assert_eq!(q.fail(delivery, message).await.unwrap(), FailOutcome::DeadLettered);
        }

        assert_eq!(q.stats().await.unwrap().dead_letter_jobs, 2);
        let dead = q.dead_letters(10).await.unwrap();
        let errors: Vec<_> = dead.iter().map(|entry| entry.error.as_str()).collect();
        assert_eq!(errors, vec!["three", "two"]);
    }

    #[tokio::test]
    async fn test_expired_dead_letters_are_dropped() {
        let q = MemoryWorkQueue::new(
            QueueConfig::default().with_dead_letter_ttl(Duration::from_millis(20)),
        );
        for message in ["old", "new"] {
            q.enqueue(envelope(message).with_max_attempts(1)).await.unwrap();
            let delivery = q.claim(Duration::ZERO).await.unwrap().unwrap();
            q.fail(delivery, message).await.unwrap();
            tokio::time::sleep(Duration::from_millis(40)).await;
        }

        let dead = q.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].error, "new");
    }

    #[tokio::test]
    async fn test_retry_runs_before_older_pending() {
        let q = queue();
        q.enqueue(envelope("a")).await.unwrap();
        q.enqueue(envelope("b")).await.unwrap();

        let a = q.claim(Duration::ZERO).await.unwrap().unwrap();
        q.fail(a, "boom").await.unwrap();

        let next = q.claim(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(next.envelope.message, "a");
        assert_eq!(next.envelope.attempt, 2);
    }

    #[tokio::test]
    async fn test_lease_expiry_and_reap() {
        let q = queue();
        q.enqueue(envelope("stuck")).await.unwrap();
        let delivery = q.claim(Duration::ZERO).await.unwrap().unwrap();

        assert!(q.extend_lease(&delivery).await.unwrap());
        assert!(q.reap_stalled().await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let reaped = q.reap_stalled().await.unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].token, delivery.token);

        // The stalled worker has lost its claim.
        assert!(!q.extend_lease(&delivery).await.unwrap());
        assert_eq!(q.recover_orphans().await.unwrap().len(), 1);

        // Reaping again finds nothing new.
        assert!(q.reap_stalled().await.unwrap().is_empty());

        let outcome = q.fail(reaped[0].clone(), "stalled").await.unwrap();
        assert!(matches!(outcome, FailOutcome::Redelivered(_)));

        // A late settle from the stalled worker changes nothing.
        assert_eq!(q.fail(delivery, "late").await.unwrap(), FailOutcome::NotHeld);
        assert_eq!(q.stats().await.unwrap().pending_jobs, 1);
    }
}
