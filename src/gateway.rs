//! Job submission gateway.
//!
//! Validates a request, checks conversation ownership, mints the job id and
//! log address and enqueues one envelope. It returns as soon as the envelope
//! is queued; the log itself is created by the first append.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::SubmitError;
use crate::metrics::MetricsCollector;
use crate::scheduler::job::{
    JobEnvelope, LogAddress, ModelSelector, DEFAULT_LOG_PREFIX, DEFAULT_MAX_ATTEMPTS,
};
use crate::scheduler::queue::WorkQueue;
use crate::storage::OwnershipCheck;

/// A caller's request to generate a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub conversation_id: String,
    pub message: String,
    /// Model selector as sent by the client, e.g. `gpt-4o`.
    pub model: String,
    pub submitter_id: String,
}

/// What the caller needs to attach a reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub job_id: Uuid,
    pub log_address: LogAddress,
}

/// Accepts submissions and puts them on the work queue.
#[derive(Clone)]
pub struct SubmissionGateway {
    queue: Arc<dyn WorkQueue>,
    ownership: Arc<dyn OwnershipCheck>,
    log_prefix: String,
    max_attempts: u32,
    metrics: MetricsCollector,
}

impl SubmissionGateway {
    pub fn new(queue: Arc<dyn WorkQueue>, ownership: Arc<dyn OwnershipCheck>) -> Self {
        Self {
            queue,
            ownership,
            log_prefix: DEFAULT_LOG_PREFIX.to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            metrics: MetricsCollector::new(),
        }
    }

    /// Sets the key prefix used for log addresses.
    pub fn with_log_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.log_prefix = prefix.into();
        self
    }

    /// Sets the delivery attempts granted to each job.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Submits a request.
    ///
    /// Rejections (`Validation`, `UnsupportedModel`, `AccessDenied`) never
    /// reach the queue.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Submission, SubmitError> {
        if request.conversation_id.trim().is_empty() {
            return Err(SubmitError::Validation("conversation_id must not be empty".to_string()));
        }
        if request.submitter_id.trim().is_empty() {
            return Err(SubmitError::Validation("submitter_id must not be empty".to_string()));
        }
        if request.message.trim().is_empty() {
            return Err(SubmitError::Validation("message must not be empty".to_string()));
        }

        let model: ModelSelector = request.model.parse()?;

        let owns = self
            .ownership
            .owns(&request.submitter_id, &request.conversation_id)
            .await
            .map_err(|e| SubmitError::Transport(e.to_string()))?;
        if !owns {
            warn!(
                submitter_id = %request.submitter_id,
                conversation_id = %request.conversation_id,
                "Rejected submission for conversation not owned by submitter"
            );
            return Err(SubmitError::AccessDenied {
                submitter_id: request.submitter_id,
                conversation_id: request.conversation_id,
            });
        }

        let envelope = JobEnvelope::new(
            request.conversation_id,
            request.message,
            model,
            request.submitter_id,
            &self.log_prefix,
        )
        .with_max_attempts(self.max_attempts);

        let submission = Submission {
            job_id: envelope.job_id,
            log_address: envelope.log_address.clone(),
        };

        self.queue.enqueue(envelope).await?;
        self.metrics.record_submission(model);

        info!(
            job_id = %submission.job_id,
            log_address = %submission.log_address,
            model = %model,
            "Accepted submission"
        );
        Ok(submission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::memory_queue::MemoryWorkQueue;
    use crate::storage::{StaticOwnership, Unrestricted};
    use std::time::Duration;

    fn request(model: &str, message: &str) -> SubmitRequest {
        SubmitRequest {
            conversation_id: "conv-1".to_string(),
            message: message.to_string(),
            model: model.to_string(),
            submitter_id: "alice".to_string(),
        }
    }

    #[tokio::test]
    async fn test_submit_enqueues_one_envelope() {
        let queue = Arc::new(MemoryWorkQueue::default());
        let gateway = SubmissionGateway::new(queue.clone(), Arc::new(Unrestricted))
            .with_log_prefix("t:log")
            .with_max_attempts(5);

        let submission = gateway.submit(request("gpt-4o", "hello")).await.unwrap();
        assert!(submission
            .log_address
            .as_str()
            .starts_with("t:log:conv-1:gpt-4o:"));

        let delivery = queue.claim(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(delivery.envelope.job_id, submission.job_id);
        assert_eq!(delivery.envelope.log_address, submission.log_address);
        assert_eq!(delivery.envelope.max_attempts, 5);
        assert_eq!(delivery.envelope.attempt, 1);
        assert!(queue.claim(Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejections_never_reach_queue() {
        let queue = Arc::new(MemoryWorkQueue::default());
        let ownership = StaticOwnership::new().with_owner("conv-1", "bob");
        let gateway = SubmissionGateway::new(queue.clone(), Arc::new(ownership));

        assert!(matches!(
            gateway.submit(request("gpt-4o", "   ")).await,
            Err(SubmitError::Validation(_))
        ));
        assert!(matches!(
            gateway.submit(request("gpt-9", "hi")).await,
            Err(SubmitError::UnsupportedModel(_))
        ));
        assert!(matches!(
            gateway.submit(request("gpt-4o", "hi")).await,
            Err(SubmitError::AccessDenied { .. })
        ));

        assert_eq!(queue.stats().await.unwrap().total_jobs(), 0);
    }

    #[tokio::test]
    async fn test_unique_addresses_per_submission() {
        let gateway = SubmissionGateway::new(Arc::new(MemoryWorkQueue::default()), Arc::new(Unrestricted));
        let a = gateway.submit(request("echo", "same")).await.unwrap();
        let b = gateway.submit(request("echo", "same")).await.unwrap();
        assert_ne!(a.job_id, b.job_id);
        assert_ne!(a.log_address, b.log_address);
    }
}
