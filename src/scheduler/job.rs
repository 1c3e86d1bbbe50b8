//! Job definitions for the scheduler.
//!
//! This module defines the core job types used in the scheduling system:
//!
//! - `JobEnvelope`: A validated generation request waiting for a worker
//! - `ModelSelector`: The closed set of generation engines a job may target
//! - `LogAddress`: The key producer and readers share for one job's fragment log
//! - `JobPhase`: Where a claimed job is in its worker-side lifecycle

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SubmitError;

/// Default maximum number of delivery attempts for a job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default key prefix for fragment logs.
pub const DEFAULT_LOG_PREFIX: &str = "relay:log";

/// Generation engines a job may be routed to.
///
/// Selectors arrive as strings from clients and are parsed once at the
/// gateway; anything outside this set is rejected there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelSelector {
    Gpt4o,
    Gpt4oMini,
    Llama3,
    Echo,
}

impl ModelSelector {
    /// Every supported selector, in display order.
    pub const ALL: [ModelSelector; 4] = [
        ModelSelector::Gpt4o,
        ModelSelector::Gpt4oMini,
        ModelSelector::Llama3,
        ModelSelector::Echo,
    ];

    /// The wire name clients use for this selector.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelSelector::Gpt4o => "gpt-4o",
            ModelSelector::Gpt4oMini => "gpt-4o-mini",
            ModelSelector::Llama3 => "llama-3",
            ModelSelector::Echo => "echo",
        }
    }

    /// Model name sent to an OpenAI-compatible upstream.
    pub fn upstream_model(&self) -> &'static str {
        match self {
            ModelSelector::Gpt4o => "openai/gpt-4o",
            ModelSelector::Gpt4oMini => "openai/gpt-4o-mini",
            ModelSelector::Llama3 => "meta-llama/llama-3.1-70b-instruct",
            ModelSelector::Echo => "echo",
        }
    }
}

impl fmt::Display for ModelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelSelector {
    type Err = SubmitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        ModelSelector::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| SubmitError::UnsupportedModel(s.to_string()))
    }
}

/// Key of a job's fragment log.
///
/// Derived from `(conversation, model, job)` so the producer and every
/// reader compute the same key without a lookup. Job ids are fresh v4
/// UUIDs, so an address is never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogAddress(String);

impl LogAddress {
    /// Derives the address for a job.
    pub fn derive(
        prefix: &str,
        conversation_id: &str,
        model: ModelSelector,
        job_id: Uuid,
    ) -> Self {
        Self(format!(
            "{}:{}:{}:{}",
            prefix,
            conversation_id,
            model.as_str(),
            job_id
        ))
    }

    /// Address for the same conversation and model under a new job id.
    fn rebind(&self, old_job: Uuid, new_job: Uuid) -> Self {
        let suffix = format!(":{}", old_job);
        match self.0.strip_suffix(&suffix) {
            Some(stem) => Self(format!("{}:{}", stem, new_job)),
            None => Self(format!("{}:{}", self.0, new_job)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LogAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LogAddress {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for LogAddress {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A validated generation request, as stored on the work queue.
///
/// Envelopes are immutable once enqueued. A redelivery after failure is a
/// new envelope with its own job id and log address; see [`JobEnvelope::redeliver`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobEnvelope {
    /// Unique identifier for this job run.
    pub job_id: Uuid,
    /// Conversation the message belongs to.
    pub conversation_id: String,
    /// Input text for the engine.
    pub message: String,
    /// Engine to run.
    pub model: ModelSelector,
    /// Who submitted the job.
    pub submitter_id: String,
    /// Where this run's fragments are written.
    pub log_address: LogAddress,
    /// Delivery attempt this envelope represents, starting at 1.
    pub attempt: u32,
    /// Attempts allowed before the job is dead-lettered.
    pub max_attempts: u32,
    /// Job id of the run this one retries, if any.
    #[serde(default)]
    pub previous_job_id: Option<Uuid>,
    /// When this envelope was created.
    pub created_at: DateTime<Utc>,
}

impl JobEnvelope {
    /// Mints a first-attempt envelope with a fresh job id and log address.
    pub fn new(
        conversation_id: impl Into<String>,
        message: impl Into<String>,
        model: ModelSelector,
        submitter_id: impl Into<String>,
        log_prefix: &str,
    ) -> Self {
        let job_id = Uuid::new_v4();
        let conversation_id = conversation_id.into();
        let log_address = LogAddress::derive(log_prefix, &conversation_id, model, job_id);

        Self {
            job_id,
            conversation_id,
            message: message.into(),
            model,
            submitter_id: submitter_id.into(),
            log_address,
            attempt: 1,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            previous_job_id: None,
            created_at: Utc::now(),
        }
    }

    /// Sets the maximum number of delivery attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Returns whether a failed run of this envelope may be retried.
    pub fn should_retry(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Returns the number of retries still available after this attempt.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt)
    }

    /// Builds the envelope for the next attempt.
    ///
    /// The retry is a distinct job: new id, new log address. The failed
    /// run's log is left as it is.
    pub fn redeliver(&self) -> JobEnvelope {
        let job_id = Uuid::new_v4();
        JobEnvelope {
            job_id,
            conversation_id: self.conversation_id.clone(),
            message: self.message.clone(),
            model: self.model,
            submitter_id: self.submitter_id.clone(),
            log_address: self.log_address.rebind(self.job_id, job_id),
            attempt: self.attempt + 1,
            max_attempts: self.max_attempts,
            previous_job_id: Some(self.job_id),
            created_at: Utc::now(),
        }
    }
}

/// Worker-side lifecycle of a claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    Claimed,
    Generating,
    Completed,
    Failed,
}

impl JobPhase {
    /// Returns true once no further transitions are possible.
    pub fn is_final(&self) -> bool {
        matches!(self, JobPhase::Completed | JobPhase::Failed)
    }

    /// Returns whether moving to `next` is a legal transition.
    pub fn can_advance_to(&self, next: JobPhase) -> bool {
        matches!(
            (self, next),
            (JobPhase::Claimed, JobPhase::Generating)
                | (JobPhase::Claimed, JobPhase::Failed)
                | (JobPhase::Generating, JobPhase::Completed)
                | (JobPhase::Generating, JobPhase::Failed)
        )
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobPhase::Claimed => write!(f, "claimed"),
            JobPhase::Generating => write!(f, "generating"),
            JobPhase::Completed => write!(f, "completed"),
            JobPhase::Failed => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> JobEnvelope {
        JobEnvelope::new("conv-1", "ping", ModelSelector::Gpt4o, "user-1", "relay:log")
    }

    #[test]
    fn test_model_selector_parse() {
        assert_eq!("gpt-4o".parse::<ModelSelector>().unwrap(), ModelSelector::Gpt4o);
        assert_eq!(" ECHO ".parse::<ModelSelector>().unwrap(), ModelSelector::Echo);

        let err = "gpt-9".parse::<ModelSelector>().unwrap_err();
        assert!(matches!(err, SubmitError::UnsupportedModel(ref s) if s == "gpt-9"));
    }

    #[test]
    fn test_model_selector_serde_uses_wire_names() {
        for model in ModelSelector::ALL {
            let json = serde_json::to_string(&model).unwrap();
            assert_eq!(json, format!("\"{}\"", model.as_str()));
        }
    }

    #[test]
    fn test_log_address_is_deterministic() {
        let job = Uuid::new_v4();
        let a = LogAddress::derive("relay:log", "conv-1", ModelSelector::Llama3, job);
        let b = LogAddress::derive("relay:log", "conv-1", ModelSelector::Llama3, job);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), format!("relay:log:conv-1:llama-3:{}", job));
    }

    #[test]
    fn test_envelope_defaults() {
        let env = envelope();
        assert_eq!(env.attempt, 1);
        assert_eq!(env.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(env.previous_job_id.is_none());
        assert!(env.log_address.as_str().ends_with(&env.job_id.to_string()));
    }

    #[test]
    fn test_redeliver_mints_new_identity() {
        let first = envelope();
        let second = first.redeliver();

        assert_ne!(second.job_id, first.job_id);
        assert_ne!(second.log_address, first.log_address);
        assert_eq!(second.attempt, 2);
        assert_eq!(second.previous_job_id, Some(first.job_id));
        assert_eq!(
            second.log_address,
            LogAddress::derive("relay:log", "conv-1", ModelSelector::Gpt4o, second.job_id)
        );
        assert_eq!(second.message, first.message);
    }

    #[test]
    fn test_retry_bound() {
        let mut env = envelope().with_max_attempts(2);
        assert!(env.should_retry());
        assert_eq!(env.remaining_attempts(), 1);

        env = env.redeliver();
        assert!(!env.should_retry());
        assert_eq!(env.remaining_attempts(), 0);
    }

    #[test]
    fn test_max_attempts_floor() {
        let env = envelope().with_max_attempts(0);
        assert_eq!(env.max_attempts, 1);
        assert!(!env.should_retry());
    }

    #[test]
    fn test_envelope_serialization_roundtrip() {
        let env = envelope();
        let json = serde_json::to_string(&env).unwrap();
        let parsed: JobEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, env);
    }

    #[test]
    fn test_job_phase_transitions() {
        assert!(JobPhase::Claimed.can_advance_to(JobPhase::Generating));
        assert!(JobPhase::Generating.can_advance_to(JobPhase::Failed));
        assert!(!JobPhase::Completed.can_advance_to(JobPhase::Generating));
        assert!(!JobPhase::Claimed.can_advance_to(JobPhase::Completed));
        assert!(JobPhase::Failed.is_final());
        assert_eq!(JobPhase::Generating.to_string(), "generating");
    }
}
