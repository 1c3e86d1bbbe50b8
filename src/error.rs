//! Error types for fragment-relay operations.
//!
//! Defines the error taxonomy shared across subsystems:
//! - Job submission (validation, ownership, model selection)
//! - Fragment log storage
//! - Fragment reading (pre-check failures, idle timeout, transport)
//! - Generation engine calls
//! - Fragment production
//!
//! Queue errors live beside the queue in [`crate::scheduler::queue`].

use std::time::Duration;

use thiserror::Error;

use crate::scheduler::job::{LogAddress, ModelSelector};
use crate::scheduler::queue::QueueError;

/// Errors returned by the submission gateway.
///
/// None of these reach the work queue: a rejected submission never
/// produces an envelope.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Submitter '{submitter_id}' does not own conversation '{conversation_id}'")]
    AccessDenied {
        submitter_id: String,
        conversation_id: String,
    },

    #[error("Unsupported model selector: {0}")]
    UnsupportedModel(String),

    #[error("Ownership lookup failed: {0}")]
    Transport(String),

    #[error("Failed to enqueue job: {0}")]
    Queue(#[from] QueueError),
}

/// Errors from a fragment log store.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("Log store transport error: {0}")]
    Transport(String),

    #[error("Malformed record {id} in {address}: {reason}")]
    Malformed {
        address: String,
        id: String,
        reason: String,
    },

    #[error("Record encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Log {address} already ends with a terminal record")]
    Sealed { address: String },

    #[error("Log {address} expected sequence {expected}, got {got}")]
    OutOfSequence {
        address: String,
        expected: u64,
        got: u64,
    },
}

impl LogError {
    /// Returns true when the failure is a connectivity problem worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, LogError::Transport(_))
    }

    /// Returns true when the store refused the append because another
    /// writer got there first.
    pub fn is_fenced(&self) -> bool {
        matches!(self, LogError::Sealed { .. } | LogError::OutOfSequence { .. })
    }
}

impl From<redis::RedisError> for LogError {
    fn from(err: redis::RedisError) -> Self {
        LogError::Transport(err.to_string())
    }
}

/// Errors surfaced to a viewer tailing a fragment log.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("No log exists at {0}")]
    NotFound(LogAddress),

    #[error("Log at {0} exists but holds no records")]
    Empty(LogAddress),

    #[error("No new records at {address} for {idle:?} ({polls} idle polls)")]
    IdleTimeout {
        address: LogAddress,
        idle: Duration,
        polls: u32,
    },

    #[error("Log store unreachable after {attempts} attempts: {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: LogError,
    },

    #[error("Corrupt log: {0}")]
    Corrupt(LogError),
}

impl ReadError {
    /// Short label used for metrics and exit codes.
    pub fn kind(&self) -> &'static str {
        match self {
            ReadError::NotFound(_) => "not_found",
            ReadError::Empty(_) => "empty",
            ReadError::IdleTimeout { .. } => "idle_timeout",
            ReadError::Transport { .. } => "transport",
            ReadError::Corrupt(_) => "corrupt",
        }
    }
}

/// Errors that can occur while a generation engine produces fragments.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Missing API base URL: LITELLM_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("No engine registered for model {0}")]
    Unavailable(ModelSelector),

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Malformed stream event: {0}")]
    Stream(String),

    #[error("Generation exceeded {0:?}")]
    Timeout(Duration),

    #[error("Generation failed: {0}")]
    Failed(String),
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        EngineError::RequestFailed(err.to_string())
    }
}

/// Errors from driving a generation stream into a fragment log.
#[derive(Debug, Error)]
pub enum ProduceError {
    #[error("Engine failed: {0}")]
    Engine(#[from] EngineError),

    #[error("Log append failed: {0}")]
    Log(#[from] LogError),
}
