//! Local engine that streams the submitted message back word by word.

use std::time::Duration;

use futures::StreamExt;

use super::engine::{FragmentStream, GenerationEngine, GenerationRequest};
use crate::error::EngineError;

/// Streams the input message back, one whitespace-terminated word per
/// fragment. Used by `demo` and for smoke testing a deployment without an
/// upstream gateway.
#[derive(Debug, Clone, Default)]
pub struct EchoEngine {
    delay: Option<Duration>,
}

impl EchoEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pauses for `delay` before each fragment.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn split(message: &str) -> Vec<String> {
        message
            .split_inclusive(char::is_whitespace)
            .map(str::to_string)
            .collect()
    }
}

impl GenerationEngine for EchoEngine {
    fn name(&self) -> &str {
        "echo"
    }

    fn generate(&self, request: GenerationRequest) -> FragmentStream {
        let words = Self::split(&request.message);
        let delay = self.delay;

        let stream = async_stream::stream! {
            for word in words {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                yield Ok::<String, EngineError>(word);
            }
        };
        stream.boxed()
    }
}
