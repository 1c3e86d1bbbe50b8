//! Generation engine boundary.
//!
//! An engine turns `(conversation, message, model)` into a lazy stream of
//! text fragments that either ends normally or yields one error. The relay
//! forwards fragments verbatim and never looks inside them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;

use crate::error::EngineError;
use crate::scheduler::job::{JobEnvelope, ModelSelector};

/// Fragments produced by an engine.
pub type FragmentStream = BoxStream<'static, Result<String, EngineError>>;

/// Input to a generation engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub conversation_id: String,
    pub message: String,
    pub model: ModelSelector,
}

impl From<&JobEnvelope> for GenerationRequest {
    fn from(envelope: &JobEnvelope) -> Self {
        Self {
            conversation_id: envelope.conversation_id.clone(),
            message: envelope.message.clone(),
            model: envelope.model,
        }
    }
}

/// A source of generated fragments.
///
/// `generate` returns immediately; all I/O happens as the stream is polled.
pub trait GenerationEngine: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    fn generate(&self, request: GenerationRequest) -> FragmentStream;
}

/// Maps each model selector to the engine that serves it.
#[derive(Clone, Default)]
pub struct EngineRegistry {
    engines: HashMap<ModelSelector, Arc<dyn GenerationEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes `model` to `engine`, replacing any previous route.
    pub fn register(&mut self, model: ModelSelector, engine: Arc<dyn GenerationEngine>) {
        self.engines.insert(model, engine);
    }

    /// Builder form of [`EngineRegistry::register`].
    pub fn with_engine(mut self, model: ModelSelector, engine: Arc<dyn GenerationEngine>) -> Self {
        self.register(model, engine);
        self
    }

    /// Routes every selector to the same engine.
    pub fn serving_all(engine: Arc<dyn GenerationEngine>) -> Self {
        let mut registry = Self::new();
        for model in ModelSelector::ALL {
            registry.register(model, Arc::clone(&engine));
        }
        registry
    }

    pub fn resolve(&self, model: ModelSelector) -> Result<Arc<dyn GenerationEngine>, EngineError> {
        self.engines
            .get(&model)
            .cloned()
            .ok_or(EngineError::Unavailable(model))
    }

    pub fn supports(&self, model: ModelSelector) -> bool {
        self.engines.contains_key(&model)
    }
}

/// Ends `fragments` with `EngineError::Timeout` if it is still running
/// after `limit`.
pub fn with_deadline(fragments: FragmentStream, limit: Duration) -> FragmentStream {
    let stream = async_stream::stream! {
        let deadline = tokio::time::sleep(limit);
        tokio::pin!(deadline);
        let mut fragments = fragments;

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    yield Err(EngineError::Timeout(limit));
                    break;
                }
                item = fragments.next() => match item {
                    Some(item) => yield item,
                    None => break,
                },
            }
        }
    };
    stream.boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::echo::EchoEngine;

    #[test]
    fn test_registry_resolution() {
        let echo: Arc<dyn GenerationEngine> = Arc::new(EchoEngine::new());
        let registry = EngineRegistry::new().with_engine(ModelSelector::Echo, echo);

        assert!(registry.supports(ModelSelector::Echo));
        assert!(registry.resolve(ModelSelector::Echo).is_ok());
        assert!(matches!(
            registry.resolve(ModelSelector::Gpt4o),
            Err(EngineError::Unavailable(ModelSelector::Gpt4o))
        ));
    }

    #[test]
    fn test_serving_all() {
        let registry = EngineRegistry::serving_all(Arc::new(EchoEngine::new()));
        assert!(ModelSelector::ALL.iter().all(|m| registry.supports(*m)));
    }

    #[test]
    fn test_request_from_envelope() {
        let env = JobEnvelope::new("c-1", "hello", ModelSelector::Llama3, "u", "log");
        let request = GenerationRequest::from(&env);
        assert_eq!(request.conversation_id, "c-1");
        assert_eq!(request.message, "hello");
        assert_eq!(request.model, ModelSelector::Llama3);
    }

    #[tokio::test]
    async fn test_deadline_passes_fast_streams() {
        let inner = futures::stream::iter(vec![Ok("a".to_string()), Ok("b".to_string())]).boxed();
        let items: Vec<_> = with_deadline(inner, Duration::from_secs(5)).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(Result::is_ok));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cuts_slow_streams() {
        let inner = futures::stream::iter(vec![Ok("a".to_string())])
            .chain(futures::stream::pending())
            .boxed();
        let items: Vec<_> = with_deadline(inner, Duration::from_secs(1)).collect().await;

        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(EngineError::Timeout(_))));
    }
}
