//! Generation engines.
//!
//! Workers resolve an engine per job through [`EngineRegistry`] and consume
//! the returned [`FragmentStream`]:
//!
//! ```ignore
//! use fragment_relay::llm::{EchoEngine, EngineRegistry, LiteLlmEngine};
//! use fragment_relay::scheduler::ModelSelector;
//! use std::sync::Arc;
//!
//! let gateway = Arc::new(LiteLlmEngine::from_env()?);
//! let engines = EngineRegistry::serving_all(gateway)
//!     .with_engine(ModelSelector::Echo, Arc::new(EchoEngine::new()));
//! ```

pub mod echo;
pub mod engine;
pub mod litellm;

pub use echo::EchoEngine;
pub use engine::{with_deadline, EngineRegistry, FragmentStream, GenerationEngine, GenerationRequest};
pub use litellm::LiteLlmEngine;
