//! Inference engine abstraction layer.
//!
//! The dispatcher treats inference as an opaque capability. Each backend
//! implements `InferenceEngine`; the worker pool only ever calls `infer`.

mod echo;
mod ollama;

pub use echo::EchoEngine;
pub use ollama::OllamaEngine;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::config::{EngineKind, EngineSettings};

/// Failures an engine may report for a single call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InferenceError {
    #[error("Inference timed out")]
    Timeout,

    #[error("{0}")]
    Failed(String),
}

/// Primary trait for inference engines.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Unique identifier for this engine type (e.g., "echo", "ollama").
    fn engine_type(&self) -> &'static str;

    /// Whether an in-progress call can be abandoned mid-flight.
    ///
    /// When true, the worker pool may drop the `infer` future to cancel a
    /// request or enforce its deadline. When false, the call always runs to
    /// completion and its result is discarded if no longer wanted.
    fn supports_interrupt(&self) -> bool {
        false
    }

    /// Check if the engine is reachable.
    async fn health_check(&self) -> Result<(), InferenceError> {
        Ok(())
    }

    /// Run one inference call.
    ///
    /// Engines should report `InferenceError::Timeout` rather than run past
    /// `deadline` when they can.
    async fn infer(&self, payload: &str, deadline: Option<Instant>) -> Result<String, InferenceError>;
}

/// Build the engine selected in configuration.
pub fn build_engine(settings: &EngineSettings) -> Arc<dyn InferenceEngine> {
    match settings.kind {
        EngineKind::Echo => Arc::new(EchoEngine::with_jitter(
            std::time::Duration::from_millis(settings.echo_latency_ms),
            std::time::Duration::from_millis(settings.echo_jitter_ms),
        )),
        EngineKind::Ollama => Arc::new(OllamaEngine::new(
            &settings.ollama_base_url,
            &settings.ollama_model,
        )),
    }
}
