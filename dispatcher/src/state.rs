use std::sync::Arc;

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::engine::InferenceEngine;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    /// Engine behind the worker pool; kept here for health checks.
    pub engine: Arc<dyn InferenceEngine>,
    pub dispatcher: Dispatcher,
}

impl AppState {
    /// Build the engine-backed dispatcher described by `config`.
    pub fn from_config(config: Config, engine: Arc<dyn InferenceEngine>) -> Self {
        let dispatcher = Dispatcher::new(config.dispatcher_config(), engine.clone());
        Self {
            config,
            engine,
            dispatcher,
        }
    }
}
