pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod logging;
pub mod routes;
pub mod state;
pub mod test_util;

pub use config::Config;
pub use dispatch::{Dispatcher, DispatcherConfig, DispatcherStats, RequestId, Submission};
pub use engine::{EchoEngine, InferenceEngine, InferenceError, OllamaEngine};
pub use error::DispatchError;
pub use state::AppState;

use std::sync::Arc;

use axum::{middleware, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the HTTP router over shared state.
pub fn app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(routes::health::router(state.clone()))
        .merge(routes::chat::router(state.clone()))
        .merge(routes::ws::router(state))
        .layer(middleware::from_fn(logging::request_logger))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
