use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::dispatch::DispatcherStats;
use crate::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    engine: &'static str,
    engine_healthy: bool,
    dispatcher: DispatcherStats,
}

/// GET /health - liveness plus dispatcher counters
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let engine_healthy = match state.engine.health_check().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(engine = state.engine.engine_type(), "Engine health check failed: {}", e);
            false
        }
    };
    let stats = state.dispatcher.stats().await;

    let status = if stats.shutting_down {
        "shutting_down"
    } else if engine_healthy {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        engine: state.engine.engine_type(),
        engine_healthy,
        dispatcher: stats,
    })
}

/// GET /metrics - dispatcher gauges in Prometheus text format
async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let version = env!("CARGO_PKG_VERSION");
    let stats = state.dispatcher.stats().await;
    let body = format!(
        "# HELP dispatch_info Service information\n\
         # TYPE dispatch_info gauge\n\
         dispatch_info{{version=\"{}\"}} 1\n\
         # HELP dispatch_queue_depth Requests waiting for a worker\n\
         # TYPE dispatch_queue_depth gauge\n\
         dispatch_queue_depth {}\n\
         # HELP dispatch_queue_capacity Maximum queued requests\n\
         # TYPE dispatch_queue_capacity gauge\n\
         dispatch_queue_capacity {}\n\
         # HELP dispatch_workers_busy Worker slots running a request\n\
         # TYPE dispatch_workers_busy gauge\n\
         dispatch_workers_busy {}\n\
         # HELP dispatch_workers_total Worker slots\n\
         # TYPE dispatch_workers_total gauge\n\
         dispatch_workers_total {}\n\
         # HELP dispatch_sessions_open Open sessions\n\
         # TYPE dispatch_sessions_open gauge\n\
         dispatch_sessions_open {}\n",
        version,
        stats.queued,
        stats.queue_capacity,
        stats.busy_workers,
        stats.worker_count,
        stats.open_sessions,
    );
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}
