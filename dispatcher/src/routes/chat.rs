use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, routing::post, Json, Router};
use chat_dispatch_common::{ChatRequest, ChatResponse};

use crate::dispatch::Submission;
use crate::error::DispatchError;
use crate::AppState;

/// POST /chat - submit one prompt and wait for its result
async fn chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, DispatchError> {
    let mut submission = Submission::new(request.input_text);
    if let Some(ms) = request.deadline_ms {
        submission = submission.with_deadline(Duration::from_millis(ms));
    }
    if let Some(priority) = request.priority {
        submission = submission.with_priority(priority);
    }

    let completion = state.dispatcher.submit_and_wait(submission).await?;

    Ok(Json(ChatResponse {
        response: completion.output,
        request_id: completion.request_id.0,
        queued_ms: completion.queued_for.as_millis() as u64,
    }))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/chat", post(chat))
        .with_state(state)
}
