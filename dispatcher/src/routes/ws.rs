//! WebSocket handler for persistent sessions.
//!
//! Each connection owns one dispatcher session. Submissions are answered
//! with `accepted` or `rejected` right away; results stream back as they
//! resolve. Dropping the socket closes the session and cancels its work.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use chat_dispatch_common::{ClientMessage, ServerMessage, SessionId};
use futures_util::{SinkExt, StreamExt};

use crate::dispatch::{Delivery, RequestId, ResultSink, SessionState, Submission};
use crate::error::DispatchError;
use crate::AppState;

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, state))
}

async fn handle_session(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let session_id = match state.dispatcher.open_session().await {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!("Refusing websocket session: {}", e);
            let _ = send_message(&mut ws_tx, &rejected(&e)).await;
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
    };

    if let Err(e) = send_message(&mut ws_tx, &ServerMessage::SessionOpened { session_id }).await {
        tracing::error!(session_id = %session_id, "Failed to send session_opened: {}", e);
        close_session(&state, session_id).await;
        return;
    }

    let (sink_tx, mut results) = ResultSink::stream();
    let mut client_closed = false;
    let mut session_lost = false;

    loop {
        tokio::select! {
            Some(delivery) = results.recv() => {
                if let Err(e) = send_message(&mut ws_tx, &delivery_message(delivery)).await {
                    tracing::warn!(session_id = %session_id, "Failed to send result: {}", e);
                    break;
                }
            }

            incoming = ws_rx.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Ping(data))) => {
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!(session_id = %session_id, "Client disconnected");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::warn!(session_id = %session_id, "WebSocket error: {}", e);
                        break;
                    }
                };

                let reply = match ClientMessage::from_text(&text) {
                    ClientMessage::Submit { input_text, deadline_ms, priority } => {
                        let mut submission = Submission::new(input_text).in_session(session_id);
                        if let Some(ms) = deadline_ms {
                            submission = submission.with_deadline(Duration::from_millis(ms));
                        }
                        if let Some(priority) = priority {
                            submission = submission.with_priority(priority);
                        }

                        match state.dispatcher.submit(submission, ResultSink::Stream(sink_tx.clone())).await {
                            Ok(id) => Some(ServerMessage::Accepted { request_id: id.0 }),
                            Err(e) => {
                                // Reaped or closed elsewhere; this socket has nothing left to serve.
                                session_lost = e == DispatchError::SessionClosed(session_id);
                                Some(rejected(&e))
                            }
                        }
                    }
                    ClientMessage::Cancel { request_id } => {
                        match state.dispatcher.cancel_in_session(session_id, RequestId(request_id)).await {
                            Ok(()) => None,
                            Err(e) => Some(error_message(Some(request_id), &e)),
                        }
                    }
                    ClientMessage::Close => {
                        client_closed = true;
                        break;
                    }
                };

                if let Some(reply) = reply {
                    if let Err(e) = send_message(&mut ws_tx, &reply).await {
                        tracing::warn!(session_id = %session_id, "Failed to send reply: {}", e);
                        break;
                    }
                }
                if session_lost {
                    tracing::info!(session_id = %session_id, "Session no longer open; closing socket");
                    break;
                }
            }
        }
    }

    close_session(&state, session_id).await;

    if client_closed || session_lost {
        // Flush cancellations and anything that resolved before the close.
        while let Ok(delivery) = results.try_recv() {
            if send_message(&mut ws_tx, &delivery_message(delivery)).await.is_err() {
                return;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    }
}

async fn close_session(state: &AppState, session_id: SessionId) {
    match state.dispatcher.close_session(session_id).await {
        Ok(SessionState::Closing) => {
            tracing::info!(session_id = %session_id, "Session closing; waiting for running work")
        }
        Ok(_) => {}
        Err(e) => tracing::debug!(session_id = %session_id, "Session already gone: {}", e),
    }
}

fn delivery_message(delivery: Delivery) -> ServerMessage {
    match delivery.outcome {
        Ok(completion) => ServerMessage::Result {
            request_id: delivery.request_id.0,
            response: completion.output,
        },
        Err(e) => error_message(Some(delivery.request_id.0), &e),
    }
}

fn rejected(err: &DispatchError) -> ServerMessage {
    ServerMessage::Rejected {
        code: err.code().to_string(),
        message: err.to_string(),
        retryable: err.is_retryable(),
    }
}

fn error_message(request_id: Option<u64>, err: &DispatchError) -> ServerMessage {
    ServerMessage::Error {
        request_id,
        code: err.code().to_string(),
        message: err.to_string(),
        retryable: err.is_retryable(),
    }
}

/// Send a message to the client.
async fn send_message<S>(sink: &mut S, msg: &ServerMessage) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let json = serde_json::to_string(msg)?;
    sink.send(Message::Text(json)).await?;
    Ok(())
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}
