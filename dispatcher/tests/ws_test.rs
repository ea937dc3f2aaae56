use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chat_dispatch_common::ServerMessage;
use chat_dispatcher::dispatch::DispatcherConfig;
use chat_dispatcher::engine::EchoEngine;
use chat_dispatcher::test_util::{create_test_state, ManualEngine};
use chat_dispatcher::{app, AppState};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn serve(state: Arc<AppState>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app(state)).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let (ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    ws
}

async fn recv(ws: &mut Client) -> ServerMessage {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for server message")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn open(ws: &mut Client) {
    match recv(ws).await {
        ServerMessage::SessionOpened { .. } => {}
        other => panic!("expected session_opened, got {:?}", other),
    }
}

fn echo_state(config: DispatcherConfig) -> Arc<AppState> {
    create_test_state(Arc::new(EchoEngine::new(Duration::from_millis(5))), config)
}

#[tokio::test]
async fn test_submit_json_and_plain_text() {
    let addr = serve(echo_state(DispatcherConfig::default())).await;
    let mut ws = connect(addr).await;
    open(&mut ws).await;

    ws.send(Message::Text(r#"{"type":"submit","input_text":"abc"}"#.to_string()))
        .await
        .unwrap();
    let id = match recv(&mut ws).await {
        ServerMessage::Accepted { request_id } => request_id,
        other => panic!("unexpected: {:?}", other),
    };
    assert_eq!(
        recv(&mut ws).await,
        ServerMessage::Result {
            request_id: id,
            response: "Model response: cba".to_string(),
        }
    );

    ws.send(Message::Text("plain words".to_string())).await.unwrap();
    assert!(matches!(recv(&mut ws).await, ServerMessage::Accepted { .. }));
    match recv(&mut ws).await {
        ServerMessage::Result { response, .. } => assert_eq!(response, "Model response: sdrow nialp"),
        other => panic!("unexpected: {:?}", other),
    }
}

#[tokio::test]
async fn test_queue_full_is_rejected() {
    let engine = Arc::new(ManualEngine::new());
    let state = create_test_state(
        engine.clone(),
        DispatcherConfig {
            worker_count: 1,
            queue_capacity: 1,
            ..DispatcherConfig::default()
        },
    );
    let addr = serve(state).await;
    let mut ws = connect(addr).await;
    open(&mut ws).await;

    for text in ["one", "two"] {
        ws.send(Message::Text(text.to_string())).await.unwrap();
        assert!(matches!(recv(&mut ws).await, ServerMessage::Accepted { .. }));
    }

    ws.send(Message::Text("three".to_string())).await.unwrap();
    match recv(&mut ws).await {
        ServerMessage::Rejected { code, retryable, .. } => {
            assert_eq!(code, "queue_full");
            assert!(retryable);
        }
        other => panic!("unexpected: {:?}", other),
    }
}

#[tokio::test]
async fn test_cancel_running_request() {
    let engine = Arc::new(ManualEngine::interruptible());
    let state = create_test_state(engine.clone(), DispatcherConfig::default());
    let addr = serve(state).await;
    let mut ws = connect(addr).await;
    open(&mut ws).await;

    ws.send(Message::Text("long job".to_string())).await.unwrap();
    let id = match recv(&mut ws).await {
        ServerMessage::Accepted { request_id } => request_id,
        other => panic!("unexpected: {:?}", other),
    };
    let _call = engine.next_call().await;

    ws.send(Message::Text(format!(r#"{{"type":"cancel","request_id":{}}}"#, id)))
        .await
        .unwrap();
    match recv(&mut ws).await {
        ServerMessage::Error { request_id, code, .. } => {
            assert_eq!(request_id, Some(id));
            assert_eq!(code, "cancelled");
        }
        other => panic!("unexpected: {:?}", other),
    }

    // Cancelling again: the request is gone.
    ws.send(Message::Text(format!(r#"{{"type":"cancel","request_id":{}}}"#, id)))
        .await
        .unwrap();
    match recv(&mut ws).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, "unknown_request"),
        other => panic!("unexpected: {:?}", other),
    }
}

#[tokio::test]
async fn test_close_message_cancels_outstanding() {
    let engine = Arc::new(ManualEngine::interruptible());
    let state = create_test_state(engine.clone(), DispatcherConfig::default());
    let addr = serve(state.clone()).await;
    let mut ws = connect(addr).await;
    open(&mut ws).await;

    ws.send(Message::Text("pending".to_string())).await.unwrap();
    assert!(matches!(recv(&mut ws).await, ServerMessage::Accepted { .. }));
    let _call = engine.next_call().await;

    ws.send(Message::Text(r#"{"type":"close"}"#.to_string())).await.unwrap();
    match recv(&mut ws).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, "cancelled"),
        other => panic!("unexpected: {:?}", other),
    }

    let stats = state.dispatcher.stats().await;
    assert_eq!(stats.open_sessions, 0);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test]
async fn test_disconnect_closes_session() {
    let engine = Arc::new(ManualEngine::interruptible());
    let state = create_test_state(engine.clone(), DispatcherConfig::default());
    let addr = serve(state.clone()).await;
    let mut ws = connect(addr).await;
    open(&mut ws).await;
    assert_eq!(state.dispatcher.stats().await.open_sessions, 1);

    ws.send(Message::Text("orphaned".to_string())).await.unwrap();
    assert!(matches!(recv(&mut ws).await, ServerMessage::Accepted { .. }));
    let _call = engine.next_call().await;

    drop(ws);

    let mut closed = false;
    for _ in 0..100 {
        let stats = state.dispatcher.stats().await;
        if stats.open_sessions == 0 && stats.in_flight == 0 {
            closed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(closed, "session was not closed after disconnect");
}

#[tokio::test]
async fn test_reaped_session_closes_socket() {
    let state = echo_state(DispatcherConfig {
        session_idle_timeout: Some(Duration::from_millis(50)),
        ..DispatcherConfig::default()
    });
    let addr = serve(state.clone()).await;
    let mut ws = connect(addr).await;
    open(&mut ws).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    state.dispatcher.sweep().await;
    assert_eq!(state.dispatcher.stats().await.open_sessions, 0);

    ws.send(Message::Text("anyone there?".to_string())).await.unwrap();
    match recv(&mut ws).await {
        ServerMessage::Rejected { code, .. } => assert_eq!(code, "session_closed"),
        other => panic!("unexpected: {:?}", other),
    }

    let next = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("socket stayed open");
    assert!(
        matches!(next, None | Some(Ok(Message::Close(_))) | Some(Err(_))),
        "expected close, got {:?}",
        next
    );
}
