//! Test helpers shared by unit and integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;

use crate::config::Config;
use crate::dispatch::{Dispatcher, DispatcherConfig};
use crate::engine::{InferenceEngine, InferenceError};
use crate::state::AppState;

/// An inference call waiting for the test to decide its result.
pub struct PendingCall {
    pub payload: String,
    pub deadline: Option<Instant>,
    tx: oneshot::Sender<Result<String, InferenceError>>,
}

impl PendingCall {
    /// Finish the call. Ignored if the call was interrupted meanwhile.
    pub fn complete(self, result: Result<String, InferenceError>) {
        let _ = self.tx.send(result);
    }

    /// Finish the call with `"done: <payload>"`.
    pub fn succeed(self) {
        let output = format!("done: {}", self.payload);
        self.complete(Ok(output));
    }
}

/// Engine whose calls block until the test completes them.
pub struct ManualEngine {
    interruptible: bool,
    started: AtomicUsize,
    tx: mpsc::UnboundedSender<PendingCall>,
    rx: Mutex<mpsc::UnboundedReceiver<PendingCall>>,
}

impl ManualEngine {
    /// Engine that cannot be interrupted.
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Engine whose calls may be abandoned mid-flight.
    pub fn interruptible() -> Self {
        Self::build(true)
    }

    fn build(interruptible: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            interruptible,
            started: AtomicUsize::new(0),
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Wait for the next call to start.
    pub async fn next_call(&self) -> PendingCall {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .expect("engine channel closed")
    }

    /// Total calls started so far.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

impl Default for ManualEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InferenceEngine for ManualEngine {
    fn engine_type(&self) -> &'static str {
        "manual"
    }

    fn supports_interrupt(&self) -> bool {
        self.interruptible
    }

    async fn infer(&self, payload: &str, deadline: Option<Instant>) -> Result<String, InferenceError> {
        let (tx, rx) = oneshot::channel();
        self.started.fetch_add(1, Ordering::SeqCst);
        self.tx
            .send(PendingCall {
                payload: payload.to_string(),
                deadline,
                tx,
            })
            .map_err(|_| InferenceError::Failed("test harness gone".to_string()))?;

        rx.await
            .unwrap_or_else(|_| Err(InferenceError::Failed("call dropped by test".to_string())))
    }
}

/// Configuration suitable for tests.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.logging.level = "debug".to_string();
    config
}

/// App state over `engine` with the given dispatcher settings.
pub fn create_test_state(engine: Arc<dyn InferenceEngine>, dispatcher: DispatcherConfig) -> Arc<AppState> {
    let config = test_config();
    Arc::new(AppState {
        config,
        engine: engine.clone(),
        dispatcher: Dispatcher::new(dispatcher, engine),
    })
}
