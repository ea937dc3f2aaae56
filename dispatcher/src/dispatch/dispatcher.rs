//! The dispatcher: admission control, assignment and result routing.
//!
//! All bookkeeping (queue, slot table, in-flight table, sessions) lives in one
//! `DispatchState` behind a single async mutex, so enqueue, assign, cancel,
//! free and expire are atomic relative to each other. Only the inference
//! calls themselves run concurrently, one per busy worker slot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chat_dispatch_common::SessionId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::pool::{Job, SlotId, WorkerCompletion, WorkerPool};
use super::queue::{QueueEntry, RequestQueue};
use super::request::{Completion, Outcome, Request, RequestId, Submission};
use super::session::{SessionRegistry, SessionState};
use super::sink::ResultSink;
use crate::engine::InferenceEngine;
use crate::error::{DispatchError, Stage};

/// Runtime configuration for a dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum number of queued requests. Submissions beyond it get `QueueFull`.
    pub queue_capacity: usize,
    /// Number of worker slots.
    pub worker_count: usize,
    /// Queued wait after which a request is served before later arrivals.
    pub starvation_threshold: Duration,
    /// Deadline for requests that do not bring their own.
    pub default_deadline: Option<Duration>,
    /// Deliver each session's results in submission order.
    pub in_order_delivery_per_session: bool,
    /// Period of the reaper loop in `Dispatcher::run`.
    pub sweep_interval: Duration,
    /// Close open sessions idle this long with nothing outstanding.
    pub session_idle_timeout: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            worker_count: 4,
            starvation_threshold: Duration::from_secs(5),
            default_deadline: None,
            in_order_delivery_per_session: false,
            sweep_interval: Duration::from_millis(25),
            session_idle_timeout: None,
        }
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub queued: usize,
    pub queue_capacity: usize,
    pub in_flight: usize,
    pub idle_workers: usize,
    pub busy_workers: usize,
    pub worker_count: usize,
    pub open_sessions: usize,
    /// Wall-clock open time of the longest-lived open session.
    pub oldest_session_opened_at: Option<DateTime<Utc>>,
    pub shutting_down: bool,
}

/// A request currently assigned to a worker.
struct InFlight {
    request: Request,
    slot: SlotId,
    assigned_at: Instant,
    /// Cancelled while running on an engine that cannot be interrupted.
    cancel_requested: bool,
}

impl InFlight {
    fn outcome(&self, completion: WorkerCompletion) -> Outcome {
        if self.cancel_requested {
            return Err(DispatchError::Cancelled);
        }

        match completion.result {
            Ok(_) if self.request.is_expired(completion.finished_at) => {
                Err(DispatchError::Timeout(Stage::Inference))
            }
            Ok(output) => Ok(Completion {
                request_id: self.request.id,
                output,
                slot: completion.slot,
                queued_for: self
                    .assigned_at
                    .saturating_duration_since(self.request.submitted_at),
                ran_for: completion
                    .finished_at
                    .saturating_duration_since(completion.started_at),
            }),
            Err(e) => Err(DispatchError::from_inference(e)),
        }
    }
}

struct DispatchState {
    queue: RequestQueue,
    pool: WorkerPool,
    sessions: SessionRegistry,
    in_flight: HashMap<RequestId, InFlight>,
    next_id: u64,
    in_order: bool,
    shutting_down: bool,
}

impl DispatchState {
    /// Resolve a request, respecting per-session delivery order.
    fn finish(&mut self, request: Request, outcome: Outcome) {
        log_outcome(request.id, &outcome);

        let Some(session_id) = request.session else {
            request.resolve(outcome);
            return;
        };

        for (request, outcome) in self.sessions.settle(session_id, request, outcome, self.in_order) {
            request.resolve(outcome);
        }

        if self.sessions.finish_close_if_drained(session_id).is_some() {
            tracing::info!(session_id = %session_id, "Session closed");
        }
    }

    /// Resolve every queued request whose deadline passed.
    fn expire_queued(&mut self, now: Instant) {
        for entry in self.queue.expire(now) {
            self.finish(entry.request, Err(DispatchError::Timeout(Stage::Queued)));
        }
    }

    fn cancel_request(&mut self, id: RequestId) -> Result<(), DispatchError> {
        if let Some(entry) = self.queue.remove(id) {
            self.finish(entry.request, Err(DispatchError::Cancelled));
            return Ok(());
        }

        let (slot, already_requested) = match self.in_flight.get(&id) {
            Some(in_flight) => (in_flight.slot, in_flight.cancel_requested),
            None => return Err(DispatchError::UnknownRequest(id)),
        };
        if already_requested {
            return Ok(());
        }

        if self.pool.interrupt(slot, id) {
            if let Some(in_flight) = self.in_flight.remove(&id) {
                self.finish(in_flight.request, Err(DispatchError::Cancelled));
            }
        } else if let Some(in_flight) = self.in_flight.get_mut(&id) {
            in_flight.cancel_requested = true;
            tracing::debug!(
                request_id = %id,
                slot = %slot,
                "Engine cannot interrupt; result will be dropped when the worker finishes"
            );
        }
        Ok(())
    }

    fn close_session(&mut self, id: SessionId) -> Result<SessionState, DispatchError> {
        let pending = self.sessions.begin_close(id)?;
        tracing::info!(session_id = %id, pending = pending.len(), "Closing session");

        for request_id in pending {
            if let Err(e) = self.cancel_request(request_id) {
                tracing::debug!(session_id = %id, request_id = %request_id, "Skipping cancel: {}", e);
            }
        }

        if self.sessions.finish_close_if_drained(id).is_some() {
            tracing::info!(session_id = %id, "Session closed");
        }
        Ok(self.sessions.state_of(id).unwrap_or(SessionState::Closed))
    }
}

fn log_outcome(request_id: RequestId, outcome: &Outcome) {
    match outcome {
        Ok(completion) => tracing::debug!(
            request_id = %request_id,
            slot = %completion.slot,
            wait_ms = completion.queued_for.as_millis() as u64,
            run_ms = completion.ran_for.as_millis() as u64,
            "Request completed"
        ),
        Err(DispatchError::Timeout(stage)) => {
            tracing::warn!(request_id = %request_id, stage = %stage, "Request timed out")
        }
        Err(DispatchError::Inference(msg)) => {
            tracing::warn!(request_id = %request_id, "Inference failed: {}", msg)
        }
        Err(e) => tracing::debug!(request_id = %request_id, "Request ended: {}", e),
    }
}

struct Inner {
    config: DispatcherConfig,
    state: Mutex<DispatchState>,
    shutdown: Notify,
}

/// Inference request dispatcher.
///
/// Cheap to clone; all clones share one state. Construct one per service
/// (or per test) and hand it to the transport.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Create a dispatcher over `engine` with `config.worker_count` slots.
    pub fn new(config: DispatcherConfig, engine: Arc<dyn InferenceEngine>) -> Self {
        tracing::info!(
            engine = engine.engine_type(),
            workers = config.worker_count,
            queue_capacity = config.queue_capacity,
            interruptible = engine.supports_interrupt(),
            "Creating dispatcher"
        );

        let state = DispatchState {
            queue: RequestQueue::new(config.queue_capacity, config.starvation_threshold),
            pool: WorkerPool::new(config.worker_count, engine),
            sessions: SessionRegistry::new(),
            in_flight: HashMap::new(),
            next_id: 1,
            in_order: config.in_order_delivery_per_session,
            shutting_down: false,
        };

        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(state),
                shutdown: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Register a new persistent session.
    pub async fn open_session(&self) -> Result<SessionId, DispatchError> {
        let mut state = self.inner.state.lock().await;
        if state.shutting_down {
            return Err(DispatchError::ShuttingDown);
        }
        let id = state.sessions.open_session();
        tracing::info!(session_id = %id, "Session opened");
        Ok(id)
    }

    /// Admit a request, or reject it without side effects.
    ///
    /// Returns as soon as the admission decision is made; the outcome arrives
    /// later on `sink`. Rejected submissions never touch the sink.
    pub async fn submit(&self, submission: Submission, sink: ResultSink) -> Result<RequestId, DispatchError> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        if state.shutting_down {
            return Err(DispatchError::ShuttingDown);
        }
        if let Some(session_id) = submission.session {
            if !state.sessions.is_open(session_id) {
                tracing::warn!(session_id = %session_id, "Rejecting submission on closed session");
                return Err(DispatchError::SessionClosed(session_id));
            }
        }

        // Overdue entries must not hold capacity.
        let now = Instant::now();
        state.expire_queued(now);

        if state.queue.is_full() {
            tracing::warn!(capacity = state.queue.capacity(), "Rejecting submission: queue full");
            return Err(DispatchError::QueueFull {
                capacity: state.queue.capacity(),
            });
        }

        let id = RequestId(state.next_id);
        state.next_id += 1;

        let session = submission.session;
        if let Some(session_id) = session {
            state.sessions.register_request(session_id, id)?;
        }

        let deadline = submission
            .deadline
            .or(self.inner.config.default_deadline)
            .map(|d| now + d);
        let priority = submission.priority;
        let request = Request::new(id, submission, now, deadline, sink);

        if let Err(e) = state.queue.enqueue(QueueEntry::new(request, now)) {
            if let Some(session_id) = session {
                state.sessions.unregister_request(session_id, id);
            }
            return Err(e);
        }

        tracing::debug!(
            request_id = %id,
            session_id = ?session,
            priority = %priority,
            queued = state.queue.len(),
            "Request admitted"
        );

        self.assign_idle_workers(state);
        Ok(id)
    }

    /// Submit and wait for the outcome (request/response callers).
    ///
    /// If the returned future is dropped before the outcome arrives, the
    /// request is cancelled.
    pub async fn submit_and_wait(&self, submission: Submission) -> Result<Completion, DispatchError> {
        let (sink, rx) = ResultSink::oneshot();
        let request_id = self.submit(submission, sink).await?;

        let mut guard = CancelOnDrop {
            dispatcher: self.clone(),
            request_id,
            armed: true,
        };
        let delivery = rx.await;
        guard.armed = false;

        match delivery {
            Ok(delivery) => delivery.outcome,
            Err(_) => Err(DispatchError::Cancelled),
        }
    }

    /// Cancel a queued or running request.
    pub async fn cancel(&self, request_id: RequestId) -> Result<(), DispatchError> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        state.cancel_request(request_id)?;
        self.assign_idle_workers(state);
        Ok(())
    }

    /// Cancel a request only if `session_id` owns it.
    pub async fn cancel_in_session(&self, session_id: SessionId, request_id: RequestId) -> Result<(), DispatchError> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        let owned = state
            .sessions
            .get(session_id)
            .is_some_and(|s| s.owns(request_id));
        if !owned {
            return Err(DispatchError::UnknownRequest(request_id));
        }
        state.cancel_request(request_id)?;
        self.assign_idle_workers(state);
        Ok(())
    }

    /// Close a session, cancelling everything it has outstanding.
    ///
    /// Returns `Closed` when nothing was left running, `Closing` when some
    /// worker still has to report back before the session is purged.
    pub async fn close_session(&self, session_id: SessionId) -> Result<SessionState, DispatchError> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        let result = state.close_session(session_id)?;
        self.assign_idle_workers(state);
        Ok(result)
    }

    /// Current state of a session; `None` once closed and purged.
    pub async fn session_state(&self, session_id: SessionId) -> Option<SessionState> {
        self.inner.state.lock().await.sessions.state_of(session_id)
    }

    /// Called when a worker slot finishes its call.
    pub async fn on_worker_free(&self, completion: WorkerCompletion) {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        if !state.pool.release(completion.slot, completion.request_id) {
            tracing::debug!(
                slot = %completion.slot,
                request_id = %completion.request_id,
                "Ignoring stale worker completion"
            );
            return;
        }

        if let Some(in_flight) = state.in_flight.remove(&completion.request_id) {
            let outcome = in_flight.outcome(completion);
            state.finish(in_flight.request, outcome);
        }

        self.assign_idle_workers(state);
    }

    /// Expire overdue queued requests, close idle sessions, fill idle slots.
    pub async fn sweep(&self) {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        if let Some(timeout) = self.inner.config.session_idle_timeout {
            for session_id in state.sessions.idle_sessions(Instant::now(), timeout) {
                tracing::info!(session_id = %session_id, "Closing idle session");
                if let Err(e) = state.close_session(session_id) {
                    tracing::debug!(session_id = %session_id, "Idle close failed: {}", e);
                }
            }
        }

        self.assign_idle_workers(state);
    }

    /// Run the reaper loop until `shutdown` is called.
    pub async fn run(&self) {
        let interval = self.inner.config.sweep_interval;

        loop {
            tokio::select! {
                _ = self.inner.shutdown.notified() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            self.sweep().await;
        }

        tracing::info!("Dispatcher reaper stopped");
    }

    /// Spawn `run` on the current runtime.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.run().await })
    }

    /// Stop admitting, cancel everything queued and stop the reaper.
    ///
    /// In-flight requests are left to finish and are delivered normally.
    pub async fn shutdown(&self) {
        {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;

            let drained = state.queue.drain();
            tracing::info!(
                cancelled = drained.len(),
                in_flight = state.in_flight.len(),
                "Dispatcher shutting down"
            );
            for entry in drained {
                state.finish(entry.request, Err(DispatchError::Cancelled));
            }
        }
        self.inner.shutdown.notify_one();
    }

    pub async fn stats(&self) -> DispatcherStats {
        let state = self.inner.state.lock().await;
        DispatcherStats {
            queued: state.queue.len(),
            queue_capacity: state.queue.capacity(),
            in_flight: state.in_flight.len(),
            idle_workers: state.pool.idle_count(),
            busy_workers: state.pool.busy_count(),
            worker_count: state.pool.size(),
            open_sessions: state.sessions.open_count(),
            oldest_session_opened_at: state.sessions.oldest_opened_at(),
            shutting_down: state.shutting_down,
        }
    }

    fn assign_idle_workers(&self, state: &mut DispatchState) {
        let now = Instant::now();
        state.expire_queued(now);

        while let Some(slot) = state.pool.acquire_idle() {
            let Some(entry) = state.queue.dequeue_next(now) else {
                break;
            };
            self.assign(state, slot, entry, now);
        }
    }

    fn assign(&self, state: &mut DispatchState, slot: SlotId, entry: QueueEntry, now: Instant) {
        let waited = entry.waited(now);
        let mut request = entry.request;
        let job = Job {
            request_id: request.id,
            payload: std::mem::take(&mut request.payload),
            deadline: request.deadline,
        };

        let dispatcher = self.clone();
        let started = state.pool.run(slot, job, move |completion| async move {
            dispatcher.on_worker_free(completion).await;
        });

        match started {
            Ok(()) => {
                tracing::debug!(
                    request_id = %request.id,
                    slot = %slot,
                    wait_ms = waited.as_millis() as u64,
                    "Request assigned"
                );
                if let Some(session_id) = request.session {
                    state.sessions.record_assignment(session_id, request.id);
                }
                state.in_flight.insert(
                    request.id,
                    InFlight {
                        request,
                        slot,
                        assigned_at: now,
                        cancel_requested: false,
                    },
                );
            }
            Err(e) => {
                tracing::error!(request_id = %request.id, "Failed to start worker: {}", e);
                state.finish(request, Err(DispatchError::Inference(e.to_string())));
            }
        }
    }
}

/// Cancels the request if the waiting caller goes away.
struct CancelOnDrop {
    dispatcher: Dispatcher,
    request_id: RequestId,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let dispatcher = self.dispatcher.clone();
        let request_id = self.request_id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if dispatcher.cancel(request_id).await.is_ok() {
                    tracing::debug!(request_id = %request_id, "Cancelled request of departed caller");
                }
            });
        }
    }
}
