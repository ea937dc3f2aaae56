//! Fixed-size pool of worker slots running inference calls.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use tokio::task::AbortHandle;
use tokio::time::Instant;

use super::request::RequestId;
use crate::engine::{InferenceEngine, InferenceError};

/// Index of a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(pub usize);

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    Busy(RequestId),
}

#[derive(Debug)]
struct WorkerSlot {
    state: SlotState,
    abort: Option<AbortHandle>,
}

impl WorkerSlot {
    fn new() -> Self {
        Self {
            state: SlotState::Idle,
            abort: None,
        }
    }

    fn is_idle(&self) -> bool {
        matches!(self.state, SlotState::Idle)
    }

    fn is_running(&self, request_id: RequestId) -> bool {
        self.state == SlotState::Busy(request_id)
    }

    fn mark_idle(&mut self) {
        self.state = SlotState::Idle;
        self.abort = None;
    }
}

/// Work handed to a slot.
#[derive(Debug, Clone)]
pub struct Job {
    pub request_id: RequestId,
    pub payload: String,
    pub deadline: Option<Instant>,
}

/// Reported by a slot when its call finishes.
#[derive(Debug)]
pub struct WorkerCompletion {
    pub slot: SlotId,
    pub request_id: RequestId,
    pub result: Result<String, InferenceError>,
    pub started_at: Instant,
    pub finished_at: Instant,
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Worker slot {0} does not exist")]
    UnknownSlot(SlotId),
    #[error("Worker slot {0} is busy")]
    SlotBusy(SlotId),
}

/// Fixed set of execution slots over one inference engine.
///
/// The pool does no queueing and never retries. Completion is reported
/// through the callback given to `run`; the caller decides what happens next.
pub struct WorkerPool {
    engine: Arc<dyn InferenceEngine>,
    slots: Vec<WorkerSlot>,
    idle: BTreeSet<SlotId>,
}

impl WorkerPool {
    /// Create a pool of `size` idle slots.
    pub fn new(size: usize, engine: Arc<dyn InferenceEngine>) -> Self {
        Self {
            engine,
            slots: (0..size).map(|_| WorkerSlot::new()).collect(),
            idle: (0..size).map(SlotId).collect(),
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    pub fn busy_count(&self) -> usize {
        self.slots.len() - self.idle.len()
    }

    /// Lowest-numbered idle slot, if any.
    pub fn acquire_idle(&self) -> Option<SlotId> {
        self.idle.first().copied()
    }

    /// Start `job` on `slot_id` and call `on_complete` when it finishes.
    ///
    /// If the engine supports interruption and the job has a deadline, the
    /// call is abandoned at the deadline and reported as a timeout.
    pub fn run<F, Fut>(&mut self, slot_id: SlotId, job: Job, on_complete: F) -> Result<(), PoolError>
    where
        F: FnOnce(WorkerCompletion) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let slot = self
            .slots
            .get_mut(slot_id.0)
            .ok_or(PoolError::UnknownSlot(slot_id))?;
        if !slot.is_idle() {
            return Err(PoolError::SlotBusy(slot_id));
        }

        let engine = self.engine.clone();
        let interruptible = engine.supports_interrupt();
        let started_at = Instant::now();
        let request_id = job.request_id;

        let handle = tokio::spawn(async move {
            let result = match job.deadline {
                Some(deadline) if interruptible => {
                    match tokio::time::timeout_at(deadline, engine.infer(&job.payload, Some(deadline))).await {
                        Ok(result) => result,
                        Err(_) => Err(InferenceError::Timeout),
                    }
                }
                deadline => engine.infer(&job.payload, deadline).await,
            };

            on_complete(WorkerCompletion {
                slot: slot_id,
                request_id,
                result,
                started_at,
                finished_at: Instant::now(),
            })
            .await;
        });

        slot.state = SlotState::Busy(request_id);
        slot.abort = interruptible.then(|| handle.abort_handle());
        self.idle.remove(&slot_id);

        tracing::debug!(slot = %slot_id, request_id = %request_id, "Worker started");
        Ok(())
    }

    /// Abandon the call running `request_id` on `slot_id`.
    ///
    /// Only possible when the engine supports interruption. On success the
    /// slot is idle again and its completion callback will never run.
    pub fn interrupt(&mut self, slot_id: SlotId, request_id: RequestId) -> bool {
        let Some(slot) = self.slots.get_mut(slot_id.0) else {
            return false;
        };
        if !slot.is_running(request_id) {
            return false;
        }
        let Some(abort) = slot.abort.take() else {
            return false;
        };

        abort.abort();
        slot.mark_idle();
        self.idle.insert(slot_id);
        tracing::debug!(slot = %slot_id, request_id = %request_id, "Worker interrupted");
        true
    }

    /// Mark the slot idle if it is still running `request_id`.
    ///
    /// Returns false for stale completions (slot already freed by `interrupt`).
    pub fn release(&mut self, slot_id: SlotId, request_id: RequestId) -> bool {
        let Some(slot) = self.slots.get_mut(slot_id.0) else {
            return false;
        };
        if !slot.is_running(request_id) {
            return false;
        }
        slot.mark_idle();
        self.idle.insert(slot_id);
        true
    }
}
