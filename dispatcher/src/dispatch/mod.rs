//! Inference request dispatching.
//!
//! This module provides:
//! - A bounded, fair request queue
//! - A fixed pool of worker slots over an inference engine
//! - A session registry for cascading cancellation
//! - The dispatcher tying them together

mod dispatcher;
mod pool;
mod queue;
mod request;
mod session;
mod sink;

pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherStats};
pub use pool::{Job, PoolError, SlotId, WorkerCompletion, WorkerPool};
pub use queue::{QueueEntry, RequestQueue};
pub use request::{Completion, Outcome, Request, RequestId, Submission};
pub use session::{Session, SessionRegistry, SessionState};
pub use sink::{Delivery, ResultSink};
