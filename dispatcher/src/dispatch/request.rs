//! Request types flowing through the dispatcher.

use std::time::Duration;

use chat_dispatch_common::{Priority, SessionId};
use tokio::time::Instant;

use super::pool::SlotId;
use super::sink::{Delivery, ResultSink};
use crate::error::DispatchError;

/// Identifier assigned to a request at submission.
///
/// Monotonically increasing per dispatcher, so it doubles as the tie-break
/// when two requests share an enqueue instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a caller hands to `Dispatcher::submit`.
#[derive(Debug, Clone)]
pub struct Submission {
    pub payload: String,
    pub session: Option<SessionId>,
    /// Relative deadline; falls back to the dispatcher's default.
    pub deadline: Option<Duration>,
    pub priority: Priority,
}

impl Submission {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            session: None,
            deadline: None,
            priority: Priority::default(),
        }
    }

    pub fn in_session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Successful result of a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub request_id: RequestId,
    pub output: String,
    /// Worker slot that ran the call.
    pub slot: SlotId,
    /// Time between submission and assignment.
    pub queued_for: Duration,
    /// Time the inference call took.
    pub ran_for: Duration,
}

/// Final state of a request as seen by its caller.
pub type Outcome = Result<Completion, DispatchError>;

/// An admitted request. Owned by the dispatcher until resolved.
pub struct Request {
    pub id: RequestId,
    pub payload: String,
    pub session: Option<SessionId>,
    pub priority: Priority,
    pub submitted_at: Instant,
    pub deadline: Option<Instant>,
    sink: ResultSink,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("session", &self.session)
            .field("priority", &self.priority)
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl Request {
    pub(crate) fn new(
        id: RequestId,
        submission: Submission,
        submitted_at: Instant,
        deadline: Option<Instant>,
        sink: ResultSink,
    ) -> Self {
        Self {
            id,
            payload: submission.payload,
            session: submission.session,
            priority: submission.priority,
            submitted_at,
            deadline,
            sink,
        }
    }

    /// Whether the deadline has passed at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.map_or(false, |d| now >= d)
    }

    /// Deliver the outcome. Consumes the request, so it happens at most once.
    pub(crate) fn resolve(self, outcome: Outcome) {
        let request_id = self.id;
        if !self.sink.deliver(Delivery { request_id, outcome }) {
            tracing::debug!(request_id = %request_id, "Caller went away before the result was delivered");
        }
    }
}
