//! Session registry for persistent (websocket-style) callers.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chat_dispatch_common::SessionId;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

use super::request::{Outcome, Request, RequestId};
use crate::error::DispatchError;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    /// Close requested; outstanding requests are being cancelled.
    Closing,
    Closed,
}

/// A long-lived caller and the requests it has outstanding.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub state: SessionState,
    pub opened_at: DateTime<Utc>,
    last_activity: Instant,
    /// Outstanding request ids in submission order.
    outstanding: VecDeque<RequestId>,
    /// Outstanding request ids that reached a worker, in assignment order.
    assigned: VecDeque<RequestId>,
    /// Resolved results waiting for earlier requests to resolve.
    held: HashMap<RequestId, (Request, Outcome)>,
}

impl Session {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            state: SessionState::Open,
            opened_at: Utc::now(),
            last_activity: Instant::now(),
            outstanding: VecDeque::new(),
            assigned: VecDeque::new(),
            held: HashMap::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    pub fn owns(&self, request_id: RequestId) -> bool {
        self.outstanding.contains(&request_id)
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    /// Outstanding requests that have not resolved yet.
    pub fn pending(&self) -> Vec<RequestId> {
        self.outstanding
            .iter()
            .filter(|id| !self.held.contains_key(id))
            .copied()
            .collect()
    }

    fn was_assigned(&self, request_id: RequestId) -> bool {
        self.assigned.contains(&request_id)
    }

    fn remove_outstanding(&mut self, request_id: RequestId) -> bool {
        remove_id(&mut self.assigned, request_id);
        remove_id(&mut self.outstanding, request_id)
    }

    /// Pop held results from the front of `order` (submission or assignment).
    fn take_deliverable(&mut self, in_order: bool) -> Vec<(Request, Outcome)> {
        let mut ready = Vec::new();
        loop {
            let order = if in_order { &self.outstanding } else { &self.assigned };
            let Some(front) = order.front().copied() else {
                break;
            };
            let Some(resolved) = self.held.remove(&front) else {
                break;
            };
            self.remove_outstanding(front);
            ready.push(resolved);
        }
        ready
    }
}

fn remove_id(ids: &mut VecDeque<RequestId>, request_id: RequestId) -> bool {
    match ids.iter().position(|&id| id == request_id) {
        Some(pos) => {
            ids.remove(pos);
            true
        }
        None => false,
    }
}

/// All live sessions, keyed by id. Closed sessions are removed.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    /// Register a new open session.
    pub fn open_session(&mut self) -> SessionId {
        let id = SessionId::new();
        self.sessions.insert(id, Session::new(id));
        id
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn is_open(&self, id: SessionId) -> bool {
        self.sessions.get(&id).is_some_and(Session::is_open)
    }

    /// State of a session; `None` once it has been closed and purged.
    pub fn state_of(&self, id: SessionId) -> Option<SessionState> {
        self.sessions.get(&id).map(|s| s.state)
    }

    pub fn open_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_open()).count()
    }

    /// Open time of the longest-lived open session.
    pub fn oldest_opened_at(&self) -> Option<DateTime<Utc>> {
        self.sessions
            .values()
            .filter(|s| s.is_open())
            .map(|s| s.opened_at)
            .min()
    }

    /// Record a new outstanding request. Fails unless the session is open.
    pub fn register_request(&mut self, id: SessionId, request_id: RequestId) -> Result<(), DispatchError> {
        match self.sessions.get_mut(&id) {
            Some(session) if session.is_open() => {
                session.outstanding.push_back(request_id);
                session.last_activity = Instant::now();
                Ok(())
            }
            _ => Err(DispatchError::SessionClosed(id)),
        }
    }

    /// Note that a request of this session was handed to a worker.
    pub fn record_assignment(&mut self, id: SessionId, request_id: RequestId) {
        if let Some(session) = self.sessions.get_mut(&id) {
            if session.owns(request_id) && !session.was_assigned(request_id) {
                session.assigned.push_back(request_id);
            }
        }
    }

    /// Forget an outstanding request without delivering anything.
    pub fn unregister_request(&mut self, id: SessionId, request_id: RequestId) -> bool {
        self.sessions
            .get_mut(&id)
            .is_some_and(|s| s.remove_outstanding(request_id))
    }

    /// Decide which results can be delivered now that `request` resolved.
    ///
    /// By default results follow assignment order: a result is held until
    /// every request of the session assigned before it resolved. Requests
    /// that never reached a worker go out at once. With `in_order` the
    /// result is held until every earlier submission resolved instead.
    pub fn settle(
        &mut self,
        id: SessionId,
        request: Request,
        outcome: Outcome,
        in_order: bool,
    ) -> Vec<(Request, Outcome)> {
        let Some(session) = self.sessions.get_mut(&id) else {
            return vec![(request, outcome)];
        };
        session.last_activity = Instant::now();

        let ordered = if in_order {
            session.owns(request.id)
        } else {
            session.was_assigned(request.id)
        };
        if !ordered {
            session.remove_outstanding(request.id);
            return vec![(request, outcome)];
        }

        session.held.insert(request.id, (request, outcome));
        session.take_deliverable(in_order)
    }

    /// Move a session to Closing and return the requests still pending.
    ///
    /// Calling this on a session that is already closing is allowed.
    pub fn begin_close(&mut self, id: SessionId) -> Result<Vec<RequestId>, DispatchError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(DispatchError::SessionClosed(id))?;
        session.state = SessionState::Closing;
        Ok(session.pending())
    }

    /// Finish closing once nothing is outstanding. The session is purged.
    pub fn finish_close_if_drained(&mut self, id: SessionId) -> Option<SessionState> {
        let session = self.sessions.get(&id)?;
        if session.state != SessionState::Closing || !session.outstanding.is_empty() {
            return None;
        }
        self.sessions.remove(&id);
        Some(SessionState::Closed)
    }

    /// Open sessions with nothing outstanding and no activity for `timeout`.
    pub fn idle_sessions(&self, now: Instant, timeout: Duration) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| {
                s.is_open()
                    && s.outstanding.is_empty()
                    && now.saturating_duration_since(s.last_activity) >= timeout
            })
            .map(|s| s.id)
            .collect()
    }
}
