//! Bounded request queue with fair ordering.
//!
//! Entries are ordered by `(priority, enqueue instant, request id)`. The
//! oldest entry is promoted ahead of everything once its wait reaches the
//! starvation threshold. With uniform priority this is plain FIFO.
//!
//! Three ordered indexes (rank, age, deadline) keep `dequeue_next`, `remove`
//! and `expire` at O(log n) per entry.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chat_dispatch_common::Priority;
use tokio::time::Instant;

use super::request::{Request, RequestId};
use crate::error::DispatchError;

/// A request waiting for a worker.
#[derive(Debug)]
pub struct QueueEntry {
    pub request: Request,
    /// When this request was enqueued.
    pub enqueued_at: Instant,
}

impl QueueEntry {
    pub fn new(request: Request, enqueued_at: Instant) -> Self {
        Self {
            request,
            enqueued_at,
        }
    }

    /// Time spent in the queue as of `now`.
    pub fn waited(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.enqueued_at)
    }

    fn rank_key(&self) -> (Priority, Instant, RequestId) {
        (self.request.priority, self.enqueued_at, self.request.id)
    }

    fn age_key(&self) -> (Instant, RequestId) {
        (self.enqueued_at, self.request.id)
    }
}

/// Bounded ordered holding area for admitted requests.
pub struct RequestQueue {
    capacity: usize,
    starvation_threshold: Duration,
    entries: HashMap<RequestId, QueueEntry>,
    by_rank: BTreeSet<(Priority, Instant, RequestId)>,
    by_age: BTreeSet<(Instant, RequestId)>,
    by_deadline: BTreeSet<(Instant, RequestId)>,
}

impl RequestQueue {
    /// Create a queue holding at most `capacity` entries.
    pub fn new(capacity: usize, starvation_threshold: Duration) -> Self {
        Self {
            capacity,
            starvation_threshold,
            entries: HashMap::with_capacity(capacity),
            by_rank: BTreeSet::new(),
            by_age: BTreeSet::new(),
            by_deadline: BTreeSet::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Add an entry. Fails with `QueueFull` at capacity; the entry is dropped
    /// and never resolved, since the caller learns of the rejection directly.
    pub fn enqueue(&mut self, entry: QueueEntry) -> Result<(), DispatchError> {
        if self.is_full() {
            return Err(DispatchError::QueueFull {
                capacity: self.capacity,
            });
        }

        let id = entry.request.id;
        self.by_rank.insert(entry.rank_key());
        self.by_age.insert(entry.age_key());
        if let Some(deadline) = entry.request.deadline {
            self.by_deadline.insert((deadline, id));
        }
        self.entries.insert(id, entry);
        Ok(())
    }

    /// Pop the entry the fairness policy selects at `now`.
    pub fn dequeue_next(&mut self, now: Instant) -> Option<QueueEntry> {
        let &(oldest_at, oldest_id) = self.by_age.first()?;

        let next = if now.saturating_duration_since(oldest_at) >= self.starvation_threshold {
            oldest_id
        } else {
            let &(_, _, id) = self.by_rank.first()?;
            id
        };

        self.take(next)
    }

    /// Remove a specific entry, e.g. on cancellation.
    pub fn remove(&mut self, id: RequestId) -> Option<QueueEntry> {
        self.take(id)
    }

    /// Remove every entry whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<QueueEntry> {
        let mut expired = Vec::new();
        while let Some(&(deadline, id)) = self.by_deadline.first() {
            if deadline > now {
                break;
            }
            if let Some(entry) = self.take(id) {
                expired.push(entry);
            }
        }
        expired
    }

    /// Remove all entries, oldest first.
    pub fn drain(&mut self) -> Vec<QueueEntry> {
        let ids: Vec<RequestId> = self.by_age.iter().map(|&(_, id)| id).collect();
        ids.into_iter().filter_map(|id| self.take(id)).collect()
    }

    fn take(&mut self, id: RequestId) -> Option<QueueEntry> {
        let entry = self.entries.remove(&id)?;
        self.by_rank.remove(&entry.rank_key());
        self.by_age.remove(&entry.age_key());
        if let Some(deadline) = entry.request.deadline {
            self.by_deadline.remove(&(deadline, id));
        }
        Some(entry)
    }
}
