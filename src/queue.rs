//! Bounded delivery queue with a single-writer capability.

use crate::error::StreamError;
use crate::sse::Event;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// What a mutation by a stale or foreign [`WriterToken`] does.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OwnershipPolicy {
    /// Return [`StreamError::QueueOwnership`].
    #[default]
    Fail,
    /// Return `Ok(false)` and leave the queue untouched.
    Reject,
}

/// Bounded FIFO of parsed events.
///
/// Reads (`poll`, `poll_timeout`, `peek`) are open to any task or thread.
/// Mutations (`enqueue`, `clear`) require the [`WriterToken`] most recently
/// issued by [`claim`](Self::claim); claiming a new token revokes the previous one.
/// Cloning the queue yields another handle to the same buffer.
#[derive(Clone)]
pub struct DeliveryQueue {
    shared: Arc<Shared>,
}

struct Shared {
    capacity: usize,
    policy: OwnershipPolicy,
    state: Mutex<QueueState>,
    not_empty: Notify,
    not_full: Notify,
}

struct QueueState {
    buffer: VecDeque<Event>,
    owner: Option<u64>,
    next_generation: u64,
}

impl std::fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("DeliveryQueue")
            .field("capacity", &self.shared.capacity)
            .field("len", &state.buffer.len())
            .field("owner", &state.owner)
            .field("policy", &self.shared.policy)
            .finish()
    }
}

/// Write capability for a [`DeliveryQueue`].
///
/// Valid until another token is claimed from the same queue. Dropping the
/// current token leaves the queue without an owner.
#[must_use = "dropping the token releases queue ownership"]
pub struct WriterToken {
    generation: u64,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for WriterToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterToken")
            .field("generation", &self.generation)
            .finish()
    }
}

impl WriterToken {
    /// Whether this token still owns its queue.
    pub fn is_current(&self) -> bool {
        self.shared.state.lock().owner == Some(self.generation)
    }
}

impl Drop for WriterToken {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        if state.owner == Some(self.generation) {
            state.owner = None;
        }
    }
}

impl DeliveryQueue {
    /// Create an empty queue.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize, policy: OwnershipPolicy) -> Self {
        assert!(capacity > 0, "delivery queue capacity must be at least 1");
        Self {
            shared: Arc::new(Shared {
                capacity,
                policy,
                state: Mutex::new(QueueState {
                    buffer: VecDeque::with_capacity(capacity),
                    owner: None,
                    next_generation: 0,
                }),
                not_empty: Notify::new(),
                not_full: Notify::new(),
            }),
        }
    }

    /// Issue a new writer token, revoking the current one.
    ///
    /// A writer blocked in [`enqueue`](Self::enqueue) with the revoked token
    /// wakes up and reports the ownership violation.
    pub fn claim(&self) -> WriterToken {
        let generation = {
            let mut state = self.shared.state.lock();
            let generation = state.next_generation;
            state.next_generation += 1;
            state.owner = Some(generation);
            generation
        };
        self.shared.not_full.notify_waiters();

        WriterToken {
            generation,
            shared: self.shared.clone(),
        }
    }

    /// Append an event, waiting while the queue is full.
    ///
    /// Returns `Ok(true)` once enqueued. With a token that does not own the
    /// queue, fails or returns `Ok(false)` depending on the [`OwnershipPolicy`].
    pub async fn enqueue(&self, token: &WriterToken, event: Event) -> Result<bool, StreamError> {
        let mut event = Some(event);
        loop {
            let space = self.shared.not_full.notified();
            {
                let mut state = self.shared.state.lock();
                if !self.owns(&state, token) {
                    return self.violation("enqueue");
                }
                if state.buffer.len() < self.shared.capacity {
                    if let Some(event) = event.take() {
                        state.buffer.push_back(event);
                    }
                    drop(state);
                    self.shared.not_empty.notify_waiters();
                    return Ok(true);
                }
            }
            space.await;
        }
    }

    /// Remove every buffered event.
    pub fn clear(&self, token: &WriterToken) -> Result<bool, StreamError> {
        {
            let mut state = self.shared.state.lock();
            if !self.owns(&state, token) {
                return self.violation("clear");
            }
            state.buffer.clear();
        }
        self.shared.not_full.notify_waiters();
        Ok(true)
    }

    /// Take the oldest event without waiting.
    pub fn poll(&self) -> Option<Event> {
        let event = self.shared.state.lock().buffer.pop_front();
        if event.is_some() {
            self.shared.not_full.notify_waiters();
        }
        event
    }

    /// Take the oldest event, waiting up to `timeout` for one to arrive.
    pub async fn poll_timeout(&self, timeout: Duration) -> Option<Event> {
        let wait = async {
            loop {
                let arrived = self.shared.not_empty.notified();
                if let Some(event) = self.poll() {
                    return event;
                }
                arrived.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.ok()
    }

    /// Look at the oldest event without removing it.
    pub fn peek(&self) -> Option<Event> {
        self.shared.state.lock().buffer.front().cloned()
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn policy(&self) -> OwnershipPolicy {
        self.shared.policy
    }

    /// Whether some writer currently owns the queue.
    pub fn has_owner(&self) -> bool {
        self.shared.state.lock().owner.is_some()
    }

    fn owns(&self, state: &QueueState, token: &WriterToken) -> bool {
        Arc::ptr_eq(&self.shared, &token.shared) && state.owner == Some(token.generation)
    }

    fn violation(&self, op: &'static str) -> Result<bool, StreamError> {
        tracing::debug!(op, policy = ?self.shared.policy, "queue mutation by non-owner");
        match self.shared.policy {
            OwnershipPolicy::Fail => Err(StreamError::QueueOwnership),
            OwnershipPolicy::Reject => Ok(false),
        }
    }
}
