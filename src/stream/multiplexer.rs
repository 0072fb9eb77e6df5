//! Fan-out of one execution's live events to its attached observers.
//!
//! Each live execution owns one [`Multiplexer`]. Events are published only
//! after they are durable, so an observer registering at any point can
//! recover everything before its registration from the event store and
//! everything after it from its receiver. Publishing and registering share
//! one lock; the replay bound captured at registration is exactly the last
//! event the new receiver will not see.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tracing::debug;

use crate::models::event::Event;
use crate::models::session::SessionStatus;

/// How a live stream closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Closure {
    /// The execution released its handle; the session rests in this status.
    Finished(SessionStatus),
    /// The execution stopped without finalizing, e.g. the store became unreachable.
    Aborted(String),
}

/// Message carried on the broadcast channel.
#[derive(Debug, Clone)]
pub enum HubMessage {
    /// A durable event.
    Event(Event),
    /// The stream is over.
    Closed(Closure),
}

/// Upper bound of the stored-history replay owed to a new observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayBound {
    /// The execution has not yet fixed its starting point; replay to the end of
    /// the store and skip live events already replayed.
    StoreEnd,
    /// Replay through this sequence number; later events arrive live.
    Through(u64),
    /// Nothing is stored; every event arrives live.
    Empty,
}

/// Result of registering an observer.
pub struct Registration {
    /// Identifier used to detach.
    pub observer_id: u64,
    /// Live events published after registration.
    pub receiver: broadcast::Receiver<HubMessage>,
    /// Stored history the observer must replay first.
    pub replay_bound: ReplayBound,
    /// Set when the stream closed before registration.
    pub closure: Option<Closure>,
}

struct HubState {
    bound: ReplayBound,
    first_seq: Option<u64>,
    observers: HashSet<u64>,
    next_observer: u64,
    closure: Option<Closure>,
}

/// Live event hub for one execution.
pub struct Multiplexer {
    session_id: String,
    state: Mutex<HubState>,
    sender: broadcast::Sender<HubMessage>,
}

impl Multiplexer {
    /// Create a hub whose observers may each fall `capacity` events behind.
    #[must_use]
    pub fn new(session_id: impl Into<String>, capacity: usize) -> Self {
        let (sender, _rx) = broadcast::channel(capacity.max(1));
        Self {
            session_id: session_id.into(),
            state: Mutex::new(HubState {
                bound: ReplayBound::StoreEnd,
                first_seq: None,
                observers: HashSet::new(),
                next_observer: 0,
                closure: None,
            }),
            sender,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Session the hub belongs to.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Record the last stored sequence before the execution's first append.
    pub fn set_base(&self, last_stored: Option<u64>) {
        let mut state = self.lock();
        if state.bound == ReplayBound::StoreEnd {
            state.bound = last_stored.map_or(ReplayBound::Empty, ReplayBound::Through);
            state.first_seq = Some(last_stored.map_or(0, |seq| seq + 1));
        }
    }

    /// Sequence number of the execution's first event, once the base is set.
    #[must_use]
    pub fn first_seq(&self) -> Option<u64> {
        self.lock().first_seq
    }

    /// Forward a durable event to every attached observer.
    pub fn publish(&self, event: Event) {
        let mut state = self.lock();
        if state.closure.is_some() {
            return;
        }
        state.bound = ReplayBound::Through(event.seq);
        // No receivers is not an error: nobody is watching.
        let _ = self.sender.send(HubMessage::Event(event));
    }

    /// Attach a new observer.
    pub fn register(&self) -> Registration {
        let mut state = self.lock();
        let observer_id = state.next_observer;
        state.next_observer += 1;
        state.observers.insert(observer_id);
        debug!(session_id = %self.session_id, observer_id, "observer attached");
        Registration {
            observer_id,
            receiver: self.sender.subscribe(),
            replay_bound: state.bound,
            closure: state.closure.clone(),
        }
    }

    /// Forget an observer. Calling it again for the same id does nothing.
    pub fn detach(&self, observer_id: u64) {
        if self.lock().observers.remove(&observer_id) {
            debug!(session_id = %self.session_id, observer_id, "observer detached");
        }
    }

    /// Close the stream. Only the first closure is delivered.
    pub fn close(&self, closure: Closure) {
        let mut state = self.lock();
        if state.closure.is_some() {
            return;
        }
        state.closure = Some(closure.clone());
        let _ = self.sender.send(HubMessage::Closed(closure));
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        self.lock().closure.is_some()
    }

    /// Number of observers currently attached.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.lock().observers.len()
    }
}
