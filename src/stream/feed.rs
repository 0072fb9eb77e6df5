//! Observer-side view of a session: stored history, then the live tail.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;

use crate::models::event::Event;
use crate::models::session::SessionStatus;
use crate::persistence::event_repo::{EventRepo, EventReplay};
use crate::persistence::session_repo::SessionRepo;

use super::multiplexer::{Closure, HubMessage, Multiplexer, ReplayBound};

/// One item delivered to an observer.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    /// A stored or live event, in sequence order.
    Event(Event),
    /// The observer fell behind and `missed` events were dropped for it.
    Overflow {
        /// Number of events skipped.
        missed: u64,
    },
    /// No more events; the session rests in `status`.
    End {
        /// Session status when the feed ended.
        status: SessionStatus,
    },
    /// The stream stopped without a final status, e.g. the store became unreachable.
    Aborted {
        /// Human-readable cause.
        reason: String,
    },
}

enum LiveItem {
    Event(Event),
    Overflow(u64),
    Closed(Closure),
    Gone,
}

struct LiveTail {
    hub: Arc<Multiplexer>,
    observer_id: u64,
    receiver: Receiver<HubMessage>,
    closed_early: Option<Closure>,
}

impl LiveTail {
    async fn recv(&mut self, next_seq: u64) -> LiveItem {
        if let Some(closure) = self.closed_early.take() {
            return LiveItem::Closed(closure);
        }
        loop {
            match self.receiver.recv().await {
                Ok(HubMessage::Event(event)) if event.seq < next_seq => {}
                Ok(HubMessage::Event(event)) => return LiveItem::Event(event),
                Ok(HubMessage::Closed(closure)) => return LiveItem::Closed(closure),
                Err(RecvError::Lagged(missed)) => return LiveItem::Overflow(missed),
                Err(RecvError::Closed) => return LiveItem::Gone,
            }
        }
    }
}

impl Drop for LiveTail {
    fn drop(&mut self) {
        self.hub.detach(self.observer_id);
    }
}

/// Ordered, gap-free delivery of a session's events to one observer.
///
/// A feed first replays stored events from its starting offset, then follows
/// the live execution if one was attached. Replay-only feeds end right after
/// the last stored event with the session's current status. Dropping a feed
/// detaches it.
pub struct Feed {
    session_id: String,
    sessions: SessionRepo,
    replay: Option<EventReplay>,
    live: Option<LiveTail>,
    next_seq: u64,
    done: bool,
}

impl Feed {
    /// Feed following a live execution after replaying history from `from_seq`.
    #[must_use]
    pub fn live(
        events: &EventRepo,
        sessions: SessionRepo,
        hub: Arc<Multiplexer>,
        from_seq: u64,
        page_size: u32,
    ) -> Self {
        let registration = hub.register();
        let session_id = hub.session_id().to_owned();
        let replay = match registration.replay_bound {
            ReplayBound::Empty => None,
            ReplayBound::StoreEnd => Some(events.replay(&session_id, from_seq).page_size(page_size)),
            ReplayBound::Through(last) => Some(
                events
                    .replay(&session_id, from_seq)
                    .page_size(page_size)
                    .until(Some(last)),
            ),
        };

        Self {
            session_id,
            sessions,
            replay,
            live: Some(LiveTail {
                hub,
                observer_id: registration.observer_id,
                receiver: registration.receiver,
                closed_early: registration.closure,
            }),
            next_seq: from_seq,
            done: false,
        }
    }

    /// Finite feed over stored history only.
    #[must_use]
    pub fn replay_only(
        events: &EventRepo,
        sessions: SessionRepo,
        session_id: &str,
        from_seq: u64,
        page_size: u32,
    ) -> Self {
        Self {
            session_id: session_id.to_owned(),
            sessions,
            replay: Some(events.replay(session_id, from_seq).page_size(page_size)),
            live: None,
            next_seq: from_seq,
            done: false,
        }
    }

    /// Session this feed observes.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Whether the feed follows a live execution.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    /// Next item, or `None` after the terminal `End`/`Aborted` item or a detach.
    pub async fn next(&mut self) -> Option<FeedItem> {
        if self.done {
            return None;
        }

        if let Some(replay) = self.replay.as_mut() {
            match replay.next().await {
                Ok(Some(event)) => {
                    self.next_seq = replay.position();
                    return Some(FeedItem::Event(event));
                }
                Ok(None) => self.replay = None,
                Err(err) => {
                    return Some(self.finish(FeedItem::Aborted {
                        reason: err.to_string(),
                    }))
                }
            }
        }

        if let Some(live) = self.live.as_mut() {
            match live.recv(self.next_seq).await {
                LiveItem::Event(event) => {
                    self.next_seq = event.seq + 1;
                    return Some(FeedItem::Event(event));
                }
                LiveItem::Overflow(missed) => return Some(FeedItem::Overflow { missed }),
                LiveItem::Closed(Closure::Finished(status)) => {
                    return Some(self.finish(FeedItem::End { status }))
                }
                LiveItem::Closed(Closure::Aborted(reason)) => {
                    return Some(self.finish(FeedItem::Aborted { reason }))
                }
                LiveItem::Gone => {}
            }
        }

        let item = match self.sessions.get_status(&self.session_id).await {
            Ok(Some(status)) => FeedItem::End { status },
            Ok(None) => FeedItem::Aborted {
                reason: format!("session {} no longer exists", self.session_id),
            },
            Err(err) => FeedItem::Aborted {
                reason: err.to_string(),
            },
        };
        Some(self.finish(item))
    }

    /// Collect every remaining item, including the terminal one.
    pub async fn collect(mut self) -> Vec<FeedItem> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item);
        }
        items
    }

    /// Stop receiving. Safe to call more than once.
    pub fn detach(&mut self) {
        self.replay = None;
        self.live = None;
        self.done = true;
    }

    fn finish(&mut self, item: FeedItem) -> FeedItem {
        self.detach();
        item
    }
}
