//! Event log entries and history reconstruction.
//!
//! Every state change of a session is recorded as an [`Event`] with a
//! per-session sequence number starting at 0 and increasing without gaps.
//! Folding a session's events in order through [`Reconstruction::apply`]
//! yields the same messages, status and pending-approval marker as the
//! stored projection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::approval::Decision;
use super::message::{Message, ToolCall};
use super::session::{PendingApproval, SessionStatus};

/// Why an execution's stream ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Agent logic finished the session.
    Completed,
    /// Cancellation was requested.
    Cancelled,
    /// Agent or tool logic failed.
    Failed,
    /// The run timeout elapsed.
    TimedOut,
    /// The runtime is shutting down; the session stays resumable.
    Shutdown,
}

/// Typed event payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// First event of every session.
    SessionCreated {
        /// Optional human-readable title.
        title: Option<String>,
    },
    /// A system, user or assistant message joined the history.
    MessageAppended {
        /// The appended message.
        message: Message,
    },
    /// The assistant asked for a tool invocation.
    ToolCallRequested {
        /// The requested call.
        call: ToolCall,
        /// Whether the call must pass the approval gate.
        requires_approval: bool,
    },
    /// A decision for a gated tool call was applied to the session.
    ///
    /// Carries the decision as a user-role message and returns the session
    /// to `active`, clearing the pending-approval marker.
    ApprovalDecided {
        /// Approval request the decision answers.
        approval_id: String,
        /// The gated tool call.
        tool_call: ToolCall,
        /// Operator decision.
        decision: Decision,
        /// Decision recorded in history.
        message: Message,
    },
    /// Output of a tool invocation, or the rejection notice.
    ToolResult {
        /// Tool-role message answering the call.
        message: Message,
    },
    /// Session lifecycle transition.
    StatusChanged {
        /// New status.
        status: SessionStatus,
        /// Marker set when entering `waiting_approval`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pending_approval: Option<PendingApproval>,
    },
    /// Terminal notice for the execution producing the stream.
    StreamEnded {
        /// Why the stream ended.
        reason: EndReason,
    },
    /// Error surfaced to observers.
    Error {
        /// Human-readable description.
        message: String,
    },
}

impl EventPayload {
    /// Stable kind label stored alongside the payload.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "session_created",
            Self::MessageAppended { .. } => "message_appended",
            Self::ToolCallRequested { .. } => "tool_call_requested",
            Self::ApprovalDecided { .. } => "approval_decided",
            Self::ToolResult { .. } => "tool_result",
            Self::StatusChanged { .. } => "status_changed",
            Self::StreamEnded { .. } => "stream_ended",
            Self::Error { .. } => "error",
        }
    }

    /// Message this payload adds to history, if any.
    #[must_use]
    pub fn message(&self) -> Option<&Message> {
        match self {
            Self::MessageAppended { message }
            | Self::ApprovalDecided { message, .. }
            | Self::ToolResult { message } => Some(message),
            _ => None,
        }
    }
}

/// A single immutable entry in a session's event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Event {
    /// Owning session.
    pub session_id: String,
    /// Per-session sequence number.
    pub seq: u64,
    /// Typed payload.
    pub payload: EventPayload,
    /// Append timestamp.
    pub created_at: DateTime<Utc>,
}

/// Session state derived from an ordered event sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconstruction {
    /// Conversation history.
    pub messages: Vec<Message>,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Pending-approval marker.
    pub pending_approval: Option<PendingApproval>,
}

impl Default for Reconstruction {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            status: SessionStatus::Active,
            pending_approval: None,
        }
    }
}

impl Reconstruction {
    /// Fold one event into the derived state.
    pub fn apply(&mut self, event: &Event) {
        match &event.payload {
            EventPayload::StatusChanged {
                status,
                pending_approval,
            } => {
                self.status = *status;
                self.pending_approval = if *status == SessionStatus::WaitingApproval {
                    pending_approval.clone()
                } else {
                    None
                };
            }
            EventPayload::ApprovalDecided { message, .. } => {
                self.messages.push(message.clone());
                self.status = SessionStatus::Active;
                self.pending_approval = None;
            }
            other => {
                if let Some(message) = other.message() {
                    self.messages.push(message.clone());
                }
            }
        }
    }
}

/// Reconstruct session state from its events in sequence order.
#[must_use]
pub fn reconstruct(events: &[Event]) -> Reconstruction {
    let mut state = Reconstruction::default();
    for event in events {
        state.apply(event);
    }
    state
}
