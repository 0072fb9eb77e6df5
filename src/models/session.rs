//! Session model and lifecycle helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::message::{Message, ToolCall};

/// Lifecycle status for an agent session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session is runnable; an execution may be live.
    Active,
    /// Session is suspended at a tool call awaiting an operator decision.
    WaitingApproval,
    /// Session finished its processing normally.
    Completed,
    /// Session ended on an unrecoverable failure or cancellation.
    Error,
}

impl SessionStatus {
    /// Whether no further execution may happen for this status.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    /// Stable lower-case name used in storage and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::WaitingApproval => "waiting_approval",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

/// Marker referencing the tool call a session is suspended on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct PendingApproval {
    /// Identifier of the approval request record.
    pub approval_id: String,
    /// Tool call awaiting a decision.
    pub tool_call: ToolCall,
}

impl PendingApproval {
    /// Construct a marker with a generated approval identifier.
    #[must_use]
    pub fn new(tool_call: ToolCall) -> Self {
        Self {
            approval_id: Uuid::new_v4().to_string(),
            tool_call,
        }
    }
}

/// Session domain entity; its status, marker and messages are a projection
/// of the session's event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Session {
    /// Unique record identifier.
    pub id: String,
    /// Optional human-readable title.
    pub title: Option<String>,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Tool call awaiting a decision; set iff status is `WaitingApproval`.
    pub pending_approval: Option<PendingApproval>,
    /// Conversation history in insertion order.
    pub messages: Vec<Message>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// When the session reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Construct a new active session with a generated identifier.
    #[must_use]
    pub fn new(title: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title,
            status: SessionStatus::Active,
            pending_approval: None,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        transition_allowed(self.status, next)
    }

    /// Tool calls issued by the assistant that have no tool result yet, in order.
    #[must_use]
    pub fn unanswered_tool_calls(&self) -> Vec<&ToolCall> {
        unanswered_tool_calls(&self.messages)
    }
}

/// Lifecycle state machine shared by the model and the storage projection.
#[must_use]
pub fn transition_allowed(from: SessionStatus, to: SessionStatus) -> bool {
    matches!(
        (from, to),
        (
            SessionStatus::Active,
            SessionStatus::WaitingApproval | SessionStatus::Completed | SessionStatus::Error
        ) | (
            SessionStatus::WaitingApproval,
            SessionStatus::Active | SessionStatus::Error
        )
    )
}

/// Tool calls in `messages` that no tool-role message answers yet.
#[must_use]
pub fn unanswered_tool_calls(messages: &[Message]) -> Vec<&ToolCall> {
    let answered: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == super::message::Role::Tool)
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();

    messages
        .iter()
        .filter(|m| m.role == super::message::Role::Assistant)
        .flat_map(|m| m.tool_calls.iter())
        .filter(|call| !answered.contains(&call.id.as_str()))
        .collect()
}
