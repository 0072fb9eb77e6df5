//! Approval request model for gated tool calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::ToolCall;
use super::session::PendingApproval;

/// Operator decision on a gated tool call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Run the tool call.
    Approve,
    /// Skip the tool call and report the rejection to the agent.
    Reject,
}

impl Decision {
    /// Text recorded in the decision message.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }
}

/// Lifecycle status for an approval request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Awaiting operator decision.
    Pending,
    /// Operator approved the tool call.
    Approved,
    /// Operator rejected the tool call.
    Rejected,
    /// Session ended before a decision arrived.
    Cancelled,
}

impl ApprovalStatus {
    /// Status recorded for a decision.
    #[must_use]
    pub fn from_decision(decision: Decision) -> Self {
        match decision {
            Decision::Approve => Self::Approved,
            Decision::Reject => Self::Rejected,
        }
    }

    /// Decision carried by a decided status.
    #[must_use]
    pub fn decision(self) -> Option<Decision> {
        match self {
            Self::Approved => Some(Decision::Approve),
            Self::Rejected => Some(Decision::Reject),
            Self::Pending | Self::Cancelled => None,
        }
    }
}

/// Durable record behind a pending-approval marker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ApprovalRequest {
    /// Marker identifier.
    pub id: String,
    /// Owning session identifier.
    pub session_id: String,
    /// Gated tool call.
    pub tool_call: ToolCall,
    /// Current lifecycle status.
    pub status: ApprovalStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// When the decision was accepted.
    pub decided_at: Option<DateTime<Utc>>,
    /// When the decision was applied to the session history.
    pub applied_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    /// Marker form of this request.
    #[must_use]
    pub fn marker(&self) -> PendingApproval {
        PendingApproval {
            approval_id: self.id.clone(),
            tool_call: self.tool_call.clone(),
        }
    }

    /// Whether a decision was recorded but not yet applied.
    #[must_use]
    pub fn awaits_application(&self) -> bool {
        self.status.decision().is_some() && self.applied_at.is_none()
    }
}
