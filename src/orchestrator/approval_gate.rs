//! Approval gate: suspends executions at gated tool calls and routes decisions.
//!
//! Decisions are always recorded durably against the pending-approval marker
//! first. If the suspended execution is live it is woken through a oneshot
//! channel; otherwise the next execution for the session applies the stored
//! decision before anything else.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::info;

use crate::models::approval::Decision;
use crate::models::message::{Message, ToolCall};
use crate::models::session::SessionStatus;
use crate::persistence::approval_repo::ApprovalRepo;
use crate::persistence::db::Database;
use crate::persistence::session_repo::SessionRepo;
use crate::{AppError, Result};

/// Content of the tool result recorded for a rejected call.
pub const REJECTED_RESULT: &str = "tool call rejected by operator";

struct Waiter {
    approval_id: String,
    sender: oneshot::Sender<Decision>,
}

/// Thread-safe map of suspended executions keyed by `session_id`.
type PendingDecisions = Arc<Mutex<HashMap<String, Waiter>>>;

fn lock(pending: &Mutex<HashMap<String, Waiter>>) -> MutexGuard<'_, HashMap<String, Waiter>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What happened to a submitted decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionOutcome {
    /// Recorded and handed to the suspended live execution.
    Delivered,
    /// Recorded for the next execution of the session to apply.
    Recorded,
}

/// Approval gate shared by the supervisor and its executions.
#[derive(Clone)]
pub struct ApprovalGate {
    sessions: SessionRepo,
    approvals: ApprovalRepo,
    pending: PendingDecisions,
}

impl ApprovalGate {
    /// Create a gate over the given database.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            sessions: SessionRepo::new(Arc::clone(&db)),
            approvals: ApprovalRepo::new(db),
            pending: PendingDecisions::default(),
        }
    }

    /// Record an operator decision for the session's pending approval.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session,
    /// `AppError::NoPendingApproval` if the session is not waiting for a
    /// decision, and `AppError::AlreadyDecided` if a decision for the current
    /// marker was already accepted.
    pub async fn submit_decision(
        &self,
        session_id: &str,
        decision: Decision,
    ) -> Result<DecisionOutcome> {
        let status = self
            .sessions
            .get_status(session_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))?;
        if status != SessionStatus::WaitingApproval {
            return Err(AppError::NoPendingApproval(format!(
                "session {session_id} is {}",
                status.as_str()
            )));
        }

        let request = self
            .approvals
            .get_pending_for_session(session_id)
            .await?
            .ok_or_else(|| {
                AppError::NoPendingApproval(format!("session {session_id} has no pending approval"))
            })?;
        let request = self.approvals.record_decision(&request.id, decision).await?;

        let outcome = self.deliver(session_id, &request.id, decision);
        info!(
            session_id,
            approval_id = %request.id,
            decision = decision.as_str(),
            ?outcome,
            "approval decision recorded"
        );
        Ok(outcome)
    }

    fn deliver(&self, session_id: &str, approval_id: &str, decision: Decision) -> DecisionOutcome {
        let waiter = {
            let mut pending = lock(&self.pending);
            let suspended_here = pending
                .get(session_id)
                .is_some_and(|waiter| waiter.approval_id == approval_id);
            if suspended_here {
                pending.remove(session_id)
            } else {
                None
            }
        };
        match waiter {
            Some(waiter) => match waiter.sender.send(decision) {
                Ok(()) => DecisionOutcome::Delivered,
                Err(_) => DecisionOutcome::Recorded,
            },
            None => DecisionOutcome::Recorded,
        }
    }

    /// Register a suspended execution for `approval_id`.
    ///
    /// Must happen before the session is marked `waiting_approval` so that no
    /// accepted decision can miss a live execution.
    #[must_use]
    pub fn register(&self, session_id: &str, approval_id: &str) -> DecisionWaiter {
        let (sender, receiver) = oneshot::channel();
        lock(&self.pending).insert(
            session_id.to_owned(),
            Waiter {
                approval_id: approval_id.to_owned(),
                sender,
            },
        );
        DecisionWaiter {
            pending: Arc::clone(&self.pending),
            session_id: session_id.to_owned(),
            approval_id: approval_id.to_owned(),
            receiver,
        }
    }

    /// Decision recorded for `approval_id` but not yet applied, if any.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the lookup fails.
    pub async fn stored_decision(&self, approval_id: &str) -> Result<Option<Decision>> {
        Ok(self
            .approvals
            .get_by_id(approval_id)
            .await?
            .filter(|request| request.awaits_application())
            .and_then(|request| request.status.decision()))
    }

    /// Decision applied earlier to this tool call, if any.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the lookup fails.
    pub async fn applied_decision(
        &self,
        session_id: &str,
        tool_call_id: &str,
    ) -> Result<Option<Decision>> {
        Ok(self
            .approvals
            .get_for_tool_call(session_id, tool_call_id)
            .await?
            .and_then(|request| request.applied_at.and(request.status.decision())))
    }
}

/// Receiving side of a suspension; unregisters itself when dropped.
pub struct DecisionWaiter {
    pending: PendingDecisions,
    session_id: String,
    approval_id: String,
    receiver: oneshot::Receiver<Decision>,
}

impl DecisionWaiter {
    /// Wait for the decision. `None` if the gate dropped the sender.
    pub async fn recv(&mut self) -> Option<Decision> {
        (&mut self.receiver).await.ok()
    }
}

impl Drop for DecisionWaiter {
    fn drop(&mut self) {
        let mut pending = lock(&self.pending);
        if pending
            .get(&self.session_id)
            .is_some_and(|waiter| waiter.approval_id == self.approval_id)
        {
            pending.remove(&self.session_id);
        }
    }
}

/// System-role message announcing that `call` waits for an operator decision.
///
/// It carries the gated call but is not an assistant message, so it never
/// counts as a tool call of its own.
#[must_use]
pub fn approval_request_message(call: &ToolCall) -> Message {
    Message {
        tool_calls: vec![call.clone()],
        tool_call_id: Some(call.id.clone()),
        ..Message::system(format!("approval required: {}", call.name))
    }
}

/// User-role message recording a decision in the session history.
#[must_use]
pub fn decision_message(call: &ToolCall, decision: Decision) -> Message {
    Message {
        tool_call_id: Some(call.id.clone()),
        ..Message::user(format!("{}: {}", decision.as_str(), call.name))
    }
}
