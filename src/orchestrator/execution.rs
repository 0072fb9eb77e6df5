//! One running instance of a session's processing.
//!
//! An execution is a `tokio` task independent of any client. It drives the
//! agent turn by turn, routes gated tool calls through the approval gate,
//! appends every step to the event log and publishes it to the session's
//! multiplexer. Cancellation, shutdown and the run timeout are cooperative:
//! they are observed between steps, at the approval gate and while waiting
//! for a model turn, never in the middle of an append or a tool invocation.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::models::approval::Decision;
use crate::models::event::{EndReason, Event, EventPayload};
use crate::models::message::{Message, ToolCall};
use crate::models::session::{PendingApproval, Session, SessionStatus};
use crate::persistence::event_repo::EventRepo;
use crate::persistence::session_repo::SessionRepo;
use crate::stream::multiplexer::{Closure, Multiplexer};
use crate::{AppError, Result};

use super::agent::{AgentLogic, Turn};
use super::approval_gate::{
    approval_request_message, decision_message, ApprovalGate, DecisionWaiter, REJECTED_RESULT,
};

/// Why an execution was asked to stop early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopRequest {
    /// Caller-requested cancellation; the session ends in `error`.
    Cancel {
        /// Human-readable reason recorded in the error event.
        reason: String,
    },
    /// The run timeout elapsed.
    TimedOut,
    /// The runtime is shutting down; the session stays resumable.
    Shutdown,
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The agent finished and the session is `completed`.
    Completed,
    /// Cancellation finalized the session as `error`.
    Cancelled,
    /// Agent or tool logic failed; the session is `error`.
    Failed(String),
    /// The run timeout elapsed.
    TimedOut,
    /// Stopped for shutdown without changing the session status.
    Shutdown,
    /// The store became unreachable; the session keeps its last durable status.
    Aborted(String),
    /// The session was already terminal; nothing ran.
    AlreadyTerminal(SessionStatus),
}

#[derive(Default)]
struct StopSlot {
    request: Option<StopRequest>,
    sealed: bool,
}

/// Handle to a live execution held in the supervisor's table.
pub struct ExecutionHandle {
    session_id: String,
    execution_id: String,
    cancel: CancellationToken,
    stop: Mutex<StopSlot>,
    hub: Arc<Multiplexer>,
    outcome: watch::Sender<Option<RunOutcome>>,
}

impl ExecutionHandle {
    pub(crate) fn new(session_id: &str, observer_buffer_size: usize) -> Self {
        let (outcome, _rx) = watch::channel(None);
        Self {
            session_id: session_id.to_owned(),
            execution_id: Uuid::new_v4().to_string(),
            cancel: CancellationToken::new(),
            stop: Mutex::new(StopSlot::default()),
            hub: Arc::new(Multiplexer::new(session_id, observer_buffer_size)),
            outcome,
        }
    }

    fn stop_slot(&self) -> MutexGuard<'_, StopSlot> {
        self.stop.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Session this execution processes.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Unique identifier of this execution.
    #[must_use]
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Live event hub of this execution.
    #[must_use]
    pub fn hub(&self) -> &Arc<Multiplexer> {
        &self.hub
    }

    /// Ask the execution to stop at its next suspension point.
    ///
    /// The first request wins, except that a cancellation replaces a pending
    /// timeout or shutdown. Returns `false` if the request was not taken,
    /// including once the execution has started finalizing.
    pub fn request_stop(&self, request: StopRequest) -> bool {
        {
            let mut slot = self.stop_slot();
            if slot.sealed {
                return false;
            }
            let replaces = matches!(
                (&slot.request, &request),
                (None, _)
                    | (
                        Some(StopRequest::TimedOut | StopRequest::Shutdown),
                        StopRequest::Cancel { .. }
                    )
            );
            if !replaces {
                return false;
            }
            slot.request = Some(request);
        }
        self.cancel.cancel();
        true
    }

    /// Pending stop request, if any.
    #[must_use]
    pub fn stop_request(&self) -> Option<StopRequest> {
        self.stop_slot().request.clone()
    }

    /// Refuse further stop requests and return the one that stands.
    fn seal(&self) -> Option<StopRequest> {
        let mut slot = self.stop_slot();
        slot.sealed = true;
        slot.request.clone()
    }

    /// Outcome, once the execution has ended.
    #[must_use]
    pub fn outcome(&self) -> Option<RunOutcome> {
        self.outcome.borrow().clone()
    }

    /// Wait until the execution has ended and return its outcome.
    pub async fn wait(&self) -> RunOutcome {
        let mut rx = self.outcome.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| RunOutcome::Aborted("execution dropped".into()))
    }

    pub(crate) fn finish(&self, outcome: RunOutcome) {
        self.outcome.send_replace(Some(outcome));
    }
}

/// Shared services an execution needs.
#[derive(Clone)]
pub(crate) struct ExecutionContext {
    pub(crate) events: EventRepo,
    pub(crate) sessions: SessionRepo,
    pub(crate) gate: ApprovalGate,
    pub(crate) agent: Arc<dyn AgentLogic>,
    pub(crate) config: RuntimeConfig,
}

enum GateResult {
    Decided(Decision),
    Stopped(StopRequest),
}

pub(crate) struct Execution {
    handle: Arc<ExecutionHandle>,
    input: Option<String>,
    ctx: ExecutionContext,
}

impl Execution {
    pub(crate) fn new(
        handle: Arc<ExecutionHandle>,
        input: Option<String>,
        ctx: ExecutionContext,
    ) -> Self {
        Self { handle, input, ctx }
    }

    fn session_id(&self) -> &str {
        &self.handle.session_id
    }

    /// Drive the session to its next resting point, finalize, then call `release`.
    pub(crate) async fn run<F>(self, release: F)
    where
        F: FnOnce() + Send,
    {
        info!("execution started");
        let timer = self.spawn_timer();
        let result = match self.drive().await {
            Ok(Some(_)) => Ok(self.handle.seal()),
            other => {
                self.handle.seal();
                other
            }
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        self.finalize(result, release).await;
    }

    fn spawn_timer(&self) -> Option<JoinHandle<()>> {
        let limit = self.ctx.config.run_timeout()?;
        let handle = Arc::clone(&self.handle);
        Some(tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(limit) => {
                    if handle.request_stop(StopRequest::TimedOut) {
                        warn!(session_id = %handle.session_id, ?limit, "run timeout elapsed");
                    }
                }
                () = handle.cancel.cancelled() => {}
            }
        }))
    }

    async fn append(&self, payload: EventPayload) -> Result<Event> {
        let event = self.ctx.events.append(self.session_id(), payload).await?;
        self.handle.hub.publish(event.clone());
        Ok(event)
    }

    async fn load(&self) -> Result<Session> {
        self.ctx
            .sessions
            .get_by_id(self.session_id())
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {} not found", self.session_id())))
    }

    /// Run until the agent finishes (`Ok(None)`) or a stop is observed.
    async fn drive(&self) -> Result<Option<StopRequest>> {
        if let Some(stop) = self.handle.stop_request() {
            return Ok(Some(stop));
        }

        let session = self.load().await?;
        match session.status {
            SessionStatus::WaitingApproval => {
                if self.input.is_some() {
                    warn!("input ignored while the session waits for approval");
                }
                let marker = session.pending_approval.ok_or_else(|| {
                    AppError::Db("waiting session has no pending approval".into())
                })?;
                if let GateResult::Stopped(stop) = self.reconcile(&marker).await? {
                    return Ok(Some(stop));
                }
            }
            SessionStatus::Active => {
                if let Some(input) = &self.input {
                    self.append(EventPayload::MessageAppended {
                        message: Message::user(input.clone()),
                    })
                    .await?;
                }
            }
            status @ (SessionStatus::Completed | SessionStatus::Error) => {
                return Err(AppError::InvalidTransition(format!(
                    "session is {}",
                    status.as_str()
                )));
            }
        }

        loop {
            if let Some(stop) = self.handle.stop_request() {
                return Ok(Some(stop));
            }

            let session = self.load().await?;
            if let Some(call) = session.unanswered_tool_calls().first().copied() {
                if let Some(stop) = self.process_tool_call(call).await? {
                    return Ok(Some(stop));
                }
                continue;
            }

            let turn = tokio::select! {
                biased;
                () = self.handle.cancel.cancelled() => None,
                turn = self.ctx.agent.next_turn(&session) => Some(turn),
            };
            let Some(turn) = turn else {
                return Ok(self.handle.stop_request());
            };

            match turn? {
                Turn::Reply { content } => {
                    self.append(EventPayload::MessageAppended {
                        message: Message::assistant(content),
                    })
                    .await?;
                }
                Turn::ToolCalls { content, calls } => {
                    self.append(EventPayload::MessageAppended {
                        message: Message::assistant_with_calls(content, calls.clone()),
                    })
                    .await?;
                    for call in calls {
                        let requires_approval = self.ctx.agent.requires_approval(&call);
                        self.append(EventPayload::ToolCallRequested {
                            call,
                            requires_approval,
                        })
                        .await?;
                    }
                }
                Turn::Finished => return Ok(None),
            }
        }
    }

    async fn process_tool_call(&self, call: &ToolCall) -> Result<Option<StopRequest>> {
        let applied = self
            .ctx
            .gate
            .applied_decision(self.session_id(), &call.id)
            .await?;

        let decision = match applied {
            Some(decision) => decision,
            None if !self.ctx.agent.requires_approval(call) => Decision::Approve,
            None if self.ctx.config.auto_approve => {
                let approval_id = Uuid::new_v4().to_string();
                self.apply_decision(&approval_id, call, Decision::Approve)
                    .await?;
                Decision::Approve
            }
            None => match self.suspend(&PendingApproval::new(call.clone())).await? {
                GateResult::Decided(decision) => decision,
                GateResult::Stopped(stop) => return Ok(Some(stop)),
            },
        };

        let message = match decision {
            Decision::Approve => {
                let output = self
                    .ctx
                    .agent
                    .invoke_tool(self.session_id(), call)
                    .await?;
                Message::tool_result(&call.id, output)
            }
            Decision::Reject => Message::tool_result(&call.id, REJECTED_RESULT),
        };
        self.append(EventPayload::ToolResult { message }).await?;
        Ok(None)
    }

    async fn suspend(&self, marker: &PendingApproval) -> Result<GateResult> {
        self.append(EventPayload::MessageAppended {
            message: approval_request_message(&marker.tool_call),
        })
        .await?;
        let waiter = self
            .ctx
            .gate
            .register(self.session_id(), &marker.approval_id);
        self.append(EventPayload::StatusChanged {
            status: SessionStatus::WaitingApproval,
            pending_approval: Some(marker.clone()),
        })
        .await?;
        info!(
            approval_id = %marker.approval_id,
            tool = %marker.tool_call.name,
            "waiting for approval"
        );
        self.await_decision(marker, waiter).await
    }

    /// Apply a decision recorded while no execution was live, or wait for one.
    async fn reconcile(&self, marker: &PendingApproval) -> Result<GateResult> {
        let waiter = self
            .ctx
            .gate
            .register(self.session_id(), &marker.approval_id);
        if let Some(decision) = self.ctx.gate.stored_decision(&marker.approval_id).await? {
            drop(waiter);
            info!(
                approval_id = %marker.approval_id,
                decision = decision.as_str(),
                "applying stored decision"
            );
            self.apply_decision(&marker.approval_id, &marker.tool_call, decision)
                .await?;
            return Ok(GateResult::Decided(decision));
        }
        self.await_decision(marker, waiter).await
    }

    async fn await_decision(
        &self,
        marker: &PendingApproval,
        mut waiter: DecisionWaiter,
    ) -> Result<GateResult> {
        let decision = tokio::select! {
            biased;
            () = self.handle.cancel.cancelled() => None,
            decision = waiter.recv() => decision,
        };
        drop(waiter);

        match decision {
            Some(decision) => {
                self.apply_decision(&marker.approval_id, &marker.tool_call, decision)
                    .await?;
                Ok(GateResult::Decided(decision))
            }
            None => self
                .handle
                .stop_request()
                .map(GateResult::Stopped)
                .ok_or_else(|| AppError::ExecutionFailed("decision channel closed".into())),
        }
    }

    async fn apply_decision(
        &self,
        approval_id: &str,
        call: &ToolCall,
        decision: Decision,
    ) -> Result<Event> {
        self.append(EventPayload::ApprovalDecided {
            approval_id: approval_id.to_owned(),
            tool_call: call.clone(),
            decision,
            message: decision_message(call, decision),
        })
        .await
    }

    /// Append terminal events, release the handle, then let observers see them.
    async fn finalize<F>(&self, result: Result<Option<StopRequest>>, release: F)
    where
        F: FnOnce() + Send,
    {
        let (outcome, payloads) = match self.terminal_payloads(result).await {
            Ok(plan) => plan,
            Err(err) => return self.abort(&err, release),
        };

        let mut appended = Vec::with_capacity(payloads.len());
        for payload in payloads {
            match self.ctx.events.append(self.session_id(), payload).await {
                Ok(event) => appended.push(event),
                Err(err) => return self.abort(&err, release),
            }
        }
        let status = match self.ctx.sessions.get_status(self.session_id()).await {
            Ok(Some(status)) => status,
            Ok(None) => {
                let err = AppError::NotFound(format!("session {} not found", self.session_id()));
                return self.abort(&err, release);
            }
            Err(err) => return self.abort(&err, release),
        };

        release();
        for event in appended {
            self.handle.hub.publish(event);
        }
        self.handle.hub.close(Closure::Finished(status));
        info!(?outcome, status = status.as_str(), "execution finished");
        self.handle.finish(outcome);
    }

    async fn terminal_payloads(
        &self,
        result: Result<Option<StopRequest>>,
    ) -> Result<(RunOutcome, Vec<EventPayload>)> {
        let error_status = EventPayload::StatusChanged {
            status: SessionStatus::Error,
            pending_approval: None,
        };

        let plan = match result {
            Ok(None) => (
                RunOutcome::Completed,
                vec![
                    EventPayload::StatusChanged {
                        status: SessionStatus::Completed,
                        pending_approval: None,
                    },
                    EventPayload::StreamEnded {
                        reason: EndReason::Completed,
                    },
                ],
            ),
            Ok(Some(StopRequest::Cancel { reason })) => {
                info!(%reason, "execution cancelled");
                (
                    RunOutcome::Cancelled,
                    vec![
                        error_status,
                        EventPayload::Error {
                            message: format!("cancelled: {reason}"),
                        },
                        EventPayload::StreamEnded {
                            reason: EndReason::Cancelled,
                        },
                    ],
                )
            }
            Ok(Some(StopRequest::Shutdown)) => (
                RunOutcome::Shutdown,
                vec![EventPayload::StreamEnded {
                    reason: EndReason::Shutdown,
                }],
            ),
            Ok(Some(StopRequest::TimedOut)) => {
                let ended = EventPayload::StreamEnded {
                    reason: EndReason::TimedOut,
                };
                let status = self.ctx.sessions.get_status(self.session_id()).await?;
                if status == Some(SessionStatus::WaitingApproval) {
                    (RunOutcome::TimedOut, vec![ended])
                } else {
                    (
                        RunOutcome::TimedOut,
                        vec![
                            error_status,
                            EventPayload::Error {
                                message: "run timed out".into(),
                            },
                            ended,
                        ],
                    )
                }
            }
            Err(err @ AppError::StoreUnavailable(_)) => return Err(err),
            Err(err) => {
                error!(%err, "execution failed");
                (
                    RunOutcome::Failed(err.to_string()),
                    vec![
                        error_status,
                        EventPayload::Error {
                            message: err.to_string(),
                        },
                        EventPayload::StreamEnded {
                            reason: EndReason::Failed,
                        },
                    ],
                )
            }
        };
        Ok(plan)
    }

    fn abort<F>(&self, err: &AppError, release: F)
    where
        F: FnOnce(),
    {
        error!(%err, "execution aborted; session keeps its last durable status");
        release();
        self.handle.hub.close(Closure::Aborted(err.to_string()));
        self.handle.finish(RunOutcome::Aborted(err.to_string()));
    }
}
