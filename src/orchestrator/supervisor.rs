//! Execution supervisor: at most one live execution per session.
//!
//! The session → handle table is the only shared mutable state. It is
//! guarded by a synchronous mutex held only for lookups and inserts, never
//! across an `.await`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::RuntimeConfig;
use crate::models::session::SessionStatus;
use crate::persistence::approval_repo::ApprovalRepo;
use crate::persistence::db::Database;
use crate::persistence::event_repo::EventRepo;
use crate::persistence::session_repo::SessionRepo;
use crate::stream::feed::Feed;
use crate::stream::multiplexer::Closure;
use crate::{AppError, Result};

use super::agent::AgentLogic;
use super::approval_gate::ApprovalGate;
use super::execution::{Execution, ExecutionContext, ExecutionHandle, RunOutcome, StopRequest};

/// Result of asking the supervisor to start a session.
#[derive(Clone)]
pub enum StartOutcome {
    /// A new execution was launched.
    Started(Arc<ExecutionHandle>),
    /// An execution was already live; nothing new was launched.
    AlreadyRunning(Arc<ExecutionHandle>),
    /// The session is terminal; nothing ran.
    Terminal(SessionStatus),
}

impl StartOutcome {
    /// Live handle, if the session has one.
    #[must_use]
    pub fn handle(&self) -> Option<&Arc<ExecutionHandle>> {
        match self {
            Self::Started(handle) | Self::AlreadyRunning(handle) => Some(handle),
            Self::Terminal(_) => None,
        }
    }
}

/// Result of a cancellation request.
#[derive(Clone)]
pub enum CancelOutcome {
    /// The execution owning the session was told to stop; wait on the handle
    /// for the terminal outcome.
    Signalled(Arc<ExecutionHandle>),
    /// The session was already terminal.
    Terminal(SessionStatus),
}

/// Sessions found by startup recovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// `active` sessions with no live execution.
    pub interrupted: Vec<String>,
    /// `waiting_approval` sessions with a decision recorded but not applied.
    pub decided: Vec<String>,
    /// `waiting_approval` sessions still waiting for a decision.
    pub awaiting_decision: Vec<String>,
    /// Sessions restarted by this recovery.
    pub restarted: Vec<String>,
}

type ExecutionTable = Mutex<HashMap<String, Arc<ExecutionHandle>>>;

struct Inner {
    ctx: ExecutionContext,
    approvals: ApprovalRepo,
    executions: ExecutionTable,
}

/// Owner of all live executions.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Create a supervisor over the given database and agent logic.
    #[must_use]
    pub fn new(db: Arc<Database>, config: RuntimeConfig, agent: Arc<dyn AgentLogic>) -> Self {
        let ctx = ExecutionContext {
            events: EventRepo::new(Arc::clone(&db)),
            sessions: SessionRepo::new(Arc::clone(&db)),
            gate: ApprovalGate::new(Arc::clone(&db)),
            agent,
            config,
        };
        Self {
            inner: Arc::new(Inner {
                ctx,
                approvals: ApprovalRepo::new(db),
                executions: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Arc<ExecutionHandle>>> {
        self.inner
            .executions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Approval gate shared with this supervisor's executions.
    #[must_use]
    pub fn gate(&self) -> &ApprovalGate {
        &self.inner.ctx.gate
    }

    /// Runtime configuration in effect.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.ctx.config
    }

    /// Live handle for a session, if any.
    #[must_use]
    pub fn live(&self, session_id: &str) -> Option<Arc<ExecutionHandle>> {
        self.table().get(session_id).cloned()
    }

    /// Number of live executions.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.table().len()
    }

    /// Start an execution for a session unless one is already live.
    ///
    /// `input` is appended as a user message when the session is `active`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session or a persistence
    /// error if the session cannot be read.
    pub async fn start(&self, session_id: &str, input: Option<String>) -> Result<StartOutcome> {
        self.launch(session_id, input, None).await
    }

    async fn launch(
        &self,
        session_id: &str,
        input: Option<String>,
        preset: Option<StopRequest>,
    ) -> Result<StartOutcome> {
        let handle = {
            let mut table = self.table();
            if let Some(existing) = table.get(session_id) {
                if input.is_some() {
                    warn!(session_id, "input ignored; execution already live");
                }
                return Ok(StartOutcome::AlreadyRunning(Arc::clone(existing)));
            }
            let handle = Arc::new(ExecutionHandle::new(
                session_id,
                self.inner.ctx.config.observer_buffer_size,
            ));
            table.insert(session_id.to_owned(), Arc::clone(&handle));
            handle
        };
        if let Some(stop) = preset {
            handle.request_stop(stop);
        }

        // The slot is ours: any previous execution has released it, so its
        // final status and events are durable.
        let status = match self.inner.ctx.sessions.get_status(session_id).await {
            Ok(Some(status)) => status,
            Ok(None) => {
                let err = AppError::NotFound(format!("session {session_id} not found"));
                return Err(self.fail(&handle, err));
            }
            Err(err) => return Err(self.fail(&handle, err)),
        };
        if status.is_terminal() {
            self.release(&handle);
            handle.hub().close(Closure::Finished(status));
            handle.finish(RunOutcome::AlreadyTerminal(status));
            return Ok(StartOutcome::Terminal(status));
        }

        match self.inner.ctx.events.last_seq(session_id).await {
            Ok(last) => handle.hub().set_base(last),
            Err(err) => return Err(self.fail(&handle, err)),
        }

        let execution = Execution::new(Arc::clone(&handle), input, self.inner.ctx.clone());
        let supervisor = self.clone();
        let released = Arc::clone(&handle);
        let span = info_span!(
            "execution",
            session_id = %session_id,
            execution_id = %handle.execution_id()
        );
        tokio::spawn(
            async move {
                execution
                    .run(move || supervisor.release(&released))
                    .await;
            }
            .instrument(span),
        );

        Ok(StartOutcome::Started(handle))
    }

    fn release(&self, handle: &ExecutionHandle) {
        let mut table = self.table();
        if table
            .get(handle.session_id())
            .is_some_and(|live| live.execution_id() == handle.execution_id())
        {
            table.remove(handle.session_id());
        }
    }

    fn fail(&self, handle: &ExecutionHandle, err: AppError) -> AppError {
        self.release(handle);
        handle.hub().close(Closure::Aborted(err.to_string()));
        handle.finish(RunOutcome::Aborted(err.to_string()));
        err
    }

    /// Cancel a session.
    ///
    /// A live execution is signalled. One already finalizing for another
    /// reason is waited out, and the session is then cancelled as if no
    /// execution were live: a resumable session is finalized by a short
    /// execution that only appends the terminal events. Terminal sessions are
    /// left alone.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session or a persistence
    /// error if the session cannot be read.
    pub async fn cancel(&self, session_id: &str, reason: &str) -> Result<CancelOutcome> {
        let request = StopRequest::Cancel {
            reason: reason.to_owned(),
        };
        loop {
            if let Some(handle) = self.live(session_id) {
                if handle.request_stop(request.clone())
                    || matches!(handle.stop_request(), Some(StopRequest::Cancel { .. }))
                {
                    return Ok(CancelOutcome::Signalled(handle));
                }
                let outcome = handle.wait().await;
                debug!(session_id, ?outcome, "cancel waited for finalizing execution");
                continue;
            }

            match self.launch(session_id, None, Some(request.clone())).await? {
                StartOutcome::Started(handle) => return Ok(CancelOutcome::Signalled(handle)),
                StartOutcome::AlreadyRunning(_) => {}
                StartOutcome::Terminal(status) => return Ok(CancelOutcome::Terminal(status)),
            }
        }
    }

    /// Attach an observer to a session, replaying stored events from `from_seq`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session.
    pub async fn attach(&self, session_id: &str, from_seq: u64) -> Result<Feed> {
        let ctx = &self.inner.ctx;
        let page_size = ctx.config.replay_page_size;

        if let Some(handle) = self.live(session_id) {
            return Ok(Feed::live(
                &ctx.events,
                ctx.sessions.clone(),
                Arc::clone(handle.hub()),
                from_seq,
                page_size,
            ));
        }

        if ctx.sessions.get_status(session_id).await?.is_none() {
            return Err(AppError::NotFound(format!("session {session_id} not found")));
        }
        Ok(Feed::replay_only(
            &ctx.events,
            ctx.sessions.clone(),
            session_id,
            from_seq,
            page_size,
        ))
    }

    /// Stop every live execution without finalizing its session and wait for
    /// each to release its handle.
    pub async fn shutdown(&self) {
        let handles: Vec<Arc<ExecutionHandle>> = self.table().values().cloned().collect();
        info!(live = handles.len(), "stopping executions for shutdown");
        for handle in &handles {
            handle.request_stop(StopRequest::Shutdown);
        }
        for handle in handles {
            let outcome = handle.wait().await;
            info!(session_id = handle.session_id(), ?outcome, "execution stopped");
        }
    }

    /// Find sessions left resumable by a previous process and optionally restart them.
    ///
    /// Sessions waiting for a decision that has not arrived are reported but
    /// never restarted.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the scan fails.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let decided: HashSet<String> = self
            .inner
            .approvals
            .list_decided_unapplied()
            .await?
            .into_iter()
            .map(|request| request.session_id)
            .collect();

        let mut report = RecoveryReport::default();
        for session in self.inner.ctx.sessions.list_resumable().await? {
            if self.live(&session.id).is_some() {
                continue;
            }
            match session.status {
                SessionStatus::Active => report.interrupted.push(session.id),
                SessionStatus::WaitingApproval if decided.contains(&session.id) => {
                    report.decided.push(session.id);
                }
                SessionStatus::WaitingApproval => report.awaiting_decision.push(session.id),
                SessionStatus::Completed | SessionStatus::Error => {}
            }
        }

        if self.inner.ctx.config.resume_interrupted_on_startup {
            let candidates: Vec<String> = report
                .interrupted
                .iter()
                .chain(report.decided.iter())
                .cloned()
                .collect();
            for session_id in candidates {
                match self.start(&session_id, None).await {
                    Ok(StartOutcome::Started(_)) => report.restarted.push(session_id),
                    Ok(_) => {}
                    Err(err) => warn!(session_id, %err, "failed to resume session"),
                }
            }
        }

        info!(
            interrupted = report.interrupted.len(),
            decided = report.decided.len(),
            awaiting_decision = report.awaiting_decision.len(),
            restarted = report.restarted.len(),
            "startup recovery complete"
        );
        Ok(report)
    }
}
