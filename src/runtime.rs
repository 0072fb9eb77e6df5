//! Session runtime facade: the operations a transport maps onto the engine.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};

use crate::config::RuntimeConfig;
use crate::models::approval::Decision;
use crate::models::event::Event;
use crate::models::message::Message;
use crate::models::session::{Session, SessionStatus};
use crate::orchestrator::agent::AgentLogic;
use crate::orchestrator::approval_gate::DecisionOutcome;
use crate::orchestrator::supervisor::{CancelOutcome, RecoveryReport, StartOutcome, Supervisor};
use crate::persistence::db::{self, Database};
use crate::persistence::event_repo::{EventRepo, EventReplay};
use crate::persistence::retention;
use crate::persistence::session_repo::SessionRepo;
use crate::stream::feed::Feed;
use crate::{AppError, GlobalConfig, Result};

/// Parameters for a new session.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    /// Optional human-readable title.
    pub title: Option<String>,
    /// System prompt recorded as the first message.
    pub system_prompt: Option<String>,
    /// Initial user message.
    pub user_message: Option<String>,
}

/// A started (or joined) run together with a feed following it.
pub struct Run {
    /// What the supervisor did.
    pub outcome: StartOutcome,
    /// Events of this run; for a joined or terminal session, the full history.
    pub feed: Feed,
}

/// Entry point for creating, running, observing and deciding on sessions.
#[derive(Clone)]
pub struct SessionRuntime {
    db: Arc<Database>,
    sessions: SessionRepo,
    events: EventRepo,
    supervisor: Supervisor,
}

impl SessionRuntime {
    /// Build a runtime over an open database.
    #[must_use]
    pub fn new(db: Arc<Database>, config: RuntimeConfig, agent: Arc<dyn AgentLogic>) -> Self {
        Self {
            sessions: SessionRepo::new(Arc::clone(&db)),
            events: EventRepo::new(Arc::clone(&db)),
            supervisor: Supervisor::new(Arc::clone(&db), config, agent),
            db,
        }
    }

    /// Open the configured database and build a runtime over it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` or a persistence error if the database
    /// cannot be opened.
    pub async fn open(config: &GlobalConfig, agent: Arc<dyn AgentLogic>) -> Result<Self> {
        let db = Arc::new(db::open(config).await?);
        info!(in_memory = config.in_memory, "session runtime ready");
        Ok(Self::new(db, config.runtime.clone(), agent))
    }

    /// Shared database pool.
    #[must_use]
    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    /// Underlying execution supervisor.
    #[must_use]
    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Create an `active` session with its initial messages.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the session cannot be stored.
    pub async fn create_session(&self, request: NewSession) -> Result<Session> {
        let mut session = Session::new(request.title);
        if let Some(prompt) = request.system_prompt {
            session.messages.push(Message::system(prompt));
        }
        if let Some(text) = request.user_message {
            session.messages.push(Message::user(text));
        }
        let session = self.sessions.create(&session).await?;
        info!(session_id = %session.id, messages = session.messages.len(), "session created");
        Ok(session)
    }

    /// Session snapshot with its full message history.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session.
    pub async fn session(&self, session_id: &str) -> Result<Session> {
        self.sessions
            .get_by_id(session_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))
    }

    /// List sessions, newest first, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the query fails.
    pub async fn sessions(&self, status: Option<SessionStatus>) -> Result<Vec<Session>> {
        self.sessions.list(status).await
    }

    /// Start the session (unless already live) and follow it.
    ///
    /// A new run's feed begins at the first event this run appends; joining a
    /// live run or a terminal session yields the whole history instead.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session or a persistence
    /// error if the session cannot be read.
    pub async fn run(&self, session_id: &str, input: Option<String>) -> Result<Run> {
        let span = info_span!("run", session_id);
        async {
            let outcome = self.supervisor.start(session_id, input).await?;
            let from_seq = match &outcome {
                StartOutcome::Started(handle) => handle.hub().first_seq().unwrap_or(0),
                StartOutcome::AlreadyRunning(_) | StartOutcome::Terminal(_) => 0,
            };
            let feed = self.supervisor.attach(session_id, from_seq).await?;
            Ok(Run { outcome, feed })
        }
        .instrument(span)
        .await
    }

    /// Start the session without attaching an observer.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session or a persistence
    /// error if the session cannot be read.
    pub async fn start(&self, session_id: &str) -> Result<StartOutcome> {
        self.supervisor.start(session_id, None).await
    }

    /// Submit an operator decision for the session's pending approval.
    ///
    /// With `resume_on_decision` set, a decision recorded while no execution
    /// is live starts one to apply it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound`, `AppError::NoPendingApproval` or
    /// `AppError::AlreadyDecided` as described on the approval gate.
    pub async fn submit_decision(
        &self,
        session_id: &str,
        decision: Decision,
    ) -> Result<DecisionOutcome> {
        let outcome = self
            .supervisor
            .gate()
            .submit_decision(session_id, decision)
            .await?;
        if outcome == DecisionOutcome::Recorded && self.supervisor.config().resume_on_decision {
            self.supervisor.start(session_id, None).await?;
        }
        Ok(outcome)
    }

    /// Attach an observer, replaying stored events from `from_seq`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session.
    pub async fn attach(&self, session_id: &str, from_seq: u64) -> Result<Feed> {
        self.supervisor.attach(session_id, from_seq).await
    }

    /// Cancel the session's execution or finalize it if none is live.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session.
    pub async fn cancel(&self, session_id: &str, reason: &str) -> Result<CancelOutcome> {
        self.supervisor.cancel(session_id, reason).await
    }

    /// All stored events of a session, in order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session or a persistence
    /// error if the read fails.
    pub async fn events(&self, session_id: &str) -> Result<Vec<Event>> {
        if self.sessions.get_status(session_id).await?.is_none() {
            return Err(AppError::NotFound(format!("session {session_id} not found")));
        }
        self.events.list(session_id).await
    }

    /// Lazy replay of stored events from `from_seq`.
    #[must_use]
    pub fn replay(&self, session_id: &str, from_seq: u64) -> EventReplay {
        self.events
            .replay(session_id, from_seq)
            .page_size(self.supervisor.config().replay_page_size)
    }

    /// Report sessions left resumable by a previous process, restarting
    /// them when configured to.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the scan fails.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        self.supervisor.recover().await
    }

    /// Start the hourly retention purge.
    #[must_use]
    pub fn spawn_retention(&self, retention_days: u32, cancel: CancellationToken) -> JoinHandle<()> {
        retention::spawn_retention_task(Arc::clone(&self.db), retention_days, cancel)
    }

    /// Stop all live executions, leaving their sessions resumable.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }
}
