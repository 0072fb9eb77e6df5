//! Session repository for `SQLite` persistence.
//!
//! Sessions are written only through the event log; this repository creates
//! them and reads the projection back.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::event::EventPayload;
use crate::models::message::{Message, Role, ToolCall};
use crate::models::session::{PendingApproval, Session, SessionStatus};
use crate::{AppError, Result};

use super::db::Database;
use super::event_repo;

/// Repository wrapper around `SQLite` for session records.
#[derive(Clone)]
pub struct SessionRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    title: Option<String>,
    status: String,
    created_at: String,
    updated_at: String,
    finished_at: Option<String>,
    pending_approval_id: Option<String>,
    pending_tool_call_id: Option<String>,
    pending_tool_name: Option<String>,
    pending_arguments: Option<String>,
}

impl SessionRow {
    fn into_session(self, messages: Vec<Message>) -> Result<Session> {
        let status = parse_session_status(&self.status)?;
        let pending_approval = match (
            self.pending_approval_id,
            self.pending_tool_call_id,
            self.pending_tool_name,
            self.pending_arguments,
        ) {
            (Some(approval_id), Some(id), Some(name), Some(arguments)) => Some(PendingApproval {
                approval_id,
                tool_call: ToolCall {
                    id,
                    name,
                    arguments: serde_json::from_str(&arguments)?,
                },
            }),
            (None, ..) => None,
            (Some(approval_id), ..) => {
                return Err(AppError::Db(format!(
                    "pending approval {approval_id} has no approval record"
                )))
            }
        };

        Ok(Session {
            id: self.id,
            title: self.title,
            status,
            pending_approval,
            messages,
            created_at: parse_timestamp(&self.created_at, "created_at")?,
            updated_at: parse_timestamp(&self.updated_at, "updated_at")?,
            finished_at: self
                .finished_at
                .as_deref()
                .map(|s| parse_timestamp(s, "finished_at"))
                .transpose()?,
        })
    }
}

/// Internal row struct for message deserialization.
#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    role: String,
    content: String,
    tool_calls: String,
    tool_call_id: Option<String>,
    created_at: String,
}

impl MessageRow {
    fn into_message(self) -> Result<Message> {
        Ok(Message {
            id: self.id,
            role: parse_role(&self.role)?,
            content: self.content,
            created_at: parse_timestamp(&self.created_at, "created_at")?,
            tool_calls: serde_json::from_str(&self.tool_calls)?,
            tool_call_id: self.tool_call_id,
        })
    }
}

const SESSION_SELECT: &str = "SELECT s.id, s.title, s.status, s.created_at, s.updated_at,
        s.finished_at, s.pending_approval_id,
        a.tool_call_id AS pending_tool_call_id, a.tool_name AS pending_tool_name,
        a.arguments AS pending_arguments
     FROM session s LEFT JOIN approval_request a ON a.id = s.pending_approval_id";

pub(super) fn parse_timestamp(raw: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {field}: {e}")))
}

pub(super) fn parse_session_status(s: &str) -> Result<SessionStatus> {
    match s {
        "active" => Ok(SessionStatus::Active),
        "waiting_approval" => Ok(SessionStatus::WaitingApproval),
        "completed" => Ok(SessionStatus::Completed),
        "error" => Ok(SessionStatus::Error),
        other => Err(AppError::Db(format!("invalid session status: {other}"))),
    }
}

fn parse_role(s: &str) -> Result<Role> {
    match s {
        "system" => Ok(Role::System),
        "user" => Ok(Role::User),
        "assistant" => Ok(Role::Assistant),
        "tool" => Ok(Role::Tool),
        other => Err(AppError::Db(format!("invalid message role: {other}"))),
    }
}

impl SessionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new session and record its creation and initial messages as events.
    ///
    /// Runs in a single transaction: either the session exists with its full
    /// initial history or not at all.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if `session` is not `active`, or a
    /// persistence error if the insert fails.
    pub async fn create(&self, session: &Session) -> Result<Session> {
        if session.status != SessionStatus::Active || session.pending_approval.is_some() {
            return Err(AppError::InvalidTransition(
                "new sessions must start active without a pending approval".into(),
            ));
        }

        let mut tx = self.db.begin().await?;
        sqlx::query(
            "INSERT INTO session (id, title, status, pending_approval_id, created_at,
             updated_at, finished_at)
             VALUES (?1, ?2, 'active', NULL, ?3, ?4, NULL)",
        )
        .bind(&session.id)
        .bind(&session.title)
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        event_repo::append_in(
            &mut tx,
            &session.id,
            EventPayload::SessionCreated {
                title: session.title.clone(),
            },
        )
        .await?;
        for message in &session.messages {
            event_repo::append_in(
                &mut tx,
                &session.id,
                EventPayload::MessageAppended {
                    message: message.clone(),
                },
            )
            .await?;
        }
        tx.commit().await?;

        self.get_by_id(&session.id)
            .await?
            .ok_or_else(|| AppError::Db("failed to create session".into()))
    }

    /// Retrieve a session with its full message history.
    ///
    /// Returns `Ok(None)` if the session does not exist.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the query or decoding fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!("{SESSION_SELECT} WHERE s.id = ?1"))
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;

        match row {
            Some(row) => {
                let messages = self.messages(id).await?;
                row.into_session(messages).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Retrieve only the status of a session.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the query fails.
    pub async fn get_status(&self, id: &str) -> Result<Option<SessionStatus>> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM session WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;

        status.as_deref().map(parse_session_status).transpose()
    }

    /// Message history of a session in insertion order.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the query or decoding fails.
    pub async fn messages(&self, id: &str) -> Result<Vec<Message>> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, role, content, tool_calls, tool_call_id, created_at
             FROM message WHERE session_id = ?1 ORDER BY position",
        )
        .bind(id)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(MessageRow::into_message).collect()
    }

    /// List sessions, optionally filtered by status, newest first.
    ///
    /// Returned sessions carry no messages; use [`Self::get_by_id`] for history.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the query fails.
    pub async fn list(&self, status: Option<SessionStatus>) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> = match status {
            Some(status) => {
                sqlx::query_as(&format!(
                    "{SESSION_SELECT} WHERE s.status = ?1 ORDER BY s.created_at DESC"
                ))
                .bind(status.as_str())
                .fetch_all(self.db.as_ref())
                .await?
            }
            None => {
                sqlx::query_as(&format!("{SESSION_SELECT} ORDER BY s.created_at DESC"))
                    .fetch_all(self.db.as_ref())
                    .await?
            }
        };

        rows.into_iter()
            .map(|row| row.into_session(Vec::new()))
            .collect()
    }

    /// Sessions that may be resumed: `active` or `waiting_approval`.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the query fails.
    pub async fn list_resumable(&self) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "{SESSION_SELECT} WHERE s.status IN ('active', 'waiting_approval')
             ORDER BY s.created_at"
        ))
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter()
            .map(|row| row.into_session(Vec::new()))
            .collect()
    }
}
