//! Append-only event log and the session projection maintained with it.
//!
//! Every append runs in one transaction that assigns the next sequence
//! number, records the event and updates the `session`, `message` and
//! `approval_request` tables. A rejected projection (invalid status
//! transition, decision applied twice) rolls the append back.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use sqlx::SqliteConnection;
use tracing::debug;

use crate::models::approval::{ApprovalStatus, Decision};
use crate::models::event::{Event, EventPayload};
use crate::models::message::{Message, ToolCall};
use crate::models::session::{transition_allowed, PendingApproval, SessionStatus};
use crate::{AppError, Result};

use super::approval_repo::{self, approval_status_str};
use super::db::Database;
use super::session_repo::{parse_session_status, parse_timestamp};

const DEFAULT_PAGE_SIZE: u32 = 256;

/// Repository for the per-session event log.
#[derive(Clone)]
pub struct EventRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct EventRow {
    session_id: String,
    seq: i64,
    payload: String,
    created_at: String,
}

impl EventRow {
    fn into_event(self) -> Result<Event> {
        let seq = u64::try_from(self.seq)
            .map_err(|_| AppError::Db(format!("invalid seq: {}", self.seq)))?;
        let payload: EventPayload = serde_json::from_str(&self.payload)?;
        let created_at = parse_timestamp(&self.created_at, "created_at")?;
        Ok(Event {
            session_id: self.session_id,
            seq,
            payload,
            created_at,
        })
    }
}

fn seq_param(seq: u64) -> Result<i64> {
    i64::try_from(seq).map_err(|_| AppError::Db(format!("seq out of range: {seq}")))
}

impl EventRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Durably append `payload` to the session's log and return the stored event.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session,
    /// `AppError::InvalidTransition` or `AppError::AlreadyDecided` when the
    /// projection rejects the event, and `AppError::StoreUnavailable` when the
    /// database cannot be reached.
    pub async fn append(&self, session_id: &str, payload: EventPayload) -> Result<Event> {
        let mut tx = self.db.begin().await?;
        let event = append_in(&mut tx, session_id, payload).await?;
        tx.commit().await?;
        debug!(
            session_id,
            seq = event.seq,
            kind = event.payload.kind(),
            "event appended"
        );
        Ok(event)
    }

    /// Lazily replay the session's events starting at `from_seq`.
    ///
    /// Each replay is an independent read; nothing is fetched until the
    /// first call to [`EventReplay::next`].
    #[must_use]
    pub fn replay(&self, session_id: &str, from_seq: u64) -> EventReplay {
        EventReplay {
            db: Arc::clone(&self.db),
            session_id: session_id.to_owned(),
            next_seq: from_seq,
            until: None,
            page_size: DEFAULT_PAGE_SIZE,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Load every stored event for a session in sequence order.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the query or payload decoding fails.
    pub async fn list(&self, session_id: &str) -> Result<Vec<Event>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT session_id, seq, payload, created_at FROM event
             WHERE session_id = ?1 ORDER BY seq",
        )
        .bind(session_id)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(EventRow::into_event).collect()
    }

    /// Highest stored sequence number for a session, if it has any events.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the query fails.
    pub async fn last_seq(&self, session_id: &str) -> Result<Option<u64>> {
        let last: Option<i64> = sqlx::query_scalar("SELECT MAX(seq) FROM event WHERE session_id = ?1")
            .bind(session_id)
            .fetch_one(self.db.as_ref())
            .await?;

        last.map(|seq| u64::try_from(seq).map_err(|_| AppError::Db(format!("invalid seq: {seq}"))))
            .transpose()
    }
}

/// Lazy, paged, restartable read over a session's stored events.
pub struct EventReplay {
    db: Arc<Database>,
    session_id: String,
    next_seq: u64,
    until: Option<u64>,
    page_size: u32,
    buffer: VecDeque<Event>,
    exhausted: bool,
}

impl EventReplay {
    /// Number of events fetched per query.
    #[must_use]
    pub fn page_size(mut self, size: u32) -> Self {
        self.page_size = size.max(1);
        self
    }

    /// Stop after the event with sequence `last`, inclusive.
    #[must_use]
    pub fn until(mut self, last: Option<u64>) -> Self {
        self.until = last;
        self
    }

    /// Sequence number of the next event this replay will yield.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.next_seq
    }

    /// Yield the next stored event, or `None` once the replay is exhausted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StoreUnavailable` if the database cannot be reached,
    /// or `AppError::Db` if a stored payload cannot be decoded.
    pub async fn next(&mut self) -> Result<Option<Event>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fill().await?;
        }
        let Some(event) = self.buffer.pop_front() else {
            return Ok(None);
        };
        self.next_seq = event.seq + 1;
        Ok(Some(event))
    }

    async fn fill(&mut self) -> Result<()> {
        let from = seq_param(self.next_seq)?;
        let until = self.until.map(seq_param).transpose()?.unwrap_or(i64::MAX);
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT session_id, seq, payload, created_at FROM event
             WHERE session_id = ?1 AND seq >= ?2 AND seq <= ?3
             ORDER BY seq LIMIT ?4",
        )
        .bind(&self.session_id)
        .bind(from)
        .bind(until)
        .bind(i64::from(self.page_size))
        .fetch_all(self.db.as_ref())
        .await?;

        if rows.len() < usize::try_from(self.page_size).unwrap_or(usize::MAX) {
            self.exhausted = true;
        }
        for row in rows {
            self.buffer.push_back(row.into_event()?);
        }
        Ok(())
    }
}

/// Append an event inside an open transaction.
pub(super) async fn append_in(
    conn: &mut SqliteConnection,
    session_id: &str,
    payload: EventPayload,
) -> Result<Event> {
    let created_at = Utc::now();
    let now = created_at.to_rfc3339();

    // Take the write lock before reading the sequence.
    let touched = sqlx::query("UPDATE session SET updated_at = ?1 WHERE id = ?2")
        .bind(&now)
        .bind(session_id)
        .execute(&mut *conn)
        .await?;
    if touched.rows_affected() == 0 {
        return Err(AppError::NotFound(format!("session {session_id} not found")));
    }

    let next: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(seq) + 1, 0) FROM event WHERE session_id = ?1")
            .bind(session_id)
            .fetch_one(&mut *conn)
            .await?;

    project(conn, session_id, &payload, &now).await?;

    let encoded = serde_json::to_string(&payload)?;
    sqlx::query(
        "INSERT INTO event (session_id, seq, kind, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(session_id)
    .bind(next)
    .bind(payload.kind())
    .bind(&encoded)
    .bind(&now)
    .execute(&mut *conn)
    .await?;

    let seq = u64::try_from(next).map_err(|_| AppError::Db(format!("invalid seq: {next}")))?;
    Ok(Event {
        session_id: session_id.to_owned(),
        seq,
        payload,
        created_at,
    })
}

async fn project(
    conn: &mut SqliteConnection,
    session_id: &str,
    payload: &EventPayload,
    now: &str,
) -> Result<()> {
    match payload {
        EventPayload::MessageAppended { message } | EventPayload::ToolResult { message } => {
            insert_message(conn, session_id, message).await
        }
        EventPayload::StatusChanged {
            status,
            pending_approval,
        } => apply_status(conn, session_id, *status, pending_approval.as_ref(), now).await,
        EventPayload::ApprovalDecided {
            approval_id,
            tool_call,
            decision,
            message,
        } => {
            apply_decision(conn, session_id, approval_id, tool_call, *decision, now).await?;
            insert_message(conn, session_id, message).await
        }
        EventPayload::SessionCreated { .. }
        | EventPayload::ToolCallRequested { .. }
        | EventPayload::StreamEnded { .. }
        | EventPayload::Error { .. } => Ok(()),
    }
}

async fn current_state(
    conn: &mut SqliteConnection,
    session_id: &str,
) -> Result<(SessionStatus, Option<String>)> {
    let (status, marker): (String, Option<String>) =
        sqlx::query_as("SELECT status, pending_approval_id FROM session WHERE id = ?1")
            .bind(session_id)
            .fetch_one(&mut *conn)
            .await?;
    Ok((parse_session_status(&status)?, marker))
}

async fn apply_status(
    conn: &mut SqliteConnection,
    session_id: &str,
    next: SessionStatus,
    pending: Option<&PendingApproval>,
    now: &str,
) -> Result<()> {
    let (current, marker) = current_state(conn, session_id).await?;
    if !transition_allowed(current, next) {
        return Err(AppError::InvalidTransition(format!(
            "session {session_id}: {} -> {}",
            current.as_str(),
            next.as_str()
        )));
    }

    let new_marker = if next == SessionStatus::WaitingApproval {
        let pending = pending.ok_or_else(|| {
            AppError::InvalidTransition("waiting_approval requires a pending approval".into())
        })?;
        approval_repo::insert_in(
            conn,
            session_id,
            &pending.approval_id,
            &pending.tool_call,
            ApprovalStatus::Pending,
            None,
        )
        .await?;
        Some(pending.approval_id.clone())
    } else {
        None
    };

    if let Some(old) = marker.as_deref() {
        sqlx::query(
            "UPDATE approval_request SET status = 'cancelled'
             WHERE id = ?1 AND status = 'pending'",
        )
        .bind(old)
        .execute(&mut *conn)
        .await?;
    }

    let finished_at = next.is_terminal().then_some(now);
    sqlx::query(
        "UPDATE session SET status = ?1, pending_approval_id = ?2,
         finished_at = COALESCE(?3, finished_at) WHERE id = ?4",
    )
    .bind(next.as_str())
    .bind(&new_marker)
    .bind(finished_at)
    .bind(session_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn apply_decision(
    conn: &mut SqliteConnection,
    session_id: &str,
    approval_id: &str,
    tool_call: &ToolCall,
    decision: Decision,
    now: &str,
) -> Result<()> {
    let (current, marker) = current_state(conn, session_id).await?;
    let expected = ApprovalStatus::from_decision(decision);

    match current {
        SessionStatus::WaitingApproval => {
            if marker.as_deref() != Some(approval_id) {
                return Err(AppError::InvalidTransition(format!(
                    "approval {approval_id} is not pending for session {session_id}"
                )));
            }
            let (status, applied_at): (String, Option<String>) = sqlx::query_as(
                "SELECT status, applied_at FROM approval_request WHERE id = ?1",
            )
            .bind(approval_id)
            .fetch_one(&mut *conn)
            .await?;
            if applied_at.is_some() {
                return Err(AppError::AlreadyDecided(format!(
                    "decision for approval {approval_id} already applied"
                )));
            }
            if status != approval_status_str(expected) {
                return Err(AppError::InvalidTransition(format!(
                    "approval {approval_id} is {status}, not {}",
                    approval_status_str(expected)
                )));
            }
            sqlx::query(
                "UPDATE approval_request SET applied_at = ?1
                 WHERE id = ?2 AND applied_at IS NULL",
            )
            .bind(now)
            .bind(approval_id)
            .execute(&mut *conn)
            .await?;
        }
        SessionStatus::Active => {
            // Decided without suspension: recorded and applied at once.
            approval_repo::insert_in(conn, session_id, approval_id, tool_call, expected, Some(now))
                .await?;
        }
        SessionStatus::Completed | SessionStatus::Error => {
            return Err(AppError::InvalidTransition(format!(
                "session {session_id} is {}; decisions cannot be applied",
                current.as_str()
            )));
        }
    }

    sqlx::query(
        "UPDATE session SET status = 'active', pending_approval_id = NULL WHERE id = ?1",
    )
    .bind(session_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn insert_message(
    conn: &mut SqliteConnection,
    session_id: &str,
    message: &Message,
) -> Result<()> {
    let position: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM message WHERE session_id = ?1")
        .bind(session_id)
        .fetch_one(&mut *conn)
        .await?;
    let tool_calls = serde_json::to_string(&message.tool_calls)?;

    sqlx::query(
        "INSERT INTO message (session_id, position, id, role, content, tool_calls,
         tool_call_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )
    .bind(session_id)
    .bind(position)
    .bind(&message.id)
    .bind(message.role.as_str())
    .bind(&message.content)
    .bind(&tool_calls)
    .bind(&message.tool_call_id)
    .bind(message.created_at.to_rfc3339())
    .execute(&mut *conn)
    .await?;

    Ok(())
}
