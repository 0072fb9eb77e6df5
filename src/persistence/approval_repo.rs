//! Approval request repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::Utc;
use sqlx::SqliteConnection;

use crate::models::approval::{ApprovalRequest, ApprovalStatus, Decision};
use crate::models::message::ToolCall;
use crate::{AppError, Result};

use super::db::Database;
use super::session_repo::parse_timestamp;

/// Repository wrapper around `SQLite` for approval request records.
///
/// Requests are created and applied by the event log projection; this
/// repository records decisions and reads requests back.
#[derive(Clone)]
pub struct ApprovalRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct ApprovalRow {
    id: String,
    session_id: String,
    tool_call_id: String,
    tool_name: String,
    arguments: String,
    status: String,
    created_at: String,
    decided_at: Option<String>,
    applied_at: Option<String>,
}

impl ApprovalRow {
    /// Convert a database row into the domain model.
    fn into_approval(self) -> Result<ApprovalRequest> {
        let status = parse_approval_status(&self.status)?;
        let created_at = parse_timestamp(&self.created_at, "created_at")?;
        let decided_at = self
            .decided_at
            .as_deref()
            .map(|s| parse_timestamp(s, "decided_at"))
            .transpose()?;
        let applied_at = self
            .applied_at
            .as_deref()
            .map(|s| parse_timestamp(s, "applied_at"))
            .transpose()?;

        Ok(ApprovalRequest {
            id: self.id,
            session_id: self.session_id,
            tool_call: ToolCall {
                id: self.tool_call_id,
                name: self.tool_name,
                arguments: serde_json::from_str(&self.arguments)?,
            },
            status,
            created_at,
            decided_at,
            applied_at,
        })
    }
}

fn parse_approval_status(s: &str) -> Result<ApprovalStatus> {
    match s {
        "pending" => Ok(ApprovalStatus::Pending),
        "approved" => Ok(ApprovalStatus::Approved),
        "rejected" => Ok(ApprovalStatus::Rejected),
        "cancelled" => Ok(ApprovalStatus::Cancelled),
        other => Err(AppError::Db(format!("invalid approval status: {other}"))),
    }
}

pub(super) fn approval_status_str(s: ApprovalStatus) -> &'static str {
    match s {
        ApprovalStatus::Pending => "pending",
        ApprovalStatus::Approved => "approved",
        ApprovalStatus::Rejected => "rejected",
        ApprovalStatus::Cancelled => "cancelled",
    }
}

/// Insert an approval request inside an open transaction.
///
/// A request inserted with a decided status is also marked applied at `decided_at`.
pub(super) async fn insert_in(
    conn: &mut SqliteConnection,
    session_id: &str,
    approval_id: &str,
    tool_call: &ToolCall,
    status: ApprovalStatus,
    decided_at: Option<&str>,
) -> Result<()> {
    let created_at = Utc::now().to_rfc3339();
    let arguments = serde_json::to_string(&tool_call.arguments)?;

    sqlx::query(
        "INSERT INTO approval_request (id, session_id, tool_call_id, tool_name, arguments,
         status, created_at, decided_at, applied_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
    )
    .bind(approval_id)
    .bind(session_id)
    .bind(&tool_call.id)
    .bind(&tool_call.name)
    .bind(&arguments)
    .bind(approval_status_str(status))
    .bind(&created_at)
    .bind(decided_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

impl ApprovalRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Retrieve an approval request by identifier.
    ///
    /// Returns `Ok(None)` if the request does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<ApprovalRequest>> {
        let row: Option<ApprovalRow> =
            sqlx::query_as("SELECT * FROM approval_request WHERE id = ?1")
                .bind(id)
                .fetch_optional(self.db.as_ref())
                .await?;

        row.map(ApprovalRow::into_approval).transpose()
    }

    /// Retrieve the request referenced by a session's pending-approval marker.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_pending_for_session(
        &self,
        session_id: &str,
    ) -> Result<Option<ApprovalRequest>> {
        let row: Option<ApprovalRow> = sqlx::query_as(
            "SELECT a.* FROM approval_request a
             JOIN session s ON s.pending_approval_id = a.id
             WHERE s.id = ?1",
        )
        .bind(session_id)
        .fetch_optional(self.db.as_ref())
        .await?;

        row.map(ApprovalRow::into_approval).transpose()
    }

    /// Latest request recorded for a tool call, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_for_tool_call(
        &self,
        session_id: &str,
        tool_call_id: &str,
    ) -> Result<Option<ApprovalRequest>> {
        let row: Option<ApprovalRow> = sqlx::query_as(
            "SELECT * FROM approval_request
             WHERE session_id = ?1 AND tool_call_id = ?2
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(session_id)
        .bind(tool_call_id)
        .fetch_optional(self.db.as_ref())
        .await?;

        row.map(ApprovalRow::into_approval).transpose()
    }

    /// Durably record a decision for a pending request.
    ///
    /// The update is conditional on the request still being `pending`, so at
    /// most one decision is ever accepted per request.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the request does not exist,
    /// `AppError::AlreadyDecided` if a decision was already accepted, and
    /// `AppError::NoPendingApproval` if the request was cancelled.
    pub async fn record_decision(&self, id: &str, decision: Decision) -> Result<ApprovalRequest> {
        let status = approval_status_str(ApprovalStatus::from_decision(decision));
        let now = Utc::now().to_rfc3339();

        let updated = sqlx::query(
            "UPDATE approval_request SET status = ?1, decided_at = ?2
             WHERE id = ?3 AND status = 'pending'",
        )
        .bind(status)
        .bind(&now)
        .bind(id)
        .execute(self.db.as_ref())
        .await?;

        let current = self
            .get_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("approval request {id} not found")))?;

        if updated.rows_affected() == 1 {
            return Ok(current);
        }
        match current.status {
            ApprovalStatus::Cancelled => Err(AppError::NoPendingApproval(format!(
                "approval request {id} was cancelled"
            ))),
            _ => Err(AppError::AlreadyDecided(format!(
                "approval request {id} already {}",
                approval_status_str(current.status)
            ))),
        }
    }

    /// List all requests recorded for a session, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_for_session(&self, session_id: &str) -> Result<Vec<ApprovalRequest>> {
        let rows: Vec<ApprovalRow> = sqlx::query_as(
            "SELECT * FROM approval_request WHERE session_id = ?1 ORDER BY created_at",
        )
        .bind(session_id)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(ApprovalRow::into_approval).collect()
    }

    /// Decisions recorded while no execution was live and not yet applied.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_decided_unapplied(&self) -> Result<Vec<ApprovalRequest>> {
        let rows: Vec<ApprovalRow> = sqlx::query_as(
            "SELECT a.* FROM approval_request a
             JOIN session s ON s.pending_approval_id = a.id
             WHERE s.status = 'waiting_approval'
               AND a.status IN ('approved', 'rejected')
               AND a.applied_at IS NULL
             ORDER BY a.decided_at",
        )
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(ApprovalRow::into_approval).collect()
    }
}
