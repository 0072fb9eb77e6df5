//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS` and are safe to
//! re-run on every startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// The `event` table is the source of truth; `session`, `message` and
/// `approval_request` are maintained as its projection.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS session (
    id                  TEXT PRIMARY KEY NOT NULL,
    title               TEXT,
    status              TEXT NOT NULL CHECK(status IN ('active','waiting_approval','completed','error')),
    pending_approval_id TEXT,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL,
    finished_at         TEXT,
    CHECK((status = 'waiting_approval') = (pending_approval_id IS NOT NULL))
);

CREATE TABLE IF NOT EXISTS event (
    session_id      TEXT NOT NULL,
    seq             INTEGER NOT NULL CHECK(seq >= 0),
    kind            TEXT NOT NULL,
    payload         TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    PRIMARY KEY (session_id, seq)
);

CREATE TABLE IF NOT EXISTS message (
    session_id      TEXT NOT NULL,
    position        INTEGER NOT NULL,
    id              TEXT NOT NULL,
    role            TEXT NOT NULL CHECK(role IN ('system','user','assistant','tool')),
    content         TEXT NOT NULL,
    tool_calls      TEXT NOT NULL DEFAULT '[]',
    tool_call_id    TEXT,
    created_at      TEXT NOT NULL,
    PRIMARY KEY (session_id, position)
);

CREATE TABLE IF NOT EXISTS approval_request (
    id              TEXT PRIMARY KEY NOT NULL,
    session_id      TEXT NOT NULL,
    tool_call_id    TEXT NOT NULL,
    tool_name       TEXT NOT NULL,
    arguments       TEXT NOT NULL,
    status          TEXT NOT NULL CHECK(status IN ('pending','approved','rejected','cancelled')),
    created_at      TEXT NOT NULL,
    decided_at      TEXT,
    applied_at      TEXT
);

CREATE INDEX IF NOT EXISTS idx_session_status ON session(status);
CREATE INDEX IF NOT EXISTS idx_approval_session ON approval_request(session_id);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
