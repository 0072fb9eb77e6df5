//! Retention service for time-based data purge.
//!
//! Deletes the event log, messages and approval requests of sessions that
//! reached a terminal status more than `retention_days` ago, then the
//! sessions themselves.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::db::Database;
use crate::Result;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Spawn the retention purge background task.
///
/// The task runs hourly until `cancel` fires.
#[must_use]
pub fn spawn_retention_task(
    db: Arc<Database>,
    retention_days: u32,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("retention task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = purge(&db, retention_days).await {
                        error!(%err, "retention purge failed");
                    }
                }
            }
        }
    })
}

/// Purge terminal sessions finished more than `retention_days` ago.
///
/// Returns the number of sessions removed.
///
/// # Errors
///
/// Returns a persistence error if any delete fails; the purge is
/// transactional, so nothing is removed in that case.
pub async fn purge(db: &Database, retention_days: u32) -> Result<u64> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
    let cutoff_str = cutoff.to_rfc3339();

    let mut tx = db.begin().await?;

    let child_tables = ["event", "message", "approval_request"];
    for table in child_tables {
        // `table` comes from the fixed list above.
        let query = format!(
            "DELETE FROM {table} WHERE session_id IN
             (SELECT id FROM session
              WHERE status IN ('completed', 'error') AND finished_at < ?1)"
        );
        sqlx::query(&query)
            .bind(&cutoff_str)
            .execute(&mut *tx)
            .await?;
    }

    let removed = sqlx::query(
        "DELETE FROM session
         WHERE status IN ('completed', 'error') AND finished_at < ?1",
    )
    .bind(&cutoff_str)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    tx.commit().await?;

    info!(retention_days, removed, "retention purge completed");
    Ok(removed)
}
