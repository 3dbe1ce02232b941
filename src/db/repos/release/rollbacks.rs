use rusqlite::{params, Row};

use crate::db::models::{RollbackEvent, RollbackStatus};
use crate::db::{self, DbPool};
use crate::error::AppError;

fn row_to_rollback(row: &Row) -> rusqlite::Result<RollbackEvent> {
    Ok(RollbackEvent {
        id: row.get("id")?,
        deploy_event_id: row.get("deploy_event_id")?,
        deployment_id: row.get("deployment_id")?,
        incident_id: row.get("incident_id")?,
        target_deployment_id: row.get("target_deployment_id")?,
        status: row.get("status")?,
        reason: row.get("reason")?,
        created_at: row.get("created_at")?,
    })
}

/// Whether any rollback (of any outcome) was already recorded for `deployment_id`.
pub fn exists_for_deployment(pool: &DbPool, deployment_id: &str) -> Result<bool, AppError> {
    let conn = pool.get()?;
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM rollback_events WHERE deployment_id = ?1",
        params![deployment_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

#[allow(clippy::too_many_arguments)]
pub fn record(
    pool: &DbPool,
    deploy_event_id: Option<&str>,
    deployment_id: &str,
    incident_id: Option<&str>,
    target_deployment_id: Option<&str>,
    status: RollbackStatus,
    reason: &str,
) -> Result<RollbackEvent, AppError> {
    let id = uuid::Uuid::new_v4().to_string();
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO rollback_events
         (id, deploy_event_id, deployment_id, incident_id, target_deployment_id, status, reason, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            id,
            deploy_event_id,
            deployment_id,
            incident_id,
            target_deployment_id,
            status.as_str(),
            reason,
            db::now(),
        ],
    )?;
    conn.query_row(
        "SELECT * FROM rollback_events WHERE id = ?1",
        params![id],
        row_to_rollback,
    )
    .map_err(AppError::Database)
}

pub fn list_for_deployment(pool: &DbPool, deployment_id: &str) -> Result<Vec<RollbackEvent>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM rollback_events WHERE deployment_id = ?1 ORDER BY created_at ASC",
    )?;
    let rows = stmt.query_map(params![deployment_id], row_to_rollback)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}
