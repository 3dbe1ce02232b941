use rusqlite::{params, OptionalExtension, Row};

use crate::db::models::{DeployEvent, NewDeployEvent};
use crate::db::{self, DbPool};
use crate::error::AppError;

fn row_to_deploy(row: &Row) -> rusqlite::Result<DeployEvent> {
    Ok(DeployEvent {
        id: row.get("id")?,
        deployment_id: row.get("deployment_id")?,
        commit_sha: row.get("commit_sha")?,
        commit_message: row.get("commit_message")?,
        branch: row.get("branch")?,
        status: row.get("status")?,
        url: row.get("url")?,
        deployed_at: row.get("deployed_at")?,
        created_at: row.get("created_at")?,
    })
}

/// Insert or refresh a deployment keyed by its platform id. Webhooks for the
/// same deployment arrive once per state change.
pub fn upsert(pool: &DbPool, input: NewDeployEvent) -> Result<DeployEvent, AppError> {
    if input.deployment_id.trim().is_empty() {
        return Err(AppError::Validation("Deployment id cannot be empty".into()));
    }

    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO deploy_events
         (id, deployment_id, commit_sha, commit_message, branch, status, url, deployed_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(deployment_id) DO UPDATE SET
            status = excluded.status,
            commit_sha = COALESCE(excluded.commit_sha, deploy_events.commit_sha),
            commit_message = COALESCE(excluded.commit_message, deploy_events.commit_message),
            branch = COALESCE(excluded.branch, deploy_events.branch),
            url = COALESCE(excluded.url, deploy_events.url),
            deployed_at = excluded.deployed_at",
        params![
            uuid::Uuid::new_v4().to_string(),
            input.deployment_id,
            input.commit_sha,
            input.commit_message,
            input.branch,
            input.status,
            input.url,
            input.deployed_at,
            db::now(),
        ],
    )?;
    conn.query_row(
        "SELECT * FROM deploy_events WHERE deployment_id = ?1",
        params![input.deployment_id],
        row_to_deploy,
    )
    .map_err(AppError::Database)
}

/// The most recent deployment at or after `since`.
pub fn latest_since(pool: &DbPool, since: &str) -> Result<Option<DeployEvent>, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM deploy_events WHERE deployed_at >= ?1 ORDER BY deployed_at DESC LIMIT 1",
        params![since],
        row_to_deploy,
    )
    .optional()
    .map_err(AppError::Database)
}
