use rusqlite::{params, Row};

use crate::db::models::EscalationLog;
use crate::db::{self, DbPool};
use crate::error::AppError;

fn row_to_log(row: &Row) -> rusqlite::Result<EscalationLog> {
    Ok(EscalationLog {
        id: row.get("id")?,
        incident_id: row.get("incident_id")?,
        channel: row.get("channel")?,
        recipient: row.get("recipient")?,
        subject: row.get("subject")?,
        status: row.get("status")?,
        error_message: row.get("error_message")?,
        attempts: row.get("attempts")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub fn record(
    pool: &DbPool,
    incident_id: &str,
    channel: &str,
    recipient: &str,
    subject: &str,
    error_message: Option<&str>,
) -> Result<EscalationLog, AppError> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = db::now();
    let status = if error_message.is_none() { "sent" } else { "failed" };
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO escalation_log
         (id, incident_id, channel, recipient, subject, status, error_message, attempts, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?8)",
        params![id, incident_id, channel, recipient, subject, status, error_message, now],
    )?;
    conn.query_row(
        "SELECT * FROM escalation_log WHERE id = ?1",
        params![id],
        row_to_log,
    )
    .map_err(AppError::Database)
}

/// Deliveries that succeeded at or after `since` (by last update, so retried
/// sends count in the hour they went out).
pub fn count_sent_since(pool: &DbPool, since: &str) -> Result<i64, AppError> {
    let conn = pool.get()?;
    let count = conn.query_row(
        "SELECT COUNT(*) FROM escalation_log WHERE status = 'sent' AND updated_at >= ?1",
        params![since],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Failed deliveries created at or after `since` with attempts left, oldest first.
pub fn get_retryable(
    pool: &DbPool,
    since: &str,
    max_attempts: i64,
    limit: usize,
) -> Result<Vec<EscalationLog>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM escalation_log
         WHERE status = 'failed' AND created_at >= ?1 AND attempts < ?2
         ORDER BY created_at ASC
         LIMIT ?3",
    )?;
    let rows = stmt.query_map(params![since, max_attempts, limit as i64], row_to_log)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

/// Record a retry attempt on an existing entry. Success flips it to `sent`.
pub fn record_retry(pool: &DbPool, id: &str, error_message: Option<&str>) -> Result<(), AppError> {
    let status = if error_message.is_none() { "sent" } else { "failed" };
    let conn = pool.get()?;
    conn.execute(
        "UPDATE escalation_log
         SET status = ?1, error_message = ?2, attempts = attempts + 1, updated_at = ?3
         WHERE id = ?4",
        params![status, error_message, db::now(), id],
    )?;
    Ok(())
}

pub fn list_for_incident(pool: &DbPool, incident_id: &str) -> Result<Vec<EscalationLog>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM escalation_log WHERE incident_id = ?1 ORDER BY created_at ASC",
    )?;
    let rows = stmt.query_map(params![incident_id], row_to_log)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

pub fn prune(pool: &DbPool, before: &str) -> Result<usize, AppError> {
    let conn = pool.get()?;
    let rows = conn.execute("DELETE FROM escalation_log WHERE created_at < ?1", params![before])?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;

    #[test]
    fn test_retry_flips_same_row() {
        let pool = init_test_db().unwrap();
        let failed = record(&pool, "inc-1", "email", "ops@example.com", "s", Some("503")).unwrap();
        assert_eq!(failed.status, "failed");

        let since = db::since(chrono::Duration::hours(24));
        assert_eq!(get_retryable(&pool, &since, 3, 5).unwrap().len(), 1);
        assert_eq!(count_sent_since(&pool, &since).unwrap(), 0);

        record_retry(&pool, &failed.id, None).unwrap();
        let rows = list_for_incident(&pool, "inc-1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "sent");
        assert_eq!(rows[0].attempts, 2);
        assert!(rows[0].error_message.is_none());
        assert_eq!(count_sent_since(&pool, &since).unwrap(), 1);
    }

    #[test]
    fn test_retryable_respects_attempt_cap() {
        let pool = init_test_db().unwrap();
        let failed = record(&pool, "inc-2", "email", "ops@example.com", "s", Some("503")).unwrap();
        record_retry(&pool, &failed.id, Some("503")).unwrap();
        record_retry(&pool, &failed.id, Some("503")).unwrap();
        let since = db::since(chrono::Duration::hours(24));
        assert!(get_retryable(&pool, &since, 3, 5).unwrap().is_empty());
    }
}
