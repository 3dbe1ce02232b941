use rusqlite::{params, Row};

use crate::db::models::SentinelRun;
use crate::db::{self, DbPool};
use crate::error::AppError;

fn row_to_run(row: &Row) -> rusqlite::Result<SentinelRun> {
    let counters: String = row.get("counters")?;
    let errors: String = row.get("errors")?;
    Ok(SentinelRun {
        id: row.get("id")?,
        trigger_source: row.get("trigger_source")?,
        status: row.get("status")?,
        counters: serde_json::from_str(&counters).unwrap_or_else(|_| serde_json::json!({})),
        errors: serde_json::from_str(&errors).unwrap_or_default(),
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
    })
}

pub fn start(pool: &DbPool, trigger_source: &str) -> Result<SentinelRun, AppError> {
    let id = uuid::Uuid::new_v4().to_string();
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO sentinel_runs (id, trigger_source, status, started_at)
         VALUES (?1, ?2, 'running', ?3)",
        params![id, trigger_source, db::now()],
    )?;
    drop(conn);
    get_by_id(pool, &id)
}

pub fn finish(
    pool: &DbPool,
    id: &str,
    status: &str,
    counters: &serde_json::Value,
    errors: &[String],
) -> Result<(), AppError> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE sentinel_runs SET status = ?1, counters = ?2, errors = ?3, finished_at = ?4
         WHERE id = ?5",
        params![
            status,
            counters.to_string(),
            serde_json::to_string(errors)?,
            db::now(),
            id,
        ],
    )?;
    Ok(())
}

pub fn get_by_id(pool: &DbPool, id: &str) -> Result<SentinelRun, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM sentinel_runs WHERE id = ?1",
        params![id],
        row_to_run,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => AppError::NotFound(format!("SentinelRun {id}")),
        other => AppError::Database(other),
    })
}

pub fn prune(pool: &DbPool, before: &str) -> Result<usize, AppError> {
    let conn = pool.get()?;
    let rows = conn.execute(
        "DELETE FROM sentinel_runs WHERE started_at < ?1 AND status != 'running'",
        params![before],
    )?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;

    #[test]
    fn test_run_lifecycle() {
        let pool = init_test_db().unwrap();
        let run = start(&pool, "manual").unwrap();
        assert_eq!(run.status, "running");
        assert!(run.finished_at.is_none());

        finish(
            &pool,
            &run.id,
            "completed",
            &serde_json::json!({ "reports_loaded": 3 }),
            &["diagnose: timeout".to_string()],
        )
        .unwrap();

        let done = get_by_id(&pool, &run.id).unwrap();
        assert_eq!(done.status, "completed");
        assert_eq!(done.counters["reports_loaded"], 3);
        assert_eq!(done.errors, vec!["diagnose: timeout"]);
        assert!(done.finished_at.is_some());
    }
}
