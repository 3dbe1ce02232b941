use rusqlite::{params, Row};

use crate::db::models::HealLogEntry;
use crate::db::{self, DbPool};
use crate::error::AppError;

fn row_to_entry(row: &Row) -> rusqlite::Result<HealLogEntry> {
    Ok(HealLogEntry {
        id: row.get("id")?,
        report_id: row.get("report_id")?,
        pattern_id: row.get("pattern_id")?,
        action: row.get("action")?,
        result: row.get("result")?,
        details: row.get("details")?,
        created_at: row.get("created_at")?,
    })
}

pub fn record(
    pool: &DbPool,
    report_id: Option<&str>,
    pattern_id: Option<&str>,
    action: &str,
    success: bool,
    details: &str,
) -> Result<(), AppError> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO heal_log (id, report_id, pattern_id, action, result, details, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            uuid::Uuid::new_v4().to_string(),
            report_id,
            pattern_id,
            action,
            if success { "success" } else { "failure" },
            details,
            db::now(),
        ],
    )?;
    Ok(())
}

pub fn list_for_report(pool: &DbPool, report_id: &str) -> Result<Vec<HealLogEntry>, AppError> {
    let conn = pool.get()?;
    let mut stmt =
        conn.prepare("SELECT * FROM heal_log WHERE report_id = ?1 ORDER BY created_at ASC")?;
    let rows = stmt.query_map(params![report_id], row_to_entry)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

pub fn prune(pool: &DbPool, before: &str) -> Result<usize, AppError> {
    let conn = pool.get()?;
    let rows = conn.execute("DELETE FROM heal_log WHERE created_at < ?1", params![before])?;
    Ok(rows)
}
