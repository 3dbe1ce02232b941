use rusqlite::{params, Row};

use crate::db::models::{ExecutionResult, NewSchemaHealLog, SchemaHealLog};
use crate::db::{self, DbPool};
use crate::error::AppError;

fn row_to_log(row: &Row) -> rusqlite::Result<SchemaHealLog> {
    Ok(SchemaHealLog {
        id: row.get("id")?,
        report_id: row.get("report_id")?,
        fingerprint: row.get("fingerprint")?,
        error_message: row.get("error_message")?,
        error_class: row.get("error_class")?,
        generated_sql: row.get("generated_sql")?,
        explanation: row.get("explanation")?,
        risk: row.get("risk")?,
        pre_state: row.get("pre_state")?,
        execution_result: ExecutionResult::parse(&row.get::<_, String>("execution_result")?),
        execution_error: row.get("execution_error")?,
        applied_at: row.get("applied_at")?,
        created_at: row.get("created_at")?,
    })
}

/// Append an entry. The result starts as `pending` unless given.
pub fn create(
    pool: &DbPool,
    input: NewSchemaHealLog,
    result: ExecutionResult,
    execution_error: Option<&str>,
) -> Result<SchemaHealLog, AppError> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = db::now();
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO schema_heal_log
         (id, report_id, fingerprint, error_message, error_class, generated_sql, explanation,
          risk, pre_state, execution_result, execution_error, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            id,
            input.report_id,
            input.fingerprint,
            input.error_message,
            input.error_class,
            input.generated_sql,
            input.explanation,
            input.risk,
            input.pre_state,
            result.as_str(),
            execution_error,
            now,
        ],
    )?;
    conn.query_row(
        "SELECT * FROM schema_heal_log WHERE id = ?1",
        params![id],
        row_to_log,
    )
    .map_err(AppError::Database)
}

/// Move a pending entry to its final result. `applied_at` is stamped on success.
pub fn set_result(
    pool: &DbPool,
    id: &str,
    result: ExecutionResult,
    execution_error: Option<&str>,
) -> Result<(), AppError> {
    let applied_at = (result == ExecutionResult::Success).then(db::now);
    let conn = pool.get()?;
    conn.execute(
        "UPDATE schema_heal_log
         SET execution_result = ?1, execution_error = ?2, applied_at = ?3
         WHERE id = ?4",
        params![result.as_str(), execution_error, applied_at, id],
    )?;
    Ok(())
}

/// All entries for `fingerprint` created at or after `since`, newest first.
pub fn history(pool: &DbPool, fingerprint: &str, since: &str) -> Result<Vec<SchemaHealLog>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM schema_heal_log
         WHERE fingerprint = ?1 AND created_at >= ?2
         ORDER BY created_at DESC",
    )?;
    let rows = stmt.query_map(params![fingerprint, since], row_to_log)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

pub fn list_all(pool: &DbPool) -> Result<Vec<SchemaHealLog>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare("SELECT * FROM schema_heal_log ORDER BY created_at ASC")?;
    let rows = stmt.query_map([], row_to_log)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;

    #[test]
    fn test_history_window_and_result_update() {
        let pool = init_test_db().unwrap();
        let entry = create(
            &pool,
            NewSchemaHealLog {
                fingerprint: "fp".into(),
                error_message: "column x does not exist".into(),
                ..Default::default()
            },
            ExecutionResult::Pending,
            None,
        )
        .unwrap();
        create(
            &pool,
            NewSchemaHealLog {
                fingerprint: "other".into(),
                error_message: "e".into(),
                ..Default::default()
            },
            ExecutionResult::Blocked,
            Some("denylist"),
        )
        .unwrap();

        set_result(&pool, &entry.id, ExecutionResult::Success, None).unwrap();

        let since = db::since(chrono::Duration::hours(24));
        let hist = history(&pool, "fp", &since).unwrap();
        assert_eq!(hist.len(), 1);
        assert_eq!(hist[0].execution_result, ExecutionResult::Success);
        assert!(hist[0].applied_at.is_some());
        assert_eq!(list_all(&pool).unwrap().len(), 2);
    }
}
