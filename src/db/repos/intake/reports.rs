use rusqlite::{params, params_from_iter, Row};

use crate::db::models::{ErrorReport, NewErrorReport, SchemaHealState};
use crate::db::{self, DbPool};
use crate::error::AppError;

fn row_to_report(row: &Row) -> rusqlite::Result<ErrorReport> {
    Ok(ErrorReport {
        id: row.get("id")?,
        tenant_id: row.get("tenant_id")?,
        description: row.get("description")?,
        console_errors: row.get("console_errors")?,
        page_url: row.get("page_url")?,
        status: row.get("status")?,
        created_at: row.get("created_at")?,
        processed_at: row.get("processed_at")?,
        matched_pattern_id: row.get("matched_pattern_id")?,
        diagnosis: row.get("diagnosis")?,
        diagnosis_fixable: row
            .get::<_, Option<i64>>("diagnosis_fixable")?
            .map(|v| v != 0),
        schema_heal_state: row.get("schema_heal_state")?,
        resolved_at: row.get("resolved_at")?,
    })
}

/// Insert a report. Normally done by the external error reporter.
pub fn create(pool: &DbPool, input: NewErrorReport) -> Result<ErrorReport, AppError> {
    if input.description.trim().is_empty() && input.console_errors.is_none() {
        return Err(AppError::Validation(
            "Error report needs a description or console errors".into(),
        ));
    }

    let id = uuid::Uuid::new_v4().to_string();
    let created_at = input.created_at.unwrap_or_else(db::now);

    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO error_reports (id, tenant_id, description, console_errors, page_url, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'open', ?6)",
        params![
            id,
            input.tenant_id,
            input.description,
            input.console_errors,
            input.page_url,
            created_at,
        ],
    )?;
    drop(conn);

    get_by_id(pool, &id)
}

pub fn get_by_id(pool: &DbPool, id: &str) -> Result<ErrorReport, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM error_reports WHERE id = ?1",
        params![id],
        row_to_report,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => AppError::NotFound(format!("ErrorReport {id}")),
        other => AppError::Database(other),
    })
}

/// Oldest-first batch of reports no run has claimed yet.
pub fn get_unprocessed(pool: &DbPool, limit: usize) -> Result<Vec<ErrorReport>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM error_reports
         WHERE processed_at IS NULL
         ORDER BY created_at ASC, id ASC
         LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], row_to_report)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

/// Claim a report as processed. Returns `false` when another run already
/// claimed it, in which case the caller must not act on the report.
pub fn mark_processed(
    pool: &DbPool,
    id: &str,
    matched_pattern_id: Option<&str>,
    diagnosis: &str,
    diagnosis_fixable: Option<bool>,
) -> Result<bool, AppError> {
    let now = db::now();
    let conn = pool.get()?;
    let rows = conn.execute(
        "UPDATE error_reports
         SET processed_at = ?1, matched_pattern_id = ?2, diagnosis = ?3, diagnosis_fixable = ?4
         WHERE id = ?5 AND processed_at IS NULL",
        params![now, matched_pattern_id, diagnosis, diagnosis_fixable, id],
    )?;
    Ok(rows > 0)
}

pub fn set_schema_heal_state(
    pool: &DbPool,
    id: &str,
    state: SchemaHealState,
) -> Result<(), AppError> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE error_reports SET schema_heal_state = ?1 WHERE id = ?2",
        params![state.as_str(), id],
    )?;
    Ok(())
}

/// Reports processed since `since` that the schema healer has not looked at
/// yet: either diagnosed as fixable, or matched to a `schema_heal` pattern.
pub fn get_schema_heal_candidates(
    pool: &DbPool,
    since: &str,
    limit: usize,
) -> Result<Vec<ErrorReport>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT r.*
         FROM error_reports r
         LEFT JOIN error_patterns p ON p.id = r.matched_pattern_id
         WHERE r.processed_at IS NOT NULL
           AND r.processed_at >= ?1
           AND r.schema_heal_state IS NULL
           AND (r.diagnosis_fixable = 1 OR p.auto_fix_action = 'schema_heal')
         ORDER BY r.processed_at ASC, r.created_at ASC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![since, limit as i64], row_to_report)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

/// Per (pattern, tenant) counts of pattern-tagged reports created since `since`.
#[derive(Debug, Clone)]
pub struct PatternTenantCount {
    pub pattern_id: String,
    pub tenant_id: Option<String>,
    pub count: i64,
}

pub fn count_by_pattern_since(
    pool: &DbPool,
    since: &str,
) -> Result<Vec<PatternTenantCount>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT matched_pattern_id, tenant_id, COUNT(*) AS n
         FROM error_reports
         WHERE matched_pattern_id IS NOT NULL AND created_at >= ?1
         GROUP BY matched_pattern_id, tenant_id",
    )?;
    let rows = stmt.query_map(params![since], |row| {
        Ok(PatternTenantCount {
            pattern_id: row.get(0)?,
            tenant_id: row.get(1)?,
            count: row.get(2)?,
        })
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

/// Count reports since `since` matched to any pattern in `categories`.
/// `tenant_id = None` counts across all tenants.
pub fn count_by_categories_since(
    pool: &DbPool,
    categories: &[&str],
    tenant_id: Option<&str>,
    since: &str,
) -> Result<i64, AppError> {
    if categories.is_empty() {
        return Ok(0);
    }
    let placeholders = vec!["?"; categories.len()].join(", ");
    let mut sql = format!(
        "SELECT COUNT(*) FROM error_reports r
         JOIN error_patterns p ON p.id = r.matched_pattern_id
         WHERE r.created_at >= ? AND p.category IN ({placeholders})"
    );
    let mut values: Vec<String> = Vec::with_capacity(categories.len() + 2);
    values.push(since.to_string());
    values.extend(categories.iter().map(|c| c.to_string()));
    if let Some(tenant) = tenant_id {
        sql.push_str(" AND r.tenant_id = ?");
        values.push(tenant.to_string());
    }

    let conn = pool.get()?;
    let count = conn.query_row(&sql, params_from_iter(values.iter()), |row| {
        row.get::<_, i64>(0)
    })?;
    Ok(count)
}

/// Reports created in `[from, to]`, processed or not.
pub fn count_created_between(pool: &DbPool, from: &str, to: &str) -> Result<i64, AppError> {
    let conn = pool.get()?;
    let count = conn.query_row(
        "SELECT COUNT(*) FROM error_reports WHERE created_at >= ?1 AND created_at <= ?2",
        params![from, to],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(count)
}

/// Resolve open, already-processed reports created before `before`.
pub fn resolve_stale(pool: &DbPool, before: &str) -> Result<usize, AppError> {
    let now = db::now();
    let conn = pool.get()?;
    let rows = conn.execute(
        "UPDATE error_reports SET status = 'resolved', resolved_at = ?1
         WHERE status = 'open' AND processed_at IS NOT NULL AND created_at < ?2",
        params![now, before],
    )?;
    Ok(rows)
}
