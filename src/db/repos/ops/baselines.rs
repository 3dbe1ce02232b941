use rusqlite::{params, OptionalExtension, Row};

use crate::db::models::{HealthCheck, PerformanceBaseline};
use crate::db::{self, DbPool};
use crate::error::AppError;

// ============================================================================
// Health checks (written by the external probe)
// ============================================================================

fn row_to_check(row: &Row) -> rusqlite::Result<HealthCheck> {
    Ok(HealthCheck {
        id: row.get("id")?,
        check_name: row.get("check_name")?,
        status: row.get("status")?,
        latency_ms: row.get("latency_ms")?,
        checked_at: row.get("checked_at")?,
    })
}

pub fn record_check(
    pool: &DbPool,
    check_name: &str,
    status: &str,
    latency_ms: f64,
    checked_at: Option<&str>,
) -> Result<HealthCheck, AppError> {
    let id = uuid::Uuid::new_v4().to_string();
    let checked_at = checked_at.map(str::to_string).unwrap_or_else(db::now);
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO health_checks (id, check_name, status, latency_ms, checked_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id, check_name, status, latency_ms, checked_at],
    )?;
    conn.query_row(
        "SELECT * FROM health_checks WHERE id = ?1",
        params![id],
        row_to_check,
    )
    .map_err(AppError::Database)
}

/// Most recent positive-latency sample for `check_name` at or after `since`.
pub fn latest_check_since(
    pool: &DbPool,
    check_name: &str,
    since: &str,
) -> Result<Option<HealthCheck>, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM health_checks
         WHERE check_name = ?1 AND checked_at >= ?2 AND latency_ms > 0
         ORDER BY checked_at DESC LIMIT 1",
        params![check_name, since],
        row_to_check,
    )
    .optional()
    .map_err(AppError::Database)
}

/// `(check_name, latency_ms)` for every positive-latency sample since `since`.
pub fn latencies_since(pool: &DbPool, since: &str) -> Result<Vec<(String, f64)>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT check_name, latency_ms FROM health_checks
         WHERE checked_at >= ?1 AND latency_ms > 0
         ORDER BY check_name, latency_ms",
    )?;
    let rows = stmt.query_map(params![since], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

pub fn prune_checks(pool: &DbPool, before: &str) -> Result<usize, AppError> {
    let conn = pool.get()?;
    let rows = conn.execute("DELETE FROM health_checks WHERE checked_at < ?1", params![before])?;
    Ok(rows)
}

// ============================================================================
// Baselines
// ============================================================================

fn row_to_baseline(row: &Row) -> rusqlite::Result<PerformanceBaseline> {
    Ok(PerformanceBaseline {
        check_name: row.get("check_name")?,
        window_hours: row.get("window_hours")?,
        mean_latency_ms: row.get("mean_latency_ms")?,
        p95_latency_ms: row.get("p95_latency_ms")?,
        sample_count: row.get("sample_count")?,
        computed_at: row.get("computed_at")?,
    })
}

/// Baselines for `window_hours` backed by at least `min_samples` samples.
pub fn get_baselines(
    pool: &DbPool,
    window_hours: i64,
    min_samples: i64,
) -> Result<Vec<PerformanceBaseline>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM performance_baselines
         WHERE window_hours = ?1 AND sample_count >= ?2
         ORDER BY check_name",
    )?;
    let rows = stmt.query_map(params![window_hours, min_samples], row_to_baseline)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

pub fn upsert_baseline(pool: &DbPool, baseline: &PerformanceBaseline) -> Result<(), AppError> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO performance_baselines
         (check_name, window_hours, mean_latency_ms, p95_latency_ms, sample_count, computed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(check_name, window_hours) DO UPDATE SET
            mean_latency_ms = excluded.mean_latency_ms,
            p95_latency_ms = excluded.p95_latency_ms,
            sample_count = excluded.sample_count,
            computed_at = excluded.computed_at",
        params![
            baseline.check_name,
            baseline.window_hours,
            baseline.mean_latency_ms,
            baseline.p95_latency_ms,
            baseline.sample_count,
            baseline.computed_at,
        ],
    )?;
    Ok(())
}
