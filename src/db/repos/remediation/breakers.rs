use rusqlite::{params, OptionalExtension, Row};

use crate::db::models::{CircuitBreakerEvent, FeatureFlag, GLOBAL_SCOPE};
use crate::db::{self, DbPool};
use crate::error::AppError;

// ============================================================================
// Feature flags
// ============================================================================

fn row_to_flag(row: &Row) -> rusqlite::Result<FeatureFlag> {
    Ok(FeatureFlag {
        scope: row.get("scope")?,
        feature_key: row.get("feature_key")?,
        enabled: row.get::<_, i32>("enabled")? != 0,
        updated_at: row.get("updated_at")?,
    })
}

/// Scope label for a tenant, or the global scope.
pub fn scope_for(tenant_id: Option<&str>) -> &str {
    tenant_id.unwrap_or(GLOBAL_SCOPE)
}

/// Identity-keyed upsert; last writer wins.
pub fn set_feature_enabled(
    pool: &DbPool,
    scope: &str,
    feature_key: &str,
    enabled: bool,
) -> Result<(), AppError> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO feature_flags (scope, feature_key, enabled, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(scope, feature_key) DO UPDATE SET enabled = excluded.enabled, updated_at = excluded.updated_at",
        params![scope, feature_key, enabled as i32, db::now()],
    )?;
    Ok(())
}

pub fn get_feature_flag(
    pool: &DbPool,
    scope: &str,
    feature_key: &str,
) -> Result<Option<FeatureFlag>, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM feature_flags WHERE scope = ?1 AND feature_key = ?2",
        params![scope, feature_key],
        row_to_flag,
    )
    .optional()
    .map_err(AppError::Database)
}

// ============================================================================
// Breaker events
// ============================================================================

fn row_to_event(row: &Row) -> rusqlite::Result<CircuitBreakerEvent> {
    Ok(CircuitBreakerEvent {
        id: row.get("id")?,
        feature_key: row.get("feature_key")?,
        tenant_id: row.get("tenant_id")?,
        action: row.get("action")?,
        reason: row.get("reason")?,
        error_count: row.get("error_count")?,
        threshold: row.get("threshold")?,
        created_at: row.get("created_at")?,
    })
}

pub fn record_event(
    pool: &DbPool,
    feature_key: &str,
    tenant_id: Option<&str>,
    action: &str,
    reason: &str,
    error_count: i64,
    threshold: i64,
) -> Result<CircuitBreakerEvent, AppError> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = db::now();
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO circuit_breaker_events
         (id, feature_key, tenant_id, action, reason, error_count, threshold, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![id, feature_key, tenant_id, action, reason, error_count, threshold, now],
    )?;
    conn.query_row(
        "SELECT * FROM circuit_breaker_events WHERE id = ?1",
        params![id],
        row_to_event,
    )
    .map_err(AppError::Database)
}

/// Whether `feature_key` was tripped for this scope at or after `since`.
pub fn tripped_since(
    pool: &DbPool,
    feature_key: &str,
    tenant_id: Option<&str>,
    since: &str,
) -> Result<bool, AppError> {
    let conn = pool.get()?;
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM circuit_breaker_events
         WHERE feature_key = ?1 AND tenant_id IS ?2 AND action = 'tripped' AND created_at >= ?3",
        params![feature_key, tenant_id, since],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// The latest trip per (feature, scope) that has not been followed by a reset.
pub fn get_active_trips(pool: &DbPool) -> Result<Vec<CircuitBreakerEvent>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT e.* FROM circuit_breaker_events e
         WHERE e.action = 'tripped'
           AND e.created_at = (
               SELECT MAX(t.created_at) FROM circuit_breaker_events t
               WHERE t.feature_key = e.feature_key AND t.tenant_id IS e.tenant_id AND t.action = 'tripped')
           AND NOT EXISTS (
               SELECT 1 FROM circuit_breaker_events r
               WHERE r.feature_key = e.feature_key AND r.tenant_id IS e.tenant_id
                 AND r.action = 'reset' AND r.created_at >= e.created_at)
         ORDER BY e.created_at ASC",
    )?;
    let rows = stmt.query_map([], row_to_event)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

pub fn list_events(pool: &DbPool, feature_key: &str) -> Result<Vec<CircuitBreakerEvent>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM circuit_breaker_events WHERE feature_key = ?1 ORDER BY created_at ASC",
    )?;
    let rows = stmt.query_map(params![feature_key], row_to_event)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

pub fn count_events(pool: &DbPool) -> Result<i64, AppError> {
    let conn = pool.get()?;
    let count = conn.query_row("SELECT COUNT(*) FROM circuit_breaker_events", [], |row| row.get(0))?;
    Ok(count)
}

pub fn prune_events(pool: &DbPool, before: &str) -> Result<usize, AppError> {
    let conn = pool.get()?;
    let rows = conn.execute(
        "DELETE FROM circuit_breaker_events WHERE created_at < ?1",
        params![before],
    )?;
    Ok(rows)
}

#[cfg(test)]
pub fn backdate_event(pool: &DbPool, id: &str, at: &str) -> Result<(), AppError> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE circuit_breaker_events SET created_at = ?1 WHERE id = ?2",
        params![at, id],
    )?;
    Ok(())
}
