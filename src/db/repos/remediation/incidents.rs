use rusqlite::{params, params_from_iter, OptionalExtension, Row};

use crate::db::models::{Incident, NewIncident, Severity};
use crate::db::{self, DbPool};
use crate::error::AppError;

/// Statuses considered "open" for dedup purposes.
const OPEN_STATUSES: &str = "('detected', 'diagnosing', 'healing')";

fn row_to_incident(row: &Row) -> rusqlite::Result<Incident> {
    let metadata: String = row.get("metadata")?;
    Ok(Incident {
        id: row.get("id")?,
        title: row.get("title")?,
        severity: Severity::parse(&row.get::<_, String>("severity")?),
        status: row.get("status")?,
        source: row.get("source")?,
        error_pattern: row.get("error_pattern")?,
        diagnosis: row.get("diagnosis")?,
        auto_healed: row.get::<_, i32>("auto_healed")? != 0,
        heal_action: row.get("heal_action")?,
        escalation_sent_at: row.get("escalation_sent_at")?,
        metadata: serde_json::from_str(&metadata).unwrap_or_else(|_| serde_json::json!({})),
        detected_at: row.get("detected_at")?,
        last_seen_at: row.get("last_seen_at")?,
        resolved_at: row.get("resolved_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub fn create(pool: &DbPool, input: NewIncident) -> Result<Incident, AppError> {
    if input.title.trim().is_empty() {
        return Err(AppError::Validation("Incident title cannot be empty".into()));
    }

    let id = uuid::Uuid::new_v4().to_string();
    let now = db::now();
    let mut metadata = input.metadata;
    if !metadata.is_object() {
        metadata = serde_json::json!({});
    }
    if metadata.get("occurrences").is_none() {
        metadata["occurrences"] = serde_json::json!(1);
    }
    let resolved_at = (input.status == "resolved").then(|| now.clone());

    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO incidents
         (id, title, severity, status, source, error_pattern, diagnosis, auto_healed, heal_action,
          metadata, detected_at, last_seen_at, resolved_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11, ?12, ?11)",
        params![
            id,
            input.title,
            input.severity.as_str(),
            input.status,
            input.source,
            input.error_pattern,
            input.diagnosis,
            input.auto_healed as i32,
            input.heal_action,
            metadata.to_string(),
            now,
            resolved_at,
        ],
    )?;
    drop(conn);

    get_by_id(pool, &id)
}

pub fn get_by_id(pool: &DbPool, id: &str) -> Result<Incident, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM incidents WHERE id = ?1",
        params![id],
        row_to_incident,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => AppError::NotFound(format!("Incident {id}")),
        other => AppError::Database(other),
    })
}

/// Most recent open incident from `source` whose pattern contains `fragment`
/// (case-insensitive).
pub fn find_open_by_pattern(
    pool: &DbPool,
    source: &str,
    fragment: &str,
) -> Result<Option<Incident>, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        &format!(
            "SELECT * FROM incidents
             WHERE source = ?1 AND status IN {OPEN_STATUSES}
               AND instr(lower(COALESCE(error_pattern, '')), lower(?2)) > 0
             ORDER BY detected_at DESC LIMIT 1"
        ),
        params![source, fragment],
        row_to_incident,
    )
    .optional()
    .map_err(AppError::Database)
}

/// Most recent open incident from `source` whose metadata has `key == value`,
/// optionally restricted to incidents detected at or after `since`.
pub fn find_open_by_metadata(
    pool: &DbPool,
    source: &str,
    key: &str,
    value: &str,
    since: Option<&str>,
) -> Result<Option<Incident>, AppError> {
    let path = format!("$.{key}");
    let mut sql = format!(
        "SELECT * FROM incidents
         WHERE source = ? AND status IN {OPEN_STATUSES}
           AND json_extract(metadata, ?) = ?"
    );
    let mut values: Vec<String> = vec![source.into(), path, value.into()];
    if let Some(since) = since {
        sql.push_str(" AND detected_at >= ?");
        values.push(since.into());
    }
    sql.push_str(" ORDER BY detected_at DESC LIMIT 1");

    let conn = pool.get()?;
    conn.query_row(&sql, params_from_iter(values.iter()), row_to_incident)
        .optional()
        .map_err(AppError::Database)
}

/// Fold `patch` into the incident's metadata, bump `occurrences`, and refresh
/// `last_seen_at`.
pub fn merge(pool: &DbPool, id: &str, patch: serde_json::Value) -> Result<Incident, AppError> {
    let current = get_by_id(pool, id)?;
    let mut metadata = current.metadata;
    if !metadata.is_object() {
        metadata = serde_json::json!({});
    }
    let occurrences = metadata
        .get("occurrences")
        .and_then(|v| v.as_i64())
        .unwrap_or(1);
    if let (Some(target), Some(source)) = (metadata.as_object_mut(), patch.as_object()) {
        for (k, v) in source {
            target.insert(k.clone(), v.clone());
        }
    }
    metadata["occurrences"] = serde_json::json!(occurrences + 1);

    let now = db::now();
    let conn = pool.get()?;
    conn.execute(
        "UPDATE incidents SET metadata = ?1, last_seen_at = ?2, updated_at = ?2 WHERE id = ?3",
        params![metadata.to_string(), now, id],
    )?;
    drop(conn);

    get_by_id(pool, id)
}

/// Raise severity; never lowers it.
pub fn raise_severity(pool: &DbPool, id: &str, severity: Severity) -> Result<bool, AppError> {
    let current = get_by_id(pool, id)?;
    if severity <= current.severity {
        return Ok(false);
    }
    let conn = pool.get()?;
    conn.execute(
        "UPDATE incidents SET severity = ?1, updated_at = ?2 WHERE id = ?3",
        params![severity.as_str(), db::now(), id],
    )?;
    Ok(true)
}

/// Append a line to the incident's diagnosis.
pub fn annotate(pool: &DbPool, id: &str, note: &str) -> Result<(), AppError> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE incidents
         SET diagnosis = CASE WHEN diagnosis IS NULL OR diagnosis = '' THEN ?1
                              ELSE diagnosis || char(10) || ?1 END,
             updated_at = ?2
         WHERE id = ?3",
        params![note, db::now(), id],
    )?;
    Ok(())
}

/// Open high/critical incidents that have never been escalated, oldest first.
pub fn get_unescalated(pool: &DbPool, limit: usize) -> Result<Vec<Incident>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM incidents
         WHERE status != 'resolved'
           AND severity IN ('high', 'critical')
           AND escalation_sent_at IS NULL
         ORDER BY detected_at ASC
         LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], row_to_incident)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

/// Claim the one-time escalation slot. Returns `false` if already claimed.
pub fn claim_escalation(pool: &DbPool, id: &str) -> Result<bool, AppError> {
    let now = db::now();
    let conn = pool.get()?;
    let rows = conn.execute(
        "UPDATE incidents SET escalation_sent_at = ?1, updated_at = ?1
         WHERE id = ?2 AND escalation_sent_at IS NULL",
        params![now, id],
    )?;
    Ok(rows > 0)
}

/// Resolve incidents from `sources` still in an early state whose last
/// activity predates `before`.
pub fn resolve_stale(pool: &DbPool, sources: &[&str], before: &str) -> Result<usize, AppError> {
    if sources.is_empty() {
        return Ok(0);
    }
    let placeholders = vec!["?"; sources.len()].join(", ");
    let sql = format!(
        "UPDATE incidents
         SET status = 'resolved', resolved_at = ?, updated_at = ?,
             diagnosis = COALESCE(diagnosis || char(10), '') || 'Auto-resolved: no new errors during quiet period'
         WHERE status IN ('detected', 'diagnosing')
           AND COALESCE(last_seen_at, detected_at) < ?
           AND source IN ({placeholders})"
    );
    let now = db::now();
    let mut values: Vec<String> = vec![now.clone(), now, before.to_string()];
    values.extend(sources.iter().map(|s| s.to_string()));

    let conn = pool.get()?;
    let rows = conn.execute(&sql, params_from_iter(values.iter()))?;
    Ok(rows)
}

pub fn list_by_source(pool: &DbPool, source: &str) -> Result<Vec<Incident>, AppError> {
    let conn = pool.get()?;
    let mut stmt =
        conn.prepare("SELECT * FROM incidents WHERE source = ?1 ORDER BY detected_at ASC")?;
    let rows = stmt.query_map(params![source], row_to_incident)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

#[cfg(test)]
pub fn set_detected_at(pool: &DbPool, id: &str, at: &str) -> Result<(), AppError> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE incidents SET detected_at = ?1, last_seen_at = ?1 WHERE id = ?2",
        params![at, id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::db::models::SOURCE_SENTINEL;

    fn sentinel_incident(pool: &DbPool, pattern: &str, severity: Severity) -> Incident {
        let mut input = NewIncident::detected(format!("[Sentinel] db: {pattern}"), severity, SOURCE_SENTINEL);
        input.error_pattern = Some(pattern.into());
        create(pool, input).unwrap()
    }

    #[test]
    fn test_find_open_by_pattern_case_insensitive() {
        let pool = init_test_db().unwrap();
        let inc = sentinel_incident(&pool, "Relation \"orders\" does not exist", Severity::High);

        let found = find_open_by_pattern(&pool, SOURCE_SENTINEL, "relation \"orders\"").unwrap();
        assert_eq!(found.map(|i| i.id), Some(inc.id.clone()));
        assert!(find_open_by_pattern(&pool, "anomaly", "relation").unwrap().is_none());
    }

    #[test]
    fn test_merge_bumps_occurrences_and_keeps_keys() {
        let pool = init_test_db().unwrap();
        let mut input = NewIncident::detected("t", Severity::High, SOURCE_SENTINEL);
        input.metadata = serde_json::json!({ "deploy_id": "dpl_1" });
        let inc = create(&pool, input).unwrap();
        assert_eq!(inc.metadata["occurrences"], 1);

        let merged = merge(&pool, &inc.id, serde_json::json!({ "latest_report_id": "r9" })).unwrap();
        assert_eq!(merged.metadata["occurrences"], 2);
        assert_eq!(merged.metadata["deploy_id"], "dpl_1");
        assert_eq!(merged.metadata["latest_report_id"], "r9");
    }

    #[test]
    fn test_find_open_by_metadata() {
        let pool = init_test_db().unwrap();
        let mut input = NewIncident::detected("deploy", Severity::High, "deploy_correlation");
        input.metadata = serde_json::json!({ "deploy_id": "dpl_7" });
        let inc = create(&pool, input).unwrap();

        let hit = find_open_by_metadata(&pool, "deploy_correlation", "deploy_id", "dpl_7", None).unwrap();
        assert_eq!(hit.map(|i| i.id), Some(inc.id));
        let future = db::since(chrono::Duration::minutes(-5));
        assert!(find_open_by_metadata(&pool, "deploy_correlation", "deploy_id", "dpl_7", Some(&future))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_escalation_claim_once() {
        let pool = init_test_db().unwrap();
        let inc = sentinel_incident(&pool, "p", Severity::Critical);
        assert_eq!(get_unescalated(&pool, 10).unwrap().len(), 1);
        assert!(claim_escalation(&pool, &inc.id).unwrap());
        assert!(!claim_escalation(&pool, &inc.id).unwrap());
        assert!(get_unescalated(&pool, 10).unwrap().is_empty());
    }

    #[test]
    fn test_unescalated_ignores_low_and_medium() {
        let pool = init_test_db().unwrap();
        sentinel_incident(&pool, "a", Severity::Medium);
        sentinel_incident(&pool, "b", Severity::Low);
        assert!(get_unescalated(&pool, 10).unwrap().is_empty());
    }

    #[test]
    fn test_raise_severity_never_lowers() {
        let pool = init_test_db().unwrap();
        let inc = sentinel_incident(&pool, "p", Severity::High);
        assert!(!raise_severity(&pool, &inc.id, Severity::Medium).unwrap());
        assert!(raise_severity(&pool, &inc.id, Severity::Critical).unwrap());
        assert_eq!(get_by_id(&pool, &inc.id).unwrap().severity, Severity::Critical);
    }

    #[test]
    fn test_resolve_stale_respects_source_and_age() {
        let pool = init_test_db().unwrap();
        let old = sentinel_incident(&pool, "old", Severity::High);
        let fresh = sentinel_incident(&pool, "fresh", Severity::High);
        set_detected_at(&pool, &old.id, "2020-01-01T00:00:00.000Z").unwrap();

        let n = resolve_stale(&pool, &[SOURCE_SENTINEL], &db::since(chrono::Duration::hours(2))).unwrap();
        assert_eq!(n, 1);
        assert_eq!(get_by_id(&pool, &old.id).unwrap().status, "resolved");
        assert_eq!(get_by_id(&pool, &fresh.id).unwrap().status, "detected");
    }

    #[test]
    fn test_annotate_appends() {
        let pool = init_test_db().unwrap();
        let inc = sentinel_incident(&pool, "p", Severity::High);
        annotate(&pool, &inc.id, "first").unwrap();
        annotate(&pool, &inc.id, "second").unwrap();
        assert_eq!(get_by_id(&pool, &inc.id).unwrap().diagnosis.as_deref(), Some("first\nsecond"));
    }
}
