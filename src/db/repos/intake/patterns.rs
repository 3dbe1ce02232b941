use rusqlite::{params, OptionalExtension, Row};

use crate::db::models::{ErrorPattern, FixAction, MatchType, NewErrorPattern};
use crate::db::{self, DbPool};
use crate::error::AppError;

fn row_to_pattern(row: &Row) -> rusqlite::Result<ErrorPattern> {
    Ok(ErrorPattern {
        id: row.get("id")?,
        pattern: row.get("pattern")?,
        match_type: MatchType::parse(&row.get::<_, String>("match_type")?),
        category: row.get("category")?,
        severity: row.get("severity")?,
        auto_fix_action: FixAction::parse(&row.get::<_, String>("auto_fix_action")?),
        fix_description: row.get("fix_description")?,
        cooldown_minutes: row.get("cooldown_minutes")?,
        times_matched: row.get("times_matched")?,
        times_fixed: row.get("times_fixed")?,
        last_matched_at: row.get("last_matched_at")?,
        last_fixed_at: row.get("last_fixed_at")?,
        enabled: row.get::<_, i32>("enabled")? != 0,
        priority: row.get("priority")?,
        source: row.get("source")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub fn create(pool: &DbPool, input: NewErrorPattern) -> Result<ErrorPattern, AppError> {
    if input.pattern.trim().is_empty() {
        return Err(AppError::Validation("Pattern cannot be empty".into()));
    }
    if input.cooldown_minutes < 0 {
        return Err(AppError::Validation("Cooldown cannot be negative".into()));
    }

    let id = uuid::Uuid::new_v4().to_string();
    let now = db::now();

    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO error_patterns
         (id, pattern, match_type, category, severity, auto_fix_action, fix_description,
          cooldown_minutes, enabled, priority, source, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?10, ?11, ?11)",
        params![
            id,
            input.pattern,
            input.match_type.as_str(),
            input.category,
            input.severity,
            input.auto_fix_action.as_str(),
            input.fix_description,
            input.cooldown_minutes,
            input.priority,
            input.source,
            now,
        ],
    )?;
    drop(conn);

    get_by_id(pool, &id)
}

pub fn get_by_id(pool: &DbPool, id: &str) -> Result<ErrorPattern, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM error_patterns WHERE id = ?1",
        params![id],
        row_to_pattern,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => AppError::NotFound(format!("ErrorPattern {id}")),
        other => AppError::Database(other),
    })
}

/// Enabled patterns in evaluation order.
pub fn get_enabled(pool: &DbPool) -> Result<Vec<ErrorPattern>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM error_patterns
         WHERE enabled = 1
         ORDER BY priority ASC, created_at ASC, id ASC",
    )?;
    let rows = stmt.query_map([], row_to_pattern)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

/// Existing pattern with identical text and match type, if any.
pub fn find_by_text(
    pool: &DbPool,
    pattern: &str,
    match_type: MatchType,
) -> Result<Option<ErrorPattern>, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM error_patterns WHERE pattern = ?1 AND match_type = ?2 LIMIT 1",
        params![pattern, match_type.as_str()],
        row_to_pattern,
    )
    .optional()
    .map_err(AppError::Database)
}

pub fn record_match(pool: &DbPool, id: &str) -> Result<(), AppError> {
    let now = db::now();
    let conn = pool.get()?;
    conn.execute(
        "UPDATE error_patterns
         SET times_matched = times_matched + 1, last_matched_at = ?1, updated_at = ?1
         WHERE id = ?2",
        params![now, id],
    )?;
    Ok(())
}

/// Compare-and-swap claim of the pattern's fix cooldown.
///
/// Succeeds only if `last_fixed_at` still equals `expected_last_fixed_at`,
/// so two overlapping runs cannot both fire the same action. Does not touch
/// `times_fixed`; see [`record_fix`].
pub fn claim_fix(
    pool: &DbPool,
    id: &str,
    expected_last_fixed_at: Option<&str>,
) -> Result<bool, AppError> {
    let now = db::now();
    let conn = pool.get()?;
    let rows = conn.execute(
        "UPDATE error_patterns
         SET last_fixed_at = ?1, updated_at = ?1
         WHERE id = ?2 AND last_fixed_at IS ?3",
        params![now, id, expected_last_fixed_at],
    )?;
    Ok(rows > 0)
}

/// Count one successfully applied fix.
pub fn record_fix(pool: &DbPool, id: &str) -> Result<(), AppError> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE error_patterns SET times_fixed = times_fixed + 1, updated_at = ?1 WHERE id = ?2",
        params![db::now(), id],
    )?;
    Ok(())
}

#[cfg(test)]
pub fn set_last_fixed_at(pool: &DbPool, id: &str, at: Option<&str>) -> Result<(), AppError> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE error_patterns SET last_fixed_at = ?1 WHERE id = ?2",
        params![at, id],
    )?;
    Ok(())
}

#[cfg(test)]
pub fn sample(pattern: &str, action: FixAction) -> NewErrorPattern {
    NewErrorPattern {
        pattern: pattern.into(),
        match_type: MatchType::Substring,
        category: "database".into(),
        severity: "high".into(),
        auto_fix_action: action,
        fix_description: Some(format!("Known issue: {pattern}")),
        cooldown_minutes: 60,
        priority: 100,
        source: "manual".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;

    #[test]
    fn test_enabled_ordered_by_priority_then_age() {
        let pool = init_test_db().unwrap();
        let mut late = sample("late", FixAction::LogOnly);
        late.priority = 10;
        let early = sample("early", FixAction::LogOnly);
        create(&pool, early).unwrap();
        create(&pool, late).unwrap();

        let all = get_enabled(&pool).unwrap();
        assert_eq!(all[0].pattern, "late");
        assert_eq!(all[1].pattern, "early");
    }

    #[test]
    fn test_claim_fix_is_compare_and_swap() {
        let pool = init_test_db().unwrap();
        let p = create(&pool, sample("x", FixAction::CreateIncident)).unwrap();

        assert!(claim_fix(&pool, &p.id, None).unwrap());
        // A second run that read the old (NULL) value loses the race
        assert!(!claim_fix(&pool, &p.id, None).unwrap());

        let fresh = get_by_id(&pool, &p.id).unwrap();
        assert_eq!(fresh.times_fixed, 0);
        assert!(fresh.last_fixed_at.is_some());
        assert!(claim_fix(&pool, &p.id, fresh.last_fixed_at.as_deref()).unwrap());
    }

    #[test]
    fn test_record_fix_counts_applied_fixes_only() {
        let pool = init_test_db().unwrap();
        let p = create(&pool, sample("z", FixAction::CreateIncident)).unwrap();
        assert!(claim_fix(&pool, &p.id, None).unwrap());
        record_fix(&pool, &p.id).unwrap();
        assert_eq!(get_by_id(&pool, &p.id).unwrap().times_fixed, 1);
    }

    #[test]
    fn test_record_match_increments() {
        let pool = init_test_db().unwrap();
        let p = create(&pool, sample("y", FixAction::LogOnly)).unwrap();
        record_match(&pool, &p.id).unwrap();
        record_match(&pool, &p.id).unwrap();
        let fresh = get_by_id(&pool, &p.id).unwrap();
        assert_eq!(fresh.times_matched, 2);
        assert!(fresh.last_matched_at.is_some());
    }

    #[test]
    fn test_find_by_text() {
        let pool = init_test_db().unwrap();
        create(&pool, sample("relation missing", FixAction::LogOnly)).unwrap();
        assert!(find_by_text(&pool, "relation missing", MatchType::Substring).unwrap().is_some());
        assert!(find_by_text(&pool, "relation missing", MatchType::Exact).unwrap().is_none());
    }
}
