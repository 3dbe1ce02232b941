use rusqlite::Connection;

use crate::error::AppError;

/// Run the consolidated schema migration.
pub fn run(conn: &Connection) -> Result<(), AppError> {
    tracing::debug!("Running database migrations");

    conn.execute_batch(SCHEMA)?;

    tracing::info!("Database migrations complete");
    Ok(())
}

const SCHEMA: &str = r#"

-- ============================================================================
-- Error intake (written by the error reporter, mutated by the pipeline)
-- ============================================================================

CREATE TABLE IF NOT EXISTS error_reports (
    id                  TEXT PRIMARY KEY,
    tenant_id           TEXT,
    description         TEXT NOT NULL,
    console_errors      TEXT,
    page_url            TEXT,
    status              TEXT NOT NULL DEFAULT 'open',
    created_at          TEXT NOT NULL,
    processed_at        TEXT,
    matched_pattern_id  TEXT,
    diagnosis           TEXT,
    schema_heal_state   TEXT,
    resolved_at         TEXT
);
CREATE INDEX IF NOT EXISTS idx_reports_unprocessed ON error_reports(processed_at, created_at);
CREATE INDEX IF NOT EXISTS idx_reports_pattern     ON error_reports(matched_pattern_id, created_at);

CREATE TABLE IF NOT EXISTS error_patterns (
    id                  TEXT PRIMARY KEY,
    pattern             TEXT NOT NULL,
    match_type          TEXT NOT NULL DEFAULT 'substring',
    category            TEXT NOT NULL,
    severity            TEXT NOT NULL DEFAULT 'medium',
    auto_fix_action     TEXT NOT NULL DEFAULT 'log_only',
    fix_description     TEXT,
    cooldown_minutes    INTEGER NOT NULL DEFAULT 60,
    times_matched       INTEGER NOT NULL DEFAULT 0,
    times_fixed         INTEGER NOT NULL DEFAULT 0,
    last_matched_at     TEXT,
    last_fixed_at       TEXT,
    enabled             INTEGER NOT NULL DEFAULT 1,
    priority            INTEGER NOT NULL DEFAULT 100,
    source              TEXT NOT NULL DEFAULT 'manual',
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_patterns_order ON error_patterns(enabled, priority, created_at);

-- ============================================================================
-- Remediation
-- ============================================================================

CREATE TABLE IF NOT EXISTS incidents (
    id                  TEXT PRIMARY KEY,
    title               TEXT NOT NULL,
    severity            TEXT NOT NULL,
    status              TEXT NOT NULL DEFAULT 'detected',
    source              TEXT NOT NULL,
    error_pattern       TEXT,
    diagnosis           TEXT,
    auto_healed         INTEGER NOT NULL DEFAULT 0,
    heal_action         TEXT,
    escalation_sent_at  TEXT,
    metadata            TEXT NOT NULL DEFAULT '{}',
    detected_at         TEXT NOT NULL,
    resolved_at         TEXT,
    updated_at          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_incidents_open     ON incidents(status, source);
CREATE INDEX IF NOT EXISTS idx_incidents_escalate ON incidents(escalation_sent_at, severity);

CREATE TABLE IF NOT EXISTS feature_flags (
    scope               TEXT NOT NULL,
    feature_key         TEXT NOT NULL,
    enabled             INTEGER NOT NULL DEFAULT 1,
    updated_at          TEXT NOT NULL,
    PRIMARY KEY (scope, feature_key)
);

CREATE TABLE IF NOT EXISTS circuit_breaker_events (
    id                  TEXT PRIMARY KEY,
    feature_key         TEXT NOT NULL,
    tenant_id           TEXT,
    action              TEXT NOT NULL,
    reason              TEXT NOT NULL,
    error_count         INTEGER NOT NULL DEFAULT 0,
    threshold           INTEGER NOT NULL DEFAULT 0,
    created_at          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cb_events_feature ON circuit_breaker_events(feature_key, created_at);

CREATE TABLE IF NOT EXISTS heal_log (
    id                  TEXT PRIMARY KEY,
    report_id           TEXT,
    pattern_id          TEXT,
    action              TEXT NOT NULL,
    result              TEXT NOT NULL,
    details             TEXT,
    created_at          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_heal_log_created ON heal_log(created_at);

-- Permanent audit trail: never pruned.
CREATE TABLE IF NOT EXISTS schema_heal_log (
    id                  TEXT PRIMARY KEY,
    report_id           TEXT,
    fingerprint         TEXT NOT NULL,
    error_message       TEXT NOT NULL,
    generated_sql       TEXT,
    explanation         TEXT,
    risk                TEXT,
    pre_state           TEXT,
    execution_result    TEXT NOT NULL DEFAULT 'pending',
    execution_error     TEXT,
    applied_at          TEXT,
    created_at          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_schema_heal_fp ON schema_heal_log(fingerprint, created_at);

-- ============================================================================
-- Releases
-- ============================================================================

CREATE TABLE IF NOT EXISTS deploy_events (
    id                  TEXT PRIMARY KEY,
    deployment_id       TEXT NOT NULL UNIQUE,
    commit_sha          TEXT,
    commit_message      TEXT,
    branch              TEXT,
    status              TEXT NOT NULL,
    url                 TEXT,
    deployed_at         TEXT NOT NULL,
    created_at          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_deploys_at ON deploy_events(deployed_at);

CREATE TABLE IF NOT EXISTS rollback_events (
    id                  TEXT PRIMARY KEY,
    deploy_event_id     TEXT REFERENCES deploy_events(id) ON DELETE SET NULL,
    deployment_id       TEXT NOT NULL,
    incident_id         TEXT,
    target_deployment_id TEXT,
    status              TEXT NOT NULL,
    reason              TEXT,
    created_at          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_rollbacks_deployment ON rollback_events(deployment_id);

-- ============================================================================
-- Operations
-- ============================================================================

CREATE TABLE IF NOT EXISTS escalation_log (
    id                  TEXT PRIMARY KEY,
    incident_id         TEXT NOT NULL,
    channel             TEXT NOT NULL,
    recipient           TEXT NOT NULL,
    subject             TEXT NOT NULL,
    status              TEXT NOT NULL,
    error_message       TEXT,
    attempts            INTEGER NOT NULL DEFAULT 1,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_escalation_status ON escalation_log(status, created_at);

CREATE TABLE IF NOT EXISTS sentinel_runs (
    id                  TEXT PRIMARY KEY,
    trigger_source      TEXT NOT NULL,
    status              TEXT NOT NULL DEFAULT 'running',
    counters            TEXT NOT NULL DEFAULT '{}',
    errors              TEXT NOT NULL DEFAULT '[]',
    started_at          TEXT NOT NULL,
    finished_at         TEXT
);
CREATE INDEX IF NOT EXISTS idx_runs_started ON sentinel_runs(started_at);

CREATE TABLE IF NOT EXISTS health_checks (
    id                  TEXT PRIMARY KEY,
    check_name          TEXT NOT NULL,
    status              TEXT NOT NULL,
    latency_ms          REAL NOT NULL DEFAULT 0,
    checked_at          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_health_checks_name ON health_checks(check_name, checked_at);

CREATE TABLE IF NOT EXISTS performance_baselines (
    check_name          TEXT NOT NULL,
    window_hours        INTEGER NOT NULL,
    mean_latency_ms     REAL NOT NULL,
    p95_latency_ms      REAL NOT NULL,
    sample_count        INTEGER NOT NULL,
    computed_at         TEXT NOT NULL,
    PRIMARY KEY (check_name, window_hours)
);

CREATE TABLE IF NOT EXISTS admin_sessions (
    token_hash          TEXT PRIMARY KEY,
    user_id             TEXT NOT NULL,
    role                TEXT NOT NULL,
    expires_at          TEXT NOT NULL,
    created_at          TEXT NOT NULL
);
"#;

fn has_column(conn: &Connection, table: &str, column: &str) -> bool {
    conn.prepare(&format!(
        "SELECT COUNT(*) FROM pragma_table_info('{table}') WHERE name = ?1"
    ))
    .and_then(|mut stmt| stmt.query_row([column], |row| row.get::<_, i64>(0)))
    .map(|c| c > 0)
    .unwrap_or(false)
}

/// Column additions for databases created before the consolidated schema grew them.
pub fn run_incremental(conn: &Connection) -> Result<(), AppError> {
    // Quiet-period tracking for housekeeping (merges bump it)
    if !has_column(conn, "incidents", "last_seen_at") {
        conn.execute_batch(
            "ALTER TABLE incidents ADD COLUMN last_seen_at TEXT;
             UPDATE incidents SET last_seen_at = detected_at WHERE last_seen_at IS NULL;",
        )?;
        tracing::info!("Added last_seen_at column to incidents");
    }

    // Structured fixability flag from the diagnoser (NULL = unknown)
    if !has_column(conn, "error_reports", "diagnosis_fixable") {
        conn.execute_batch("ALTER TABLE error_reports ADD COLUMN diagnosis_fixable INTEGER;")?;
        tracing::info!("Added diagnosis_fixable column to error_reports");
    }

    if !has_column(conn, "schema_heal_log", "error_class") {
        conn.execute_batch("ALTER TABLE schema_heal_log ADD COLUMN error_class TEXT;")?;
        tracing::info!("Added error_class column to schema_heal_log");
    }

    Ok(())
}
