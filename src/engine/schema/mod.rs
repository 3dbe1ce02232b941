//! Schema healer: repairs schema drift behind recent errors with one
//! additive DDL statement at a time.
//!
//! Per candidate: classify → consult fingerprint history → introspect →
//! generate → risk check → safety gate → execute → reload schema cache →
//! learn a pattern. Every attempt that reaches generation leaves a
//! `schema_heal_log` row, which is what the loop breaker reads.

pub mod classify;
pub mod generate;
pub mod introspect;
pub mod safety;

use std::time::Duration;

use super::catalog::{self, clip, DedupKey};
use super::remediation::count_outcome;
use super::{fingerprint, RunState, RunSummary, SentinelContext};
use crate::clients::{AdminChannel, CompletionClient};
use crate::db;
use crate::db::models::{
    ErrorReport, ExecutionResult, FixAction, MatchType, NewErrorPattern, NewIncident,
    NewSchemaHealLog, SchemaHealState, Severity, SOURCE_SCHEMA_HEALER,
};
use crate::db::repos::intake::{patterns, reports};
use crate::db::repos::remediation::{heal_log, schema_heal};
use crate::error::AppError;
use classify::Classification;
use generate::Risk;

/// Hard cap on DDL statements executed per run.
pub const MAX_EXECUTIONS_PER_RUN: usize = 3;
/// Candidates examined per run.
pub const MAX_CANDIDATES_PER_RUN: usize = 10;
/// Prior failures for one fingerprint after which the healer stops trying.
pub const LOOP_BREAKER_FAILURES: usize = 2;
const HISTORY_WINDOW_HOURS: i64 = 24;
const MAX_LOGGED_ERROR_CHARS: usize = 2000;

pub const SCHEMA_RELOAD: &str = "NOTIFY pgrst, 'reload schema'";

/// What happened to one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Recorded(SchemaHealState),
    /// Per-run execution cap reached, or a transient failure before any SQL
    /// was generated; leave for the next run.
    Deferred,
}

pub async fn run(
    ctx: &SentinelContext,
    _state: &mut RunState,
    summary: &mut RunSummary,
) -> Result<(), AppError> {
    let (Some(llm), Some(admin)) = (ctx.llm.clone(), ctx.admin.clone()) else {
        tracing::debug!("Schema healer needs a completion client and an admin channel, skipping");
        return Ok(());
    };

    let since = db::since(chrono::Duration::hours(HISTORY_WINDOW_HOURS));
    let candidates = reports::get_schema_heal_candidates(&ctx.pool, &since, MAX_CANDIDATES_PER_RUN)?;
    summary.counters.schema_candidates = candidates.len() as u64;

    let mut executed = 0usize;
    for report in &candidates {
        let outcome = heal_one(ctx, llm.as_ref(), admin.as_ref(), report, &mut executed, summary).await;
        let state = match outcome {
            Ok(Outcome::Recorded(state)) => state,
            Ok(Outcome::Deferred) => continue,
            Err(e) => {
                summary.note_error("schema_heal", format!("report {}: {e}", report.id));
                continue;
            }
        };

        let counters = &mut summary.counters;
        match state {
            SchemaHealState::Healed => counters.schema_healed += 1,
            SchemaHealState::AlreadyHealed => counters.schema_already_healed += 1,
            SchemaHealState::Failed => counters.schema_failed += 1,
            SchemaHealState::Blocked => counters.schema_blocked += 1,
            SchemaHealState::Skipped => counters.schema_skipped += 1,
            // counted by escalate()
            SchemaHealState::Escalated | SchemaHealState::Unclassified => {}
        }
        if let Err(e) = reports::set_schema_heal_state(&ctx.pool, &report.id, state) {
            summary.note_error("schema_heal", format!("report {}: {e}", report.id));
        }
    }

    if !candidates.is_empty() {
        tracing::info!(
            candidates = candidates.len(),
            executed,
            healed = summary.counters.schema_healed,
            escalated = summary.counters.schema_escalated,
            "Schema healer pass complete"
        );
    }
    Ok(())
}

async fn heal_one(
    ctx: &SentinelContext,
    llm: &dyn CompletionClient,
    admin: &dyn AdminChannel,
    report: &ErrorReport,
    executed: &mut usize,
    summary: &mut RunSummary,
) -> Result<Outcome, AppError> {
    let pool = &ctx.pool;
    let (text, fp) = fingerprint::for_report(report);
    let Some(classification) = classify::classify(&text) else {
        return Ok(Outcome::Recorded(SchemaHealState::Unclassified));
    };

    let since = db::since(chrono::Duration::hours(HISTORY_WINDOW_HOURS));
    let history = schema_heal::history(pool, &fp, &since)?;
    if history.iter().any(|h| h.execution_result == ExecutionResult::Success) {
        return Ok(Outcome::Recorded(SchemaHealState::AlreadyHealed));
    }
    let failures = history
        .iter()
        .filter(|h| matches!(h.execution_result, ExecutionResult::Failed | ExecutionResult::Blocked))
        .count();
    if failures >= LOOP_BREAKER_FAILURES {
        let reason = format!("{failures} failed heal attempts in the last {HISTORY_WINDOW_HOURS}h");
        escalate(ctx, report, &fp, &classification, &reason, summary)?;
        return Ok(Outcome::Recorded(SchemaHealState::Escalated));
    }
    let prior_high_risk = history.iter().any(|h| {
        h.execution_result == ExecutionResult::Skipped && h.risk.as_deref() == Some(Risk::High.as_str())
    });
    if prior_high_risk {
        escalate(ctx, report, &fp, &classification, "previous fix was rated high risk", summary)?;
        return Ok(Outcome::Recorded(SchemaHealState::Escalated));
    }

    if *executed >= MAX_EXECUTIONS_PER_RUN {
        return Ok(Outcome::Deferred);
    }

    let mut entry = NewSchemaHealLog {
        report_id: Some(report.id.clone()),
        fingerprint: fp.clone(),
        error_message: clip(&text, MAX_LOGGED_ERROR_CHARS).to_string(),
        error_class: Some(classification.class.label().to_string()),
        ..Default::default()
    };

    let context = match introspect::gather(admin, &classification.class).await {
        Ok(context) => context,
        Err(e) => {
            // Logged as skipped so the loop breaker only counts SQL that ran or was blocked.
            let error = format!("introspection failed: {e}");
            schema_heal::create(pool, entry, ExecutionResult::Skipped, Some(&error))?;
            summary.note_error("schema_heal", error);
            return Ok(Outcome::Deferred);
        }
    };
    entry.pre_state = Some(serde_json::to_string(&context)?);

    let timeout = Duration::from_secs(ctx.config.llm.generate_timeout_secs);
    let fix = match generate::generate(llm, &text, &classification, &context, timeout).await {
        Ok(fix) => fix,
        Err(e) => {
            let error = format!("fix generation failed: {e}");
            schema_heal::create(pool, entry, ExecutionResult::Skipped, Some(&error))?;
            summary.note_error("schema_heal", error);
            return Ok(Outcome::Deferred);
        }
    };
    entry.generated_sql = Some(fix.sql.clone());
    entry.explanation = Some(fix.explanation.clone());
    entry.risk = Some(fix.risk.as_str().to_string());

    if fix.risk == Risk::High {
        schema_heal::create(pool, entry, ExecutionResult::Skipped, Some("rated high risk, not executed"))?;
        escalate(ctx, report, &fp, &classification, "generated fix was rated high risk", summary)?;
        return Ok(Outcome::Recorded(SchemaHealState::Skipped));
    }

    let statement = match safety::validate(&fix.sql) {
        Ok(statement) => statement,
        Err(violation) => {
            let error = violation.to_string();
            schema_heal::create(pool, entry, ExecutionResult::Blocked, Some(&error))?;
            tracing::warn!(fingerprint = %clip(&fp, 80), %error, "Generated fix blocked by safety gate");
            escalate(ctx, report, &fp, &classification, &format!("safety gate: {error}"), summary)?;
            return Ok(Outcome::Recorded(SchemaHealState::Blocked));
        }
    };

    let log = schema_heal::create(pool, entry, ExecutionResult::Pending, None)?;
    *executed += 1;
    if let Err(e) = admin.query(&statement).await {
        let error = e.to_string();
        schema_heal::set_result(pool, &log.id, ExecutionResult::Failed, Some(&error))?;
        heal_log::record(pool, Some(&report.id), None, "schema_heal", false, &error)?;
        tracing::warn!(log_id = %log.id, %error, "Schema fix execution failed");
        return Ok(Outcome::Recorded(SchemaHealState::Failed));
    }
    schema_heal::set_result(pool, &log.id, ExecutionResult::Success, None)?;
    tracing::info!(log_id = %log.id, class = classification.class.label(), "Schema fix applied");

    if let Err(e) = admin.query(SCHEMA_RELOAD).await {
        tracing::warn!(error = %e, "Schema cache reload failed");
    }
    heal_log::record(
        pool,
        Some(&report.id),
        None,
        "schema_heal",
        true,
        &format!("applied: {}", clip(&statement, 200)),
    )?;
    if let Err(e) = learn_pattern(ctx, &classification, &fix.explanation) {
        summary.note_error("schema_heal", format!("pattern learning: {e}"));
    }

    Ok(Outcome::Recorded(SchemaHealState::Healed))
}

/// Open (or bump) the manual-fix incident for a fingerprint.
fn escalate(
    ctx: &SentinelContext,
    report: &ErrorReport,
    fingerprint: &str,
    classification: &Classification,
    reason: &str,
    summary: &mut RunSummary,
) -> Result<(), AppError> {
    let subject = classification.phrase.as_deref().unwrap_or(fingerprint);
    let mut incident = NewIncident::detected(
        format!("[Schema Healer] Manual fix needed: {}", clip(subject, 80)),
        Severity::High,
        SOURCE_SCHEMA_HEALER,
    );
    incident.error_pattern = Some(fingerprint.to_string());
    incident.diagnosis = Some(reason.to_string());
    incident.metadata = serde_json::json!({
        "fingerprint": fingerprint,
        "error_class": classification.class.label(),
        "latest_report_id": report.id,
        "reason": reason,
    });
    let (_, outcome) = catalog::open_or_merge(
        &ctx.pool,
        incident,
        DedupKey::Metadata { key: "fingerprint", value: fingerprint, since: None },
    )?;
    count_outcome(summary, outcome);
    summary.counters.schema_escalated += 1;
    Ok(())
}

/// Remember the healed error so future reports match without diagnosis.
fn learn_pattern(
    ctx: &SentinelContext,
    classification: &Classification,
    explanation: &str,
) -> Result<(), AppError> {
    let Some(phrase) = classification.phrase.as_deref() else {
        return Ok(());
    };
    if patterns::find_by_text(&ctx.pool, phrase, MatchType::Substring)?.is_some() {
        return Ok(());
    }
    let learned = patterns::create(
        &ctx.pool,
        NewErrorPattern {
            pattern: phrase.to_string(),
            match_type: MatchType::Substring,
            category: "database".into(),
            severity: "medium".into(),
            auto_fix_action: FixAction::LogOnly,
            fix_description: Some(format!("Auto-healed schema drift: {explanation}")),
            cooldown_minutes: 60,
            priority: 50,
            source: "auto_learned".into(),
        },
    )?;
    tracing::info!(pattern_id = %learned.id, phrase, "Learned pattern from schema fix");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::db::repos::remediation::incidents;
    use crate::engine::test_support::{self, FakeAdmin, FakeLlm};

    const LOW_RISK_FIX: &str = r#"{"sql":"CREATE INDEX IF NOT EXISTS idx_t ON t (x);","explanation":"add index","risk":"low"}"#;

    fn fixable_report(pool: &db::DbPool, description: &str) -> ErrorReport {
        let r = test_support::report(pool, description);
        assert!(reports::mark_processed(pool, &r.id, None, "diagnosed", Some(true)).unwrap());
        reports::get_by_id(pool, &r.id).unwrap()
    }

    fn ddl(admin: &FakeAdmin) -> Vec<String> {
        admin
            .executed()
            .into_iter()
            .filter(|q| !q.starts_with("SELECT") && !q.starts_with("NOTIFY"))
            .collect()
    }

    fn ctx_with(pool: &db::DbPool, llm: std::sync::Arc<FakeLlm>, admin: std::sync::Arc<FakeAdmin>) -> SentinelContext {
        let mut ctx = test_support::context(pool.clone());
        ctx.llm = Some(llm);
        ctx.admin = Some(admin);
        ctx
    }

    async fn heal(ctx: &SentinelContext) -> RunSummary {
        let mut summary = RunSummary::new("test");
        run(ctx, &mut RunState::default(), &mut summary).await.unwrap();
        summary
    }

    #[tokio::test]
    async fn test_successful_heal_reloads_and_learns_pattern() {
        let pool = init_test_db().unwrap();
        let llm = FakeLlm::fixed(LOW_RISK_FIX);
        let admin = FakeAdmin::accepting();
        let ctx = ctx_with(&pool, llm.clone(), admin.clone());
        let r = fixable_report(&pool, r#"relation "discussion_replies" does not exist"#);

        let summary = heal(&ctx).await;
        assert_eq!(summary.counters.schema_healed, 1);
        assert_eq!(ddl(&admin), vec!["CREATE INDEX IF NOT EXISTS idx_t ON t (x);".to_string()]);
        assert!(admin.executed().iter().any(|q| q == SCHEMA_RELOAD));

        let stored = reports::get_by_id(&pool, &r.id).unwrap();
        assert_eq!(stored.schema_heal_state.as_deref(), Some("healed"));
        let learned = patterns::find_by_text(
            &pool,
            r#"relation "discussion_replies" does not exist"#,
            MatchType::Substring,
        )
        .unwrap()
        .unwrap();
        assert_eq!(learned.source, "auto_learned");
        assert_eq!(learned.auto_fix_action, FixAction::LogOnly);

        let log = schema_heal::list_all(&pool).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].execution_result, ExecutionResult::Success);
        assert!(log[0].applied_at.is_some());
    }

    #[tokio::test]
    async fn test_same_fingerprint_after_success_is_already_healed() {
        let pool = init_test_db().unwrap();
        let llm = FakeLlm::fixed(LOW_RISK_FIX);
        let admin = FakeAdmin::accepting();
        let ctx = ctx_with(&pool, llm.clone(), admin.clone());
        for _ in 0..3 {
            fixable_report(&pool, r#"column "bio" of relation "profiles" does not exist"#);
        }

        let summary = heal(&ctx).await;
        assert_eq!(summary.counters.schema_healed, 1);
        assert_eq!(summary.counters.schema_already_healed, 2);
        assert_eq!(llm.call_count(), 1);
        assert_eq!(ddl(&admin).len(), 1);
    }

    #[tokio::test]
    async fn test_execution_cap_per_run() {
        let pool = init_test_db().unwrap();
        let llm = FakeLlm::fixed(LOW_RISK_FIX);
        let admin = FakeAdmin::accepting();
        let ctx = ctx_with(&pool, llm.clone(), admin.clone());
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(fixable_report(&pool, &format!(r#"column "c{i}" of relation "t" does not exist"#)).id);
        }

        let summary = heal(&ctx).await;
        assert_eq!(summary.counters.schema_healed, MAX_EXECUTIONS_PER_RUN as u64);
        assert_eq!(ddl(&admin).len(), MAX_EXECUTIONS_PER_RUN);
        let untouched = ids
            .iter()
            .filter(|id| reports::get_by_id(&pool, id).unwrap().schema_heal_state.is_none())
            .count();
        assert_eq!(untouched, 2);
    }

    #[tokio::test]
    async fn test_high_risk_is_skipped_and_escalated_then_not_regenerated() {
        let pool = init_test_db().unwrap();
        let llm = FakeLlm::fixed(r#"{"sql":"CREATE INDEX i ON t (x)","explanation":"unsure","risk":"high"}"#);
        let admin = FakeAdmin::accepting();
        let ctx = ctx_with(&pool, llm.clone(), admin.clone());
        let r = fixable_report(&pool, r#"column "bio" of relation "profiles" does not exist"#);

        let summary = heal(&ctx).await;
        assert_eq!(summary.counters.schema_skipped, 1);
        assert!(ddl(&admin).is_empty());
        let log = schema_heal::list_all(&pool).unwrap();
        assert_eq!(log[0].execution_result, ExecutionResult::Skipped);
        assert_eq!(
            reports::get_by_id(&pool, &r.id).unwrap().schema_heal_state.as_deref(),
            Some("skipped")
        );
        let escalations = incidents::list_by_source(&pool, SOURCE_SCHEMA_HEALER).unwrap();
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].severity, Severity::High);

        // A later report with the same fingerprint escalates without a new call.
        fixable_report(&pool, r#"column "bio" of relation "profiles" does not exist"#);
        let summary = heal(&ctx).await;
        assert_eq!(summary.counters.schema_escalated, 1);
        assert_eq!(llm.call_count(), 1);
        assert_eq!(incidents::list_by_source(&pool, SOURCE_SCHEMA_HEALER).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unsafe_fix_is_blocked() {
        let pool = init_test_db().unwrap();
        let llm = FakeLlm::fixed(r#"{"sql":"DROP TABLE profiles","explanation":"start over","risk":"low"}"#);
        let admin = FakeAdmin::accepting();
        let ctx = ctx_with(&pool, llm, admin.clone());
        fixable_report(&pool, r#"relation "profiles" does not exist"#);

        let summary = heal(&ctx).await;
        assert_eq!(summary.counters.schema_blocked, 1);
        assert!(ddl(&admin).is_empty());
        let log = schema_heal::list_all(&pool).unwrap();
        assert_eq!(log[0].execution_result, ExecutionResult::Blocked);
        assert_eq!(log[0].execution_error.as_deref(), Some("denied: drop"));
    }

    #[tokio::test]
    async fn test_loop_breaker_escalates_after_two_failures() {
        let pool = init_test_db().unwrap();
        let llm = FakeLlm::fixed(LOW_RISK_FIX);
        let admin = FakeAdmin::new(|sql| {
            if sql.starts_with("CREATE") {
                Err(AppError::Upstream("admin query 400: permission denied".into()))
            } else {
                Ok(serde_json::json!([]))
            }
        });
        let ctx = ctx_with(&pool, llm.clone(), admin.clone());
        let text = r#"column "bio" of relation "profiles" does not exist"#;

        fixable_report(&pool, text);
        fixable_report(&pool, text);
        let summary = heal(&ctx).await;
        assert_eq!(summary.counters.schema_failed, 2);
        assert_eq!(llm.call_count(), 2);

        let third = fixable_report(&pool, text);
        let summary = heal(&ctx).await;
        assert_eq!(summary.counters.schema_escalated, 1);
        assert_eq!(llm.call_count(), 2);
        assert_eq!(
            reports::get_by_id(&pool, &third.id).unwrap().schema_heal_state.as_deref(),
            Some("escalated")
        );
    }

    #[tokio::test]
    async fn test_generation_timeouts_do_not_trip_loop_breaker() {
        let pool = init_test_db().unwrap();
        let attempts = std::sync::atomic::AtomicUsize::new(0);
        let llm = FakeLlm::new(move |_| {
            if attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst) < 2 {
                Err(AppError::Timeout("completion timed out".into()))
            } else {
                Ok(LOW_RISK_FIX.to_string())
            }
        });
        let admin = FakeAdmin::accepting();
        let ctx = ctx_with(&pool, llm.clone(), admin.clone());
        let r = fixable_report(&pool, r#"column "bio" of relation "profiles" does not exist"#);

        for _ in 0..2 {
            let summary = heal(&ctx).await;
            assert_eq!(summary.counters.schema_failed, 0);
            assert_eq!(summary.errors.len(), 1);
            assert!(reports::get_by_id(&pool, &r.id).unwrap().schema_heal_state.is_none());
        }
        let log = schema_heal::list_all(&pool).unwrap();
        assert_eq!(log.len(), 2);
        assert!(log.iter().all(|l| l.execution_result == ExecutionResult::Skipped));

        let summary = heal(&ctx).await;
        assert_eq!(summary.counters.schema_healed, 1);
        assert_eq!(summary.counters.schema_escalated, 0);
        assert_eq!(llm.call_count(), 3);
        assert_eq!(ddl(&admin).len(), 1);
        assert!(incidents::list_by_source(&pool, SOURCE_SCHEMA_HEALER).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_introspection_failure_leaves_candidate_for_next_run() {
        let pool = init_test_db().unwrap();
        let llm = FakeLlm::fixed(LOW_RISK_FIX);
        let admin = FakeAdmin::new(|_| Err(AppError::Timeout("admin query timed out".into())));
        let ctx = ctx_with(&pool, llm.clone(), admin);
        let r = fixable_report(&pool, r#"column "bio" of relation "profiles" does not exist"#);

        let summary = heal(&ctx).await;
        assert_eq!(summary.counters.schema_failed, 0);
        assert_eq!(llm.call_count(), 0);
        assert!(reports::get_by_id(&pool, &r.id).unwrap().schema_heal_state.is_none());
        let log = schema_heal::list_all(&pool).unwrap();
        assert_eq!(log[0].execution_result, ExecutionResult::Skipped);
        assert!(log[0].execution_error.as_deref().unwrap().starts_with("introspection failed"));
    }

    #[tokio::test]
    async fn test_unclassified_candidates_are_marked() {
        let pool = init_test_db().unwrap();
        let llm = FakeLlm::fixed(LOW_RISK_FIX);
        let ctx = ctx_with(&pool, llm.clone(), FakeAdmin::accepting());
        let r = fixable_report(&pool, "TypeError: undefined is not a function");

        heal(&ctx).await;
        assert_eq!(llm.call_count(), 0);
        assert_eq!(
            reports::get_by_id(&pool, &r.id).unwrap().schema_heal_state.as_deref(),
            Some("unclassified")
        );
    }

    #[tokio::test]
    async fn test_missing_collaborators_leave_candidates_alone() {
        let pool = init_test_db().unwrap();
        let ctx = test_support::context(pool.clone());
        let r = fixable_report(&pool, r#"relation "x" does not exist"#);
        heal(&ctx).await;
        assert!(reports::get_by_id(&pool, &r.id).unwrap().schema_heal_state.is_none());
    }
}
