//! Run coordinator: executes every phase in a fixed order against one
//! persisted `sentinel_runs` row.
//!
//! Each phase is isolated. An `Err` or a panic inside a phase is folded into
//! the run's error list and the next phase still runs. Only failing to open
//! or close the run row marks the run `failed`.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use futures_util::FutureExt;
use serde::Serialize;

use super::{
    anomaly, breaker, deploy, diagnoser, escalation, housekeeping, ingest, remediation, schema,
    RunState, RunSummary, SentinelContext,
};
use crate::db::repos::ops::runs;
use crate::error::AppError;

// =============================================================================
// Phases
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Ingest,
    Match,
    Diagnose,
    Remediate,
    SchemaHeal,
    DeployCorrelation,
    Anomaly,
    AggregateBreaker,
    Escalation,
    Housekeeping,
}

impl Phase {
    /// Every phase in execution order.
    pub const ALL: &'static [Phase] = &[
        Phase::Ingest,
        Phase::Match,
        Phase::Diagnose,
        Phase::Remediate,
        Phase::SchemaHeal,
        Phase::DeployCorrelation,
        Phase::Anomaly,
        Phase::AggregateBreaker,
        Phase::Escalation,
        Phase::Housekeeping,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Match => "match",
            Self::Diagnose => "diagnose",
            Self::Remediate => "remediate",
            Self::SchemaHeal => "schema_heal",
            Self::DeployCorrelation => "deploy_correlation",
            Self::Anomaly => "anomaly",
            Self::AggregateBreaker => "aggregate_breaker",
            Self::Escalation => "escalation",
            Self::Housekeeping => "housekeeping",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

async fn run_phase(
    phase: Phase,
    ctx: &SentinelContext,
    state: &mut RunState,
    summary: &mut RunSummary,
) -> Result<(), AppError> {
    match phase {
        Phase::Ingest => ingest::run(ctx, state, summary).await,
        Phase::Match => ingest::match_batch(ctx, state, summary).await,
        Phase::Diagnose => diagnoser::run(ctx, state, summary).await,
        Phase::Remediate => remediation::run(ctx, state, summary).await,
        Phase::SchemaHeal => schema::run(ctx, state, summary).await,
        Phase::DeployCorrelation => {
            deploy::correlate(ctx, state, summary).await?;
            deploy::rollback(ctx, state, summary).await
        }
        Phase::Anomaly => anomaly::run(ctx, state, summary).await,
        Phase::AggregateBreaker => breaker::run(ctx, state, summary).await,
        Phase::Escalation => escalation::run(ctx, state, summary).await,
        Phase::Housekeeping => housekeeping::run(ctx, state, summary).await,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into())
}

// =============================================================================
// Entry point
// =============================================================================

/// Run one full pipeline pass. Never returns an error: every failure is
/// reported through the summary's `status` and `errors`.
pub async fn run_pipeline(ctx: &SentinelContext, trigger: &str) -> RunSummary {
    let started = Instant::now();
    let mut summary = RunSummary::new(trigger);

    let run = match runs::start(&ctx.pool, trigger) {
        Ok(run) => run,
        Err(e) => {
            tracing::error!(trigger, error = %e, "Failed to open sentinel run");
            summary.status = "failed".into();
            summary.errors.push(format!("run: {e}"));
            summary.duration_ms = started.elapsed().as_millis() as u64;
            return summary;
        }
    };
    summary.run_id = Some(run.id.clone());
    tracing::info!(run_id = %run.id, trigger, "Sentinel run started");

    let mut state = RunState::default();
    for &phase in Phase::ALL {
        let phase_started = Instant::now();
        let outcome = AssertUnwindSafe(run_phase(phase, ctx, &mut state, &mut summary))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(run_id = %run.id, phase = %phase, error = %e, "Sentinel phase failed");
                summary.errors.push(format!("{phase}: {e}"));
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(run_id = %run.id, phase = %phase, panic = %message, "Sentinel phase panicked");
                summary.errors.push(format!("{phase}: panicked: {message}"));
            }
        }
        tracing::debug!(
            run_id = %run.id,
            phase = %phase,
            duration_ms = phase_started.elapsed().as_millis() as u64,
            "Phase finished"
        );
    }

    summary.status = "completed".into();
    summary.duration_ms = started.elapsed().as_millis() as u64;

    let counters = serde_json::to_value(&summary.counters).unwrap_or_else(|_| serde_json::json!({}));
    if let Err(e) = runs::finish(&ctx.pool, &run.id, &summary.status, &counters, &summary.errors) {
        tracing::error!(run_id = %run.id, error = %e, "Failed to finalize sentinel run");
        summary.status = "failed".into();
        summary.errors.push(format!("run: {e}"));
    }

    tracing::info!(
        run_id = %run.id,
        status = %summary.status,
        errors = summary.errors.len(),
        duration_ms = summary.duration_ms,
        reports = summary.counters.reports_loaded,
        matched = summary.counters.patterns_matched,
        healed = summary.counters.schema_healed,
        "Sentinel run finished"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    use crate::db::models::{
        MatchType, NewDeployEvent, NewErrorReport, NewIncident, Severity, SOURCE_DEPLOY, SOURCE_SENTINEL,
    };
    use crate::db::repos::intake::{patterns, reports};
    use crate::db::repos::release::{deploys, rollbacks};
    use crate::db::repos::remediation::incidents;
    use crate::db::{self, init_test_db};
    use crate::engine::test_support::{self, FakeAdmin, FakeLlm};

    const MISSING_RELATION: &str = r#"relation "discussion_replies" does not exist"#;

    const REPLACE_FUNCTION: &str = "CREATE OR REPLACE FUNCTION public.get_replies(p_id uuid) \
RETURNS SETOF discussion_comments LANGUAGE sql AS $$ SELECT * FROM discussion_comments WHERE thread_id = p_id $$";

    fn schema_llm() -> std::sync::Arc<FakeLlm> {
        FakeLlm::new(|req| {
            if req.system.contains("schema drift") {
                Ok(serde_json::json!({
                    "sql": REPLACE_FUNCTION,
                    "explanation": "replies moved to discussion_comments",
                    "risk": "low",
                })
                .to_string())
            } else {
                Ok(test_support::fixable_diagnosis())
            }
        })
    }

    #[test]
    fn test_phase_order_is_fixed() {
        let labels: Vec<&str> = Phase::ALL.iter().map(Phase::label).collect();
        assert_eq!(
            labels,
            vec![
                "ingest",
                "match",
                "diagnose",
                "remediate",
                "schema_heal",
                "deploy_correlation",
                "anomaly",
                "aggregate_breaker",
                "escalation",
                "housekeeping",
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_run_completes_and_persists_counters() {
        let pool = init_test_db().unwrap();
        let ctx = test_support::context(pool.clone());

        let summary = run_pipeline(&ctx, "cli").await;
        assert_eq!(summary.status, "completed");
        assert!(summary.errors.is_empty());

        let stored = runs::get_by_id(&pool, summary.run_id.as_deref().unwrap()).unwrap();
        assert_eq!(stored.status, "completed");
        assert_eq!(stored.trigger_source, "cli");
        assert_eq!(stored.counters["reports_loaded"], 0);
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_repeated_schema_error_is_healed_then_pattern_matched() {
        let pool = init_test_db().unwrap();
        let llm = schema_llm();
        let admin = FakeAdmin::accepting();
        let mut ctx = test_support::context(pool.clone());
        ctx.llm = Some(llm.clone());
        ctx.admin = Some(admin.clone());
        for _ in 0..12 {
            test_support::report(&pool, MISSING_RELATION);
        }

        let first = run_pipeline(&ctx, "schedule").await;
        assert_eq!(first.status, "completed");
        assert_eq!(first.counters.reports_loaded, 12);
        assert_eq!(first.counters.ai_diagnosed, 5);
        assert_eq!(first.counters.reports_deferred, 7);
        assert_eq!(first.counters.schema_healed, 1);
        assert_eq!(first.counters.schema_already_healed, 4);
        // one diagnosis call for the shared fingerprint, one fix generation
        assert_eq!(llm.call_count(), 2);
        assert!(patterns::find_by_text(&pool, MISSING_RELATION, MatchType::Substring)
            .unwrap()
            .is_some());

        let second = run_pipeline(&ctx, "schedule").await;
        assert_eq!(second.counters.reports_loaded, 7);
        assert_eq!(second.counters.patterns_matched, 7);
        assert_eq!(second.counters.ai_diagnosed, 0);
        assert_eq!(llm.call_count(), 2);
        assert!(reports::get_unprocessed(&pool, 100).unwrap().is_empty());

        let executed: Vec<String> = admin
            .executed()
            .into_iter()
            .filter(|q| q.starts_with("CREATE OR REPLACE FUNCTION"))
            .collect();
        assert_eq!(executed.len(), 1);
    }

    #[tokio::test]
    async fn test_small_post_deploy_burst_is_high_without_rollback() {
        let pool = init_test_db().unwrap();
        let ctx = test_support::context(pool.clone());
        deploys::upsert(
            &pool,
            NewDeployEvent {
                deployment_id: "dpl_t".into(),
                status: "ready".into(),
                deployed_at: db::since(Duration::minutes(20)),
                ..Default::default()
            },
        )
        .unwrap();
        for i in 0..4 {
            reports::create(
                &pool,
                NewErrorReport {
                    description: format!("checkout render failed #{i}"),
                    created_at: Some(db::since(Duration::minutes(10))),
                    ..Default::default()
                },
            )
            .unwrap();
        }

        let summary = run_pipeline(&ctx, "schedule").await;
        assert_eq!(summary.counters.deploy_correlations, 1);
        assert!(summary.counters.rollback.is_none());
        let opened = incidents::list_by_source(&pool, SOURCE_DEPLOY).unwrap();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].severity, Severity::High);
        assert!(rollbacks::list_for_deployment(&pool, "dpl_t").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_phase_does_not_stop_later_phases() {
        let pool = init_test_db().unwrap();
        let mut ctx = test_support::context(pool.clone());
        ctx.llm = Some(FakeLlm::new(|_| panic!("model client exploded")));
        test_support::report(&pool, "unrecognised failure");
        let stale =
            incidents::create(&pool, NewIncident::detected("quiet", Severity::Low, SOURCE_SENTINEL)).unwrap();
        incidents::set_detected_at(&pool, &stale.id, &db::since(Duration::hours(3))).unwrap();

        let summary = run_pipeline(&ctx, "manual").await;
        assert_eq!(summary.status, "completed");
        assert_eq!(summary.errors.len(), 1);
        assert!(summary.errors[0].starts_with("diagnose: panicked: model client exploded"));
        // housekeeping still ran
        assert_eq!(summary.counters.incidents_auto_resolved, 1);
    }
}
