//! Deploy correlation and automatic rollback.

use chrono::{Duration, Utc};

use super::catalog::{self, DedupKey};
use super::remediation::count_outcome;
use super::{CorrelationDescriptor, RunState, RunSummary, SentinelContext};
use crate::db;
use crate::db::models::{DeployEvent, NewIncident, RollbackStatus, Severity, SOURCE_DEPLOY};
use crate::db::repos::intake::reports;
use crate::db::repos::release::{deploys, rollbacks};
use crate::db::repos::remediation::incidents;
use crate::error::AppError;

/// Deployments fetched when looking for a rollback target.
const ROLLBACK_SEARCH_LIMIT: usize = 20;

/// Map a platform ready-state (or webhook event type) onto the stored deploy
/// status.
pub fn map_ready_state(ready_state: &str) -> &'static str {
    match ready_state.to_ascii_uppercase().as_str() {
        "BUILDING" | "INITIALIZING" | "QUEUED" | "DEPLOYMENT.CREATED" => "building",
        "READY" | "DEPLOYMENT.READY" | "DEPLOYMENT.SUCCEEDED" => "ready",
        "ERROR" | "DEPLOYMENT.ERROR" => "error",
        "CANCELED" | "DEPLOYMENT.CANCELED" => "canceled",
        _ => "unknown",
    }
}

fn short_sha(deploy: &DeployEvent) -> String {
    let sha = deploy.commit_sha.as_deref().unwrap_or(&deploy.deployment_id);
    sha.chars().take(7).collect()
}

/// Open or merge a correlation incident when a burst of errors follows the
/// latest deploy.
pub async fn correlate(
    ctx: &SentinelContext,
    state: &mut RunState,
    summary: &mut RunSummary,
) -> Result<(), AppError> {
    let t = &ctx.config.thresholds;
    let window = Duration::minutes(t.deploy_window_minutes);
    let Some(deploy) = deploys::latest_since(&ctx.pool, &db::since(window))? else {
        return Ok(());
    };
    let Some(deployed_at) = db::parse_timestamp(&deploy.deployed_at) else {
        return Ok(());
    };
    let window_end = deployed_at + window;

    let in_batch = state
        .batch
        .iter()
        .filter_map(|p| db::parse_timestamp(&p.report.created_at))
        .filter(|at| *at >= deployed_at && *at <= window_end)
        .count();
    if in_batch < t.correlation_min_errors {
        return Ok(());
    }

    // Count from the store so reports re-loaded across runs are not double counted.
    let total = reports::count_created_between(
        &ctx.pool,
        &deploy.deployed_at,
        &db::timestamp(window_end),
    )?
    .max(in_batch as i64) as usize;
    let severity = if total >= t.correlation_critical_errors {
        Severity::Critical
    } else {
        Severity::High
    };

    let sha = short_sha(&deploy);
    let mut incident = NewIncident::detected(
        format!("[Deploy Correlation] {total} errors after deploy {sha}"),
        severity,
        SOURCE_DEPLOY,
    );
    incident.diagnosis = Some(format!(
        "{total} error reports within {} minutes of deployment {} ({})",
        t.deploy_window_minutes,
        deploy.deployment_id,
        deploy.commit_message.as_deref().unwrap_or("no commit message"),
    ));
    incident.metadata = serde_json::json!({
        "deploy_id": deploy.deployment_id,
        "deploy_event_id": deploy.id,
        "commit_sha": deploy.commit_sha,
        "branch": deploy.branch,
        "error_count": total,
    });
    let (incident, outcome) = catalog::open_or_merge(
        &ctx.pool,
        incident,
        DedupKey::Metadata { key: "deploy_id", value: &deploy.deployment_id, since: None },
    )?;
    count_outcome(summary, outcome);
    summary.counters.deploy_correlations += 1;

    tracing::warn!(
        deployment_id = %deploy.deployment_id,
        errors = total,
        severity = incident.severity.as_str(),
        "Error burst correlated with deploy"
    );

    state.correlation = Some(CorrelationDescriptor {
        deploy_event_id: deploy.id.clone(),
        deployment_id: deploy.deployment_id.clone(),
        deployed_at: deploy.deployed_at.clone(),
        incident_id: incident.id,
        error_count: total,
        severity: incident.severity,
    });
    Ok(())
}

/// Roll back a critical correlated deploy, at most once per deployment.
pub async fn rollback(
    ctx: &SentinelContext,
    state: &mut RunState,
    summary: &mut RunSummary,
) -> Result<(), AppError> {
    let Some(correlation) = state.correlation.clone() else {
        return Ok(());
    };
    if correlation.severity != Severity::Critical
        || correlation.error_count < ctx.config.thresholds.rollback_min_errors
    {
        return Ok(());
    }
    if rollbacks::exists_for_deployment(&ctx.pool, &correlation.deployment_id)? {
        tracing::debug!(deployment_id = %correlation.deployment_id, "Rollback already recorded");
        return Ok(());
    }

    let (status, target, reason) = attempt_rollback(ctx, &correlation).await;
    rollbacks::record(
        &ctx.pool,
        Some(&correlation.deploy_event_id),
        &correlation.deployment_id,
        Some(&correlation.incident_id),
        target.as_deref(),
        status,
        &reason,
    )?;
    incidents::annotate(
        &ctx.pool,
        &correlation.incident_id,
        &format!("Rollback {}: {reason}", status.as_str()),
    )?;
    summary.counters.rollback = Some(status.as_str().to_string());

    match status {
        RollbackStatus::Success => tracing::warn!(
            deployment_id = %correlation.deployment_id,
            target = target.as_deref().unwrap_or(""),
            "Rolled back production deploy"
        ),
        RollbackStatus::Failed => summary.note_error("rollback", &reason),
        RollbackStatus::Skipped => tracing::info!(%reason, "Rollback skipped"),
    }
    Ok(())
}

async fn attempt_rollback(
    ctx: &SentinelContext,
    correlation: &CorrelationDescriptor,
) -> (RollbackStatus, Option<String>, String) {
    let Some(platform) = ctx.platform.as_ref() else {
        return (
            RollbackStatus::Skipped,
            None,
            "deployment platform credentials not configured".into(),
        );
    };

    let deployments = match platform.list_deployments(ROLLBACK_SEARCH_LIMIT).await {
        Ok(d) => d,
        Err(e) => return (RollbackStatus::Failed, None, format!("listing deployments failed: {e}")),
    };

    let suspect_created = deployments
        .iter()
        .find(|d| d.uid == correlation.deployment_id)
        .map(|d| d.created_ms())
        .or_else(|| db::parse_timestamp(&correlation.deployed_at).map(|t| t.timestamp_millis()))
        .unwrap_or_else(|| Utc::now().timestamp_millis());

    let target = deployments
        .iter()
        .filter(|d| {
            d.uid != correlation.deployment_id
                && d.ready_state().eq_ignore_ascii_case("READY")
                && d.is_production()
                && d.created_ms() < suspect_created
        })
        .max_by_key(|d| d.created_ms());
    let Some(target) = target else {
        return (
            RollbackStatus::Skipped,
            None,
            "no earlier READY production deployment found".into(),
        );
    };

    match platform.redeploy(&target.uid).await {
        Ok(new_id) => (
            RollbackStatus::Success,
            Some(target.uid.clone()),
            format!(
                "redeployed {} as {new_id} after {} errors",
                target.uid, correlation.error_count
            ),
        ),
        Err(e) => (
            RollbackStatus::Failed,
            Some(target.uid.clone()),
            format!("redeploy of {} failed: {e}", target.uid),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::db::models::{NewDeployEvent, NewErrorReport};
    use crate::engine::test_support::{self, FakePlatform};
    use crate::engine::ingest;

    fn deploy_minutes_ago(pool: &db::DbPool, id: &str, minutes: i64) -> DeployEvent {
        deploys::upsert(
            pool,
            NewDeployEvent {
                deployment_id: id.into(),
                commit_sha: Some("abc1234def".into()),
                status: "ready".into(),
                deployed_at: db::since(Duration::minutes(minutes)),
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn errors_minutes_ago(pool: &db::DbPool, count: usize, minutes: i64) {
        for i in 0..count {
            reports::create(
                pool,
                NewErrorReport {
                    description: format!("render failure #{i}"),
                    created_at: Some(db::since(Duration::minutes(minutes))),
                    ..Default::default()
                },
            )
            .unwrap();
        }
    }

    async fn correlate_and_rollback(ctx: &SentinelContext) -> (RunState, RunSummary) {
        let mut state = RunState::default();
        let mut summary = RunSummary::new("test");
        ingest::run(ctx, &mut state, &mut summary).await.unwrap();
        correlate(ctx, &mut state, &mut summary).await.unwrap();
        rollback(ctx, &mut state, &mut summary).await.unwrap();
        (state, summary)
    }

    #[test]
    fn test_map_ready_state() {
        assert_eq!(map_ready_state("QUEUED"), "building");
        assert_eq!(map_ready_state("ready"), "ready");
        assert_eq!(map_ready_state("ERROR"), "error");
        assert_eq!(map_ready_state("CANCELED"), "canceled");
        assert_eq!(map_ready_state("deployment.succeeded"), "ready");
        assert_eq!(map_ready_state("deployment.error"), "error");
        assert_eq!(map_ready_state("DELETED"), "unknown");
    }

    #[tokio::test]
    async fn test_small_burst_opens_high_incident_without_rollback() {
        let pool = init_test_db().unwrap();
        let ctx = test_support::context(pool.clone());
        deploy_minutes_ago(&pool, "dpl_new", 20);
        errors_minutes_ago(&pool, 4, 10);

        let (state, summary) = correlate_and_rollback(&ctx).await;
        let correlation = state.correlation.unwrap();
        assert_eq!(correlation.severity, Severity::High);
        assert_eq!(correlation.error_count, 4);
        assert!(summary.counters.rollback.is_none());

        let incident = incidents::get_by_id(&pool, &correlation.incident_id).unwrap();
        assert_eq!(incident.title, "[Deploy Correlation] 4 errors after deploy abc1234");
        assert!(rollbacks::list_for_deployment(&pool, "dpl_new").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_errors_before_deploy_are_not_correlated() {
        let pool = init_test_db().unwrap();
        let ctx = test_support::context(pool.clone());
        deploy_minutes_ago(&pool, "dpl_new", 5);
        errors_minutes_ago(&pool, 6, 20);

        let (state, _) = correlate_and_rollback(&ctx).await;
        assert!(state.correlation.is_none());
    }

    #[tokio::test]
    async fn test_critical_burst_rolls_back_once() {
        let pool = init_test_db().unwrap();
        let now_ms = Utc::now().timestamp_millis();
        let platform = FakePlatform::new(vec![
            FakePlatform::deployment("dpl_new", "READY", "production", now_ms - 20 * 60_000),
            FakePlatform::deployment("dpl_preview", "READY", "preview", now_ms - 60 * 60_000),
            FakePlatform::deployment("dpl_broken", "ERROR", "production", now_ms - 90 * 60_000),
            FakePlatform::deployment("dpl_good", "READY", "production", now_ms - 120 * 60_000),
            FakePlatform::deployment("dpl_older", "READY", "production", now_ms - 240 * 60_000),
        ]);
        let mut ctx = test_support::context(pool.clone());
        ctx.platform = Some(platform.clone());
        deploy_minutes_ago(&pool, "dpl_new", 20);
        errors_minutes_ago(&pool, 12, 10);

        let (state, summary) = correlate_and_rollback(&ctx).await;
        assert_eq!(state.correlation.unwrap().severity, Severity::Critical);
        assert_eq!(summary.counters.rollback.as_deref(), Some("success"));
        assert_eq!(*platform.redeployed.lock().unwrap(), vec!["dpl_good".to_string()]);

        let events = rollbacks::list_for_deployment(&pool, "dpl_new").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].target_deployment_id.as_deref(), Some("dpl_good"));

        // A later run merges into the same incident and does not roll back again.
        let (state, summary) = correlate_and_rollback(&ctx).await;
        assert!(state.correlation.is_some());
        assert!(summary.counters.rollback.is_none());
        assert_eq!(platform.redeployed.lock().unwrap().len(), 1);
        assert_eq!(incidents::list_by_source(&pool, SOURCE_DEPLOY).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_without_credentials_is_recorded_skipped() {
        let pool = init_test_db().unwrap();
        let ctx = test_support::context(pool.clone());
        deploy_minutes_ago(&pool, "dpl_new", 20);
        errors_minutes_ago(&pool, 10, 10);

        let (state, summary) = correlate_and_rollback(&ctx).await;
        assert_eq!(summary.counters.rollback.as_deref(), Some("skipped"));
        let events = rollbacks::list_for_deployment(&pool, "dpl_new").unwrap();
        assert_eq!(events[0].status, "skipped");

        let incident = incidents::get_by_id(&pool, &state.correlation.unwrap().incident_id).unwrap();
        assert!(incident.diagnosis.unwrap().contains("Rollback skipped: deployment platform credentials"));
    }
}
