//! End-of-run cleanup: quiet incidents resolve themselves, old operational
//! rows are pruned, stale processed reports are closed.

use chrono::Duration;

use super::{RunState, RunSummary, SentinelContext};
use crate::db;
use crate::db::models::{SOURCE_ANOMALY, SOURCE_DEPLOY, SOURCE_SENTINEL};
use crate::db::repos::intake::reports;
use crate::db::repos::ops::{baselines, escalations, runs};
use crate::db::repos::remediation::{breakers, heal_log, incidents};
use crate::error::AppError;

/// Incident sources that close on their own once errors stop arriving.
/// Deploy correlations are sentinel-raised and follow the same quiet period.
const AUTO_RESOLVE_SOURCES: &[&str] = &[SOURCE_SENTINEL, SOURCE_DEPLOY, SOURCE_ANOMALY];

pub async fn run(
    ctx: &SentinelContext,
    _state: &mut RunState,
    summary: &mut RunSummary,
) -> Result<(), AppError> {
    let t = &ctx.config.thresholds;

    let quiet_since = db::since(Duration::hours(t.stale_incident_hours));
    let resolved = incidents::resolve_stale(&ctx.pool, AUTO_RESOLVE_SOURCES, &quiet_since)?;
    summary.counters.incidents_auto_resolved += resolved as u64;

    // schema_heal_log is an audit trail and is never pruned.
    let cutoff = db::since(Duration::days(t.retention_days));
    let pruned = runs::prune(&ctx.pool, &cutoff)?
        + breakers::prune_events(&ctx.pool, &cutoff)?
        + heal_log::prune(&ctx.pool, &cutoff)?
        + escalations::prune(&ctx.pool, &cutoff)?
        + baselines::prune_checks(&ctx.pool, &cutoff)?;
    summary.counters.rows_pruned += pruned as u64;

    let stale_reports = db::since(Duration::days(t.stale_report_days));
    let closed = reports::resolve_stale(&ctx.pool, &stale_reports)?;
    summary.counters.reports_resolved += closed as u64;

    if resolved + pruned + closed > 0 {
        tracing::info!(
            incidents_resolved = resolved,
            rows_pruned = pruned,
            reports_resolved = closed,
            "Housekeeping complete"
        );
    }
    Ok(())
}
