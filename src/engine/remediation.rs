//! Remediation executor: applies the concrete action of each matched pattern.

use chrono::Utc;

use super::catalog::{self, clip, DedupKey, IncidentOutcome};
use super::{QueuedAction, RunState, RunSummary, SentinelContext};
use crate::db;
use crate::db::models::{
    ErrorPattern, FixAction, NewIncident, Severity, SOURCE_CIRCUIT_BREAKER, SOURCE_SENTINEL,
};
use crate::db::repos::intake::patterns;
use crate::db::repos::remediation::{breakers, heal_log};
use crate::error::AppError;

/// Characters of the pattern used to find an existing open incident.
const DEDUP_FRAGMENT_LEN: usize = 50;

/// Whether `pattern` fired recently enough that its action must not repeat.
pub fn in_cooldown(pattern: &ErrorPattern, now: chrono::DateTime<Utc>) -> bool {
    if pattern.cooldown_minutes <= 0 {
        return false;
    }
    let Some(last) = pattern.last_fixed_at.as_deref().and_then(db::parse_timestamp) else {
        return false;
    };
    now < last + chrono::Duration::minutes(pattern.cooldown_minutes)
}

pub async fn run(
    ctx: &SentinelContext,
    state: &mut RunState,
    summary: &mut RunSummary,
) -> Result<(), AppError> {
    for action in std::mem::take(&mut state.queued) {
        // Cooldown state may have moved since the pattern was loaded.
        let pattern = match patterns::get_by_id(&ctx.pool, &action.pattern.id) {
            Ok(p) => p,
            Err(e) => {
                summary.note_error("remediate", format!("pattern {}: {e}", action.pattern.id));
                continue;
            }
        };

        if in_cooldown(&pattern, Utc::now()) {
            summary.counters.remediations_in_cooldown += 1;
            tracing::debug!(pattern_id = %pattern.id, "Pattern in cooldown, skipping action");
            continue;
        }
        match patterns::claim_fix(&ctx.pool, &pattern.id, pattern.last_fixed_at.as_deref()) {
            Ok(true) => {}
            Ok(false) => {
                summary.counters.remediations_in_cooldown += 1;
                continue;
            }
            Err(e) => {
                summary.note_error("remediate", format!("pattern {}: {e}", pattern.id));
                continue;
            }
        }

        let result = apply(ctx, &action, &pattern, summary);
        let (success, details) = match &result {
            Ok(details) => (true, details.clone()),
            Err(e) => (false, e.to_string()),
        };
        if let Err(e) = heal_log::record(
            &ctx.pool,
            Some(&action.report_id),
            Some(&pattern.id),
            pattern.auto_fix_action.as_str(),
            success,
            &details,
        ) {
            summary.note_error("remediate", format!("heal log: {e}"));
        }

        match result {
            Ok(_) => {
                summary.counters.remediations_applied += 1;
                if let Err(e) = patterns::record_fix(&ctx.pool, &pattern.id) {
                    summary.note_error("remediate", format!("pattern {}: {e}", pattern.id));
                }
            }
            Err(e) => {
                summary.counters.remediations_failed += 1;
                summary.note_error("remediate", format!("pattern {}: {e}", pattern.id));
            }
        }
    }
    Ok(())
}

/// Apply one action. Returns a short description for the heal log.
fn apply(
    ctx: &SentinelContext,
    action: &QueuedAction,
    pattern: &ErrorPattern,
    summary: &mut RunSummary,
) -> Result<String, AppError> {
    match pattern.auto_fix_action {
        FixAction::CreateIncident => pattern_incident(ctx, action, pattern, summary),
        FixAction::CircuitBreaker | FixAction::DisableFeature => {
            let features = catalog::features_for_category(&pattern.category);
            if features.is_empty() {
                tracing::debug!(
                    category = %pattern.category,
                    "No feature mapped to category, opening incident instead"
                );
                return pattern_incident(ctx, action, pattern, summary);
            }
            let mut tripped = Vec::with_capacity(features.len());
            for feature in features {
                let trip = Trip {
                    tenant_id: action.tenant_id.as_deref(),
                    error_count: pattern.times_matched,
                    reason: format!("pattern {} matched ({})", pattern.id, clip(&pattern.pattern, 80)),
                    latest_report_id: Some(&action.report_id),
                };
                trip_feature(ctx, pattern, feature, &trip, summary)?;
                tripped.push(feature);
            }
            Ok(format!(
                "disabled {} for {}",
                tripped.join(", "),
                breakers::scope_for(action.tenant_id.as_deref())
            ))
        }
        FixAction::LogOnly | FixAction::SchemaHeal => Ok("no action".into()),
    }
}

fn pattern_incident(
    ctx: &SentinelContext,
    action: &QueuedAction,
    pattern: &ErrorPattern,
    summary: &mut RunSummary,
) -> Result<String, AppError> {
    let mut incident = NewIncident::detected(
        format!("[Sentinel] {}: {}", pattern.category, clip(&pattern.pattern, 80)),
        Severity::parse(&pattern.severity),
        SOURCE_SENTINEL,
    );
    incident.error_pattern = Some(pattern.pattern.clone());
    incident.diagnosis = pattern.fix_description.clone();
    incident.metadata = serde_json::json!({
        "pattern_id": pattern.id,
        "latest_report_id": action.report_id,
        "tenant_id": action.tenant_id,
    });

    let (created, outcome) = catalog::open_or_merge(
        &ctx.pool,
        incident,
        DedupKey::Pattern(clip(&pattern.pattern, DEDUP_FRAGMENT_LEN)),
    )?;
    count_outcome(summary, outcome);
    Ok(format!("incident {} {}", created.id, outcome_label(outcome)))
}

/// Why and for whom a feature is being disabled.
pub(crate) struct Trip<'a> {
    pub tenant_id: Option<&'a str>,
    pub error_count: i64,
    pub reason: String,
    pub latest_report_id: Option<&'a str>,
}

/// Disable `feature` for the trip's scope, record the breaker event and
/// open or merge the matching breaker incident.
pub(crate) fn trip_feature(
    ctx: &SentinelContext,
    pattern: &ErrorPattern,
    feature: &str,
    trip: &Trip<'_>,
    summary: &mut RunSummary,
) -> Result<(), AppError> {
    let scope = breakers::scope_for(trip.tenant_id);

    breakers::set_feature_enabled(&ctx.pool, scope, feature, false)?;
    breakers::record_event(
        &ctx.pool,
        feature,
        trip.tenant_id,
        "tripped",
        &trip.reason,
        trip.error_count,
        ctx.config.thresholds.breaker_threshold,
    )?;
    summary.counters.breakers_tripped += 1;

    let breaker_key = format!("{feature}:{scope}");
    let mut incident = NewIncident::detected(
        format!("[Circuit Breaker] {feature} disabled for {scope}"),
        Severity::parse(&pattern.severity),
        SOURCE_CIRCUIT_BREAKER,
    );
    incident.status = "healing".into();
    incident.auto_healed = true;
    incident.heal_action = Some(format!("circuit_breaker:{feature}"));
    incident.error_pattern = Some(pattern.pattern.clone());
    incident.metadata = serde_json::json!({
        "breaker_key": breaker_key,
        "feature_key": feature,
        "scope": scope,
        "pattern_id": pattern.id,
        "error_count": trip.error_count,
        "latest_report_id": trip.latest_report_id,
    });
    let (_, outcome) = catalog::open_or_merge(
        &ctx.pool,
        incident,
        DedupKey::Metadata { key: "breaker_key", value: &breaker_key, since: None },
    )?;
    count_outcome(summary, outcome);

    tracing::warn!(feature, scope, pattern_id = %pattern.id, "Circuit breaker tripped");
    Ok(())
}

pub(crate) fn count_outcome(summary: &mut RunSummary, outcome: IncidentOutcome) {
    match outcome {
        IncidentOutcome::Created => summary.counters.incidents_created += 1,
        IncidentOutcome::Merged => summary.counters.incidents_merged += 1,
    }
}

fn outcome_label(outcome: IncidentOutcome) -> &'static str {
    match outcome {
        IncidentOutcome::Created => "created",
        IncidentOutcome::Merged => "merged",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::db::models::GLOBAL_SCOPE;
    use crate::db::repos::remediation::incidents;
    use crate::db::models::NewErrorReport;
    use crate::engine::{ingest, test_support};

    async fn run_once(ctx: &SentinelContext) -> RunSummary {
        let mut state = RunState::default();
        let mut summary = RunSummary::new("test");
        ingest::run(ctx, &mut state, &mut summary).await.unwrap();
        ingest::match_batch(ctx, &mut state, &mut summary).await.unwrap();
        run(ctx, &mut state, &mut summary).await.unwrap();
        summary
    }

    #[test]
    fn test_in_cooldown_window() {
        let pool = init_test_db().unwrap();
        let mut p = patterns::create(&pool, patterns::sample("x", FixAction::CreateIncident)).unwrap();
        let now = Utc::now();
        assert!(!in_cooldown(&p, now));

        p.last_fixed_at = Some(db::timestamp(now - chrono::Duration::minutes(10)));
        assert!(in_cooldown(&p, now));

        p.last_fixed_at = Some(db::timestamp(now - chrono::Duration::minutes(61)));
        assert!(!in_cooldown(&p, now));

        p.cooldown_minutes = 0;
        p.last_fixed_at = Some(db::timestamp(now));
        assert!(!in_cooldown(&p, now));
    }

    #[tokio::test]
    async fn test_create_incident_dedups_and_records_heal_log() {
        let pool = init_test_db().unwrap();
        let ctx = test_support::context(pool.clone());
        let mut p = patterns::sample("Failed to load supplements list", FixAction::CreateIncident);
        p.cooldown_minutes = 0;
        patterns::create(&pool, p).unwrap();

        let first = test_support::report(&pool, "Failed to load supplements list: 500");
        let summary = run_once(&ctx).await;
        assert_eq!(summary.counters.incidents_created, 1);
        assert_eq!(summary.counters.remediations_applied, 1);

        test_support::report(&pool, "Failed to load supplements list: 502");
        let summary = run_once(&ctx).await;
        assert_eq!(summary.counters.incidents_merged, 1);

        let open = incidents::list_by_source(&pool, SOURCE_SENTINEL).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].metadata["occurrences"], 2);
        assert!(open[0].title.starts_with("[Sentinel] database: "));

        let log = heal_log::list_for_report(&pool, &first.id).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].action, "create_incident");
        assert_eq!(patterns::get_by_id(&pool, log[0].pattern_id.as_deref().unwrap()).unwrap().times_fixed, 2);
    }

    #[tokio::test]
    async fn test_failed_action_is_not_counted_as_fixed() {
        let pool = init_test_db().unwrap();
        let ctx = test_support::context(pool.clone());
        let p = patterns::create(&pool, patterns::sample("boom", FixAction::CreateIncident)).unwrap();
        let r = test_support::report(&pool, "boom");

        let mut state = RunState::default();
        let mut summary = RunSummary::new("test");
        ingest::run(&ctx, &mut state, &mut summary).await.unwrap();
        ingest::match_batch(&ctx, &mut state, &mut summary).await.unwrap();
        pool.get().unwrap().execute_batch("ALTER TABLE incidents RENAME TO incidents_offline").unwrap();

        run(&ctx, &mut state, &mut summary).await.unwrap();
        assert_eq!(summary.counters.remediations_failed, 1);
        let stored = patterns::get_by_id(&pool, &p.id).unwrap();
        assert_eq!(stored.times_fixed, 0);
        assert!(stored.last_fixed_at.is_some());
        let log = heal_log::list_for_report(&pool, &r.id).unwrap();
        assert_eq!(log[0].result, "failure");
    }

    #[tokio::test]
    async fn test_circuit_breaker_disables_mapped_features_once_per_cooldown() {
        let pool = init_test_db().unwrap();
        let ctx = test_support::context(pool.clone());
        // sample(): category "database", cooldown 60 minutes
        patterns::create(&pool, patterns::sample("protocol query failed", FixAction::CircuitBreaker)).unwrap();

        reports_for_tenant(&pool, "protocol query failed", "tenant-a");
        let summary = run_once(&ctx).await;
        assert_eq!(summary.counters.breakers_tripped, 2);

        for feature in ["supplements", "protocols"] {
            let flag = breakers::get_feature_flag(&pool, "tenant-a", feature).unwrap().unwrap();
            assert!(!flag.enabled);
        }
        assert!(breakers::get_feature_flag(&pool, GLOBAL_SCOPE, "supplements").unwrap().is_none());
        let events_after_first = breakers::count_events(&pool).unwrap();
        assert_eq!(events_after_first, 2);

        // Duplicate match inside the cooldown window produces no new events.
        reports_for_tenant(&pool, "protocol query failed", "tenant-a");
        let summary = run_once(&ctx).await;
        assert_eq!(summary.counters.remediations_in_cooldown, 1);
        assert_eq!(breakers::count_events(&pool).unwrap(), events_after_first);

        let breaker_incidents = incidents::list_by_source(&pool, SOURCE_CIRCUIT_BREAKER).unwrap();
        assert_eq!(breaker_incidents.len(), 2);
        assert!(breaker_incidents.iter().all(|i| i.auto_healed && i.status == "healing"));
    }

    #[tokio::test]
    async fn test_unmapped_category_falls_back_to_incident() {
        let pool = init_test_db().unwrap();
        let ctx = test_support::context(pool.clone());
        let mut p = patterns::sample("websocket closed", FixAction::DisableFeature);
        p.category = "network".into();
        patterns::create(&pool, p).unwrap();
        test_support::report(&pool, "websocket closed unexpectedly");

        let summary = run_once(&ctx).await;
        assert_eq!(summary.counters.breakers_tripped, 0);
        assert_eq!(summary.counters.incidents_created, 1);
        assert_eq!(incidents::list_by_source(&pool, SOURCE_SENTINEL).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lost_cooldown_claim_skips_action() {
        let pool = init_test_db().unwrap();
        let ctx = test_support::context(pool.clone());
        let p = patterns::create(&pool, patterns::sample("boom", FixAction::CreateIncident)).unwrap();
        test_support::report(&pool, "boom");

        let mut state = RunState::default();
        let mut summary = RunSummary::new("test");
        ingest::run(&ctx, &mut state, &mut summary).await.unwrap();
        ingest::match_batch(&ctx, &mut state, &mut summary).await.unwrap();

        // An overlapping run claims the cooldown first.
        assert!(patterns::claim_fix(&pool, &p.id, None).unwrap());

        run(&ctx, &mut state, &mut summary).await.unwrap();
        assert_eq!(summary.counters.remediations_in_cooldown, 1);
        assert!(incidents::list_by_source(&pool, SOURCE_SENTINEL).unwrap().is_empty());
        assert_eq!(patterns::get_by_id(&pool, &p.id).unwrap().times_fixed, 0);
    }

    fn reports_for_tenant(pool: &db::DbPool, description: &str, tenant: &str) {
        crate::db::repos::intake::reports::create(
            pool,
            NewErrorReport {
                tenant_id: Some(tenant.into()),
                description: description.into(),
                ..Default::default()
            },
        )
        .unwrap();
    }
}
