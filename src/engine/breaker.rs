//! Aggregate circuit breaker: trips features when a pattern keeps firing
//! inside the breaker window, and resets trips once the window goes quiet.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};

use super::catalog;
use super::remediation::{trip_feature, Trip};
use super::{RunState, RunSummary, SentinelContext};
use crate::db;
use crate::db::repos::intake::{patterns, reports};
use crate::db::repos::remediation::breakers;
use crate::error::AppError;

pub async fn run(
    ctx: &SentinelContext,
    _state: &mut RunState,
    summary: &mut RunSummary,
) -> Result<(), AppError> {
    // Reset still runs when the trip pass fails.
    let tripped = trip(ctx, summary);
    reset(ctx, summary)?;
    tripped
}

/// Per-pattern totals with the tenants that contributed to them.
fn tally(counts: Vec<reports::PatternTenantCount>) -> BTreeMap<String, (i64, Vec<Option<String>>)> {
    let mut by_pattern: BTreeMap<String, (i64, Vec<Option<String>>)> = BTreeMap::new();
    for row in counts {
        let entry = by_pattern.entry(row.pattern_id).or_default();
        entry.0 += row.count;
        if !entry.1.contains(&row.tenant_id) {
            entry.1.push(row.tenant_id);
        }
    }
    by_pattern
}

fn trip(ctx: &SentinelContext, summary: &mut RunSummary) -> Result<(), AppError> {
    let window = Duration::minutes(ctx.config.thresholds.breaker_window_minutes);
    let threshold = ctx.config.thresholds.breaker_threshold;
    let window_start = db::since(window);

    let counts = reports::count_by_pattern_since(&ctx.pool, &window_start)?;
    for (pattern_id, (total, tenants)) in tally(counts) {
        if total < threshold {
            continue;
        }
        let pattern = match patterns::get_by_id(&ctx.pool, &pattern_id) {
            Ok(pattern) => pattern,
            Err(e) => {
                summary.note_error("breaker", format!("pattern {pattern_id}: {e}"));
                continue;
            }
        };
        let features = catalog::features_for_category(&pattern.category);
        if features.is_empty() {
            continue;
        }

        for tenant in &tenants {
            let tenant = tenant.as_deref();
            for feature in &features {
                if breakers::tripped_since(&ctx.pool, feature, tenant, &window_start)? {
                    continue;
                }
                let trip = Trip {
                    tenant_id: tenant,
                    error_count: total,
                    reason: format!(
                        "{total} errors for pattern {} in {} min (threshold {threshold})",
                        pattern.id,
                        window.num_minutes()
                    ),
                    latest_report_id: None,
                };
                if let Err(e) = trip_feature(ctx, &pattern, feature, &trip, summary) {
                    summary.note_error("breaker", format!("trip {feature}: {e}"));
                }
            }
        }
    }
    Ok(())
}

fn reset(ctx: &SentinelContext, summary: &mut RunSummary) -> Result<(), AppError> {
    let window = Duration::minutes(ctx.config.thresholds.breaker_window_minutes);
    let now = Utc::now();
    let window_start = db::timestamp(now - window);

    for event in breakers::get_active_trips(&ctx.pool)? {
        let Some(tripped_at) = db::parse_timestamp(&event.created_at) else {
            continue;
        };
        if now - tripped_at < window {
            continue;
        }
        let categories = catalog::categories_for_feature(&event.feature_key);
        let tenant = event.tenant_id.as_deref();
        let recent = reports::count_by_categories_since(&ctx.pool, categories, tenant, &window_start)?;
        if recent > 0 {
            continue;
        }

        let scope = breakers::scope_for(tenant);
        breakers::set_feature_enabled(&ctx.pool, scope, &event.feature_key, true)?;
        breakers::record_event(
            &ctx.pool,
            &event.feature_key,
            tenant,
            "reset",
            &format!("no errors in the last {} min", window.num_minutes()),
            0,
            ctx.config.thresholds.breaker_threshold,
        )?;
        summary.counters.breakers_reset += 1;
        tracing::info!(feature = %event.feature_key, scope, "Circuit breaker reset");
    }
    Ok(())
}
