//! Latency anomaly detection against rolling health-check baselines.

use chrono::Duration;

use super::catalog::{self, DedupKey};
use super::remediation::count_outcome;
use super::{RunState, RunSummary, SentinelContext};
use crate::db;
use crate::db::models::{NewIncident, PerformanceBaseline, Severity, SOURCE_ANOMALY};
use crate::db::repos::ops::baselines;
use crate::error::AppError;

pub const BASELINE_WINDOW_HOURS: i64 = 24;
/// Only samples this recent count as "current" latency.
const LATEST_SAMPLE_MINUTES: i64 = 15;
const MIN_REFRESH_SAMPLES: usize = 3;

/// Mean and p95 of `samples`, or `None` below the minimum sample count.
/// p95 is the element at `floor(n * 0.95)` of the sorted samples.
pub fn compute_baseline(samples: &[f64]) -> Option<(f64, f64)> {
    if samples.len() < MIN_REFRESH_SAMPLES {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    let mean = sorted.iter().sum::<f64>() / n as f64;
    let idx = ((n as f64 * 0.95).floor() as usize).min(n - 1);
    Some((mean, sorted[idx]))
}

/// Severity of `latest` against `baseline`, or `None` if it is not anomalous.
pub fn anomaly_severity(
    latest: f64,
    baseline: &PerformanceBaseline,
    multiplier: f64,
    floor_ms: f64,
) -> Option<Severity> {
    if latest <= baseline.mean_latency_ms * multiplier || latest <= floor_ms {
        return None;
    }
    let reference = if baseline.p95_latency_ms > 0.0 {
        baseline.p95_latency_ms
    } else {
        baseline.mean_latency_ms
    };
    if reference <= 0.0 {
        return Some(Severity::Critical);
    }
    let ratio = latest / reference;
    Some(if ratio >= 3.0 {
        Severity::Critical
    } else if ratio >= 2.0 {
        Severity::High
    } else {
        Severity::Medium
    })
}

pub async fn run(
    ctx: &SentinelContext,
    _state: &mut RunState,
    summary: &mut RunSummary,
) -> Result<(), AppError> {
    detect(ctx, summary)?;
    refresh_baselines(ctx, summary)?;
    Ok(())
}

fn detect(ctx: &SentinelContext, summary: &mut RunSummary) -> Result<(), AppError> {
    let t = &ctx.config.thresholds;
    let recent = db::since(Duration::minutes(LATEST_SAMPLE_MINUTES));
    let dedup_since = db::since(Duration::minutes(t.anomaly_dedup_minutes));

    for baseline in baselines::get_baselines(&ctx.pool, BASELINE_WINDOW_HOURS, t.anomaly_min_samples)? {
        let Some(latest) = baselines::latest_check_since(&ctx.pool, &baseline.check_name, &recent)? else {
            continue;
        };
        let Some(severity) =
            anomaly_severity(latest.latency_ms, &baseline, t.anomaly_multiplier, t.anomaly_floor_ms)
        else {
            continue;
        };

        let ratio = if baseline.p95_latency_ms > 0.0 {
            latest.latency_ms / baseline.p95_latency_ms
        } else {
            0.0
        };
        let mut incident = NewIncident::detected(
            format!(
                "[Anomaly] {} latency {:.0}ms ({ratio:.1}x p95)",
                baseline.check_name, latest.latency_ms
            ),
            severity,
            SOURCE_ANOMALY,
        );
        incident.diagnosis = Some(format!(
            "Latest {:.0}ms vs mean {:.0}ms / p95 {:.0}ms over {} samples",
            latest.latency_ms, baseline.mean_latency_ms, baseline.p95_latency_ms, baseline.sample_count
        ));
        incident.metadata = serde_json::json!({
            "check_name": baseline.check_name,
            "latest_latency_ms": latest.latency_ms,
            "mean_latency_ms": baseline.mean_latency_ms,
            "p95_latency_ms": baseline.p95_latency_ms,
        });

        let (_, outcome) = catalog::open_or_merge(
            &ctx.pool,
            incident,
            DedupKey::Metadata {
                key: "check_name",
                value: &baseline.check_name,
                since: Some(&dedup_since),
            },
        )?;
        count_outcome(summary, outcome);
        summary.counters.anomalies_detected += 1;
        tracing::warn!(
            check = %baseline.check_name,
            latency_ms = latest.latency_ms,
            severity = severity.as_str(),
            "Latency anomaly detected"
        );
    }
    Ok(())
}

fn refresh_baselines(ctx: &SentinelContext, summary: &mut RunSummary) -> Result<(), AppError> {
    let samples = baselines::latencies_since(&ctx.pool, &db::since(Duration::hours(BASELINE_WINDOW_HOURS)))?;

    let mut by_check: Vec<(String, Vec<f64>)> = Vec::new();
    for (check, latency) in samples {
        match by_check.last_mut() {
            Some((name, values)) if *name == check => values.push(latency),
            _ => by_check.push((check, vec![latency])),
        }
    }

    let computed_at = db::now();
    for (check_name, values) in by_check {
        let Some((mean, p95)) = compute_baseline(&values) else {
            continue;
        };
        baselines::upsert_baseline(
            &ctx.pool,
            &PerformanceBaseline {
                check_name,
                window_hours: BASELINE_WINDOW_HOURS,
                mean_latency_ms: mean,
                p95_latency_ms: p95,
                sample_count: values.len() as i64,
                computed_at: computed_at.clone(),
            },
        )?;
        summary.counters.baselines_updated += 1;
    }
    Ok(())
}
