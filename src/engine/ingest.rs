//! Ingest and match phases.

use super::fingerprint;
use super::matcher::PatternSet;
use super::{PreparedReport, QueuedAction, RunState, RunSummary, SentinelContext};
use crate::db::repos::intake::{patterns, reports};
use crate::error::AppError;

/// Load the oldest unprocessed reports and compute their canonical text.
pub async fn run(
    ctx: &SentinelContext,
    state: &mut RunState,
    summary: &mut RunSummary,
) -> Result<(), AppError> {
    let batch = reports::get_unprocessed(&ctx.pool, ctx.config.thresholds.batch_size)?;
    summary.counters.reports_loaded = batch.len() as u64;

    state.batch = batch
        .into_iter()
        .map(|report| {
            let (text, fingerprint) = fingerprint::for_report(&report);
            PreparedReport { report, text, fingerprint }
        })
        .collect();

    if !state.batch.is_empty() {
        tracing::debug!(count = state.batch.len(), "Loaded unprocessed error reports");
    }
    Ok(())
}

/// Match each loaded report against enabled patterns.
///
/// Matched reports are marked processed with the pattern's fix description.
/// Concrete actions are queued for remediation; everything unmatched is left
/// for the diagnoser.
pub async fn match_batch(
    ctx: &SentinelContext,
    state: &mut RunState,
    summary: &mut RunSummary,
) -> Result<(), AppError> {
    if state.batch.is_empty() {
        return Ok(());
    }
    let set = PatternSet::new(patterns::get_enabled(&ctx.pool)?);

    for prepared in &state.batch {
        let Some(pattern) = set.first_match(&prepared.text) else {
            state.unmatched.push(prepared.clone());
            continue;
        };

        let diagnosis = pattern
            .fix_description
            .clone()
            .unwrap_or_else(|| format!("Matched known pattern: {}", pattern.pattern));

        let claimed = match reports::mark_processed(
            &ctx.pool,
            &prepared.report.id,
            Some(&pattern.id),
            &diagnosis,
            None,
        ) {
            Ok(claimed) => claimed,
            Err(e) => {
                summary.note_error("match", format!("report {}: {e}", prepared.report.id));
                continue;
            }
        };
        if !claimed {
            summary.counters.reports_skipped += 1;
            continue;
        }

        if let Err(e) = patterns::record_match(&ctx.pool, &pattern.id) {
            summary.note_error("match", format!("pattern {}: {e}", pattern.id));
        }
        summary.counters.patterns_matched += 1;

        if pattern.auto_fix_action.is_remediation() {
            state.queued.push(QueuedAction {
                report_id: prepared.report.id.clone(),
                tenant_id: prepared.report.tenant_id.clone(),
                pattern: pattern.clone(),
            });
        }
    }

    tracing::debug!(
        patterns = set.len(),
        matched = summary.counters.patterns_matched,
        unmatched = state.unmatched.len(),
        queued = state.queued.len(),
        "Pattern matching complete"
    );
    Ok(())
}
