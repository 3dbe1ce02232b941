//! Escalation notifier: emails unresolved high/critical incidents once,
//! under a global hourly cap, and retries failed deliveries.

use chrono::Duration;

use super::{RunState, RunSummary, SentinelContext};
use crate::clients::{Mailer, OutboundEmail};
use crate::db;
use crate::db::models::{EscalationLog, Incident};
use crate::db::repos::ops::escalations;
use crate::db::repos::remediation::incidents;
use crate::error::AppError;

const CHANNEL_EMAIL: &str = "email";
const RETRY_WINDOW_HOURS: i64 = 24;

pub fn subject_for(incident: &Incident) -> String {
    format!(
        "[Sentinel] {} incident: {}",
        incident.severity.as_str().to_uppercase(),
        incident.title
    )
}

/// Email body. Every interpolated value goes through `ammonia::clean_text`,
/// so incident text can never inject markup.
pub fn render_html(incident: &Incident) -> String {
    let row = |label: &str, value: &str| {
        format!(
            "<tr><td><strong>{label}</strong></td><td>{}</td></tr>",
            ammonia::clean_text(value)
        )
    };
    let mut rows = vec![
        row("Severity", incident.severity.as_str()),
        row("Source", &incident.source),
        row("Status", &incident.status),
        row("Detected", &incident.detected_at),
    ];
    if let Some(last_seen) = &incident.last_seen_at {
        rows.push(row("Last seen", last_seen));
    }
    if let Some(pattern) = &incident.error_pattern {
        rows.push(row("Pattern", pattern));
    }

    let diagnosis = incident
        .diagnosis
        .as_deref()
        .map(|d| format!("<pre>{}</pre>", ammonia::clean_text(d)))
        .unwrap_or_default();

    format!(
        "<h2>{}</h2><table>{}</table>{}<p>Incident id: {}</p>",
        ammonia::clean_text(&incident.title),
        rows.join(""),
        diagnosis,
        ammonia::clean_text(&incident.id),
    )
}

pub async fn run(
    ctx: &SentinelContext,
    _state: &mut RunState,
    summary: &mut RunSummary,
) -> Result<(), AppError> {
    let recipients = &ctx.config.escalation.recipients;
    let Some(mailer) = ctx.mailer.as_deref() else {
        tracing::debug!("No mailer configured, skipping escalation");
        return Ok(());
    };
    if recipients.is_empty() {
        tracing::debug!("No escalation recipients configured");
        return Ok(());
    }

    escalate_new(ctx, mailer, recipients, summary).await?;
    retry_failed(ctx, mailer, summary).await?;
    Ok(())
}

/// Sends left under the hourly cap.
fn remaining_budget(ctx: &SentinelContext) -> Result<i64, AppError> {
    let sent = escalations::count_sent_since(&ctx.pool, &db::since(Duration::hours(1)))?;
    Ok((ctx.config.thresholds.escalation_hourly_cap - sent).max(0))
}

async fn escalate_new(
    ctx: &SentinelContext,
    mailer: &dyn Mailer,
    recipients: &[String],
    summary: &mut RunSummary,
) -> Result<(), AppError> {
    let mut budget = remaining_budget(ctx)?;
    if budget == 0 {
        tracing::info!("Escalation hourly cap reached");
        return Ok(());
    }

    let pending = incidents::get_unescalated(&ctx.pool, ctx.config.thresholds.escalation_batch_size)?;
    for incident in pending {
        if budget == 0 {
            break;
        }
        if !incidents::claim_escalation(&ctx.pool, &incident.id)? {
            continue;
        }

        let email = OutboundEmail {
            from: ctx.config.escalation.from.clone(),
            to: recipients.to_vec(),
            subject: subject_for(&incident),
            html: render_html(&incident),
        };
        let error = mailer.send(&email).await.err().map(|e| e.to_string());
        escalations::record(
            &ctx.pool,
            &incident.id,
            CHANNEL_EMAIL,
            &email.to.join(","),
            &email.subject,
            error.as_deref(),
        )?;

        match error {
            None => {
                budget -= 1;
                summary.counters.escalations_sent += 1;
                tracing::info!(incident_id = %incident.id, severity = incident.severity.as_str(), "Incident escalated");
            }
            Some(e) => {
                summary.counters.escalations_failed += 1;
                summary.note_error("escalation", format!("incident {}: {e}", incident.id));
            }
        }
    }
    Ok(())
}

async fn retry_failed(
    ctx: &SentinelContext,
    mailer: &dyn Mailer,
    summary: &mut RunSummary,
) -> Result<(), AppError> {
    let t = &ctx.config.thresholds;
    let mut budget = remaining_budget(ctx)?;
    if budget == 0 {
        return Ok(());
    }

    let retryable = escalations::get_retryable(
        &ctx.pool,
        &db::since(Duration::hours(RETRY_WINDOW_HOURS)),
        t.escalation_max_attempts,
        t.escalation_retry_batch_size,
    )?;
    for entry in retryable {
        if budget == 0 {
            break;
        }
        let error = match retry_one(ctx, mailer, &entry).await {
            Ok(()) => None,
            Err(e) => Some(e.to_string()),
        };
        escalations::record_retry(&ctx.pool, &entry.id, error.as_deref())?;
        match error {
            None => {
                budget -= 1;
                summary.counters.escalation_retries_sent += 1;
            }
            Some(e) => tracing::warn!(escalation_id = %entry.id, attempts = entry.attempts + 1, error = %e, "Escalation retry failed"),
        }
    }
    Ok(())
}

async fn retry_one(ctx: &SentinelContext, mailer: &dyn Mailer, entry: &EscalationLog) -> Result<(), AppError> {
    let incident = incidents::get_by_id(&ctx.pool, &entry.incident_id)?;
    let email = OutboundEmail {
        from: ctx.config.escalation.from.clone(),
        to: entry
            .recipient
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .collect(),
        subject: entry.subject.clone(),
        html: render_html(&incident),
    };
    mailer.send(&email).await
}
