//! AI diagnosis of reports no pattern recognised.
//!
//! Only the first `ai_batch_size` unmatched reports are diagnosed per run.
//! The rest stay unprocessed so the next run can try patterns (possibly newly
//! learned ones) before spending another completion call.

use std::sync::LazyLock;
use std::time::Duration;

use futures_util::future::join_all;
use regex::Regex;
use serde::Deserialize;

use super::catalog::clip;
use super::{PreparedReport, RunState, RunSummary, SentinelContext};
use crate::clients::{strip_code_fences, CompletionClient, CompletionRequest};
use crate::db::repos::intake::reports;
use crate::error::AppError;

/// Diagnosis stored on a report whose completion call failed.
pub const DIAGNOSIS_FAILED: &str = "AI diagnosis failed";

const MAX_TOKENS: u32 = 400;
const TEMPERATURE: f32 = 0.2;
const MAX_ERROR_CHARS: usize = 2000;

const SYSTEM_PROMPT: &str = "You are a production reliability engineer diagnosing errors \
reported by a web application backed by Postgres and PostgREST. Reply with a JSON object \
with exactly these keys: \"root_cause\" (string), \"severity\" (one of low, medium, high, \
critical), \"auto_fixable\" (boolean, true only when a single additive schema change such as \
adding a column, adding an index, granting a privilege, or replacing a function would fix \
the error), \"fix_summary\" (string, empty when not fixable), \"recommendation\" (string).";

#[allow(clippy::expect_used)]
static FEASIBILITY_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^[\s>*#\-\d.)]*auto[\s-]?fix\s+possible[\s?:*\-]*(yes|no)\b")
        .expect("valid regex")
});

/// A rendered diagnosis and its feasibility flag (`None` = unknown).
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnosis {
    pub text: String,
    pub fixable: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct StructuredDiagnosis {
    #[serde(default)]
    root_cause: String,
    #[serde(default)]
    severity: String,
    #[serde(default)]
    auto_fixable: bool,
    #[serde(default)]
    fix_summary: String,
    #[serde(default)]
    recommendation: String,
}

/// Read the feasibility verdict from a free-text diagnosis.
///
/// Looks for a line shaped like `AUTO-FIX POSSIBLE? yes`. Only the first
/// yes/no token after the label counts, so a "yes" followed by a negating
/// qualifier still reads as fixable. Anything else is unknown.
pub fn classify_feasibility(text: &str) -> Option<bool> {
    FEASIBILITY_LINE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().eq_ignore_ascii_case("yes"))
}

/// Turn the raw completion into stored diagnosis text.
pub fn parse_diagnosis(raw: &str) -> Diagnosis {
    let body = strip_code_fences(raw);
    match serde_json::from_str::<StructuredDiagnosis>(body) {
        Ok(d) => {
            let verdict = if d.auto_fixable { "yes" } else { "no" };
            let mut text = format!(
                "ROOT CAUSE: {}\nSEVERITY: {}\nAUTO-FIX POSSIBLE? {verdict}",
                d.root_cause.trim(),
                d.severity.trim()
            );
            if d.auto_fixable && !d.fix_summary.trim().is_empty() {
                text.push_str(&format!(" - {}", d.fix_summary.trim()));
            }
            text.push_str(&format!("\nRECOMMENDATION: {}", d.recommendation.trim()));
            Diagnosis { text, fixable: Some(d.auto_fixable) }
        }
        Err(_) => Diagnosis {
            text: raw.trim().to_string(),
            fixable: classify_feasibility(raw),
        },
    }
}

async fn diagnose_one(
    llm: &dyn CompletionClient,
    text: &str,
    page_url: Option<&str>,
    timeout: Duration,
) -> Result<Diagnosis, AppError> {
    let mut user = format!("Error:\n{}", clip(text, MAX_ERROR_CHARS));
    if let Some(url) = page_url {
        user.push_str(&format!("\n\nPage: {url}"));
    }
    let raw = llm
        .complete(CompletionRequest {
            system: SYSTEM_PROMPT.to_string(),
            user,
            max_tokens: MAX_TOKENS,
            temperature: TEMPERATURE,
            json: true,
            timeout,
        })
        .await?;
    Ok(parse_diagnosis(&raw))
}

pub async fn run(
    ctx: &SentinelContext,
    state: &mut RunState,
    summary: &mut RunSummary,
) -> Result<(), AppError> {
    if state.unmatched.is_empty() {
        return Ok(());
    }
    let Some(llm) = ctx.llm.clone() else {
        summary.counters.reports_deferred += state.unmatched.len() as u64;
        tracing::debug!(
            deferred = state.unmatched.len(),
            "No completion client configured, deferring unmatched reports"
        );
        return Ok(());
    };

    let take = ctx.config.thresholds.ai_batch_size.min(state.unmatched.len());
    let (current, deferred) = state.unmatched.split_at(take);
    summary.counters.reports_deferred += deferred.len() as u64;

    // One call per distinct fingerprint, in first-seen order.
    let mut groups: Vec<(&str, Vec<&PreparedReport>)> = Vec::new();
    for prepared in current {
        match groups.iter_mut().find(|(fp, _)| *fp == prepared.fingerprint) {
            Some((_, members)) => members.push(prepared),
            None => groups.push((prepared.fingerprint.as_str(), vec![prepared])),
        }
    }

    let timeout = Duration::from_secs(ctx.config.llm.diagnose_timeout_secs);
    let calls = groups.iter().map(|(_, members)| {
        let lead = members[0];
        diagnose_one(
            llm.as_ref(),
            &lead.text,
            lead.report.page_url.as_deref(),
            timeout,
        )
    });
    let results = join_all(calls).await;

    for ((fingerprint, members), result) in groups.iter().zip(results) {
        let (text, fixable, failed) = match result {
            Ok(d) => (d.text, d.fixable, false),
            Err(e) => {
                summary.note_error("diagnose", format!("{}: {e}", clip(fingerprint, 60)));
                (DIAGNOSIS_FAILED.to_string(), None, true)
            }
        };
        for prepared in members {
            match reports::mark_processed(&ctx.pool, &prepared.report.id, None, &text, fixable) {
                Ok(true) if failed => summary.counters.ai_failed += 1,
                Ok(true) => summary.counters.ai_diagnosed += 1,
                Ok(false) => summary.counters.reports_skipped += 1,
                Err(e) => summary.note_error("diagnose", format!("report {}: {e}", prepared.report.id)),
            }
        }
    }

    tracing::info!(
        calls = groups.len(),
        diagnosed = summary.counters.ai_diagnosed,
        failed = summary.counters.ai_failed,
        deferred = summary.counters.reports_deferred,
        "AI diagnosis complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::engine::test_support::{self, FakeLlm};
    use crate::engine::ingest;

    #[test]
    fn test_classify_feasibility_shapes() {
        assert_eq!(classify_feasibility("AUTO-FIX POSSIBLE? yes"), Some(true));
        assert_eq!(classify_feasibility("3. Auto-fix possible: No, needs a human"), Some(false));
        assert_eq!(classify_feasibility("**AUTO-FIX POSSIBLE?** YES"), Some(true));
        assert_eq!(classify_feasibility("ROOT CAUSE: x\nautofix possible - yes"), Some(true));
        assert_eq!(classify_feasibility("It might be possible to auto-fix this"), None);
        assert_eq!(classify_feasibility(""), None);
    }

    #[test]
    fn test_classifier_tolerates_negating_qualifier() {
        // Only the first verdict token is read.
        assert_eq!(
            classify_feasibility("AUTO-FIX POSSIBLE? yes, but not without a migration"),
            Some(true)
        );
    }

    #[test]
    fn test_parse_structured_diagnosis() {
        let d = parse_diagnosis(&test_support::fixable_diagnosis());
        assert_eq!(d.fixable, Some(true));
        assert!(d.text.starts_with("ROOT CAUSE: A stored function"));
        assert!(d.text.contains("AUTO-FIX POSSIBLE? yes - Point the function"));
        assert_eq!(classify_feasibility(&d.text), Some(true));
    }

    #[test]
    fn test_parse_free_text_falls_back_to_classifier() {
        let d = parse_diagnosis("ROOT CAUSE: flaky network\nAUTO-FIX POSSIBLE? no");
        assert_eq!(d.fixable, Some(false));
        let d = parse_diagnosis("no idea");
        assert_eq!(d.fixable, None);
        assert_eq!(d.text, "no idea");
    }

    async fn load(ctx: &SentinelContext) -> (RunState, RunSummary) {
        let mut state = RunState::default();
        let mut summary = RunSummary::new("test");
        ingest::run(ctx, &mut state, &mut summary).await.unwrap();
        ingest::match_batch(ctx, &mut state, &mut summary).await.unwrap();
        (state, summary)
    }

    #[tokio::test]
    async fn test_shared_fingerprint_uses_one_call_and_defers_rest() {
        let pool = init_test_db().unwrap();
        let llm = FakeLlm::fixed(&test_support::fixable_diagnosis());
        let mut ctx = test_support::context(pool.clone());
        ctx.llm = Some(llm.clone());

        let mut ids = Vec::new();
        for _ in 0..7 {
            ids.push(test_support::report(&pool, "relation \"discussion_replies\" does not exist").id);
        }

        let (mut state, mut summary) = load(&ctx).await;
        run(&ctx, &mut state, &mut summary).await.unwrap();

        assert_eq!(llm.call_count(), 1);
        assert_eq!(summary.counters.ai_diagnosed, 5);
        assert_eq!(summary.counters.reports_deferred, 2);

        let processed: Vec<_> = ids
            .iter()
            .map(|id| reports::get_by_id(&pool, id).unwrap())
            .filter(|r| r.processed_at.is_some())
            .collect();
        assert_eq!(processed.len(), 5);
        assert!(processed.iter().all(|r| r.diagnosis_fixable == Some(true)));
    }

    #[tokio::test]
    async fn test_failed_call_marks_reports_and_records_error() {
        let pool = init_test_db().unwrap();
        let mut ctx = test_support::context(pool.clone());
        ctx.llm = Some(FakeLlm::failing());
        let r = test_support::report(&pool, "TypeError: cannot read properties of null");

        let (mut state, mut summary) = load(&ctx).await;
        run(&ctx, &mut state, &mut summary).await.unwrap();

        assert_eq!(summary.counters.ai_failed, 1);
        assert_eq!(summary.errors.len(), 1);
        let stored = reports::get_by_id(&pool, &r.id).unwrap();
        assert_eq!(stored.diagnosis.as_deref(), Some(DIAGNOSIS_FAILED));
        assert!(stored.processed_at.is_some());
    }

    #[tokio::test]
    async fn test_without_llm_everything_is_deferred() {
        let pool = init_test_db().unwrap();
        let ctx = test_support::context(pool.clone());
        let r = test_support::report(&pool, "unknown failure");

        let (mut state, mut summary) = load(&ctx).await;
        run(&ctx, &mut state, &mut summary).await.unwrap();

        assert_eq!(summary.counters.reports_deferred, 1);
        assert!(reports::get_by_id(&pool, &r.id).unwrap().processed_at.is_none());
    }
}
