//! The self-healing pipeline.
//!
//! Every phase module exposes an `async fn run(ctx, state, summary)` step.
//! [`coordinator::run_pipeline`] calls them in a fixed order, isolating
//! failures per phase. Working state ([`RunState`]) is rebuilt from the store
//! on every invocation; nothing survives between runs in memory.

pub mod anomaly;
pub mod breaker;
pub mod catalog;
pub mod coordinator;
pub mod deploy;
pub mod diagnoser;
pub mod escalation;
pub mod fingerprint;
pub mod housekeeping;
pub mod ingest;
pub mod matcher;
pub mod remediation;
pub mod schema;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

use serde::Serialize;

use crate::clients::{
    AdminChannel, CompletionClient, DeployPlatform, ManagementApiClient, Mailer, OpenAiClient,
    ResendMailer, VercelClient,
};
use crate::config::SentinelConfig;
use crate::db::models::{ErrorPattern, ErrorReport};
use crate::db::DbPool;
use crate::error::AppError;

/// Everything a phase needs: the store, configuration, and whichever
/// collaborators have credentials. A missing collaborator disables the
/// work that depends on it rather than failing the run.
#[derive(Clone)]
pub struct SentinelContext {
    pub pool: DbPool,
    pub config: Arc<SentinelConfig>,
    pub llm: Option<Arc<dyn CompletionClient>>,
    pub admin: Option<Arc<dyn AdminChannel>>,
    pub platform: Option<Arc<dyn DeployPlatform>>,
    pub mailer: Option<Arc<dyn Mailer>>,
}

impl SentinelContext {
    /// Build HTTP collaborators for every credential present in `config`.
    pub fn from_config(pool: DbPool, config: SentinelConfig) -> Result<Self, AppError> {
        let llm: Option<Arc<dyn CompletionClient>> = match &config.llm.api_key {
            Some(key) => Some(Arc::new(OpenAiClient::new(
                &config.llm.base_url,
                key,
                &config.llm.model,
            )?)),
            None => None,
        };

        let admin: Option<Arc<dyn AdminChannel>> = match (&config.admin.api_url, &config.admin.token) {
            (Some(url), Some(token)) => Some(Arc::new(ManagementApiClient::new(url, token)?)),
            _ => None,
        };

        let platform: Option<Arc<dyn DeployPlatform>> =
            match (&config.deploy.token, &config.deploy.project_id) {
                (Some(token), Some(project)) => Some(Arc::new(VercelClient::new(
                    &config.deploy.api_url,
                    token,
                    project,
                    config.deploy.team_id.as_deref(),
                )?)),
                _ => None,
            };

        let mailer: Option<Arc<dyn Mailer>> = match &config.escalation.api_key {
            Some(key) => Some(Arc::new(ResendMailer::new(&config.escalation.api_url, key)?)),
            None => None,
        };

        tracing::info!(
            llm = llm.is_some(),
            admin_channel = admin.is_some(),
            deploy_platform = platform.is_some(),
            mailer = mailer.is_some(),
            "Sentinel collaborators configured"
        );

        Ok(Self {
            pool,
            config: Arc::new(config),
            llm,
            admin,
            platform,
            mailer,
        })
    }
}

/// A loaded report with its canonical text and fingerprint.
#[derive(Debug, Clone)]
pub struct PreparedReport {
    pub report: ErrorReport,
    pub text: String,
    pub fingerprint: String,
}

/// A matched pattern whose action the remediation executor should apply.
#[derive(Debug, Clone)]
pub struct QueuedAction {
    pub report_id: String,
    pub tenant_id: Option<String>,
    pub pattern: ErrorPattern,
}

/// Output of the deploy correlator, consumed by the rollback trigger.
#[derive(Debug, Clone, Serialize)]
pub struct CorrelationDescriptor {
    pub deploy_event_id: String,
    pub deployment_id: String,
    pub deployed_at: String,
    pub incident_id: String,
    pub error_count: usize,
    pub severity: crate::db::models::Severity,
}

/// Per-invocation working state handed from phase to phase.
#[derive(Debug, Default)]
pub struct RunState {
    pub batch: Vec<PreparedReport>,
    pub unmatched: Vec<PreparedReport>,
    pub queued: Vec<QueuedAction>,
    pub correlation: Option<CorrelationDescriptor>,
}

/// Counters reported in the run summary and persisted on the run row.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunCounters {
    pub reports_loaded: u64,
    pub reports_skipped: u64,
    pub patterns_matched: u64,
    pub ai_diagnosed: u64,
    pub ai_failed: u64,
    pub reports_deferred: u64,
    pub remediations_applied: u64,
    pub remediations_failed: u64,
    pub remediations_in_cooldown: u64,
    pub incidents_created: u64,
    pub incidents_merged: u64,
    pub schema_candidates: u64,
    pub schema_healed: u64,
    pub schema_already_healed: u64,
    pub schema_failed: u64,
    pub schema_blocked: u64,
    pub schema_skipped: u64,
    pub schema_escalated: u64,
    pub deploy_correlations: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback: Option<String>,
    pub anomalies_detected: u64,
    pub baselines_updated: u64,
    pub breakers_tripped: u64,
    pub breakers_reset: u64,
    pub escalations_sent: u64,
    pub escalations_failed: u64,
    pub escalation_retries_sent: u64,
    pub incidents_auto_resolved: u64,
    pub reports_resolved: u64,
    pub rows_pruned: u64,
}

/// JSON summary returned to the trigger caller.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Option<String>,
    /// "completed" | "failed"
    pub status: String,
    pub trigger: String,
    pub counters: RunCounters,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl RunSummary {
    pub fn new(trigger: &str) -> Self {
        Self {
            run_id: None,
            status: "running".into(),
            trigger: trigger.into(),
            counters: RunCounters::default(),
            errors: Vec::new(),
            duration_ms: 0,
        }
    }

    /// Record a recoverable per-item failure without aborting the phase.
    pub fn note_error(&mut self, phase: &str, message: impl std::fmt::Display) {
        tracing::warn!(phase, error = %message, "Sentinel item failure");
        self.errors.push(format!("{phase}: {message}"));
    }
}
