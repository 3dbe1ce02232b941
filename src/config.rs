//! Runtime configuration.
//!
//! Layering: built-in defaults, then an optional TOML file, then environment
//! variables (a `.env` file is loaded by `main` before this runs). Credentials
//! are normally supplied through the environment only.
//!
//! The schema-healing safety limits are deliberately absent here: they live as
//! constants in `engine::schema` and cannot be tuned at runtime.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::AppError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    pub database_path: PathBuf,
    pub bind_addr: String,
    /// Seconds between scheduled runs in `serve` mode. `0` disables the
    /// in-process scheduler (an external cron calls `/sentinel/run`).
    pub schedule_secs: u64,
    pub log: LogConfig,
    pub thresholds: Thresholds,
    pub llm: LlmConfig,
    pub admin: AdminConfig,
    pub deploy: DeployConfig,
    pub escalation: EscalationConfig,
    pub auth: AuthConfig,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/sentinel.db"),
            bind_addr: "127.0.0.1:9430".into(),
            schedule_secs: 120,
            log: LogConfig::default(),
            thresholds: Thresholds::default(),
            llm: LlmConfig::default(),
            admin: AdminConfig::default(),
            deploy: DeployConfig::default(),
            escalation: EscalationConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub json: bool,
    /// When set, a daily-rolling log file is written here as well.
    pub dir: Option<PathBuf>,
}

/// Operational tuning knobs. Every value has a production default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub batch_size: usize,
    pub ai_batch_size: usize,
    pub breaker_threshold: i64,
    pub breaker_window_minutes: i64,
    pub deploy_window_minutes: i64,
    pub correlation_min_errors: usize,
    pub correlation_critical_errors: usize,
    pub rollback_min_errors: usize,
    pub anomaly_multiplier: f64,
    pub anomaly_floor_ms: f64,
    pub anomaly_min_samples: i64,
    pub anomaly_dedup_minutes: i64,
    pub escalation_hourly_cap: i64,
    pub escalation_batch_size: usize,
    pub escalation_retry_batch_size: usize,
    pub escalation_max_attempts: i64,
    pub stale_incident_hours: i64,
    pub retention_days: i64,
    pub stale_report_days: i64,
    pub manual_trigger_per_minute: usize,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            batch_size: 100,
            ai_batch_size: 5,
            breaker_threshold: 10,
            breaker_window_minutes: 15,
            deploy_window_minutes: 30,
            correlation_min_errors: 3,
            correlation_critical_errors: 10,
            rollback_min_errors: 5,
            anomaly_multiplier: 2.5,
            anomaly_floor_ms: 500.0,
            anomaly_min_samples: 10,
            anomaly_dedup_minutes: 30,
            escalation_hourly_cap: 10,
            escalation_batch_size: 10,
            escalation_retry_batch_size: 5,
            escalation_max_attempts: 3,
            stale_incident_hours: 2,
            retention_days: 30,
            stale_report_days: 7,
            manual_trigger_per_minute: 6,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub diagnose_timeout_secs: u64,
    pub generate_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o-mini".into(),
            diagnose_timeout_secs: 15,
            generate_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Full URL of the management query endpoint.
    pub api_url: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    pub api_url: String,
    pub token: Option<String>,
    pub project_id: Option<String>,
    pub team_id: Option<String>,
    pub webhook_secret: Option<String>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.vercel.com".into(),
            token: None,
            project_id: None,
            team_id: None,
            webhook_secret: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub from: String,
    pub recipients: Vec<String>,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.resend.com".into(),
            api_key: None,
            from: "Sentinel <sentinel@alerts.invalid>".into(),
            recipients: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub cron_secret: Option<String>,
}

impl SentinelConfig {
    /// Load defaults, overlay `path` (if any), then overlay the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)?;
                Self::from_toml(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, AppError> {
        toml::from_str(raw).map_err(|e| AppError::Config(e.to_string()))
    }

    /// Overlay values from an environment lookup. Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("SENTINEL_DATABASE_PATH") {
            self.database_path = PathBuf::from(v);
        }
        if let Some(v) = get("SENTINEL_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Some(v) = get("SENTINEL_SCHEDULE_SECS").and_then(|v| v.parse().ok()) {
            self.schedule_secs = v;
        }
        if let Some(v) = get("SENTINEL_LOG_JSON") {
            self.log.json = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Some(v) = get("SENTINEL_LOG_DIR") {
            self.log.dir = Some(PathBuf::from(v));
        }

        if let Some(v) = get("OPENAI_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = get("OPENAI_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = get("SENTINEL_LLM_MODEL") {
            self.llm.model = v;
        }

        if let Some(v) = get("ADMIN_API_URL") {
            self.admin.api_url = Some(v);
        }
        if let Some(v) = get("ADMIN_API_TOKEN") {
            self.admin.token = Some(v);
        }

        if let Some(v) = get("VERCEL_TOKEN") {
            self.deploy.token = Some(v);
        }
        if let Some(v) = get("VERCEL_PROJECT_ID") {
            self.deploy.project_id = Some(v);
        }
        if let Some(v) = get("VERCEL_TEAM_ID") {
            self.deploy.team_id = Some(v);
        }
        if let Some(v) = get("DEPLOY_WEBHOOK_SECRET") {
            self.deploy.webhook_secret = Some(v);
        }

        if let Some(v) = get("RESEND_API_KEY") {
            self.escalation.api_key = Some(v);
        }
        if let Some(v) = get("ESCALATION_FROM") {
            self.escalation.from = v;
        }
        if let Some(v) = get("ESCALATION_RECIPIENTS") {
            self.escalation.recipients = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Some(v) = get("CRON_SECRET") {
            self.auth.cron_secret = Some(v);
        }
    }
}
