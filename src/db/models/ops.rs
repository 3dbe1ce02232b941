use serde::{Deserialize, Serialize};

// ============================================================================
// Escalations
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationLog {
    pub id: String,
    pub incident_id: String,
    pub channel: String,
    pub recipient: String,
    pub subject: String,
    /// "sent" | "failed"
    pub status: String,
    pub error_message: Option<String>,
    pub attempts: i64,
    pub created_at: String,
    pub updated_at: String,
}

// ============================================================================
// Runs
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelRun {
    pub id: String,
    /// "schedule" | "manual" | "cli"
    pub trigger_source: String,
    /// "running" | "completed" | "failed"
    pub status: String,
    pub counters: serde_json::Value,
    pub errors: Vec<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

// ============================================================================
// Health & baselines
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub id: String,
    pub check_name: String,
    /// "pass" | "fail"
    pub status: String,
    pub latency_ms: f64,
    pub checked_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceBaseline {
    pub check_name: String,
    pub window_hours: i64,
    pub mean_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub sample_count: i64,
    pub computed_at: String,
}

// ============================================================================
// Admin sessions
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminSession {
    pub token_hash: String,
    pub user_id: String,
    /// "admin" | "super_admin" | other roles written by the auth service
    pub role: String,
    pub expires_at: String,
}

impl AdminSession {
    pub fn is_privileged(&self) -> bool {
        matches!(self.role.as_str(), "admin" | "super_admin")
    }
}
