use serde::{Deserialize, Serialize};

// ============================================================================
// Remediation audit trail
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealLogEntry {
    pub id: String,
    pub report_id: Option<String>,
    pub pattern_id: Option<String>,
    pub action: String,
    /// "success" | "failure"
    pub result: String,
    pub details: Option<String>,
    pub created_at: String,
}

// ============================================================================
// Schema heal audit trail
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionResult {
    Pending,
    Success,
    Failed,
    Blocked,
    Skipped,
}

impl ExecutionResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "success" => Self::Success,
            "failed" => Self::Failed,
            "blocked" => Self::Blocked,
            "skipped" => Self::Skipped,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaHealLog {
    pub id: String,
    pub report_id: Option<String>,
    pub fingerprint: String,
    pub error_message: String,
    pub error_class: Option<String>,
    pub generated_sql: Option<String>,
    pub explanation: Option<String>,
    /// "low" | "medium" | "high"
    pub risk: Option<String>,
    /// JSON snapshot of the introspected columns before execution.
    pub pre_state: Option<String>,
    pub execution_result: ExecutionResult,
    pub execution_error: Option<String>,
    pub applied_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct NewSchemaHealLog {
    pub report_id: Option<String>,
    pub fingerprint: String,
    pub error_message: String,
    pub error_class: Option<String>,
    pub generated_sql: Option<String>,
    pub explanation: Option<String>,
    pub risk: Option<String>,
    pub pre_state: Option<String>,
}
