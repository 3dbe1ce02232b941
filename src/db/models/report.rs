use serde::{Deserialize, Serialize};

// ============================================================================
// Error Reports
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub id: String,
    pub tenant_id: Option<String>,
    pub description: String,
    /// Raw JSON as captured by the browser reporter. Not guaranteed to parse.
    pub console_errors: Option<String>,
    pub page_url: Option<String>,
    /// "open" | "resolved"
    pub status: String,
    pub created_at: String,
    pub processed_at: Option<String>,
    pub matched_pattern_id: Option<String>,
    pub diagnosis: Option<String>,
    /// Structured feasibility flag from the diagnoser. `None` = unknown.
    pub diagnosis_fixable: Option<bool>,
    pub schema_heal_state: Option<String>,
    pub resolved_at: Option<String>,
}

/// Insert payload used by the intake collaborator (and tests).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewErrorReport {
    pub tenant_id: Option<String>,
    pub description: String,
    pub console_errors: Option<String>,
    pub page_url: Option<String>,
    /// Defaults to now when absent.
    pub created_at: Option<String>,
}

/// Terminal outcome recorded on a report by the schema healer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaHealState {
    Healed,
    AlreadyHealed,
    Failed,
    Blocked,
    Skipped,
    Escalated,
    Unclassified,
}

impl SchemaHealState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healed => "healed",
            Self::AlreadyHealed => "already_healed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Skipped => "skipped",
            Self::Escalated => "escalated",
            Self::Unclassified => "unclassified",
        }
    }
}
