use serde::{Deserialize, Serialize};

// ============================================================================
// Incidents
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "critical" => Self::Critical,
            "high" => Self::High,
            "low" => Self::Low,
            _ => Self::Medium,
        }
    }
}

/// Incident sources written by this pipeline.
pub const SOURCE_SENTINEL: &str = "sentinel";
pub const SOURCE_CIRCUIT_BREAKER: &str = "circuit_breaker";
pub const SOURCE_SCHEMA_HEALER: &str = "schema_healer";
pub const SOURCE_DEPLOY: &str = "deploy_correlation";
pub const SOURCE_ANOMALY: &str = "anomaly";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub title: String,
    pub severity: Severity,
    /// "detected" | "diagnosing" | "healing" | "resolved"
    pub status: String,
    pub source: String,
    pub error_pattern: Option<String>,
    pub diagnosis: Option<String>,
    pub auto_healed: bool,
    pub heal_action: Option<String>,
    pub escalation_sent_at: Option<String>,
    pub metadata: serde_json::Value,
    pub detected_at: String,
    pub last_seen_at: Option<String>,
    pub resolved_at: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewIncident {
    pub title: String,
    pub severity: Severity,
    pub status: String,
    pub source: String,
    pub error_pattern: Option<String>,
    pub diagnosis: Option<String>,
    pub auto_healed: bool,
    pub heal_action: Option<String>,
    pub metadata: serde_json::Value,
}

impl NewIncident {
    /// A freshly detected incident with empty metadata.
    pub fn detected(title: impl Into<String>, severity: Severity, source: &str) -> Self {
        Self {
            title: title.into(),
            severity,
            status: "detected".into(),
            source: source.into(),
            error_pattern: None,
            diagnosis: None,
            auto_healed: false,
            heal_action: None,
            metadata: serde_json::json!({}),
        }
    }
}
