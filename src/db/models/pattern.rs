use serde::{Deserialize, Serialize};

// ============================================================================
// Error Patterns
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Substring,
    Regex,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Substring => "substring",
            Self::Regex => "regex",
        }
    }

    /// Unknown labels fall back to substring, the most permissive safe match.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "exact" => Self::Exact,
            "regex" => Self::Regex,
            _ => Self::Substring,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixAction {
    LogOnly,
    CreateIncident,
    CircuitBreaker,
    DisableFeature,
    SchemaHeal,
}

impl FixAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LogOnly => "log_only",
            Self::CreateIncident => "create_incident",
            Self::CircuitBreaker => "circuit_breaker",
            Self::DisableFeature => "disable_feature",
            Self::SchemaHeal => "schema_heal",
        }
    }

    /// Unknown labels are treated as log-only so they never mutate anything.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "create_incident" => Self::CreateIncident,
            "circuit_breaker" => Self::CircuitBreaker,
            "disable_feature" => Self::DisableFeature,
            "schema_heal" => Self::SchemaHeal,
            _ => Self::LogOnly,
        }
    }

    /// Whether the remediation executor has work to do for this action.
    pub fn is_remediation(&self) -> bool {
        matches!(
            self,
            Self::CreateIncident | Self::CircuitBreaker | Self::DisableFeature
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub id: String,
    pub pattern: String,
    pub match_type: MatchType,
    pub category: String,
    /// "low" | "medium" | "high" | "critical"
    pub severity: String,
    pub auto_fix_action: FixAction,
    pub fix_description: Option<String>,
    pub cooldown_minutes: i64,
    pub times_matched: i64,
    pub times_fixed: i64,
    pub last_matched_at: Option<String>,
    pub last_fixed_at: Option<String>,
    pub enabled: bool,
    /// Lower runs first; ties broken by creation time.
    pub priority: i64,
    /// "seed" | "manual" | "auto_learned"
    pub source: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewErrorPattern {
    pub pattern: String,
    pub match_type: MatchType,
    pub category: String,
    pub severity: String,
    pub auto_fix_action: FixAction,
    pub fix_description: Option<String>,
    pub cooldown_minutes: i64,
    pub priority: i64,
    pub source: String,
}
