use serde::{Deserialize, Serialize};

// ============================================================================
// Circuit Breakers
// ============================================================================

/// Scope label used when a breaker applies to every tenant.
pub const GLOBAL_SCOPE: &str = "global";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerEvent {
    pub id: String,
    pub feature_key: String,
    /// `None` = global.
    pub tenant_id: Option<String>,
    /// "tripped" | "reset"
    pub action: String,
    pub reason: String,
    pub error_count: i64,
    pub threshold: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlag {
    /// Tenant id or [`GLOBAL_SCOPE`].
    pub scope: String,
    pub feature_key: String,
    pub enabled: bool,
    pub updated_at: String,
}
