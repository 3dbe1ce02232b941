use serde::{Deserialize, Serialize};

// ============================================================================
// Deployments
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployEvent {
    pub id: String,
    pub deployment_id: String,
    pub commit_sha: Option<String>,
    pub commit_message: Option<String>,
    pub branch: Option<String>,
    /// "building" | "ready" | "error" | "canceled" | "unknown"
    pub status: String,
    pub url: Option<String>,
    pub deployed_at: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewDeployEvent {
    pub deployment_id: String,
    pub commit_sha: Option<String>,
    pub commit_message: Option<String>,
    pub branch: Option<String>,
    pub status: String,
    pub url: Option<String>,
    pub deployed_at: String,
}

// ============================================================================
// Rollbacks
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    Success,
    Failed,
    Skipped,
}

impl RollbackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackEvent {
    pub id: String,
    pub deploy_event_id: Option<String>,
    pub deployment_id: String,
    pub incident_id: Option<String>,
    pub target_deployment_id: Option<String>,
    pub status: String,
    pub reason: Option<String>,
    pub created_at: String,
}
