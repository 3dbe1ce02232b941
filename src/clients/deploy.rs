use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{build_http, check_status, upstream_err};
use crate::error::AppError;

const DEPLOY_API_TIMEOUT: Duration = Duration::from_secs(15);

/// A deployment as reported by the hosting platform.
///
/// The list endpoint reports both `state`/`readyState` and
/// `created`/`createdAt` depending on API version, so both are kept.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformDeployment {
    pub uid: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub ready_state: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub url: Option<String>,
}

impl PlatformDeployment {
    /// Platform ready-state, e.g. `READY`, `ERROR`, `BUILDING`.
    pub fn ready_state(&self) -> &str {
        self.ready_state
            .as_deref()
            .or(self.state.as_deref())
            .unwrap_or("")
    }

    /// Creation time in epoch milliseconds.
    pub fn created_ms(&self) -> i64 {
        self.created_at.or(self.created).unwrap_or(0)
    }

    pub fn is_production(&self) -> bool {
        self.target.as_deref() == Some("production")
    }
}

#[async_trait::async_trait]
pub trait DeployPlatform: Send + Sync {
    /// Recent deployments, newest first.
    async fn list_deployments(&self, limit: usize) -> Result<Vec<PlatformDeployment>, AppError>;

    /// Redeploy `deployment_id` to production. Returns the new deployment id.
    async fn redeploy(&self, deployment_id: &str) -> Result<String, AppError>;
}

// ============================================================================
// Vercel
// ============================================================================

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    deployments: Vec<PlatformDeployment>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RedeployBody<'a> {
    name: &'a str,
    deployment_id: &'a str,
    target: &'static str,
}

#[derive(Deserialize)]
struct RedeployResponse {
    #[serde(alias = "uid")]
    id: String,
}

pub struct VercelClient {
    http: reqwest::Client,
    api_url: String,
    token: String,
    project_id: String,
    team_id: Option<String>,
}

impl VercelClient {
    pub fn new(
        api_url: &str,
        token: &str,
        project_id: &str,
        team_id: Option<&str>,
    ) -> Result<Self, AppError> {
        Ok(Self {
            http: build_http()?,
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            project_id: project_id.to_string(),
            team_id: team_id.map(str::to_string),
        })
    }

    /// Build an authenticated request, adding the team scope when configured.
    fn authed(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .request(method, format!("{}{}", self.api_url, path))
            .bearer_auth(&self.token)
            .timeout(DEPLOY_API_TIMEOUT);
        if let Some(team) = &self.team_id {
            req = req.query(&[("teamId", team.as_str())]);
        }
        req
    }
}

#[async_trait::async_trait]
impl DeployPlatform for VercelClient {
    async fn list_deployments(&self, limit: usize) -> Result<Vec<PlatformDeployment>, AppError> {
        let limit = limit.to_string();
        let res = self
            .authed(reqwest::Method::GET, "/v6/deployments")
            .query(&[("projectId", self.project_id.as_str()), ("limit", limit.as_str())])
            .send()
            .await?;
        let parsed: ListResponse = check_status("deployments list", res)
            .await?
            .json()
            .await
            .map_err(upstream_err)?;
        let mut deployments = parsed.deployments;
        deployments.sort_by_key(|d| std::cmp::Reverse(d.created_ms()));
        Ok(deployments)
    }

    async fn redeploy(&self, deployment_id: &str) -> Result<String, AppError> {
        let res = self
            .authed(reqwest::Method::POST, "/v13/deployments")
            .query(&[("forceNew", "1")])
            .json(&RedeployBody {
                name: &self.project_id,
                deployment_id,
                target: "production",
            })
            .send()
            .await?;
        let parsed: RedeployResponse = check_status("redeploy", res)
            .await?
            .json()
            .await
            .map_err(upstream_err)?;
        Ok(parsed.id)
    }
}
