//! Outbound collaborators.
//!
//! Each external system the pipeline calls sits behind a small trait so the
//! engine can run against fakes in tests. The HTTP implementations share the
//! same shape: one `reqwest::Client` per collaborator, an explicit per-request
//! timeout, and non-2xx responses mapped to [`AppError::Upstream`].

pub mod admin;
pub mod deploy;
pub mod llm;
pub mod mailer;

use crate::error::AppError;

pub use admin::{AdminChannel, ManagementApiClient};
pub use deploy::{DeployPlatform, PlatformDeployment, VercelClient};
pub use llm::{strip_code_fences, CompletionClient, CompletionRequest, OpenAiClient};
pub use mailer::{Mailer, OutboundEmail, ResendMailer};

/// Convert any displayable error into `AppError::Upstream`.
fn upstream_err(e: impl std::fmt::Display) -> AppError {
    AppError::Upstream(e.to_string())
}

fn build_http() -> Result<reqwest::Client, AppError> {
    reqwest::Client::builder()
        .user_agent(concat!("sentinel-worker/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(upstream_err)
}

/// Turn a non-success response into an error carrying a short body excerpt.
async fn check_status(
    service: &str,
    res: reqwest::Response,
) -> Result<reqwest::Response, AppError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    let excerpt: String = body.chars().take(300).collect();
    Err(AppError::Upstream(format!("{service} {}: {excerpt}", status.as_u16())))
}
