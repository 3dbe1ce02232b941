use std::time::Duration;

use serde::Serialize;

use super::{build_http, check_status, upstream_err};
use crate::error::AppError;

/// Hard budget for a single administrative statement.
pub const ADMIN_QUERY_TIMEOUT: Duration = Duration::from_secs(20);

/// Privileged SQL execution path, separate from the tenant-facing data API.
///
/// Only the schema healer calls `query` with generated DDL, and only after
/// the safety gate has accepted it. Introspection queries go through the same
/// channel because they read catalog tables the data API does not expose.
#[async_trait::async_trait]
pub trait AdminChannel: Send + Sync {
    /// Execute one statement; returns the JSON rows (or an empty array).
    async fn query(&self, sql: &str) -> Result<serde_json::Value, AppError>;
}

#[derive(Serialize)]
struct QueryBody<'a> {
    query: &'a str,
}

/// Management REST endpoint: `POST {url}` with `{ "query": ... }`.
pub struct ManagementApiClient {
    http: reqwest::Client,
    url: String,
    token: String,
}

impl ManagementApiClient {
    pub fn new(url: &str, token: &str) -> Result<Self, AppError> {
        Ok(Self {
            http: build_http()?,
            url: url.to_string(),
            token: token.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl AdminChannel for ManagementApiClient {
    async fn query(&self, sql: &str) -> Result<serde_json::Value, AppError> {
        let res = self
            .http
            .post(&self.url)
            .bearer_auth(&self.token)
            .timeout(ADMIN_QUERY_TIMEOUT)
            .json(&QueryBody { query: sql })
            .send()
            .await?;
        let text = check_status("admin query", res)
            .await?
            .text()
            .await
            .map_err(upstream_err)?;
        if text.trim().is_empty() {
            return Ok(serde_json::Value::Array(Vec::new()));
        }
        Ok(serde_json::from_str(&text)?)
    }
}
