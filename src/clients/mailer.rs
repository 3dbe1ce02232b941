use std::time::Duration;

use serde::Serialize;

use super::{build_http, check_status};
use crate::error::AppError;

const EMAIL_API_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Serialize)]
pub struct OutboundEmail {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub html: String,
}

#[async_trait::async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<(), AppError>;
}

/// Resend transactional email API: `POST {api_url}/emails`.
pub struct ResendMailer {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl ResendMailer {
    pub fn new(api_url: &str, api_key: &str) -> Result<Self, AppError> {
        Ok(Self {
            http: build_http()?,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl Mailer for ResendMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<(), AppError> {
        let res = self
            .http
            .post(format!("{}/emails", self.api_url))
            .bearer_auth(&self.api_key)
            .timeout(EMAIL_API_TIMEOUT)
            .json(email)
            .send()
            .await?;
        check_status("email", res).await?;
        Ok(())
    }
}
