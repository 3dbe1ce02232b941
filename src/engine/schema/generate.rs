//! Fix generation: ask the completion model for one additive DDL statement.

use std::time::Duration;

use serde::Deserialize;

use super::classify::Classification;
use super::introspect::SchemaContext;
use crate::clients::{strip_code_fences, CompletionClient, CompletionRequest};
use crate::engine::catalog::clip;
use crate::error::AppError;

const MAX_TOKENS: u32 = 1200;
const TEMPERATURE: f32 = 0.1;
const MAX_ERROR_CHARS: usize = 2000;
const MAX_CONTEXT_CHARS: usize = 6000;

const SYSTEM_PROMPT: &str = "You repair Postgres schema drift behind a PostgREST API. \
Given an error and the live schema around it, propose exactly ONE additive SQL statement \
that fixes it. Allowed forms: ALTER TABLE ... ADD COLUMN, ALTER TABLE ... ADD CONSTRAINT, \
CREATE INDEX, CREATE OR REPLACE FUNCTION, GRANT SELECT/INSERT/UPDATE/EXECUTE to a named \
role, COMMENT ON. Never drop, rename, truncate, delete, insert, update rows, create tables, \
touch roles, or reference the auth, storage or pg_catalog schemas. Reply with a JSON object: \
{\"sql\": string, \"explanation\": string, \"risk\": \"low\" | \"medium\" | \"high\"}. Use \
risk \"high\" whenever you are unsure the statement is safe and correct.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Risk {
    Low,
    Medium,
    High,
}

impl Risk {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Unknown labels count as high.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Self::Low,
            "medium" => Self::Medium,
            _ => Self::High,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedFix {
    pub sql: String,
    pub explanation: String,
    pub risk: Risk,
}

#[derive(Deserialize)]
struct RawFix {
    #[serde(default)]
    sql: String,
    #[serde(default)]
    explanation: String,
    #[serde(default)]
    risk: String,
}

pub fn parse_fix(raw: &str) -> Result<GeneratedFix, AppError> {
    let parsed: RawFix = serde_json::from_str(strip_code_fences(raw))
        .map_err(|e| AppError::Upstream(format!("fix generation returned invalid JSON: {e}")))?;
    let sql = strip_code_fences(&parsed.sql).to_string();
    if sql.is_empty() {
        return Err(AppError::Upstream("fix generation returned no SQL".into()));
    }
    Ok(GeneratedFix {
        sql,
        explanation: parsed.explanation.trim().to_string(),
        risk: Risk::parse(&parsed.risk),
    })
}

pub async fn generate(
    llm: &dyn CompletionClient,
    error_text: &str,
    classification: &Classification,
    context: &SchemaContext,
    timeout: Duration,
) -> Result<GeneratedFix, AppError> {
    let class = serde_json::to_string(&classification.class)?;
    let schema = serde_json::to_string_pretty(context)?;
    let user = format!(
        "Error:\n{}\n\nClassification: {class}\n\nLive schema context:\n{}",
        clip(error_text, MAX_ERROR_CHARS),
        clip(&schema, MAX_CONTEXT_CHARS),
    );
    let raw = llm
        .complete(CompletionRequest {
            system: SYSTEM_PROMPT.to_string(),
            user,
            max_tokens: MAX_TOKENS,
            temperature: TEMPERATURE,
            json: true,
            timeout,
        })
        .await?;
    parse_fix(&raw)
}
