//! Trigger authentication: the scheduler's shared secret, or a privileged
//! admin session token.

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

use crate::db::repos::ops::sessions;
use crate::db::DbPool;
use crate::error::AppError;

pub const CRON_SECRET_HEADER: &str = "x-cron-secret";

/// Who asked for the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    Scheduler,
    Admin { user_id: String },
}

impl Caller {
    /// Value stored as the run's trigger source.
    pub fn trigger(&self) -> &'static str {
        match self {
            Caller::Scheduler => "schedule",
            Caller::Admin { .. } => "manual",
        }
    }
}

/// Compare two secrets without an early exit on the first differing byte.
/// Both sides are hashed first so lengths never leak either.
fn secrets_match(given: &str, expected: &str) -> bool {
    let a = Sha256::digest(given.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

pub fn authenticate(pool: &DbPool, cron_secret: Option<&str>, headers: &HeaderMap) -> Result<Caller, AppError> {
    let cron_secret = cron_secret.filter(|s| !s.is_empty());

    if let (Some(expected), Some(given)) = (
        cron_secret,
        headers.get(CRON_SECRET_HEADER).and_then(|v| v.to_str().ok()),
    ) {
        if secrets_match(given, expected) {
            return Ok(Caller::Scheduler);
        }
        return Err(AppError::Auth("invalid scheduler secret".into()));
    }

    let Some(token) = bearer(headers) else {
        return Err(AppError::Auth("missing credentials".into()));
    };
    if let Some(expected) = cron_secret {
        if secrets_match(token, expected) {
            return Ok(Caller::Scheduler);
        }
    }

    match sessions::find_valid(pool, token)? {
        Some(session) if session.is_privileged() => Ok(Caller::Admin { user_id: session.user_id }),
        Some(session) => {
            tracing::warn!(user_id = %session.user_id, role = %session.role, "Non-admin tried to trigger a run");
            Err(AppError::Auth("admin role required".into()))
        }
        None => Err(AppError::Auth("invalid or expired session".into())),
    }
}
