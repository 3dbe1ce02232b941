//! In-memory collaborators for engine tests. Each fake counts its calls so
//! tests can assert on how often the pipeline reached out.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::clients::{
    AdminChannel, CompletionClient, CompletionRequest, DeployPlatform, Mailer, OutboundEmail,
    PlatformDeployment,
};
use crate::config::SentinelConfig;
use crate::db::models::NewErrorReport;
use crate::db::repos::intake::reports;
use crate::db::DbPool;
use crate::error::AppError;

use super::SentinelContext;

type Responder<I, O> = Box<dyn Fn(&I) -> Result<O, AppError> + Send + Sync>;

// ============================================================================
// LLM
// ============================================================================

pub struct FakeLlm {
    responder: Responder<CompletionRequest, String>,
    pub calls: AtomicUsize,
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl FakeLlm {
    pub fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&CompletionRequest) -> Result<String, AppError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            responder: Box::new(responder),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Always answers with `body`.
    pub fn fixed(body: &str) -> Arc<Self> {
        let body = body.to_string();
        Self::new(move |_| Ok(body.clone()))
    }

    pub fn failing() -> Arc<Self> {
        Self::new(|_| Err(AppError::Upstream("llm unavailable".into())))
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl CompletionClient for FakeLlm {
    async fn complete(&self, request: CompletionRequest) -> Result<String, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = (self.responder)(&request);
        self.requests.lock().unwrap().push(request);
        result
    }
}

// ============================================================================
// Admin channel
// ============================================================================

pub struct FakeAdmin {
    responder: Responder<String, serde_json::Value>,
    pub queries: Mutex<Vec<String>>,
}

impl FakeAdmin {
    pub fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&String) -> Result<serde_json::Value, AppError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            responder: Box::new(responder),
            queries: Mutex::new(Vec::new()),
        })
    }

    /// Every statement succeeds with no rows.
    pub fn accepting() -> Arc<Self> {
        Self::new(|_| Ok(serde_json::json!([])))
    }

    pub fn executed(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl AdminChannel for FakeAdmin {
    async fn query(&self, sql: &str) -> Result<serde_json::Value, AppError> {
        let sql = sql.to_string();
        let result = (self.responder)(&sql);
        self.queries.lock().unwrap().push(sql);
        result
    }
}

// ============================================================================
// Deploy platform
// ============================================================================

pub struct FakePlatform {
    pub deployments: Vec<PlatformDeployment>,
    pub fail_redeploy: bool,
    pub redeployed: Mutex<Vec<String>>,
}

impl FakePlatform {
    pub fn new(deployments: Vec<PlatformDeployment>) -> Arc<Self> {
        Arc::new(Self {
            deployments,
            fail_redeploy: false,
            redeployed: Mutex::new(Vec::new()),
        })
    }

    pub fn deployment(uid: &str, state: &str, target: &str, created_ms: i64) -> PlatformDeployment {
        PlatformDeployment {
            uid: uid.into(),
            ready_state: Some(state.into()),
            target: Some(target.into()),
            created_at: Some(created_ms),
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
impl DeployPlatform for FakePlatform {
    async fn list_deployments(&self, limit: usize) -> Result<Vec<PlatformDeployment>, AppError> {
        let mut all = self.deployments.clone();
        all.sort_by_key(|d| std::cmp::Reverse(d.created_ms()));
        all.truncate(limit);
        Ok(all)
    }

    async fn redeploy(&self, deployment_id: &str) -> Result<String, AppError> {
        if self.fail_redeploy {
            return Err(AppError::Upstream("redeploy rejected".into()));
        }
        self.redeployed.lock().unwrap().push(deployment_id.to_string());
        Ok(format!("{deployment_id}-redeploy"))
    }
}

// ============================================================================
// Mailer
// ============================================================================

#[derive(Default)]
pub struct FakeMailer {
    pub fail: AtomicBool,
    pub sent: Mutex<Vec<OutboundEmail>>,
}

impl FakeMailer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl Mailer for FakeMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<(), AppError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::Upstream("mail provider 503".into()));
        }
        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}

// ============================================================================
// Context + fixtures
// ============================================================================

/// A context with default config and no collaborators.
pub fn context(pool: DbPool) -> SentinelContext {
    context_with(pool, SentinelConfig::default())
}

pub fn context_with(pool: DbPool, config: SentinelConfig) -> SentinelContext {
    SentinelContext {
        pool,
        config: Arc::new(config),
        llm: None,
        admin: None,
        platform: None,
        mailer: None,
    }
}

/// Insert a report with `description` and no console output.
pub fn report(pool: &DbPool, description: &str) -> crate::db::models::ErrorReport {
    reports::create(
        pool,
        NewErrorReport {
            description: description.into(),
            ..Default::default()
        },
    )
    .unwrap()
}

/// Diagnosis response the fake LLM gives for a fixable schema error.
pub fn fixable_diagnosis() -> String {
    serde_json::json!({
        "root_cause": "A stored function references a table that was renamed.",
        "severity": "high",
        "auto_fixable": true,
        "fix_summary": "Point the function at the current table name.",
        "recommendation": "Replace the function body."
    })
    .to_string()
}
