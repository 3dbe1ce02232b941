//! HTTP surface: the run trigger, the deploy webhook, and a health probe.

pub mod auth;
pub mod deploy_hook;
pub mod throttle;

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderName, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};

use crate::db::repos::release::deploys;
use crate::engine::{coordinator, SentinelContext};
use crate::error::AppError;
use crate::scheduler::SchedulerState;

use self::auth::{Caller, CRON_SECRET_HEADER};
use self::throttle::{TriggerThrottle, MANUAL_TRIGGER_WINDOW};

/// Shared state for the HTTP server.
pub struct ServerState {
    pub ctx: SentinelContext,
    pub throttle: Arc<TriggerThrottle>,
    pub scheduler: Arc<SchedulerState>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self)).into_response()
    }
}

pub fn router(state: Arc<ServerState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static(CRON_SECRET_HEADER),
        ]);

    Router::new()
        .route("/sentinel/run", post(trigger_run))
        .route("/deploy-webhook", post(deploy_webhook))
        .route("/health", get(health))
        .layer(cors)
        .with_state(state)
}

/// Serve until `shutdown_rx` changes.
pub async fn start_server(
    state: Arc<ServerState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), AppError> {
    let addr = state.ctx.config.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "Sentinel HTTP server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
            tracing::info!("HTTP server shutting down");
        })
        .await?;
    Ok(())
}

async fn health(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "sentinel-worker",
        "scheduler": state.scheduler.stats(),
    }))
}

/// POST /sentinel/run: authenticate, throttle manual callers, run one pass.
async fn trigger_run(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    let caller = match auth::authenticate(&state.ctx.pool, state.ctx.config.auth.cron_secret.as_deref(), &headers) {
        Ok(caller) => caller,
        Err(e) => {
            tracing::warn!(error = %e, "Rejected run trigger");
            return e.into_response();
        }
    };

    if let Caller::Admin { user_id } = &caller {
        let max = state.ctx.config.thresholds.manual_trigger_per_minute;
        if let Err(retry_after) = state.throttle.admit(user_id, max, MANUAL_TRIGGER_WINDOW) {
            tracing::warn!(user_id = %user_id, retry_after, "Manual trigger throttled");
            return (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, retry_after.to_string())],
                Json(serde_json::json!({
                    "error": "Too many manual runs, try again shortly",
                    "kind": "rate_limited",
                    "retry_after_secs": retry_after,
                })),
            )
                .into_response();
        }
    }

    let summary = coordinator::run_pipeline(&state.ctx, caller.trigger()).await;
    let status = if summary.status == "failed" {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    (status, Json(summary)).into_response()
}

/// POST /deploy-webhook: verify the signature when a secret is configured,
/// then upsert the deployment.
async fn deploy_webhook(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    match state.ctx.config.deploy.webhook_secret.as_deref().filter(|s| !s.is_empty()) {
        Some(secret) => {
            let signature = deploy_hook::SIGNATURE_HEADERS
                .iter()
                .find_map(|h| headers.get(*h))
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| AppError::Auth("missing deploy signature".into()))?;
            if !deploy_hook::verify_signature(secret, &body, signature) {
                return Err(AppError::Auth("invalid deploy signature".into()));
            }
        }
        None => tracing::warn!("DEPLOY_WEBHOOK_SECRET not set, accepting unsigned deploy event"),
    }

    let event = deploy_hook::parse_event(&body)?;
    let stored = deploys::upsert(&state.ctx.pool, event)?;
    tracing::info!(
        deployment_id = %stored.deployment_id,
        status = %stored.status,
        "Deploy event recorded"
    );
    Ok(Json(serde_json::json!({
        "ok": true,
        "deployment_id": stored.deployment_id,
        "status": stored.status,
    })))
}
