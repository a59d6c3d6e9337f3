//! Code-assist gateway
//!
//! Single-binary composition root. Constructs every pool component once,
//! wires them together through `Arc` handles and the provider traits,
//! starts the background quota scheduler and auto token refresh, and
//! serves the forward + admin + health routes until SIGINT/SIGTERM.

mod admin;
mod clients;
mod config;
mod wire;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use codeassist_pool::{
    AccountRegistry, AccountSelector, CooldownTracker, DispatchCoordinator, DispatchRequest,
    HistoryCompressor, QuotaCache, QuotaScheduler, RateLimiter, RefreshManager,
};
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::AdminState;
use crate::clients::HttpClients;
use crate::config::Config;

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    dispatcher: Arc<DispatchCoordinator>,
    registry: Arc<AccountRegistry>,
    started_at: Instant,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting codeassist-gateway");

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    tokio::fs::create_dir_all(&config.gateway.data_dir)
        .await
        .with_context(|| {
            format!(
                "failed to create data dir {}",
                config.gateway.data_dir.display()
            )
        })?;

    // Provider clients (one concrete type implements all four traits)
    let clients = Arc::new(HttpClients::new(config.endpoints.clone()));

    // Core components
    let cooldowns = Arc::new(CooldownTracker::new());
    let quota_cache = Arc::new(QuotaCache::new(config.quota_cache_path()));
    quota_cache.load_from_file().await;
    let selector = Arc::new(AccountSelector::load(quota_cache.clone(), config.priority_path()).await);
    let registry = Arc::new(
        AccountRegistry::load(
            config.accounts_path(),
            config.gateway.default_token_path.clone(),
            cooldowns.clone(),
            quota_cache.clone(),
            selector,
        )
        .await,
    );
    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
    let refresh_manager = Arc::new(
        RefreshManager::new(config.refresh.clone()).context("invalid refresh configuration")?,
    );
    let compressor = Arc::new(
        HistoryCompressor::new(config.history.clone()).context("invalid history configuration")?,
    );
    let scheduler = Arc::new(QuotaScheduler::new(
        quota_cache.clone(),
        clients.clone(),
        registry.clone(),
        Duration::from_secs(config.quota_scheduler.update_interval_secs),
        Duration::from_secs(config.quota_scheduler.cache_max_age_secs),
    ));

    let dispatcher = Arc::new(DispatchCoordinator::new(
        registry.clone(),
        scheduler.clone(),
        rate_limiter.clone(),
        refresh_manager.clone(),
        cooldowns.clone(),
        quota_cache.clone(),
        compressor.clone(),
        clients.clone(),
        clients.clone(),
        clients.clone(),
    ));

    info!(
        accounts = registry.list().len(),
        listen_addr = %config.gateway.listen_addr,
        "components wired"
    );

    // Background work: quota refresh loop + auto token refresh timer
    scheduler.start().await;
    refresh_manager
        .start_auto_refresh(registry.clone(), clients.clone())
        .await;

    let admin_state = AdminState {
        registry: registry.clone(),
        scheduler: scheduler.clone(),
        refresh_manager: refresh_manager.clone(),
        rate_limiter,
        compressor,
        token_client: clients.clone(),
        usage_client: clients.clone(),
    };
    let app_state = AppState {
        dispatcher,
        registry: registry.clone(),
        started_at: Instant::now(),
    };

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/v1/forward", post(forward_handler))
        .with_state(app_state)
        .merge(admin::build_admin_router(admin_state));

    let listener = TcpListener::bind(config.gateway.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.gateway.listen_addr))?;

    info!(addr = %config.gateway.listen_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Orderly teardown: stop background tasks, persist the cache
    scheduler.stop().await;
    refresh_manager.stop_auto_refresh().await;
    quota_cache.save_to_file().await;

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: uptime plus pool availability counts.
async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let cooldowns = state.registry.cooldowns();
    let quota_cache = state.registry.quota_cache();
    let accounts = state.registry.list();
    let available = accounts
        .iter()
        .filter(|a| a.is_available(cooldowns, quota_cache))
        .count();
    let status = if accounts.is_empty() || available == 0 {
        "unhealthy"
    } else if available < accounts.len() {
        "degraded"
    } else {
        "healthy"
    };

    Json(serde_json::json!({
        "status": status,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "accounts_total": accounts.len(),
        "accounts_available": available,
    }))
}

/// Inbound forward request, already translated out of its wire dialect.
#[derive(Deserialize)]
struct ForwardBody {
    session_id: Option<String>,
    #[serde(default)]
    history: Vec<Value>,
    user_content: String,
    model_id: Option<String>,
}

/// Forward one request through the dispatch pipeline, streaming the
/// upstream body back.
async fn forward_handler(
    State(state): State<AppState>,
    Json(body): Json<ForwardBody>,
) -> Response {
    let (history, shape) = match wire::parse_history(&body.history) {
        Ok(parsed) => parsed,
        Err(message) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": message})),
            )
                .into_response();
        }
    };

    let request = DispatchRequest {
        session_id: body.session_id,
        history,
        shape,
        user_content: body.user_content,
        model_id: body.model_id,
    };

    match state.dispatcher.dispatch(request).await {
        Ok(outcome) => {
            let mut response = Response::builder()
                .status(StatusCode::OK)
                .header("x-account-id", outcome.account_id);
            if let Some(warning) = outcome.warning {
                response = response.header("x-history-compressed", warning);
            }
            response
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .body(axum::body::Body::from_stream(outcome.stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(error) => {
            let status = match &error {
                codeassist_pool::Error::NoAvailableAccount => StatusCode::SERVICE_UNAVAILABLE,
                codeassist_pool::Error::UpstreamRateLimited(_)
                | codeassist_pool::Error::UpstreamQuotaExhausted(_) => {
                    StatusCode::TOO_MANY_REQUESTS
                }
                codeassist_pool::Error::InputTooLong(_) => StatusCode::PAYLOAD_TOO_LARGE,
                codeassist_pool::Error::UpstreamAuthFailed(_)
                | codeassist_pool::Error::TokenRefreshFailed(_) => StatusCode::BAD_GATEWAY,
                codeassist_pool::Error::NotFound(_) => StatusCode::NOT_FOUND,
                codeassist_pool::Error::ConfigInvalid(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::BAD_GATEWAY,
            };
            (
                status,
                Json(serde_json::json!({
                    "error": {"kind": error.kind(), "message": error.to_string()}
                })),
            )
                .into_response()
        }
    }
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
