//! Admin API for pool management
//!
//! JSON surface driving the core: account CRUD and health detail, token
//! refresh (single and batch with progress), cooldown restore, the three
//! runtime configs, priority list and strategy, and quota refresh. Every
//! write returns an `{ok, message}` envelope; reads return data directly
//! and degrade to last-known-good snapshots rather than erroring.
//!
//! Inbound authentication is deliberately absent; bind the listener to a
//! loopback or otherwise trusted interface.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::Json;
use codeassist_auth::now_millis;
use codeassist_pool::{
    AccountRegistry, HistoryCompressor, HistoryConfig, QuotaFetcher, QuotaScheduler,
    RateLimitConfig, RateLimiter, RefreshConfig, RefreshManager, SelectionStrategy,
};
use provider::{TokenClient, UsageClient};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

/// Shared state for admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub registry: Arc<AccountRegistry>,
    pub scheduler: Arc<QuotaScheduler>,
    pub refresh_manager: Arc<RefreshManager>,
    pub rate_limiter: Arc<RateLimiter>,
    pub compressor: Arc<HistoryCompressor>,
    pub token_client: Arc<dyn TokenClient>,
    pub usage_client: Arc<dyn UsageClient>,
}

/// Build the admin router.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/accounts", get(list_accounts).post(add_account))
        .route("/admin/accounts/{id}", get(account_detail).delete(delete_account))
        .route("/admin/accounts/{id}/toggle", post(toggle_account))
        .route("/admin/accounts/{id}/refresh-token", post(refresh_account_token))
        .route("/admin/accounts/{id}/restore", post(restore_cooldown))
        .route("/admin/accounts/{id}/quota", post(refresh_account_quota))
        .route("/admin/refresh-all", post(refresh_all_tokens))
        .route("/admin/refresh-progress", get(refresh_progress))
        .route("/admin/quota/refresh-all", post(refresh_all_quotas))
        .route("/admin/quota/summary", get(quota_summary))
        .route(
            "/admin/config/rate-limit",
            get(get_rate_limit_config).put(set_rate_limit_config),
        )
        .route(
            "/admin/config/refresh",
            get(get_refresh_config).put(set_refresh_config),
        )
        .route(
            "/admin/config/history",
            get(get_history_config).put(set_history_config),
        )
        .route("/admin/priority", get(get_priority).put(set_priority))
        .route("/admin/priority/add", post(add_priority))
        .route("/admin/priority/{id}", delete(remove_priority))
        .route("/admin/priority/reorder", post(reorder_priority))
        .route("/admin/strategy", put(set_strategy))
        .route("/admin/status", get(status))
        .with_state(state)
}

fn ok_message(message: impl Into<String>) -> Json<Value> {
    Json(json!({"ok": true, "message": message.into()}))
}

fn error_reply(status: StatusCode, message: String) -> (StatusCode, Json<Value>) {
    (status, Json(json!({"ok": false, "message": message})))
}

fn core_error(error: codeassist_pool::Error) -> (StatusCode, Json<Value>) {
    let status = match &error {
        codeassist_pool::Error::NotFound(_) => StatusCode::NOT_FOUND,
        codeassist_pool::Error::ConfigInvalid(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({"ok": false, "kind": error.kind(), "message": error.to_string()})),
    )
}

/// Full per-account detail, including the cached quota snapshot. Tokens
/// are never exposed.
async fn describe_account(
    state: &AdminState,
    account: &Arc<codeassist_pool::Account>,
) -> Value {
    let cooldowns = state.registry.cooldowns();
    let quota_cache = state.registry.quota_cache();
    let selector = state.registry.selector();

    let credential = account.credential().await;
    let now = now_millis();
    let window = Duration::from_secs(state.refresh_manager.config().token_refresh_before_expiry);

    let quota = quota_cache.get(&account.id).map(|snapshot| {
        json!({
            "balance": snapshot.balance,
            "usage_limit": snapshot.usage_limit,
            "current_usage": snapshot.current_usage,
            "usage_percent": snapshot.usage_percent,
            "balance_status": snapshot.balance_status,
            "is_low_balance": snapshot.is_low_balance,
            "is_exhausted": snapshot.is_exhausted,
            "subscription_title": snapshot.subscription_title,
            "free_trial_limit": snapshot.free_trial_limit,
            "free_trial_usage": snapshot.free_trial_usage,
            "bonus_limit": snapshot.bonus_limit,
            "bonus_usage": snapshot.bonus_usage,
            "updated_at": snapshot.updated_at,
            "stale": state.scheduler.is_snapshot_stale(&account.id),
            "error": snapshot.error,
        })
    });

    let request_count = account.request_count();
    let error_count = account.error_count();
    let error_rate = format!(
        "{:.1}%",
        error_count as f64 / (request_count.max(1)) as f64 * 100.0
    );

    json!({
        "id": account.id,
        "name": account.name,
        "enabled": account.enabled(),
        "status": account.status(),
        "available": account.is_available(cooldowns, quota_cache),
        "request_count": request_count,
        "error_count": error_count,
        "error_rate": error_rate,
        "cooldown_remaining_secs": cooldowns.cooldown_remaining(&account.id).as_secs(),
        "token_expired": credential.as_ref().map(|c| c.is_expired(now)),
        "token_expiring_soon": credential.as_ref().map(|c| c.expires_within(window, now)),
        "token_expires_at": credential.as_ref().map(|c| c.expires_at),
        "auth_method": credential.as_ref().map(|c| c.auth_method),
        "has_refresh_token": credential.as_ref().is_some_and(|c| !c.refresh_token.expose().is_empty()),
        "quota": quota,
        "is_priority": selector.priority_order(&account.id).is_some(),
        "priority_order": selector.priority_order(&account.id),
        "is_active": state.scheduler.is_active(&account.id),
        "last_used": account.last_used(),
    })
}

async fn list_accounts(State(state): State<AdminState>) -> impl IntoResponse {
    let mut accounts = Vec::new();
    for account in state.registry.list() {
        accounts.push(describe_account(&state, &account).await);
    }
    Json(json!({"accounts": accounts}))
}

async fn account_detail(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.registry.get(&id) {
        Some(account) => Ok(Json(describe_account(&state, &account).await)),
        None => Err(error_reply(
            StatusCode::NOT_FOUND,
            format!("account not found: {id}"),
        )),
    }
}

#[derive(Deserialize)]
struct AddAccountRequest {
    id: Option<String>,
    name: String,
    token_path: String,
    #[serde(default = "default_true")]
    enabled: bool,
}

fn default_true() -> bool {
    true
}

async fn add_account(
    State(state): State<AdminState>,
    Json(body): Json<AddAccountRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let id = body
        .id
        .unwrap_or_else(|| format!("acct-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]));
    state
        .registry
        .add_account(&id, &body.name, body.token_path.into(), body.enabled)
        .await
        .map_err(core_error)?;
    info!(account_id = %id, "account added via admin");
    Ok(Json(json!({"ok": true, "id": id, "message": "account added"})))
}

async fn delete_account(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    state.registry.remove_account(&id).await.map_err(core_error)?;
    Ok(ok_message(format!("account removed: {id}")))
}

#[derive(Deserialize)]
struct ToggleRequest {
    enabled: bool,
}

async fn toggle_account(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(body): Json<ToggleRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    state
        .registry
        .set_account_enabled(&id, body.enabled)
        .await
        .map_err(core_error)?;
    Ok(ok_message(format!(
        "account {id} {}",
        if body.enabled { "enabled" } else { "disabled" }
    )))
}

async fn refresh_account_token(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let account = state.registry.get(&id).ok_or_else(|| {
        error_reply(StatusCode::NOT_FOUND, format!("account not found: {id}"))
    })?;
    match account.refresh_token(state.token_client.as_ref()).await {
        Ok(()) => Ok(ok_message("token refreshed")),
        Err(message) => Err(error_reply(StatusCode::BAD_GATEWAY, message)),
    }
}

async fn restore_cooldown(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Json<Value> {
    if state.registry.cooldowns().restore(&id) {
        Json(json!({"ok": true, "message": format!("cooldown cleared for {id}")}))
    } else {
        Json(json!({"ok": true, "message": format!("no active cooldown for {id}")}))
    }
}

async fn refresh_account_quota(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if state.scheduler.refresh_account(&id).await {
        Ok(ok_message("quota refreshed"))
    } else if state.registry.get(&id).is_none() {
        Err(error_reply(
            StatusCode::NOT_FOUND,
            format!("account not found: {id}"),
        ))
    } else {
        Err(error_reply(
            StatusCode::BAD_GATEWAY,
            "quota fetch failed, error snapshot recorded".into(),
        ))
    }
}

#[derive(Deserialize)]
#[serde(default)]
struct RefreshAllRequest {
    skip_disabled: bool,
    skip_error: bool,
}

impl Default for RefreshAllRequest {
    fn default() -> Self {
        Self {
            skip_disabled: true,
            skip_error: true,
        }
    }
}

/// Kick off an async batch refresh; progress is polled separately.
async fn refresh_all_tokens(
    State(state): State<AdminState>,
    Json(options): Json<RefreshAllRequest>,
) -> Json<Value> {
    if state.refresh_manager.is_refreshing() {
        return Json(json!({"ok": false, "message": "refresh in progress"}));
    }

    let manager = state.refresh_manager.clone();
    let accounts = state.registry.list();
    let token_client = state.token_client.clone();
    let fetcher = QuotaFetcher {
        usage_client: state.usage_client.clone(),
        quota_cache: state.registry.quota_cache().clone(),
    };
    tokio::spawn(async move {
        manager
            .refresh_all_with_token(
                accounts,
                token_client,
                Some(fetcher),
                options.skip_disabled,
                options.skip_error,
            )
            .await;
    });

    Json(json!({"ok": true, "message": "refresh started"}))
}

async fn refresh_progress(State(state): State<AdminState>) -> Json<Value> {
    Json(state.refresh_manager.status())
}

async fn refresh_all_quotas(State(state): State<AdminState>) -> Json<Value> {
    let results = state.scheduler.refresh_all().await;
    let success = results.values().filter(|ok| **ok).count();
    Json(json!({
        "ok": true,
        "message": format!("quota refresh complete: {success}/{} succeeded", results.len()),
        "results": results,
    }))
}

async fn quota_summary(State(state): State<AdminState>) -> Json<Value> {
    Json(json!(state.registry.quota_cache().summary()))
}

async fn get_rate_limit_config(State(state): State<AdminState>) -> Json<RateLimitConfig> {
    Json(state.rate_limiter.config())
}

async fn set_rate_limit_config(
    State(state): State<AdminState>,
    Json(config): Json<RateLimitConfig>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    state.rate_limiter.set_config(config).map_err(core_error)?;
    Ok(ok_message("rate limit config updated"))
}

async fn get_refresh_config(State(state): State<AdminState>) -> Json<RefreshConfig> {
    Json(state.refresh_manager.config())
}

async fn set_refresh_config(
    State(state): State<AdminState>,
    Json(config): Json<RefreshConfig>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    state.refresh_manager.set_config(config).map_err(core_error)?;
    Ok(ok_message("refresh config updated"))
}

async fn get_history_config(State(state): State<AdminState>) -> Json<HistoryConfig> {
    Json(state.compressor.config())
}

async fn set_history_config(
    State(state): State<AdminState>,
    Json(config): Json<HistoryConfig>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    state.compressor.set_config(config).map_err(core_error)?;
    Ok(ok_message("history config updated"))
}

async fn get_priority(State(state): State<AdminState>) -> Json<Value> {
    let selector = state.registry.selector();
    Json(json!({
        "strategy": selector.strategy(),
        "priority_accounts": selector.priority_accounts(),
    }))
}

#[derive(Deserialize)]
struct SetPriorityRequest {
    account_ids: Vec<String>,
}

async fn set_priority(
    State(state): State<AdminState>,
    Json(body): Json<SetPriorityRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let message = state
        .registry
        .selector()
        .set_priority_accounts(body.account_ids, &state.registry.valid_account_ids())
        .await
        .map_err(core_error)?;
    Ok(ok_message(message))
}

#[derive(Deserialize)]
struct AddPriorityRequest {
    account_id: String,
    position: Option<usize>,
}

async fn add_priority(
    State(state): State<AdminState>,
    Json(body): Json<AddPriorityRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let message = state
        .registry
        .selector()
        .add_priority_account(
            &body.account_id,
            body.position,
            &state.registry.valid_account_ids(),
        )
        .await
        .map_err(core_error)?;
    Ok(ok_message(message))
}

async fn remove_priority(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let message = state
        .registry
        .selector()
        .remove_priority_account(&id)
        .await
        .map_err(core_error)?;
    Ok(ok_message(message))
}

#[derive(Deserialize)]
struct ReorderRequest {
    account_ids: Vec<String>,
}

async fn reorder_priority(
    State(state): State<AdminState>,
    Json(body): Json<ReorderRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let message = state
        .registry
        .selector()
        .reorder_priority(body.account_ids)
        .await
        .map_err(core_error)?;
    Ok(ok_message(message))
}

#[derive(Deserialize)]
struct SetStrategyRequest {
    strategy: SelectionStrategy,
}

async fn set_strategy(
    State(state): State<AdminState>,
    Json(body): Json<SetStrategyRequest>,
) -> Json<Value> {
    state.registry.selector().set_strategy(body.strategy).await;
    Json(json!({"ok": true, "message": "strategy updated"}))
}

async fn status(State(state): State<AdminState>) -> Json<Value> {
    let cooldowns = state.registry.cooldowns();
    let quota_cache = state.registry.quota_cache();
    let accounts = state.registry.list();
    let available = accounts
        .iter()
        .filter(|a| a.is_available(cooldowns, quota_cache))
        .count();
    Json(json!({
        "accounts_total": accounts.len(),
        "accounts_available": available,
        "quota_summary": quota_cache.summary(),
        "scheduler": state.scheduler.status(),
        "refresh": state.refresh_manager.status(),
        "selector": {
            "strategy": state.registry.selector().strategy(),
            "priority_accounts": state.registry.selector().priority_accounts(),
        },
    }))
}
