//! Token refresh management
//!
//! Covers the whole token-freshness lifecycle: the expiry predicate, single
//! refreshes, retry with exponential backoff (longer waits for throttles),
//! batch refresh behind a global try-acquire lock with observable progress,
//! a singleton auto-refresh timer, and the 401 refresh-and-replay wrapper.
//!
//! The global refresh lock is a binary semaphore distinct from the state
//! mutex: it serializes batch passes only, single-account refreshes bypass
//! it. Release happens through a drop guard so every exit path frees it,
//! including a panicking per-account task.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use codeassist_auth::now_millis;
use provider::{TokenClient, UsageClient};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::account::{Account, AccountStatus};
use crate::error::{Error, Result};
use crate::quota_cache::{QuotaCache, QuotaSnapshot, now_epoch_secs};
use crate::registry::AccountRegistry;

/// Refresh behavior knobs, settable through the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Retries per account on top of the first attempt
    pub max_retries: u32,
    /// Base backoff delay in seconds; actual waits grow exponentially
    pub retry_base_delay: f64,
    /// Concurrent account refreshes in a batch pass
    pub concurrency: usize,
    /// Refresh tokens expiring within this many seconds
    pub token_refresh_before_expiry: u64,
    /// Auto-refresh timer interval in seconds
    pub auto_refresh_interval: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: 1.0,
            concurrency: 3,
            token_refresh_before_expiry: 300,
            auto_refresh_interval: 60,
        }
    }
}

impl RefreshConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retry_base_delay <= 0.0 {
            return Err(Error::ConfigInvalid(
                "retry_base_delay must be greater than 0".into(),
            ));
        }
        if self.concurrency < 1 {
            return Err(Error::ConfigInvalid("concurrency must be at least 1".into()));
        }
        if self.auto_refresh_interval < 1 {
            return Err(Error::ConfigInvalid(
                "auto_refresh_interval must be at least 1 second".into(),
            ));
        }
        Ok(())
    }
}

/// Batch refresh state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshStatus {
    Running,
    Completed,
    Error,
}

/// Progress of a batch refresh, readable while the pass runs.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshProgress {
    pub total: usize,
    pub completed: usize,
    pub success: usize,
    pub failed: usize,
    pub current_account: Option<String>,
    pub status: RefreshStatus,
    /// Unix seconds when the pass started
    pub started_at: u64,
    pub message: Option<String>,
}

impl RefreshProgress {
    fn new(total: usize, message: String) -> Self {
        Self {
            total,
            completed: 0,
            success: 0,
            failed: 0,
            current_account: None,
            status: RefreshStatus::Running,
            started_at: now_epoch_secs(),
            message: Some(message),
        }
    }

    fn error(message: &str) -> Self {
        Self {
            total: 0,
            completed: 0,
            success: 0,
            failed: 0,
            current_account: None,
            status: RefreshStatus::Error,
            started_at: now_epoch_secs(),
            message: Some(message.to_string()),
        }
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.completed as f64 / self.total as f64 * 10000.0).round() / 100.0
    }

    pub fn elapsed_seconds(&self) -> u64 {
        now_epoch_secs().saturating_sub(self.started_at)
    }

    pub fn is_running(&self) -> bool {
        self.status == RefreshStatus::Running
    }
}

/// Writes usage snapshots into the quota cache during batch refreshes.
#[derive(Clone)]
pub struct QuotaFetcher {
    pub usage_client: Arc<dyn UsageClient>,
    pub quota_cache: Arc<QuotaCache>,
}

impl QuotaFetcher {
    /// Fetch usage for `account` and record the result (error snapshot on
    /// failure).
    pub async fn fetch_into_cache(&self, account: &Arc<Account>) -> std::result::Result<(), String> {
        let Some(credential) = account.credential().await else {
            let message = "credentials unavailable".to_string();
            self.quota_cache
                .set(&account.id, QuotaSnapshot::from_error(&account.id, &message));
            return Err(message);
        };
        let machine_id = account.machine_id().await;
        match self.usage_client.fetch_usage(&credential, &machine_id).await {
            Ok(usage) => {
                self.quota_cache
                    .set(&account.id, QuotaSnapshot::from_usage(&account.id, &usage));
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                self.quota_cache
                    .set(&account.id, QuotaSnapshot::from_error(&account.id, &message));
                Err(format!("usage fetch failed: {message}"))
            }
        }
    }
}

struct ManagerState {
    config: RefreshConfig,
    progress: Option<RefreshProgress>,
    last_refresh_time: Option<u64>,
}

/// Token refresh manager.
pub struct RefreshManager {
    state: Mutex<ManagerState>,
    refresh_sem: Arc<Semaphore>,
    held_permit: Mutex<Option<OwnedSemaphorePermit>>,
    auto_task: tokio::sync::Mutex<Option<(CancellationToken, tokio::task::JoinHandle<()>)>>,
}

/// Frees the refresh lock on every exit path, including unwinds.
struct ReleaseOnDrop<'a>(&'a RefreshManager);

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        self.0.release_refresh_lock();
    }
}

impl RefreshManager {
    pub fn new(config: RefreshConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            state: Mutex::new(ManagerState {
                config,
                progress: None,
                last_refresh_time: None,
            }),
            refresh_sem: Arc::new(Semaphore::new(1)),
            held_permit: Mutex::new(None),
            auto_task: tokio::sync::Mutex::new(None),
        })
    }

    pub fn config(&self) -> RefreshConfig {
        crate::lock(&self.state).config.clone()
    }

    pub fn set_config(&self, config: RefreshConfig) -> Result<()> {
        config.validate()?;
        crate::lock(&self.state).config = config;
        Ok(())
    }

    /// True while a batch pass holds the refresh lock.
    pub fn is_refreshing(&self) -> bool {
        self.refresh_sem.available_permits() == 0
    }

    pub fn progress(&self) -> Option<RefreshProgress> {
        crate::lock(&self.state).progress.clone()
    }

    /// Unix seconds when the last batch pass finished.
    pub fn last_refresh_time(&self) -> Option<u64> {
        crate::lock(&self.state).last_refresh_time
    }

    /// Try to take the global refresh lock without waiting.
    pub fn try_acquire_refresh_lock(&self) -> bool {
        match self.refresh_sem.clone().try_acquire_owned() {
            Ok(permit) => {
                *crate::lock(&self.held_permit) = Some(permit);
                true
            }
            Err(_) => false,
        }
    }

    /// Release the refresh lock. Idempotent.
    pub fn release_refresh_lock(&self) {
        crate::lock(&self.held_permit).take();
    }

    /// Whether the account's token is missing, expired, or expiring within
    /// the configured window.
    pub async fn should_refresh(&self, account: &Account) -> bool {
        let window = Duration::from_secs(self.config().token_refresh_before_expiry);
        match account.credential().await {
            None => true,
            Some(credential) => {
                let now = now_millis();
                credential.is_expired(now) || credential.expires_within(window, now)
            }
        }
    }

    /// Refresh the account's token when the freshness predicate says so.
    /// The error string comes back verbatim for classification.
    pub async fn refresh_token_if_needed(
        &self,
        account: &Arc<Account>,
        token_client: &dyn TokenClient,
    ) -> std::result::Result<(), String> {
        if !self.should_refresh(account).await {
            return Ok(());
        }
        debug!(account_id = %account.id, "token expiring, refreshing");
        account.refresh_token(token_client).await
    }

    /// Ensure a fresh token, then fetch quota when a fetcher is given.
    pub async fn refresh_account_with_token(
        &self,
        account: &Arc<Account>,
        token_client: &dyn TokenClient,
        quota_fetcher: Option<&QuotaFetcher>,
    ) -> std::result::Result<(), String> {
        self.refresh_token_if_needed(account, token_client).await?;
        if let Some(fetcher) = quota_fetcher {
            fetcher.fetch_into_cache(account).await?;
        }
        Ok(())
    }

    /// Run `op` with exponential backoff: `base × 2^attempt` waits, tripled
    /// for rate-limit failures. `op` is called exactly `max_retries + 1`
    /// times in the worst case; the last error is returned.
    pub async fn retry_with_backoff<T, F, Fut>(
        &self,
        mut op: F,
        max_retries: Option<u32>,
    ) -> std::result::Result<T, String>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, String>>,
    {
        let (retries, base_delay) = {
            let state = crate::lock(&self.state);
            (
                max_retries.unwrap_or(state.config.max_retries),
                state.config.retry_base_delay,
            )
        };

        let mut last_error = String::new();
        for attempt in 0..=retries {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let delay = if is_rate_limit_error(&e) {
                        rate_limit_backoff_delay(base_delay, attempt)
                    } else {
                        backoff_delay(base_delay, attempt)
                    };
                    last_error = e;
                    if attempt < retries {
                        debug!(
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %last_error,
                            "attempt failed, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        Err(last_error)
    }

    /// Batch refresh: ensure each account's token, then fetch its quota.
    ///
    /// Guarded by the global refresh lock: a second caller gets the
    /// current progress back with no work started. Per-account failures
    /// accumulate into `failed` and never abort the pass; a panicking
    /// task flips the final status to error.
    pub async fn refresh_all_with_token(
        self: &Arc<Self>,
        accounts: Vec<Arc<Account>>,
        token_client: Arc<dyn TokenClient>,
        quota_fetcher: Option<QuotaFetcher>,
        skip_disabled: bool,
        skip_error: bool,
    ) -> RefreshProgress {
        if !self.try_acquire_refresh_lock() {
            if let Some(progress) = self.progress() {
                return progress;
            }
            return RefreshProgress::error("refresh in progress");
        }
        let _release = ReleaseOnDrop(self);

        let to_refresh: Vec<Arc<Account>> = accounts
            .into_iter()
            .filter(|account| {
                if skip_disabled && !account.enabled() {
                    return false;
                }
                if skip_error
                    && matches!(
                        account.status(),
                        AccountStatus::Unhealthy | AccountStatus::Suspended
                    )
                {
                    return false;
                }
                true
            })
            .collect();

        let total = to_refresh.len();
        self.start_progress(total, format!("refreshing {total} accounts"));
        if total == 0 {
            self.finish_progress(RefreshStatus::Completed, Some("no accounts to refresh".into()));
            return self.progress().unwrap_or_else(|| RefreshProgress::error("no progress"));
        }

        let concurrency = self.config().concurrency;
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut join_set = JoinSet::new();

        for account in to_refresh {
            let semaphore = semaphore.clone();
            let manager = self.clone();
            let token_client = token_client.clone();
            let quota_fetcher = quota_fetcher.clone();
            join_set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                manager.set_current_account(&account.id, &account.name);

                let result = manager
                    .retry_with_backoff(
                        || {
                            let manager = manager.clone();
                            let account = account.clone();
                            let token_client = token_client.clone();
                            let quota_fetcher = quota_fetcher.clone();
                            async move {
                                manager
                                    .refresh_account_with_token(
                                        &account,
                                        token_client.as_ref(),
                                        quota_fetcher.as_ref(),
                                    )
                                    .await
                            }
                        },
                        None,
                    )
                    .await;

                match result {
                    Ok(()) => manager.bump_progress(true),
                    Err(e) => {
                        warn!(account_id = %account.id, error = %e, "account refresh failed");
                        manager.bump_progress(false);
                    }
                }
            });
        }

        let mut catastrophic = false;
        while let Some(joined) = join_set.join_next().await {
            if joined.is_err() {
                catastrophic = true;
            }
        }

        if catastrophic {
            self.finish_progress(RefreshStatus::Error, Some("refresh task failed".into()));
        } else {
            self.finish_progress(RefreshStatus::Completed, None);
        }
        self.progress()
            .unwrap_or_else(|| RefreshProgress::error("no progress"))
    }

    /// Run `op`; on a 401-classified failure refresh the token once and
    /// replay `op` exactly once. A failed refresh propagates the original
    /// failure.
    pub async fn execute_with_auth_retry<T, F, Fut>(
        &self,
        account: &Arc<Account>,
        token_client: &dyn TokenClient,
        mut op: F,
    ) -> std::result::Result<T, String>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, String>>,
    {
        match op().await {
            Ok(value) => Ok(value),
            Err(original) if is_auth_error(&original) => {
                info!(account_id = %account.id, "auth failure, refreshing token and replaying");
                match account.refresh_token(token_client).await {
                    Ok(()) => op().await,
                    Err(refresh_error) => {
                        warn!(account_id = %account.id, error = %refresh_error, "token refresh after 401 failed");
                        Err(original)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Start the auto-refresh timer, replacing any existing one. The loop
    /// walks enabled, healthy accounts serially; one account's failure
    /// never affects the others.
    pub async fn start_auto_refresh(
        self: &Arc<Self>,
        registry: Arc<AccountRegistry>,
        token_client: Arc<dyn TokenClient>,
    ) {
        self.stop_auto_refresh().await;

        let interval = Duration::from_secs(self.config().auto_refresh_interval);
        let cancel = CancellationToken::new();
        let manager = self.clone();
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        manager.auto_refresh_pass(&registry, token_client.as_ref()).await;
                    }
                }
            }
        });
        *self.auto_task.lock().await = Some((cancel, handle));
        info!(interval_secs = interval.as_secs(), "auto token refresh started");
    }

    /// Cancel the auto-refresh timer and wait for it to exit.
    pub async fn stop_auto_refresh(&self) {
        if let Some((cancel, handle)) = self.auto_task.lock().await.take() {
            cancel.cancel();
            let _ = handle.await;
            info!("auto token refresh stopped");
        }
    }

    pub async fn is_auto_refresh_running(&self) -> bool {
        self.auto_task
            .lock()
            .await
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    async fn auto_refresh_pass(&self, registry: &AccountRegistry, token_client: &dyn TokenClient) {
        for account in registry.list() {
            if !account.enabled() {
                continue;
            }
            if matches!(
                account.status(),
                AccountStatus::Unhealthy | AccountStatus::Suspended | AccountStatus::Disabled
            ) {
                continue;
            }
            if !self.should_refresh(&account).await {
                continue;
            }
            if let Err(e) = self.refresh_token_if_needed(&account, token_client).await {
                warn!(account_id = %account.id, error = %e, "auto refresh failed");
            }
        }
    }

    /// Status payload for the admin surface.
    pub fn status(&self) -> serde_json::Value {
        let state = crate::lock(&self.state);
        serde_json::json!({
            "is_refreshing": self.refresh_sem.available_permits() == 0,
            "progress": state.progress,
            "last_refresh_time": state.last_refresh_time,
            "config": state.config,
        })
    }

    fn start_progress(&self, total: usize, message: String) {
        crate::lock(&self.state).progress = Some(RefreshProgress::new(total, message));
    }

    fn set_current_account(&self, account_id: &str, name: &str) {
        let mut state = crate::lock(&self.state);
        if let Some(progress) = state.progress.as_mut() {
            progress.current_account = Some(account_id.to_string());
            progress.message = Some(format!("refreshing: {name}"));
        }
    }

    fn bump_progress(&self, success: bool) {
        let mut state = crate::lock(&self.state);
        if let Some(progress) = state.progress.as_mut() {
            if success {
                progress.success += 1;
            } else {
                progress.failed += 1;
            }
            progress.completed += 1;
        }
    }

    fn finish_progress(&self, status: RefreshStatus, message: Option<String>) {
        let mut state = crate::lock(&self.state);
        state.last_refresh_time = Some(now_epoch_secs());
        if let Some(progress) = state.progress.as_mut() {
            progress.status = status;
            progress.current_account = None;
            progress.message = message.or_else(|| {
                Some(format!(
                    "refresh complete: {} succeeded, {} failed",
                    progress.success, progress.failed
                ))
            });
        }
    }
}

/// Wait before retry `attempt` (0-based): `base × 2^attempt`.
pub fn backoff_delay(base_delay: f64, attempt: u32) -> Duration {
    Duration::from_secs_f64(base_delay * f64::powi(2.0, attempt as i32))
}

/// Rate-limited waits are three times the normal backoff.
pub fn rate_limit_backoff_delay(base_delay: f64, attempt: u32) -> Duration {
    Duration::from_secs_f64(base_delay * 3.0 * f64::powi(2.0, attempt as i32))
}

/// Throttle detection over error strings.
pub fn is_rate_limit_error(error: &str) -> bool {
    error.contains("429")
        || error.to_lowercase().contains("rate limit")
        || error.contains("请求过于频繁")
}

/// Auth-failure detection over error strings.
pub fn is_auth_error(error: &str) -> bool {
    if error.contains("401") {
        return true;
    }
    let lower = error.to_lowercase();
    lower.contains("unauthorized")
        || lower.contains("credential expired")
        || lower.contains("credentials expired")
}
