//! Background quota refresh
//!
//! On startup every account's usage is fetched concurrently, disabled
//! accounts included, so an account whose quota refilled can be re-enabled.
//! After that, a periodic tick refreshes only accounts that were actually
//! used in the last minute; everyone else keeps their cached snapshot until
//! they become active again.
//!
//! Accounts the scheduler disables for exhaustion are tracked by origin, so
//! only those are auto re-enabled when balance returns. Admin-disabled
//! accounts stay put.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use provider::UsageClient;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::quota_cache::{QuotaCache, QuotaSnapshot, now_epoch_secs};
use crate::registry::AccountRegistry;
use crate::account::Account;

/// Default refresh interval.
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(60);

/// An account is active when it was used within this window.
pub const ACTIVE_WINDOW: Duration = Duration::from_secs(60);

/// Periodic quota refresher for active accounts.
pub struct QuotaScheduler {
    quota_cache: Arc<QuotaCache>,
    usage_client: Arc<dyn UsageClient>,
    registry: Arc<AccountRegistry>,
    update_interval: Duration,
    cache_max_age: Duration,
    active: Mutex<HashMap<String, Instant>>,
    /// Accounts this scheduler disabled for exhaustion (origin tracking)
    auto_disabled: Mutex<HashSet<String>>,
    last_full_refresh: Mutex<Option<u64>>,
    cancel: CancellationToken,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl QuotaScheduler {
    pub fn new(
        quota_cache: Arc<QuotaCache>,
        usage_client: Arc<dyn UsageClient>,
        registry: Arc<AccountRegistry>,
        update_interval: Duration,
        cache_max_age: Duration,
    ) -> Self {
        Self {
            quota_cache,
            usage_client,
            registry,
            update_interval,
            cache_max_age,
            active: Mutex::new(HashMap::new()),
            auto_disabled: Mutex::new(HashSet::new()),
            last_full_refresh: Mutex::new(None),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Age beyond which a cached snapshot counts as stale.
    pub fn cache_max_age_secs(&self) -> u64 {
        self.cache_max_age.as_secs()
    }

    /// Whether the cached snapshot for an account is missing or stale.
    pub fn is_snapshot_stale(&self, account_id: &str) -> bool {
        self.quota_cache
            .is_stale(account_id, self.cache_max_age.as_secs())
    }

    /// Run the startup refresh, then spawn the periodic loop.
    pub async fn start(self: &Arc<Self>) {
        if crate::lock(&self.task).is_some() {
            return;
        }
        info!(interval_secs = self.update_interval.as_secs(), "starting quota scheduler");
        self.refresh_all().await;

        let scheduler = self.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.update_interval);
            ticker.tick().await; // immediate first tick; startup refresh just ran
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = async {
                        ticker.tick().await;
                        scheduler.refresh_active_pass().await;
                    } => {}
                }
            }
        });
        *crate::lock(&self.task) = Some(handle);
    }

    /// Cancel the loop and any in-flight fetches, then wait for it to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = crate::lock(&self.task).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("quota scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        crate::lock(&self.task)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Refresh every account's quota concurrently. Disabled accounts are
    /// included to detect re-eligibility. Returns per-account success.
    pub async fn refresh_all(&self) -> HashMap<String, bool> {
        let accounts = self.registry.list();
        if accounts.is_empty() {
            return HashMap::new();
        }
        info!(accounts = accounts.len(), "refreshing all account quotas");

        let mut join_set = JoinSet::new();
        for account in accounts {
            let quota_cache = self.quota_cache.clone();
            let usage_client = self.usage_client.clone();
            join_set.spawn(async move {
                let ok = refresh_one(&quota_cache, usage_client.as_ref(), &account).await;
                (account, ok)
            });
        }

        let mut results = HashMap::new();
        let mut success = 0usize;
        while let Some(joined) = join_set.join_next().await {
            if let Ok((account, ok)) = joined {
                self.apply_auto_toggle(&account);
                if ok {
                    success += 1;
                }
                results.insert(account.id.clone(), ok);
            }
        }

        *crate::lock(&self.last_full_refresh) = Some(now_epoch_secs());
        self.quota_cache.save_to_file().await;
        self.registry.save().await;

        info!(
            success,
            failed = results.len() - success,
            "quota refresh pass complete"
        );
        results
    }

    /// Refresh one account's quota and persist on success.
    pub async fn refresh_account(&self, account_id: &str) -> bool {
        let Some(account) = self.registry.get(account_id) else {
            warn!(account_id, "quota refresh requested for unknown account");
            return false;
        };
        let ok = refresh_one(&self.quota_cache, self.usage_client.as_ref(), &account).await;
        self.apply_auto_toggle(&account);
        if ok {
            self.quota_cache.save_to_file().await;
            self.registry.save().await;
        }
        ok
    }

    /// Disable exhausted accounts; re-enable scheduler-disabled accounts
    /// whose balance came back.
    fn apply_auto_toggle(&self, account: &Arc<Account>) {
        let Some(snapshot) = self.quota_cache.get(&account.id) else {
            return;
        };
        if snapshot.has_error() {
            return;
        }
        if snapshot.is_exhausted {
            if account.enabled() {
                account.set_enabled(false);
                crate::lock(&self.auto_disabled).insert(account.id.clone());
                warn!(account_id = %account.id, "quota exhausted, account auto-disabled");
            }
        } else if snapshot.balance > 0.0 && !account.enabled() {
            let was_auto = crate::lock(&self.auto_disabled).remove(&account.id);
            if was_auto {
                account.set_enabled(true);
                info!(account_id = %account.id, "quota available again, account re-enabled");
            }
        }
    }

    /// Record a dispatch on an account, keeping it in the active window.
    pub fn mark_active(&self, account_id: &str) {
        crate::lock(&self.active).insert(account_id.to_string(), Instant::now());
    }

    /// Whether the account was used within the active window.
    pub fn is_active(&self, account_id: &str) -> bool {
        crate::lock(&self.active)
            .get(account_id)
            .is_some_and(|last| last.elapsed() < ACTIVE_WINDOW)
    }

    /// Ids currently inside the active window.
    pub fn active_accounts(&self) -> HashSet<String> {
        crate::lock(&self.active)
            .iter()
            .filter(|(_, last)| last.elapsed() < ACTIVE_WINDOW)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Drop activity entries older than twice the window.
    pub fn cleanup_inactive(&self) {
        crate::lock(&self.active).retain(|_, last| last.elapsed() < ACTIVE_WINDOW * 2);
    }

    /// One periodic pass: refresh active accounts, save once, prune.
    async fn refresh_active_pass(&self) {
        let active_ids = self.active_accounts();
        if !active_ids.is_empty() {
            let accounts: Vec<Arc<Account>> = self
                .registry
                .list()
                .into_iter()
                .filter(|a| active_ids.contains(&a.id))
                .collect();
            info!(accounts = accounts.len(), "refreshing active account quotas");

            let mut join_set = JoinSet::new();
            for account in accounts {
                let quota_cache = self.quota_cache.clone();
                let usage_client = self.usage_client.clone();
                join_set.spawn(async move {
                    refresh_one(&quota_cache, usage_client.as_ref(), &account).await;
                    account
                });
            }
            while let Some(joined) = join_set.join_next().await {
                if let Ok(account) = joined {
                    self.apply_auto_toggle(&account);
                }
            }
            self.quota_cache.save_to_file().await;
        }
        self.cleanup_inactive();
    }

    /// Unix seconds of the last full refresh pass.
    pub fn last_full_refresh(&self) -> Option<u64> {
        *crate::lock(&self.last_full_refresh)
    }

    /// Status payload for the admin surface.
    pub fn status(&self) -> serde_json::Value {
        let active: Vec<String> = self.active_accounts().into_iter().collect();
        serde_json::json!({
            "running": self.is_running(),
            "update_interval_secs": self.update_interval.as_secs(),
            "cache_max_age_secs": self.cache_max_age.as_secs(),
            "active_accounts": active,
            "active_count": active.len(),
            "last_full_refresh": self.last_full_refresh(),
        })
    }
}

/// Fetch one account's usage and write the snapshot (error snapshot on
/// failure).
async fn refresh_one(
    quota_cache: &QuotaCache,
    usage_client: &dyn UsageClient,
    account: &Arc<Account>,
) -> bool {
    let Some(credential) = account.credential().await else {
        quota_cache.set(
            &account.id,
            QuotaSnapshot::from_error(&account.id, "credentials unavailable"),
        );
        return false;
    };
    let machine_id = account.machine_id().await;

    match usage_client.fetch_usage(&credential, &machine_id).await {
        Ok(usage) => {
            quota_cache.set(&account.id, QuotaSnapshot::from_usage(&account.id, &usage));
            true
        }
        Err(e) => {
            warn!(account_id = %account.id, error = %e, "usage fetch failed");
            quota_cache.set(
                &account.id,
                QuotaSnapshot::from_error(&account.id, e.to_string()),
            );
            false
        }
    }
}
