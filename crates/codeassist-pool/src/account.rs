//! Account state
//!
//! An account is a named handle to one credential file plus local counters
//! and health status. Counters are atomics so the hot dispatch path never
//! takes a lock for bookkeeping; the credential cache sits behind an async
//! RwLock because (re)loading it touches the filesystem.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use codeassist_auth::{Credential, derive_machine_id, now_millis};
use provider::TokenClient;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cooldown::CooldownTracker;
use crate::quota_cache::QuotaCache;
use crate::rate_limit::RateLimiter;

/// Health status of an account's credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    #[default]
    Active,
    Cooldown,
    Unhealthy,
    Disabled,
    Suspended,
}

/// One pool account.
pub struct Account {
    pub id: String,
    pub name: String,
    pub token_path: PathBuf,
    enabled: AtomicBool,
    status: Mutex<AccountStatus>,
    request_count: AtomicU64,
    error_count: AtomicU64,
    /// Unix millis of the last completed dispatch; 0 = never used
    last_used: AtomicU64,
    credential: tokio::sync::RwLock<Option<Credential>>,
    machine_id: OnceLock<String>,
}

impl Account {
    pub fn new(id: impl Into<String>, name: impl Into<String>, token_path: PathBuf, enabled: bool) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            token_path,
            enabled: AtomicBool::new(enabled),
            status: Mutex::new(AccountStatus::Active),
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            last_used: AtomicU64::new(0),
            credential: tokio::sync::RwLock::new(None),
            machine_id: OnceLock::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn status(&self) -> AccountStatus {
        *crate::lock(&self.status)
    }

    pub fn set_status(&self, status: AccountStatus) {
        *crate::lock(&self.status) = status;
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn record_request(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Unix millis of the last completed dispatch, if any.
    pub fn last_used(&self) -> Option<u64> {
        match self.last_used.load(Ordering::Relaxed) {
            0 => None,
            millis => Some(millis),
        }
    }

    pub fn touch(&self) {
        self.last_used.store(now_millis(), Ordering::Relaxed);
    }

    /// The cached credential, loading it from the token file on first use.
    pub async fn credential(&self) -> Option<Credential> {
        if let Some(credential) = self.credential.read().await.as_ref() {
            return Some(credential.clone());
        }
        self.reload_credential().await
    }

    /// Force a (re)load from the token file.
    pub async fn reload_credential(&self) -> Option<Credential> {
        let mut slot = self.credential.write().await;
        match Credential::load(&self.token_path).await {
            Ok(credential) => {
                *slot = Some(credential.clone());
                Some(credential)
            }
            Err(e) => {
                warn!(account_id = %self.id, error = %e, "failed to load credentials");
                None
            }
        }
    }

    /// Machine id derived from the credential identity; stable for the
    /// lifetime of this account instance.
    pub async fn machine_id(&self) -> String {
        if let Some(id) = self.machine_id.get() {
            return id.clone();
        }
        let credential = self.credential().await;
        let derived = match &credential {
            Some(c) => derive_machine_id(c.profile_arn.as_deref(), c.client_id.as_deref()),
            None => derive_machine_id(None, None),
        };
        self.machine_id.get_or_init(|| derived).clone()
    }

    /// Availability for selection: enabled, healthy status, not cooling
    /// down, and quota not exhausted.
    pub fn is_available(&self, cooldowns: &CooldownTracker, quota_cache: &QuotaCache) -> bool {
        if !self.enabled() {
            return false;
        }
        if matches!(
            self.status(),
            AccountStatus::Disabled | AccountStatus::Unhealthy | AccountStatus::Suspended
        ) {
            return false;
        }
        if !cooldowns.is_available(&self.id) {
            return false;
        }
        if let Some(snapshot) = quota_cache.get(&self.id) {
            if snapshot.is_exhausted {
                return false;
            }
        }
        true
    }

    /// Refresh the access token through the auth endpoint and persist the
    /// result. On success the account becomes active; on failure it is
    /// marked unhealthy and the error string is returned verbatim for
    /// classification.
    pub async fn refresh_token(&self, token_client: &dyn TokenClient) -> Result<(), String> {
        let Some(mut credential) = self.credential().await else {
            self.set_status(AccountStatus::Unhealthy);
            return Err("unable to load credentials".to_string());
        };

        match token_client.refresh(&credential).await {
            Ok(refreshed) => {
                credential.access_token = refreshed.access_token.into();
                if let Some(refresh_token) = refreshed.refresh_token {
                    credential.refresh_token = refresh_token.into();
                }
                credential.expires_at = refreshed.expires_at;

                if let Err(e) = credential.save(&self.token_path).await {
                    warn!(account_id = %self.id, error = %e, "failed to persist refreshed token");
                }
                *self.credential.write().await = Some(credential);
                self.set_status(AccountStatus::Active);
                info!(account_id = %self.id, "token refreshed");
                Ok(())
            }
            Err(e) => {
                self.set_status(AccountStatus::Unhealthy);
                Err(e.to_string())
            }
        }
    }

    /// Record an upstream throttle. Cools the account down only when rate
    /// limiting is enabled; the error counter bumps either way.
    pub fn mark_quota_exceeded(
        &self,
        reason: &str,
        rate_limiter: &RateLimiter,
        cooldowns: &CooldownTracker,
    ) {
        if rate_limiter.should_apply_quota_cooldown() {
            cooldowns.mark_exceeded(&self.id, reason, rate_limiter.quota_cooldown());
            self.set_status(AccountStatus::Cooldown);
        }
        self.record_error();
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("enabled", &self.enabled())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::RateLimitConfig;
    use std::path::PathBuf;

    fn test_account(id: &str) -> Account {
        Account::new(id, format!("Account {id}"), PathBuf::from("/nonexistent/token.json"), true)
    }

    fn deps() -> (CooldownTracker, QuotaCache) {
        (
            CooldownTracker::new(),
            QuotaCache::new(PathBuf::from("/nonexistent/cache.json")),
        )
    }

    #[test]
    fn fresh_account_is_available() {
        let (cooldowns, cache) = deps();
        let account = test_account("a");
        assert!(account.is_available(&cooldowns, &cache));
    }

    #[test]
    fn disabled_or_bad_status_is_unavailable() {
        let (cooldowns, cache) = deps();
        let account = test_account("a");

        account.set_enabled(false);
        assert!(!account.is_available(&cooldowns, &cache));
        account.set_enabled(true);

        for status in [
            AccountStatus::Disabled,
            AccountStatus::Unhealthy,
            AccountStatus::Suspended,
        ] {
            account.set_status(status);
            assert!(!account.is_available(&cooldowns, &cache), "{status:?}");
        }

        // Cooldown status alone does not exclude; the tracker does
        account.set_status(AccountStatus::Cooldown);
        assert!(account.is_available(&cooldowns, &cache));
    }

    #[test]
    fn cooldown_record_excludes() {
        let (cooldowns, cache) = deps();
        let account = test_account("a");
        cooldowns.mark_exceeded("a", "throttled", std::time::Duration::from_secs(60));
        assert!(!account.is_available(&cooldowns, &cache));
    }

    #[test]
    fn exhausted_quota_excludes() {
        use provider::UsageInfo;

        let (cooldowns, cache) = deps();
        let account = test_account("a");
        let usage = UsageInfo {
            usage_limit: 100.0,
            current_usage: 100.0,
            ..Default::default()
        };
        cache.set("a", crate::quota_cache::QuotaSnapshot::from_usage("a", &usage));
        assert!(!account.is_available(&cooldowns, &cache));
    }

    #[test]
    fn error_snapshot_does_not_exclude() {
        let (cooldowns, cache) = deps();
        let account = test_account("a");
        cache.set("a", crate::quota_cache::QuotaSnapshot::from_error("a", "fetch failed"));
        assert!(account.is_available(&cooldowns, &cache));
    }

    #[test]
    fn quota_exceeded_without_limiter_only_bumps_errors() {
        let (cooldowns, _cache) = deps();
        let limiter = RateLimiter::new(RateLimitConfig::default());
        let account = test_account("a");

        account.mark_quota_exceeded("Rate limited", &limiter, &cooldowns);

        assert_eq!(account.error_count(), 1);
        assert!(cooldowns.is_available("a"), "no cooldown when limiter disabled");
        assert_eq!(account.status(), AccountStatus::Active);
    }

    #[test]
    fn quota_exceeded_with_limiter_cools_down() {
        let (cooldowns, _cache) = deps();
        let mut config = RateLimitConfig::default();
        config.enabled = true;
        let limiter = RateLimiter::new(config);
        let account = test_account("a");

        account.mark_quota_exceeded("Rate limited", &limiter, &cooldowns);

        assert_eq!(account.error_count(), 1);
        assert!(!cooldowns.is_available("a"));
        assert_eq!(account.status(), AccountStatus::Cooldown);
    }

    #[test]
    fn counters_and_touch() {
        let account = test_account("a");
        assert!(account.last_used().is_none());

        account.record_request();
        account.record_request();
        account.record_error();
        account.touch();

        assert_eq!(account.request_count(), 2);
        assert_eq!(account.error_count(), 1);
        assert!(account.last_used().is_some());
    }

    #[tokio::test]
    async fn credential_loads_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        let credential = Credential {
            access_token: "at".into(),
            refresh_token: "rt".into(),
            expires_at: u64::MAX,
            client_id: None,
            client_secret: None,
            region: String::new(),
            auth_method: codeassist_auth::AuthMethod::Social,
            profile_arn: Some("arn:test".into()),
            client_id_hash: None,
        };
        credential.save(&path).await.unwrap();

        let account = Account::new("a", "A", path.clone(), true);
        assert_eq!(account.credential().await.unwrap().access_token.expose(), "at");

        // Cached: deleting the file does not lose the credential
        tokio::fs::remove_file(&path).await.unwrap();
        assert!(account.credential().await.is_some());
    }

    #[tokio::test]
    async fn missing_token_file_yields_none() {
        let account = test_account("a");
        assert!(account.credential().await.is_none());
    }

    #[tokio::test]
    async fn machine_id_is_stable_per_account() {
        let account = test_account("a");
        let first = account.machine_id().await;
        let second = account.machine_id().await;
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }
}
