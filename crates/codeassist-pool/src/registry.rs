//! Account registry and session stickiness
//!
//! Owns the set of accounts and their persisted metadata (`accounts.json`),
//! plus the 60-second session bindings that keep a conversation pinned to
//! one account while it stays available. Acquisition is the single entry
//! point for dispatch: prune cooldowns, honor a fresh binding, otherwise
//! delegate to the selector and rebind.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::account::Account;
use crate::cooldown::CooldownTracker;
use crate::error::{Error, Result};
use crate::quota_cache::QuotaCache;
use crate::selector::AccountSelector;

/// How long a session stays bound to an account after its last use.
pub const SESSION_TTL: Duration = Duration::from_secs(60);

#[derive(Serialize, Deserialize)]
struct RegistryEntry {
    id: String,
    name: String,
    token_path: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

struct SessionBinding {
    account_id: String,
    last_touch: Instant,
}

/// The set of accounts plus session bindings.
pub struct AccountRegistry {
    accounts: RwLock<Vec<Arc<Account>>>,
    sessions: Mutex<HashMap<String, SessionBinding>>,
    path: PathBuf,
    cooldowns: Arc<CooldownTracker>,
    quota_cache: Arc<QuotaCache>,
    selector: Arc<AccountSelector>,
}

impl AccountRegistry {
    /// Load the registry from `accounts.json`, skipping entries whose token
    /// file no longer exists. With no usable entries, a present
    /// `default_token_path` is adopted as account "default".
    pub async fn load(
        path: PathBuf,
        default_token_path: Option<PathBuf>,
        cooldowns: Arc<CooldownTracker>,
        quota_cache: Arc<QuotaCache>,
        selector: Arc<AccountSelector>,
    ) -> Self {
        let mut accounts: Vec<Arc<Account>> = Vec::new();

        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => match serde_json::from_str::<Vec<RegistryEntry>>(&contents) {
                Ok(entries) => {
                    for entry in entries {
                        let token_path = PathBuf::from(&entry.token_path);
                        if !token_path.exists() {
                            warn!(
                                account_id = %entry.id,
                                path = %token_path.display(),
                                "token file missing, skipping account"
                            );
                            continue;
                        }
                        accounts.push(Arc::new(Account::new(
                            entry.id,
                            entry.name,
                            token_path,
                            entry.enabled,
                        )));
                    }
                    info!(accounts = accounts.len(), "loaded account registry");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "registry file unreadable, starting empty")
                }
            },
            Err(_) => {}
        }

        let registry = Self {
            accounts: RwLock::new(accounts),
            sessions: Mutex::new(HashMap::new()),
            path,
            cooldowns,
            quota_cache,
            selector,
        };

        if registry.list().is_empty() {
            if let Some(default_path) = default_token_path {
                if default_path.exists() {
                    info!(path = %default_path.display(), "adopting default token file");
                    registry.push(Arc::new(Account::new(
                        "default",
                        "Default account",
                        default_path,
                        true,
                    )));
                    registry.save().await;
                }
            }
        }

        registry
    }

    fn push(&self, account: Arc<Account>) {
        self.accounts
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(account);
    }

    /// Snapshot of all accounts.
    pub fn list(&self) -> Vec<Arc<Account>> {
        self.accounts
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, account_id: &str) -> Option<Arc<Account>> {
        self.list().into_iter().find(|a| a.id == account_id)
    }

    /// Ids of enabled accounts, for priority-list validation.
    pub fn valid_account_ids(&self) -> HashSet<String> {
        self.list()
            .iter()
            .filter(|a| a.enabled())
            .map(|a| a.id.clone())
            .collect()
    }

    pub fn cooldowns(&self) -> &Arc<CooldownTracker> {
        &self.cooldowns
    }

    pub fn quota_cache(&self) -> &Arc<QuotaCache> {
        &self.quota_cache
    }

    pub fn selector(&self) -> &Arc<AccountSelector> {
        &self.selector
    }

    /// Acquire an account for a request.
    ///
    /// Expired cooldowns are pruned first. A fresh session binding to a
    /// still-available account is touched and reused; otherwise the
    /// selector picks, and the session (when given) is rebound to the
    /// result.
    pub fn get_available_account(&self, session_id: Option<&str>) -> Option<Arc<Account>> {
        self.cooldowns.cleanup_expired();

        if let Some(session_id) = session_id {
            let bound_id = {
                let mut sessions = crate::lock(&self.sessions);
                sessions.retain(|_, binding| binding.last_touch.elapsed() < SESSION_TTL);
                sessions.get(session_id).map(|b| b.account_id.clone())
            };
            if let Some(bound_id) = bound_id {
                if let Some(account) = self.get(&bound_id) {
                    if account.is_available(&self.cooldowns, &self.quota_cache) {
                        crate::lock(&self.sessions).insert(
                            session_id.to_string(),
                            SessionBinding {
                                account_id: bound_id,
                                last_touch: Instant::now(),
                            },
                        );
                        return Some(account);
                    }
                }
            }
        }

        let accounts = self.list();
        let picked = self.selector.select(&accounts, &self.cooldowns)?;

        if let Some(session_id) = session_id {
            crate::lock(&self.sessions).insert(
                session_id.to_string(),
                SessionBinding {
                    account_id: picked.id.clone(),
                    last_touch: Instant::now(),
                },
            );
        }
        Some(picked)
    }

    /// Lowest-traffic available account other than `exclude_id`, for
    /// fail-over.
    pub fn get_next_available_account(&self, exclude_id: &str) -> Option<Arc<Account>> {
        self.list()
            .into_iter()
            .filter(|a| a.id != exclude_id && a.is_available(&self.cooldowns, &self.quota_cache))
            .min_by_key(|a| a.request_count())
    }

    /// Record a completed dispatch on an account.
    pub fn mark_used(&self, account_id: &str) {
        if let Some(account) = self.get(account_id) {
            account.touch();
            account.record_request();
        }
    }

    /// Add an account pointing at an existing token file.
    pub async fn add_account(
        &self,
        id: &str,
        name: &str,
        token_path: PathBuf,
        enabled: bool,
    ) -> Result<Arc<Account>> {
        if self.get(id).is_some() {
            return Err(Error::ConfigInvalid(format!("account {id} already exists")));
        }
        if !token_path.exists() {
            return Err(Error::ConfigInvalid(format!(
                "token file not found: {}",
                token_path.display()
            )));
        }
        let account = Arc::new(Account::new(id, name, token_path, enabled));
        self.push(account.clone());
        self.save().await;
        info!(account_id = id, "account added");
        Ok(account)
    }

    pub async fn remove_account(&self, account_id: &str) -> Result<()> {
        {
            let mut accounts = self
                .accounts
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let before = accounts.len();
            accounts.retain(|a| a.id != account_id);
            if accounts.len() == before {
                return Err(Error::NotFound(account_id.to_string()));
            }
        }
        crate::lock(&self.sessions).retain(|_, binding| binding.account_id != account_id);
        self.quota_cache.remove(account_id);
        self.cooldowns.restore(account_id);
        self.save().await;
        info!(account_id, "account removed");
        Ok(())
    }

    pub async fn set_account_enabled(&self, account_id: &str, enabled: bool) -> Result<()> {
        let account = self
            .get(account_id)
            .ok_or_else(|| Error::NotFound(account_id.to_string()))?;
        account.set_enabled(enabled);
        self.save().await;
        Ok(())
    }

    /// Persist the registry. Failures are logged, not fatal.
    pub async fn save(&self) {
        let entries: Vec<RegistryEntry> = self
            .list()
            .iter()
            .map(|a| RegistryEntry {
                id: a.id.clone(),
                name: a.name.clone(),
                token_path: a.token_path.display().to_string(),
                enabled: a.enabled(),
            })
            .collect();
        let json = match serde_json::to_string_pretty(&entries) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "failed to serialize account registry");
                return;
            }
        };
        if let Err(e) = common::fs::write_atomic(&self.path, json.as_bytes()).await {
            warn!(path = %self.path.display(), error = %e, "failed to persist account registry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota_cache::QuotaSnapshot;
    use provider::UsageInfo;

    async fn write_token(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(format!("{name}.json"));
        tokio::fs::write(
            &path,
            r#"{"accessToken": "at", "refreshToken": "rt", "expiresAt": 99999999999999}"#,
        )
        .await
        .unwrap();
        path
    }

    async fn registry(dir: &tempfile::TempDir) -> AccountRegistry {
        let cooldowns = Arc::new(CooldownTracker::new());
        let cache = Arc::new(QuotaCache::new(dir.path().join("quota_cache.json")));
        let selector = Arc::new(
            AccountSelector::load(cache.clone(), dir.path().join("priority.json")).await,
        );
        AccountRegistry::load(
            dir.path().join("accounts.json"),
            None,
            cooldowns,
            cache,
            selector,
        )
        .await
    }

    #[tokio::test]
    async fn add_list_remove_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir).await;
        let token = write_token(&dir, "a").await;

        reg.add_account("a", "Account A", token, true).await.unwrap();
        assert_eq!(reg.list().len(), 1);
        assert!(reg.get("a").is_some());

        reg.remove_account("a").await.unwrap();
        assert!(reg.get("a").is_none());
        assert!(matches!(
            reg.remove_account("a").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn add_rejects_duplicates_and_missing_token_files() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir).await;
        let token = write_token(&dir, "a").await;

        reg.add_account("a", "A", token.clone(), true).await.unwrap();
        assert!(reg.add_account("a", "A again", token, true).await.is_err());
        assert!(
            reg.add_account("b", "B", dir.path().join("nope.json"), true)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let token = write_token(&dir, "a").await;
        {
            let reg = registry(&dir).await;
            reg.add_account("a", "Account A", token, false).await.unwrap();
        }

        let reloaded = registry(&dir).await;
        let account = reloaded.get("a").unwrap();
        assert_eq!(account.name, "Account A");
        assert!(!account.enabled());
    }

    #[tokio::test]
    async fn reload_skips_accounts_with_missing_token_files() {
        let dir = tempfile::tempdir().unwrap();
        let token = write_token(&dir, "a").await;
        {
            let reg = registry(&dir).await;
            reg.add_account("a", "A", token.clone(), true).await.unwrap();
        }
        tokio::fs::remove_file(&token).await.unwrap();

        let reloaded = registry(&dir).await;
        assert!(reloaded.list().is_empty());
    }

    #[tokio::test]
    async fn adopts_default_token_path_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let default_token = write_token(&dir, "well-known").await;

        let cooldowns = Arc::new(CooldownTracker::new());
        let cache = Arc::new(QuotaCache::new(dir.path().join("quota_cache.json")));
        let selector = Arc::new(
            AccountSelector::load(cache.clone(), dir.path().join("priority.json")).await,
        );
        let reg = AccountRegistry::load(
            dir.path().join("accounts.json"),
            Some(default_token),
            cooldowns,
            cache,
            selector,
        )
        .await;

        assert_eq!(reg.list().len(), 1);
        assert_eq!(reg.list()[0].id, "default");
        // and it was persisted
        assert!(dir.path().join("accounts.json").exists());
    }

    #[tokio::test]
    async fn session_binding_sticks_while_available() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir).await;
        let token_a = write_token(&dir, "a").await;
        let token_b = write_token(&dir, "b").await;
        reg.add_account("a", "A", token_a, true).await.unwrap();
        reg.add_account("b", "B", token_b, true).await.unwrap();
        // make "a" preferred by balance so first pick is deterministic
        reg.quota_cache()
            .set("a", QuotaSnapshot::from_usage("a", &usage(1000.0, 900.0)));
        reg.quota_cache()
            .set("b", QuotaSnapshot::from_usage("b", &usage(1000.0, 100.0)));

        let first = reg.get_available_account(Some("session-1")).unwrap();
        assert_eq!(first.id, "a");

        // Flip the balances; the session still sticks to "a"
        reg.quota_cache()
            .set("a", QuotaSnapshot::from_usage("a", &usage(1000.0, 100.0)));
        reg.quota_cache()
            .set("b", QuotaSnapshot::from_usage("b", &usage(1000.0, 900.0)));
        let second = reg.get_available_account(Some("session-1")).unwrap();
        assert_eq!(second.id, "a");

        // A different session follows the selector
        let other = reg.get_available_account(Some("session-2")).unwrap();
        assert_eq!(other.id, "b");
    }

    fn usage(limit: f64, used: f64) -> UsageInfo {
        UsageInfo {
            usage_limit: limit,
            current_usage: used,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn session_rebinds_when_bound_account_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir).await;
        let token_a = write_token(&dir, "a").await;
        let token_b = write_token(&dir, "b").await;
        reg.add_account("a", "A", token_a, true).await.unwrap();
        reg.add_account("b", "B", token_b, true).await.unwrap();
        reg.quota_cache()
            .set("a", QuotaSnapshot::from_usage("a", &usage(1000.0, 900.0)));

        let first = reg.get_available_account(Some("s")).unwrap();
        assert_eq!(first.id, "a");

        first.set_enabled(false);
        let second = reg.get_available_account(Some("s")).unwrap();
        assert_eq!(second.id, "b");

        // Re-enabling "a" does not steal the session back; it is bound
        // to "b" now
        first.set_enabled(true);
        reg.quota_cache()
            .set("b", QuotaSnapshot::from_usage("b", &usage(1000.0, 990.0)));
        let third = reg.get_available_account(Some("s")).unwrap();
        assert_eq!(third.id, "b");
    }

    #[tokio::test]
    async fn next_available_excludes_and_prefers_least_requests() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir).await;
        let token_a = write_token(&dir, "a").await;
        let token_b = write_token(&dir, "b").await;
        let token_c = write_token(&dir, "c").await;
        reg.add_account("a", "A", token_a, true).await.unwrap();
        reg.add_account("b", "B", token_b, true).await.unwrap();
        reg.add_account("c", "C", token_c, true).await.unwrap();
        reg.get("b").unwrap().record_request();
        reg.get("b").unwrap().record_request();
        reg.get("c").unwrap().record_request();

        let next = reg.get_next_available_account("a").unwrap();
        assert_eq!(next.id, "c");

        reg.get("c").unwrap().set_enabled(false);
        let next = reg.get_next_available_account("a").unwrap();
        assert_eq!(next.id, "b");

        reg.get("b").unwrap().set_enabled(false);
        assert!(reg.get_next_available_account("a").is_none());
    }

    #[tokio::test]
    async fn mark_used_bumps_counters() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir).await;
        let token = write_token(&dir, "a").await;
        reg.add_account("a", "A", token, true).await.unwrap();

        reg.mark_used("a");
        let account = reg.get("a").unwrap();
        assert_eq!(account.request_count(), 1);
        assert!(account.last_used().is_some());
    }

    #[tokio::test]
    async fn toggle_account() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir).await;
        let token = write_token(&dir, "a").await;
        reg.add_account("a", "A", token, true).await.unwrap();

        reg.set_account_enabled("a", false).await.unwrap();
        assert!(!reg.get("a").unwrap().enabled());
        assert!(reg.set_account_enabled("ghost", false).await.is_err());
        assert_eq!(reg.valid_account_ids().len(), 0);
    }
}
