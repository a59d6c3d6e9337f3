//! Per-account quota snapshots with file persistence
//!
//! The cache maps account ids to the last known usage numbers from the
//! usage endpoint. Selection reads it to rank accounts by remaining
//! balance; the scheduler writes it on every refresh pass. Persistence is
//! atomic (temp file + rename) and a corrupt or missing cache file is never
//! fatal: the cache starts empty and rebuilds on the next refresh.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use provider::UsageInfo;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Cache entries older than this are considered stale.
pub const DEFAULT_CACHE_MAX_AGE_SECS: u64 = 300;

/// Balance fraction at or below which an account counts as low.
pub const LOW_BALANCE_THRESHOLD: f64 = 0.20;

/// Derived quota state of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceStatus {
    /// More than 20% of the limit remaining
    #[default]
    Normal,
    /// 0 < remaining ≤ 20% of the limit
    Low,
    /// Nothing remaining
    Exhausted,
}

/// One account's cached usage numbers.
///
/// `balance_status` and the two booleans are derived from `balance` and
/// `usage_limit` whenever a snapshot is built or loaded. A snapshot with
/// `error` set keeps `Normal` status: a failed fetch means unknown, not
/// exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    #[serde(skip)]
    pub account_id: String,
    pub usage_limit: f64,
    pub current_usage: f64,
    pub balance: f64,
    pub usage_percent: f64,
    #[serde(default)]
    pub balance_status: BalanceStatus,
    #[serde(default)]
    pub is_low_balance: bool,
    #[serde(default)]
    pub is_exhausted: bool,
    #[serde(default)]
    pub subscription_title: String,
    #[serde(default)]
    pub free_trial_limit: f64,
    #[serde(default)]
    pub free_trial_usage: f64,
    #[serde(default)]
    pub bonus_limit: f64,
    #[serde(default)]
    pub bonus_usage: f64,
    /// Unix timestamp in seconds of the fetch that produced this snapshot
    pub updated_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QuotaSnapshot {
    /// Build a snapshot from a successful usage fetch.
    pub fn from_usage(account_id: &str, usage: &UsageInfo) -> Self {
        let usage_percent = if usage.usage_limit > 0.0 {
            (usage.current_usage / usage.usage_limit * 10000.0).round() / 100.0
        } else {
            0.0
        };
        let mut snapshot = Self {
            account_id: account_id.to_string(),
            usage_limit: usage.usage_limit,
            current_usage: usage.current_usage,
            balance: usage.balance(),
            usage_percent,
            balance_status: BalanceStatus::Normal,
            is_low_balance: false,
            is_exhausted: false,
            subscription_title: usage.subscription_title.clone(),
            free_trial_limit: usage.free_trial_limit,
            free_trial_usage: usage.free_trial_usage,
            bonus_limit: usage.bonus_limit,
            bonus_usage: usage.bonus_usage,
            updated_at: now_epoch_secs(),
            error: None,
        };
        snapshot.update_balance_status();
        snapshot
    }

    /// Build an error snapshot for a failed fetch. Balance fields stay zero
    /// and the status stays `Normal` (unknown).
    pub fn from_error(account_id: &str, error: impl Into<String>) -> Self {
        Self {
            account_id: account_id.to_string(),
            usage_limit: 0.0,
            current_usage: 0.0,
            balance: 0.0,
            usage_percent: 0.0,
            balance_status: BalanceStatus::Normal,
            is_low_balance: false,
            is_exhausted: false,
            subscription_title: String::new(),
            free_trial_limit: 0.0,
            free_trial_usage: 0.0,
            bonus_limit: 0.0,
            bonus_usage: 0.0,
            updated_at: now_epoch_secs(),
            error: Some(error.into()),
        }
    }

    /// Build an exhausted snapshot, used when the upstream reports quota
    /// exhaustion outright and no fetch has run yet.
    pub fn exhausted(account_id: &str, usage_limit: f64) -> Self {
        let mut snapshot = Self::from_error(account_id, "");
        snapshot.error = None;
        snapshot.usage_limit = usage_limit;
        snapshot.current_usage = usage_limit;
        snapshot.balance = 0.0;
        snapshot.usage_percent = 100.0;
        snapshot.update_balance_status();
        snapshot
    }

    /// Recompute the derived status fields from balance and limit.
    pub fn update_balance_status(&mut self) {
        if self.error.is_some() {
            return;
        }
        if self.balance <= 0.0 {
            self.balance_status = BalanceStatus::Exhausted;
            self.is_exhausted = true;
            self.is_low_balance = false;
        } else if self.usage_limit > 0.0 && self.balance / self.usage_limit <= LOW_BALANCE_THRESHOLD
        {
            self.balance_status = BalanceStatus::Low;
            self.is_low_balance = true;
            self.is_exhausted = false;
        } else {
            self.balance_status = BalanceStatus::Normal;
            self.is_low_balance = false;
            self.is_exhausted = false;
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Quota usable: not exhausted and not an error snapshot.
    pub fn is_available(&self) -> bool {
        !self.is_exhausted && !self.has_error()
    }
}

/// Aggregate numbers over the whole cache, for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct CacheSummary {
    pub total_accounts: usize,
    pub total_balance: f64,
    pub total_usage: f64,
    pub total_limit: f64,
    pub error_count: usize,
    pub stale_count: usize,
}

/// On-disk cache format.
#[derive(Serialize, Deserialize)]
struct CacheFile {
    version: String,
    updated_at: String,
    accounts: HashMap<String, QuotaSnapshot>,
}

/// Thread-safe quota snapshot cache.
///
/// All map operations take the mutex briefly; file I/O runs on a clone of
/// the map taken under the lock, never while holding it.
pub struct QuotaCache {
    cache: Mutex<HashMap<String, QuotaSnapshot>>,
    path: PathBuf,
}

impl QuotaCache {
    /// Create an empty cache persisting to `path`. Call `load_from_file`
    /// to pick up a previous run's snapshots.
    pub fn new(path: PathBuf) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            path,
        }
    }

    pub fn get(&self, account_id: &str) -> Option<QuotaSnapshot> {
        crate::lock(&self.cache).get(account_id).cloned()
    }

    pub fn set(&self, account_id: &str, snapshot: QuotaSnapshot) {
        crate::lock(&self.cache).insert(account_id.to_string(), snapshot);
    }

    pub fn remove(&self, account_id: &str) {
        crate::lock(&self.cache).remove(account_id);
    }

    pub fn clear(&self) {
        crate::lock(&self.cache).clear();
    }

    /// Copy of the whole cache.
    pub fn get_all(&self) -> HashMap<String, QuotaSnapshot> {
        crate::lock(&self.cache).clone()
    }

    /// True when no snapshot exists or the snapshot is older than `max_age`.
    pub fn is_stale(&self, account_id: &str, max_age_secs: u64) -> bool {
        match crate::lock(&self.cache).get(account_id) {
            None => true,
            Some(snapshot) => now_epoch_secs().saturating_sub(snapshot.updated_at) > max_age_secs,
        }
    }

    /// Load snapshots from the cache file. Missing or corrupt files are
    /// tolerated: the cache starts empty and the problem is logged once.
    pub async fn load_from_file(&self) -> bool {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(_) => return false,
        };
        let file: CacheFile = match serde_json::from_str(&contents) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "quota cache file unreadable, starting empty");
                return false;
            }
        };

        let mut cache = crate::lock(&self.cache);
        cache.clear();
        for (account_id, mut snapshot) in file.accounts {
            snapshot.account_id = account_id.clone();
            snapshot.update_balance_status();
            cache.insert(account_id, snapshot);
        }
        info!(accounts = cache.len(), "loaded quota cache");
        true
    }

    /// Persist the cache atomically. Returns false on failure; the caller
    /// (the scheduler) retries on its next pass.
    pub async fn save_to_file(&self) -> bool {
        let accounts = self.get_all();
        let file = CacheFile {
            version: "1.0".to_string(),
            updated_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            accounts,
        };
        let json = match serde_json::to_string_pretty(&file) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "failed to serialize quota cache");
                return false;
            }
        };
        match common::fs::write_atomic(&self.path, json.as_bytes()).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "persisted quota cache");
                true
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to persist quota cache");
                false
            }
        }
    }

    /// Aggregate totals; error snapshots are excluded from the sums.
    pub fn summary(&self) -> CacheSummary {
        let cache = crate::lock(&self.cache);
        let now = now_epoch_secs();

        let mut summary = CacheSummary {
            total_accounts: cache.len(),
            total_balance: 0.0,
            total_usage: 0.0,
            total_limit: 0.0,
            error_count: 0,
            stale_count: 0,
        };
        for snapshot in cache.values() {
            if snapshot.has_error() {
                summary.error_count += 1;
            } else {
                summary.total_balance += snapshot.balance;
                summary.total_usage += snapshot.current_usage;
                summary.total_limit += snapshot.usage_limit;
            }
            if now.saturating_sub(snapshot.updated_at) > DEFAULT_CACHE_MAX_AGE_SECS {
                summary.stale_count += 1;
            }
        }
        summary
    }
}

/// Current unix time in whole seconds.
pub fn now_epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(limit: f64, used: f64) -> UsageInfo {
        UsageInfo {
            subscription_title: "Pro".into(),
            usage_limit: limit,
            current_usage: used,
            ..Default::default()
        }
    }

    #[test]
    fn snapshot_roundtrips_through_cache() {
        let cache = QuotaCache::new(PathBuf::from("/nonexistent/cache.json"));
        let snapshot = QuotaSnapshot::from_usage("a", &usage(1000.0, 400.0));
        cache.set("a", snapshot.clone());
        assert_eq!(cache.get("a"), Some(snapshot));
    }

    #[test]
    fn balance_classification_normal() {
        let snapshot = QuotaSnapshot::from_usage("a", &usage(1000.0, 400.0));
        assert_eq!(snapshot.balance, 600.0);
        assert_eq!(snapshot.balance_status, BalanceStatus::Normal);
        assert!(!snapshot.is_low_balance);
        assert!(!snapshot.is_exhausted);
        assert!(snapshot.is_available());
    }

    #[test]
    fn balance_classification_low() {
        // 20% remaining is the boundary, still low
        let snapshot = QuotaSnapshot::from_usage("a", &usage(1000.0, 800.0));
        assert_eq!(snapshot.balance_status, BalanceStatus::Low);
        assert!(snapshot.is_low_balance);
        assert!(!snapshot.is_exhausted);
        assert!(snapshot.is_available());
    }

    #[test]
    fn balance_classification_exhausted() {
        let snapshot = QuotaSnapshot::from_usage("a", &usage(1000.0, 1000.0));
        assert_eq!(snapshot.balance_status, BalanceStatus::Exhausted);
        assert!(snapshot.is_exhausted);
        assert!(!snapshot.is_low_balance);
        assert!(!snapshot.is_available());

        let negative = QuotaSnapshot::from_usage("a", &usage(1000.0, 1200.0));
        assert!(negative.is_exhausted);
    }

    #[test]
    fn error_snapshot_stays_normal() {
        let snapshot = QuotaSnapshot::from_error("a", "fetch timed out");
        assert!(snapshot.has_error());
        assert_eq!(snapshot.balance_status, BalanceStatus::Normal);
        assert!(!snapshot.is_exhausted);
        // but not usable for selection either
        assert!(!snapshot.is_available());
    }

    #[test]
    fn usage_percent_is_rounded() {
        let snapshot = QuotaSnapshot::from_usage("a", &usage(3.0, 1.0));
        assert_eq!(snapshot.usage_percent, 33.33);
    }

    #[test]
    fn stale_detection() {
        let cache = QuotaCache::new(PathBuf::from("/nonexistent/cache.json"));
        assert!(cache.is_stale("missing", 300));

        let mut snapshot = QuotaSnapshot::from_usage("a", &usage(100.0, 0.0));
        cache.set("a", snapshot.clone());
        assert!(!cache.is_stale("a", 300));

        snapshot.updated_at = now_epoch_secs() - 600;
        cache.set("a", snapshot);
        assert!(cache.is_stale("a", 300));
    }

    #[test]
    fn remove_and_clear() {
        let cache = QuotaCache::new(PathBuf::from("/nonexistent/cache.json"));
        cache.set("a", QuotaSnapshot::from_usage("a", &usage(100.0, 0.0)));
        cache.set("b", QuotaSnapshot::from_usage("b", &usage(100.0, 0.0)));

        cache.remove("a");
        assert!(cache.get("a").is_none());
        assert_eq!(cache.get_all().len(), 1);

        cache.clear();
        assert!(cache.get_all().is_empty());
    }

    #[tokio::test]
    async fn file_roundtrip_preserves_all_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota_cache.json");

        let cache = QuotaCache::new(path.clone());
        cache.set("a", QuotaSnapshot::from_usage("a", &usage(1000.0, 850.0)));
        cache.set("b", QuotaSnapshot::from_error("b", "boom"));
        assert!(cache.save_to_file().await);

        let reloaded = QuotaCache::new(path);
        assert!(reloaded.load_from_file().await);
        assert_eq!(reloaded.get_all(), cache.get_all());

        let a = reloaded.get("a").unwrap();
        assert_eq!(a.account_id, "a");
        assert_eq!(a.balance_status, BalanceStatus::Low);
        let b = reloaded.get("b").unwrap();
        assert_eq!(b.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn file_format_has_version_and_omits_account_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota_cache.json");

        let cache = QuotaCache::new(path.clone());
        cache.set("a", QuotaSnapshot::from_usage("a", &usage(100.0, 0.0)));
        cache.save_to_file().await;

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["version"], "1.0");
        assert!(value["updated_at"].as_str().unwrap().contains('T'));
        assert!(value["accounts"]["a"].get("account_id").is_none());
    }

    #[tokio::test]
    async fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota_cache.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let cache = QuotaCache::new(path);
        assert!(!cache.load_from_file().await);
        assert!(cache.get_all().is_empty());
    }

    #[tokio::test]
    async fn missing_file_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let cache = QuotaCache::new(dir.path().join("quota_cache.json"));
        assert!(!cache.load_from_file().await);
    }

    #[tokio::test]
    async fn save_failure_keeps_memory_state() {
        // Unwritable path (parent is a file, not a directory)
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        tokio::fs::write(&blocker, "x").await.unwrap();

        let cache = QuotaCache::new(blocker.join("cache.json"));
        cache.set("a", QuotaSnapshot::from_usage("a", &usage(100.0, 0.0)));
        assert!(!cache.save_to_file().await);
        assert!(cache.get("a").is_some());
    }

    #[test]
    fn summary_totals_exclude_errors() {
        let cache = QuotaCache::new(PathBuf::from("/nonexistent/cache.json"));
        cache.set("a", QuotaSnapshot::from_usage("a", &usage(1000.0, 300.0)));
        cache.set("b", QuotaSnapshot::from_usage("b", &usage(500.0, 100.0)));
        cache.set("c", QuotaSnapshot::from_error("c", "nope"));

        let summary = cache.summary();
        assert_eq!(summary.total_accounts, 3);
        assert_eq!(summary.total_balance, 1100.0);
        assert_eq!(summary.total_usage, 400.0);
        assert_eq!(summary.total_limit, 1500.0);
        assert_eq!(summary.error_count, 1);
        assert_eq!(summary.stale_count, 0);
    }
}
