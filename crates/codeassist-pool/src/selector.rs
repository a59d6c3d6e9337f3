//! Account selection
//!
//! Priority accounts are tried first, in their configured order. When no
//! priority account is available the configured strategy picks from the
//! available set: lowest remaining balance (default), round-robin, or
//! fewest requests. The priority list and strategy persist to
//! `priority.json` on every mutation; mutations validate every referenced
//! id against the caller's set of enabled accounts and fail atomically.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::account::Account;
use crate::cooldown::CooldownTracker;
use crate::error::{Error, Result};
use crate::quota_cache::QuotaCache;

/// How to choose among available accounts when no priority account applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Drain accounts closest to exhaustion first
    #[default]
    LowestBalance,
    RoundRobin,
    LeastRequests,
}

#[derive(Serialize, Deserialize)]
struct PriorityFile {
    version: String,
    priority_accounts: Vec<String>,
    strategy: SelectionStrategy,
}

struct SelectorState {
    priority_accounts: Vec<String>,
    strategy: SelectionStrategy,
    round_robin_index: usize,
}

/// Picks the account for a request.
pub struct AccountSelector {
    quota_cache: Arc<QuotaCache>,
    state: Mutex<SelectorState>,
    path: PathBuf,
}

impl AccountSelector {
    /// Create a selector persisting to `path`, loading any existing
    /// priority configuration. A missing or corrupt file means defaults.
    pub async fn load(quota_cache: Arc<QuotaCache>, path: PathBuf) -> Self {
        let mut state = SelectorState {
            priority_accounts: Vec::new(),
            strategy: SelectionStrategy::default(),
            round_robin_index: 0,
        };

        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => match serde_json::from_str::<PriorityFile>(&contents) {
                Ok(file) => {
                    info!(
                        priority = file.priority_accounts.len(),
                        strategy = ?file.strategy,
                        "loaded priority configuration"
                    );
                    state.priority_accounts = file.priority_accounts;
                    state.strategy = file.strategy;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "priority file unreadable, using defaults")
                }
            },
            Err(_) => {}
        }

        Self {
            quota_cache,
            state: Mutex::new(state),
            path,
        }
    }

    /// Pick one account, or none when nothing is available.
    pub fn select(
        &self,
        accounts: &[Arc<Account>],
        cooldowns: &CooldownTracker,
    ) -> Option<Arc<Account>> {
        if accounts.is_empty() {
            return None;
        }
        let mut state = crate::lock(&self.state);

        // Priority accounts first, in list order
        for priority_id in &state.priority_accounts {
            if let Some(account) = accounts
                .iter()
                .find(|a| &a.id == priority_id && a.is_available(cooldowns, &self.quota_cache))
            {
                return Some(account.clone());
            }
        }

        let available: Vec<&Arc<Account>> = accounts
            .iter()
            .filter(|a| a.is_available(cooldowns, &self.quota_cache))
            .collect();
        if available.is_empty() {
            return None;
        }

        match state.strategy {
            SelectionStrategy::LowestBalance => self.select_lowest_balance(&available),
            SelectionStrategy::RoundRobin => {
                let index = state.round_robin_index % available.len();
                state.round_robin_index = index + 1;
                Some(available[index].clone())
            }
            SelectionStrategy::LeastRequests => available
                .iter()
                .min_by_key(|a| a.request_count())
                .map(|a| (*a).clone()),
        }
    }

    /// Smallest balance wins; missing or errored snapshots rank last; ties
    /// break toward fewer requests.
    fn select_lowest_balance(&self, available: &[&Arc<Account>]) -> Option<Arc<Account>> {
        let rank = |account: &Account| -> (f64, u64) {
            let balance = match self.quota_cache.get(&account.id) {
                Some(snapshot) if !snapshot.has_error() => snapshot.balance,
                _ => f64::INFINITY,
            };
            (balance, account.request_count())
        };

        available
            .iter()
            .min_by(|a, b| {
                let (balance_a, requests_a) = rank(a);
                let (balance_b, requests_b) = rank(b);
                balance_a
                    .total_cmp(&balance_b)
                    .then(requests_a.cmp(&requests_b))
            })
            .map(|a| (*a).clone())
    }

    pub fn strategy(&self) -> SelectionStrategy {
        crate::lock(&self.state).strategy
    }

    pub async fn set_strategy(&self, strategy: SelectionStrategy) {
        crate::lock(&self.state).strategy = strategy;
        self.save().await;
    }

    pub fn priority_accounts(&self) -> Vec<String> {
        crate::lock(&self.state).priority_accounts.clone()
    }

    /// 1-based position of an account in the priority list.
    pub fn priority_order(&self, account_id: &str) -> Option<usize> {
        crate::lock(&self.state)
            .priority_accounts
            .iter()
            .position(|id| id == account_id)
            .map(|i| i + 1)
    }

    /// Replace the whole priority list. Every id must be in `valid_ids`.
    pub async fn set_priority_accounts(
        &self,
        account_ids: Vec<String>,
        valid_ids: &HashSet<String>,
    ) -> Result<String> {
        {
            let mut state = crate::lock(&self.state);
            let invalid: Vec<&String> = account_ids
                .iter()
                .filter(|id| !valid_ids.contains(*id))
                .collect();
            if !invalid.is_empty() {
                let list = invalid
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(Error::NotFound(format!("unknown accounts: {list}")));
            }
            state.priority_accounts = account_ids.clone();
        }
        self.save().await;
        Ok(format!("{} priority accounts set", account_ids.len()))
    }

    /// Insert one account into the priority list. `position` past the end
    /// (or absent) appends.
    pub async fn add_priority_account(
        &self,
        account_id: &str,
        position: Option<usize>,
        valid_ids: &HashSet<String>,
    ) -> Result<String> {
        {
            let mut state = crate::lock(&self.state);
            if !valid_ids.contains(account_id) {
                return Err(Error::NotFound(format!("unknown account: {account_id}")));
            }
            if state.priority_accounts.iter().any(|id| id == account_id) {
                return Err(Error::ConfigInvalid(format!(
                    "account {account_id} is already a priority account"
                )));
            }
            match position {
                Some(position) if position < state.priority_accounts.len() => {
                    state.priority_accounts.insert(position, account_id.to_string());
                }
                _ => state.priority_accounts.push(account_id.to_string()),
            }
        }
        self.save().await;
        Ok(format!("priority account added: {account_id}"))
    }

    pub async fn remove_priority_account(&self, account_id: &str) -> Result<String> {
        {
            let mut state = crate::lock(&self.state);
            let Some(index) = state
                .priority_accounts
                .iter()
                .position(|id| id == account_id)
            else {
                return Err(Error::NotFound(format!(
                    "account {account_id} is not a priority account"
                )));
            };
            state.priority_accounts.remove(index);
        }
        self.save().await;
        Ok(format!("priority account removed: {account_id}"))
    }

    /// Reorder the priority list. The new order must contain exactly the
    /// current set of ids.
    pub async fn reorder_priority(&self, account_ids: Vec<String>) -> Result<String> {
        {
            let mut state = crate::lock(&self.state);
            let current: HashSet<&String> = state.priority_accounts.iter().collect();
            let proposed: HashSet<&String> = account_ids.iter().collect();

            if current != proposed {
                let missing: Vec<&str> = current
                    .difference(&proposed)
                    .map(|s| s.as_str())
                    .collect();
                let extra: Vec<&str> = proposed
                    .difference(&current)
                    .map(|s| s.as_str())
                    .collect();
                let mut parts = Vec::new();
                if !missing.is_empty() {
                    parts.push(format!("missing accounts: {}", missing.join(", ")));
                }
                if !extra.is_empty() {
                    parts.push(format!("unexpected accounts: {}", extra.join(", ")));
                }
                return Err(Error::ConfigInvalid(parts.join("; ")));
            }
            state.priority_accounts = account_ids;
        }
        self.save().await;
        Ok("priority order updated".to_string())
    }

    /// Persist strategy + priority list. Failures are logged, not fatal;
    /// the in-memory state is authoritative until the next write succeeds.
    async fn save(&self) {
        let file = {
            let state = crate::lock(&self.state);
            PriorityFile {
                version: "1.0".to_string(),
                priority_accounts: state.priority_accounts.clone(),
                strategy: state.strategy,
            }
        };
        let json = match serde_json::to_string_pretty(&file) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "failed to serialize priority configuration");
                return;
            }
        };
        if let Err(e) = common::fs::write_atomic(&self.path, json.as_bytes()).await {
            warn!(path = %self.path.display(), error = %e, "failed to persist priority configuration");
        }
    }
}
