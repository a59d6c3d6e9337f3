//! Account-lifecycle and request-dispatch engine
//!
//! Manages the fleet of upstream credentials behind the gateway: quota
//! snapshots with file persistence, cooldown bookkeeping, request pacing,
//! priority/strategy account selection, background quota refresh, token
//! refresh (single, batch, and timed), session stickiness, history
//! compression against the upstream input ceiling, and the dispatch
//! pipeline that ties them together.
//!
//! Account lifecycle:
//! 1. The registry loads accounts from `accounts.json`, each pointing at a
//!    token file
//! 2. Dispatch acquires an account (session-sticky, priority list, then
//!    strategy), paces it, and ensures a fresh token
//! 3. Upstream throttles cool the account down (when rate limiting is on);
//!    quota exhaustion disables it until the scheduler sees balance again
//! 4. Background tasks keep quota snapshots and tokens fresh
//!
//! Everything external (the auth endpoint, usage endpoint, upstream, and
//! summarizer) enters through the `provider` traits; the gateway binary
//! is the composition root that wires real HTTP clients in.

pub mod account;
pub mod cooldown;
pub mod dispatch;
pub mod error;
pub mod history;
pub mod quota_cache;
pub mod rate_limit;
pub mod refresh;
pub mod registry;
pub mod scheduler;
pub mod selector;

pub use account::{Account, AccountStatus};
pub use cooldown::{CooldownRecord, CooldownTracker};
pub use dispatch::{DispatchCoordinator, DispatchOutcome, DispatchRequest};
pub use error::{Error, Result};
pub use history::{
    CompressionOutcome, HistoryCompressor, HistoryConfig, HistoryEntry, HistoryShape,
};
pub use quota_cache::{BalanceStatus, CacheSummary, QuotaCache, QuotaSnapshot};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use refresh::{QuotaFetcher, RefreshConfig, RefreshManager, RefreshProgress, RefreshStatus};
pub use registry::AccountRegistry;
pub use scheduler::QuotaScheduler;
pub use selector::{AccountSelector, SelectionStrategy};

/// Lock a mutex, ignoring poisoning; state behind these locks stays
/// consistent because every critical section is a plain field update.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
