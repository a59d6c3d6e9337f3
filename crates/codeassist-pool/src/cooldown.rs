//! Per-account cooldown bookkeeping
//!
//! Accounts that get throttled by the upstream are excluded from selection
//! until their cooldown elapses. Records expire lazily: the registry prunes
//! before each acquisition, and `is_available` treats an elapsed record as
//! absent.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, info};

/// One cooldown window for one account.
#[derive(Debug, Clone)]
pub struct CooldownRecord {
    pub credential_id: String,
    pub exceeded_at: Instant,
    pub cooldown_until: Instant,
    pub reason: String,
}

/// Tracks which accounts are cooling down and until when.
#[derive(Default)]
pub struct CooldownTracker {
    records: Mutex<HashMap<String, CooldownRecord>>,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put an account into cooldown, overwriting any existing record.
    pub fn mark_exceeded(&self, credential_id: &str, reason: &str, cooldown: Duration) {
        let now = Instant::now();
        let record = CooldownRecord {
            credential_id: credential_id.to_string(),
            exceeded_at: now,
            cooldown_until: now + cooldown,
            reason: reason.to_string(),
        };
        info!(
            account_id = credential_id,
            cooldown_secs = cooldown.as_secs(),
            reason,
            "account entering cooldown"
        );
        crate::lock(&self.records).insert(credential_id.to_string(), record);
    }

    /// True when the account has no active cooldown.
    pub fn is_available(&self, credential_id: &str) -> bool {
        match crate::lock(&self.records).get(credential_id) {
            None => true,
            Some(record) => Instant::now() >= record.cooldown_until,
        }
    }

    /// Forcibly drop a cooldown (admin restore). Returns whether a record
    /// existed.
    pub fn restore(&self, credential_id: &str) -> bool {
        let removed = crate::lock(&self.records).remove(credential_id).is_some();
        if removed {
            info!(account_id = credential_id, "cooldown cleared by admin");
        }
        removed
    }

    /// Prune every record whose cooldown has elapsed.
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        let mut records = crate::lock(&self.records);
        let before = records.len();
        records.retain(|_, record| now < record.cooldown_until);
        let pruned = before - records.len();
        if pruned > 0 {
            debug!(pruned, "pruned expired cooldowns");
        }
    }

    /// Remaining cooldown, zero when none is active.
    pub fn cooldown_remaining(&self, credential_id: &str) -> Duration {
        match crate::lock(&self.records).get(credential_id) {
            None => Duration::ZERO,
            Some(record) => record
                .cooldown_until
                .saturating_duration_since(Instant::now()),
        }
    }
}
