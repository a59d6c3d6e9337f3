//! Request pacing
//!
//! Sliding one-minute windows per account and globally, plus a minimum
//! interval between consecutive requests on the same account. `acquire`
//! suspends until all three gates admit. When the limiter is disabled it
//! admits immediately, and upstream 429s then only bump error
//! counters instead of cooling accounts down.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Length of the sliding windows.
const WINDOW: Duration = Duration::from_secs(60);

/// Runtime rate-limit configuration, settable through the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Minimum seconds between consecutive requests on one account
    pub min_request_interval: f64,
    pub max_requests_per_minute: u32,
    pub global_max_requests_per_minute: u32,
    /// Cooldown applied to an account when the upstream throttles it
    pub quota_cooldown_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_request_interval: 0.5,
            max_requests_per_minute: 60,
            global_max_requests_per_minute: 120,
            quota_cooldown_seconds: 30,
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_request_interval < 0.0 {
            return Err(Error::ConfigInvalid(
                "min_request_interval must not be negative".into(),
            ));
        }
        if self.max_requests_per_minute == 0 {
            return Err(Error::ConfigInvalid(
                "max_requests_per_minute must be at least 1".into(),
            ));
        }
        if self.global_max_requests_per_minute == 0 {
            return Err(Error::ConfigInvalid(
                "global_max_requests_per_minute must be at least 1".into(),
            ));
        }
        if self.quota_cooldown_seconds == 0 {
            return Err(Error::ConfigInvalid(
                "quota_cooldown_seconds must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

struct LimiterState {
    config: RateLimitConfig,
    account_windows: HashMap<String, VecDeque<Instant>>,
    global_window: VecDeque<Instant>,
    last_request: HashMap<String, Instant>,
}

/// Global + per-account request pacer.
pub struct RateLimiter {
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                config,
                account_windows: HashMap::new(),
                global_window: VecDeque::new(),
                last_request: HashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        crate::lock(&self.state).config.clone()
    }

    pub fn set_config(&self, config: RateLimitConfig) -> Result<()> {
        config.validate()?;
        crate::lock(&self.state).config = config;
        Ok(())
    }

    /// Whether upstream 429s should cool the account down.
    pub fn should_apply_quota_cooldown(&self) -> bool {
        crate::lock(&self.state).config.enabled
    }

    /// Cooldown to apply on an upstream throttle.
    pub fn quota_cooldown(&self) -> Duration {
        Duration::from_secs(crate::lock(&self.state).config.quota_cooldown_seconds)
    }

    /// Admit one request for `account_id`, suspending as long as needed.
    ///
    /// Gate order per admission attempt: prune both windows, check window
    /// capacity (account first, then global), then the minimum-interval
    /// gate. The wait is computed under the lock and slept outside it.
    pub async fn acquire(&self, account_id: &str) {
        loop {
            let wait = self.try_admit(account_id);
            match wait {
                None => return,
                Some(delay) => {
                    debug!(account_id, wait_ms = delay.as_millis() as u64, "rate limited, waiting");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One admission attempt. `None` = admitted (and recorded); `Some` =
    /// retry after the returned delay.
    fn try_admit(&self, account_id: &str) -> Option<Duration> {
        let mut state = crate::lock(&self.state);
        if !state.config.enabled {
            return None;
        }
        let now = Instant::now();
        let per_account_max = state.config.max_requests_per_minute as usize;
        let global_max = state.config.global_max_requests_per_minute as usize;
        let min_interval = Duration::from_secs_f64(state.config.min_request_interval);

        prune(&mut state.global_window, now);
        let window = state
            .account_windows
            .entry(account_id.to_string())
            .or_default();
        prune(window, now);

        if window.len() >= per_account_max {
            let oldest = *window.front().unwrap_or(&now);
            return Some((oldest + WINDOW).saturating_duration_since(now));
        }
        if state.global_window.len() >= global_max {
            let oldest = *state.global_window.front().unwrap_or(&now);
            return Some((oldest + WINDOW).saturating_duration_since(now));
        }

        if let Some(last) = state.last_request.get(account_id) {
            let since = now.saturating_duration_since(*last);
            if since < min_interval {
                return Some(min_interval - since);
            }
        }

        // Admitted: record in both windows
        if let Some(window) = state.account_windows.get_mut(account_id) {
            window.push_back(now);
        }
        state.global_window.push_back(now);
        state.last_request.insert(account_id.to_string(), now);
        None
    }
}

fn prune(window: &mut VecDeque<Instant>, now: Instant) {
    while let Some(front) = window.front() {
        if now.saturating_duration_since(*front) >= WINDOW {
            window.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_config() -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            min_request_interval: 0.0,
            max_requests_per_minute: 3,
            global_max_requests_per_minute: 5,
            quota_cooldown_seconds: 30,
        }
    }

    #[tokio::test]
    async fn disabled_limiter_admits_immediately() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        // Would deadlock the test if it actually waited
        for _ in 0..200 {
            limiter.acquire("a").await;
        }
        assert!(!limiter.should_apply_quota_cooldown());
    }

    #[test]
    fn per_account_window_fills_up() {
        let limiter = RateLimiter::new(enabled_config());
        assert!(limiter.try_admit("a").is_none());
        assert!(limiter.try_admit("a").is_none());
        assert!(limiter.try_admit("a").is_none());

        let wait = limiter.try_admit("a");
        assert!(wait.is_some(), "fourth request within a minute must wait");
        assert!(wait.unwrap() <= WINDOW);
    }

    #[test]
    fn global_window_caps_across_accounts() {
        let limiter = RateLimiter::new(enabled_config());
        assert!(limiter.try_admit("a").is_none());
        assert!(limiter.try_admit("a").is_none());
        assert!(limiter.try_admit("b").is_none());
        assert!(limiter.try_admit("b").is_none());
        assert!(limiter.try_admit("c").is_none());

        // 5 admitted globally; "c" has per-account room but the global
        // window is full
        assert!(limiter.try_admit("c").is_some());
    }

    #[test]
    fn min_interval_gates_after_window_admission() {
        let mut config = enabled_config();
        config.min_request_interval = 10.0;
        let limiter = RateLimiter::new(config);

        assert!(limiter.try_admit("a").is_none());
        let wait = limiter.try_admit("a").expect("second request must wait");
        assert!(wait <= Duration::from_secs(10));
        // The interval gate must not have recorded the attempt: "b" is
        // unaffected
        assert!(limiter.try_admit("b").is_none());
    }

    #[test]
    fn quota_cooldown_reflects_config() {
        let limiter = RateLimiter::new(enabled_config());
        assert!(limiter.should_apply_quota_cooldown());
        assert_eq!(limiter.quota_cooldown(), Duration::from_secs(30));
    }

    #[test]
    fn set_config_validates() {
        let limiter = RateLimiter::new(RateLimitConfig::default());

        let mut bad = RateLimitConfig::default();
        bad.max_requests_per_minute = 0;
        assert!(matches!(
            limiter.set_config(bad),
            Err(Error::ConfigInvalid(_))
        ));

        let mut bad = RateLimitConfig::default();
        bad.min_request_interval = -1.0;
        assert!(limiter.set_config(bad).is_err());

        let mut good = RateLimitConfig::default();
        good.enabled = true;
        limiter.set_config(good).unwrap();
        assert!(limiter.should_apply_quota_cooldown());
    }

    #[tokio::test]
    async fn acquire_waits_out_the_min_interval() {
        let mut config = enabled_config();
        config.min_request_interval = 0.05;
        let limiter = RateLimiter::new(config);

        limiter.acquire("a").await;
        let started = Instant::now();
        limiter.acquire("a").await;
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}
