//! Request dispatch
//!
//! The per-request pipeline: acquire an account (session-sticky), pace it
//! through the rate limiter, ensure its token is fresh, compress the
//! history when it would blow the upstream input ceiling, forward, and
//! react to what comes back: cooldown + failover on throttles, disable on
//! exhaustion, recompress-and-retry on length overruns, one token replay
//! on 401s, bounded failover on everything transient.
//!
//! Cancellation: dropping the dispatch future cancels the in-flight
//! upstream call before any counter is bumped, so a cancelled inbound
//! request never penalizes the account that served it.

use std::sync::Arc;

use provider::{
    ByteStream, ErrorClassification, SummaryClient, TokenClient, UpstreamClient, UpstreamReply,
    UpstreamRequest, classify_status,
};
use tracing::{debug, info, warn};

use crate::account::Account;
use crate::cooldown::CooldownTracker;
use crate::error::{Error, Result};
use crate::history::{HistoryCompressor, HistoryEntry, HistoryShape, serialize_history};
use crate::quota_cache::{QuotaCache, QuotaSnapshot};
use crate::rate_limit::RateLimiter;
use crate::refresh::{RefreshManager, is_auth_error};
use crate::registry::AccountRegistry;
use crate::scheduler::QuotaScheduler;

/// Upper bound on switching accounts within one dispatch.
const MAX_FAILOVER_ATTEMPTS: usize = 3;

/// An inbound forward request, already translated out of its wire dialect.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub session_id: Option<String>,
    pub history: Vec<HistoryEntry>,
    pub shape: HistoryShape,
    pub user_content: String,
    pub model_id: Option<String>,
}

/// A successfully opened upstream stream.
pub struct DispatchOutcome {
    pub account_id: String,
    pub stream: ByteStream,
    /// Truncation note when history compression ran and warning headers
    /// are enabled
    pub warning: Option<String>,
}

impl std::fmt::Debug for DispatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchOutcome")
            .field("account_id", &self.account_id)
            .field("stream", &"<ByteStream>")
            .field("warning", &self.warning)
            .finish()
    }
}

/// Binds the pool components into the per-request pipeline.
pub struct DispatchCoordinator {
    registry: Arc<AccountRegistry>,
    scheduler: Arc<QuotaScheduler>,
    rate_limiter: Arc<RateLimiter>,
    refresh_manager: Arc<RefreshManager>,
    cooldowns: Arc<CooldownTracker>,
    quota_cache: Arc<QuotaCache>,
    compressor: Arc<HistoryCompressor>,
    token_client: Arc<dyn TokenClient>,
    upstream: Arc<dyn UpstreamClient>,
    summarizer: Arc<dyn SummaryClient>,
}

impl DispatchCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<AccountRegistry>,
        scheduler: Arc<QuotaScheduler>,
        rate_limiter: Arc<RateLimiter>,
        refresh_manager: Arc<RefreshManager>,
        cooldowns: Arc<CooldownTracker>,
        quota_cache: Arc<QuotaCache>,
        compressor: Arc<HistoryCompressor>,
        token_client: Arc<dyn TokenClient>,
        upstream: Arc<dyn UpstreamClient>,
        summarizer: Arc<dyn SummaryClient>,
    ) -> Self {
        Self {
            registry,
            scheduler,
            rate_limiter,
            refresh_manager,
            cooldowns,
            quota_cache,
            compressor,
            token_client,
            upstream,
            summarizer,
        }
    }

    /// Route one forward request through the pool.
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchOutcome> {
        let DispatchRequest {
            session_id,
            mut history,
            shape,
            user_content,
            model_id,
        } = request;
        let cache_key = session_id.clone();
        let mut warning = None;

        // Pre-send size check
        if self
            .compressor
            .needs_compression(&history, &user_content, shape)
        {
            let outcome = self
                .compressor
                .pre_process(
                    history,
                    &user_content,
                    shape,
                    self.summarizer.as_ref(),
                    cache_key.as_deref(),
                )
                .await;
            warning = self.compressor.warning_header(&outcome);
            history = outcome.history;
        }

        let mut account = self
            .registry
            .get_available_account(session_id.as_deref())
            .ok_or(Error::NoAvailableAccount)?;

        let mut failovers = 0usize;
        let mut length_retries = 0u32;

        loop {
            self.rate_limiter.acquire(&account.id).await;

            if let Err(message) = self
                .refresh_manager
                .refresh_token_if_needed(&account, self.token_client.as_ref())
                .await
            {
                // The account is already marked unhealthy
                warn!(account_id = %account.id, error = %message, "token unusable, failing over");
                account =
                    self.next_account(&account.id, Error::TokenRefreshFailed(message), &mut failovers)?;
                continue;
            }

            let upstream_request = UpstreamRequest {
                history: serialize_history(&history, shape),
                user_content: user_content.clone(),
                model_id: model_id.clone(),
            };
            let machine_id = account.machine_id().await;

            let reply = {
                let op_account = account.clone();
                let upstream = self.upstream.clone();
                self.refresh_manager
                    .execute_with_auth_retry(&account, self.token_client.as_ref(), move || {
                        let account = op_account.clone();
                        let upstream = upstream.clone();
                        let request = upstream_request.clone();
                        let machine_id = machine_id.clone();
                        async move {
                            let Some(credential) = account.credential().await else {
                                return Err("credentials unavailable".to_string());
                            };
                            match upstream
                                .forward(&request, credential.access_token.expose(), &machine_id)
                                .await
                            {
                                Ok(UpstreamReply::Failure { status: 401, body }) => {
                                    Err(format!("upstream returned 401: {body}"))
                                }
                                Ok(reply) => Ok(reply),
                                Err(e) => Err(e.to_string()),
                            }
                        }
                    })
                    .await
            };

            match reply {
                Ok(UpstreamReply::Stream(stream)) => {
                    self.registry.mark_used(&account.id);
                    self.scheduler.mark_active(&account.id);
                    debug!(account_id = %account.id, "dispatch succeeded");
                    return Ok(DispatchOutcome {
                        account_id: account.id.clone(),
                        stream,
                        warning,
                    });
                }
                Ok(UpstreamReply::Failure { status, body }) => {
                    match classify_status(status, &body) {
                        ErrorClassification::RateLimited => {
                            info!(account_id = %account.id, "upstream throttled the account");
                            account.mark_quota_exceeded(
                                "Rate limited",
                                &self.rate_limiter,
                                &self.cooldowns,
                            );
                            account = self.next_account(
                                &account.id,
                                Error::UpstreamRateLimited(body),
                                &mut failovers,
                            )?;
                        }
                        ErrorClassification::QuotaExhausted => {
                            warn!(account_id = %account.id, "upstream reports quota exhausted, disabling account");
                            let snapshot = match self.quota_cache.get(&account.id) {
                                Some(mut snapshot) => {
                                    snapshot.current_usage = snapshot.usage_limit;
                                    snapshot.balance = 0.0;
                                    snapshot.update_balance_status();
                                    snapshot
                                }
                                None => QuotaSnapshot::exhausted(&account.id, 0.0),
                            };
                            self.quota_cache.set(&account.id, snapshot);
                            account.set_enabled(false);
                            account.record_error();
                            account = self.next_account(
                                &account.id,
                                Error::UpstreamQuotaExhausted(body),
                                &mut failovers,
                            )?;
                        }
                        ErrorClassification::InputTooLong => {
                            let (outcome, should_retry) = self
                                .compressor
                                .handle_length_error(
                                    std::mem::take(&mut history),
                                    shape,
                                    length_retries,
                                    self.summarizer.as_ref(),
                                    cache_key.as_deref(),
                                )
                                .await;
                            if !should_retry {
                                account.record_error();
                                return Err(Error::InputTooLong(body));
                            }
                            if let Some(note) = self.compressor.warning_header(&outcome) {
                                warning = Some(note);
                            }
                            history = outcome.history;
                            length_retries += 1;
                            info!(
                                account_id = %account.id,
                                retry = length_retries,
                                "input too long, recompressed history for retry"
                            );
                        }
                        ErrorClassification::AuthFailed => {
                            // 403: not replayable by token refresh
                            account.record_error();
                            return Err(Error::UpstreamAuthFailed(body));
                        }
                        ErrorClassification::Transient => {
                            account.record_error();
                            account = self.next_account(
                                &account.id,
                                Error::UpstreamTransient(body),
                                &mut failovers,
                            )?;
                        }
                    }
                }
                Err(message) => {
                    account.record_error();
                    if is_auth_error(&message) {
                        // 401 survived the refresh-and-replay
                        return Err(Error::UpstreamAuthFailed(message));
                    }
                    account = self.next_account(
                        &account.id,
                        Error::UpstreamTransient(message),
                        &mut failovers,
                    )?;
                }
            }
        }
    }

    /// Fail over to the least-loaded other account, or surface `error`
    /// once the bound is hit or nothing else is available.
    fn next_account(
        &self,
        exclude_id: &str,
        error: Error,
        failovers: &mut usize,
    ) -> Result<Arc<Account>> {
        *failovers += 1;
        if *failovers > MAX_FAILOVER_ATTEMPTS {
            return Err(error);
        }
        match self.registry.get_next_available_account(exclude_id) {
            Some(account) => {
                debug!(from = exclude_id, to = %account.id, "failing over");
                Ok(account)
            }
            None => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryConfig;
    use crate::rate_limit::RateLimitConfig;
    use crate::refresh::RefreshConfig;
    use crate::selector::AccountSelector;
    use bytes::Bytes;
    use codeassist_auth::Credential;
    use provider::{ProviderError, RefreshedToken, UsageInfo};
    use std::collections::VecDeque;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    enum Script {
        Success,
        Status(u16, &'static str),
    }

    /// Upstream that replays a scripted sequence; an exhausted script
    /// means success.
    struct ScriptedUpstream {
        script: Mutex<VecDeque<Script>>,
        calls: AtomicUsize,
        last_history_len: AtomicUsize,
    }

    impl ScriptedUpstream {
        fn new(script: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
                last_history_len: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl UpstreamClient for ScriptedUpstream {
        fn forward<'a>(
            &'a self,
            request: &'a UpstreamRequest,
            _access_token: &'a str,
            _machine_id: &'a str,
        ) -> Pin<Box<dyn Future<Output = provider::Result<UpstreamReply>> + Send + 'a>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.last_history_len
                .store(request.history.len(), Ordering::SeqCst);
            let next = crate::lock(&self.script).pop_front();
            Box::pin(async move {
                match next {
                    None | Some(Script::Success) => {
                        let stream: ByteStream = Box::pin(futures_util::stream::once(async {
                            Ok(Bytes::from_static(b"data"))
                        }));
                        Ok(UpstreamReply::Stream(stream))
                    }
                    Some(Script::Status(status, body)) => Ok(UpstreamReply::Failure {
                        status,
                        body: body.to_string(),
                    }),
                }
            })
        }
    }

    struct CountingTokenClient {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingTokenClient {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    impl TokenClient for CountingTokenClient {
        fn refresh<'a>(
            &'a self,
            _credential: &'a Credential,
        ) -> Pin<Box<dyn Future<Output = provider::Result<RefreshedToken>> + Send + 'a>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if self.fail {
                    Err(ProviderError::Endpoint {
                        status: 400,
                        body: "refresh rejected".into(),
                    })
                } else {
                    Ok(RefreshedToken {
                        access_token: "at_fresh".into(),
                        refresh_token: None,
                        expires_at: codeassist_auth::now_millis() + 3_600_000,
                    })
                }
            })
        }
    }

    struct StaticSummarizer {
        calls: AtomicUsize,
    }

    impl SummaryClient for StaticSummarizer {
        fn summarize<'a>(
            &'a self,
            _prompt: &'a str,
        ) -> Pin<Box<dyn Future<Output = provider::Result<String>> + Send + 'a>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok("conversation summary".to_string()) })
        }
    }

    struct StubUsage;

    impl provider::UsageClient for StubUsage {
        fn fetch_usage<'a>(
            &'a self,
            _credential: &'a Credential,
            _machine_id: &'a str,
        ) -> Pin<Box<dyn Future<Output = provider::Result<UsageInfo>> + Send + 'a>> {
            Box::pin(async { Ok(UsageInfo::default()) })
        }
    }

    struct Harness {
        coordinator: DispatchCoordinator,
        registry: Arc<AccountRegistry>,
        cooldowns: Arc<CooldownTracker>,
        token_client: Arc<CountingTokenClient>,
        upstream: Arc<ScriptedUpstream>,
        summarizer: Arc<StaticSummarizer>,
        _dir: tempfile::TempDir,
    }

    async fn harness_with(
        accounts: &[&str],
        script: Vec<Script>,
        rate_limit: RateLimitConfig,
        token_fails: bool,
        expires_at: u64,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let cooldowns = Arc::new(CooldownTracker::new());
        let quota_cache = Arc::new(QuotaCache::new(dir.path().join("quota_cache.json")));
        let selector = Arc::new(
            AccountSelector::load(quota_cache.clone(), dir.path().join("priority.json")).await,
        );
        let registry = Arc::new(
            AccountRegistry::load(
                dir.path().join("accounts.json"),
                None,
                cooldowns.clone(),
                quota_cache.clone(),
                selector,
            )
            .await,
        );
        for id in accounts {
            let path = dir.path().join(format!("{id}.json"));
            Credential {
                access_token: format!("at_{id}").into(),
                refresh_token: "rt".into(),
                expires_at,
                client_id: None,
                client_secret: None,
                region: String::new(),
                auth_method: codeassist_auth::AuthMethod::Social,
                profile_arn: None,
                client_id_hash: None,
            }
            .save(&path)
            .await
            .unwrap();
            registry
                .add_account(id, &id.to_uppercase(), path, true)
                .await
                .unwrap();
        }

        let usage_client = Arc::new(StubUsage);
        let scheduler = Arc::new(QuotaScheduler::new(
            quota_cache.clone(),
            usage_client,
            registry.clone(),
            Duration::from_secs(60),
            Duration::from_secs(300),
        ));
        let rate_limiter = Arc::new(RateLimiter::new(rate_limit));
        let refresh_manager = Arc::new(
            RefreshManager::new(RefreshConfig {
                retry_base_delay: 0.001,
                ..Default::default()
            })
            .unwrap(),
        );
        let compressor = Arc::new(HistoryCompressor::new(HistoryConfig::default()).unwrap());
        let token_client = CountingTokenClient::new(token_fails);
        let upstream = ScriptedUpstream::new(script);
        let summarizer = Arc::new(StaticSummarizer {
            calls: AtomicUsize::new(0),
        });

        let coordinator = DispatchCoordinator::new(
            registry.clone(),
            scheduler,
            rate_limiter,
            refresh_manager,
            cooldowns.clone(),
            quota_cache,
            compressor,
            token_client.clone(),
            upstream.clone(),
            summarizer.clone(),
        );

        Harness {
            coordinator,
            registry,
            cooldowns,
            token_client,
            upstream,
            summarizer,
            _dir: dir,
        }
    }

    fn far_future() -> u64 {
        codeassist_auth::now_millis() + 86_400_000
    }

    fn request() -> DispatchRequest {
        DispatchRequest {
            session_id: Some("session-1".into()),
            history: vec![
                HistoryEntry::user("hello"),
                HistoryEntry::assistant("hi there"),
            ],
            shape: HistoryShape::Generic,
            user_content: "next question".into(),
            model_id: None,
        }
    }

    fn big_request() -> DispatchRequest {
        let history: Vec<HistoryEntry> = (0..220)
            .map(|i| {
                let text = "x".repeat(1000);
                if i % 2 == 0 {
                    HistoryEntry::user(text)
                } else {
                    HistoryEntry::assistant(text)
                }
            })
            .collect();
        DispatchRequest {
            session_id: Some("session-big".into()),
            history,
            shape: HistoryShape::Generic,
            user_content: String::new(),
            model_id: None,
        }
    }

    #[tokio::test]
    async fn happy_path_marks_account_used() {
        let h = harness_with(
            &["a"],
            vec![Script::Success],
            RateLimitConfig::default(),
            false,
            far_future(),
        )
        .await;

        let outcome = h.coordinator.dispatch(request()).await.unwrap();
        assert_eq!(outcome.account_id, "a");
        assert!(outcome.warning.is_none());

        let account = h.registry.get("a").unwrap();
        assert_eq!(account.request_count(), 1);
        assert_eq!(account.error_count(), 0);
        assert!(account.last_used().is_some());
    }

    #[tokio::test]
    async fn no_accounts_fails_fast() {
        let h = harness_with(
            &[],
            vec![],
            RateLimitConfig::default(),
            false,
            far_future(),
        )
        .await;
        let err = h.coordinator.dispatch(request()).await.unwrap_err();
        assert!(matches!(err, Error::NoAvailableAccount));
        assert_eq!(h.upstream.calls(), 0);
    }

    #[tokio::test]
    async fn throttle_without_limiter_bumps_errors_only() {
        let h = harness_with(
            &["a", "b"],
            vec![Script::Status(429, "slow down"), Script::Success],
            RateLimitConfig::default(), // disabled
            false,
            far_future(),
        )
        .await;

        // "a" is picked first (lowest request count tie broken by balance
        // ranking; make it deterministic via priority)
        h.registry
            .selector()
            .set_priority_accounts(vec!["a".into()], &h.registry.valid_account_ids())
            .await
            .unwrap();

        let outcome = h.coordinator.dispatch(request()).await.unwrap();
        assert_eq!(outcome.account_id, "b");

        let throttled = h.registry.get("a").unwrap();
        assert_eq!(throttled.error_count(), 1);
        assert!(
            h.cooldowns.is_available("a"),
            "no cooldown while the limiter is disabled"
        );
        assert!(throttled.is_available(&h.cooldowns, h.registry.quota_cache()));
    }

    #[tokio::test]
    async fn throttle_with_limiter_cools_down() {
        let mut config = RateLimitConfig::default();
        config.enabled = true;
        config.min_request_interval = 0.0;
        let h = harness_with(
            &["a", "b"],
            vec![Script::Status(429, "slow down"), Script::Success],
            config,
            false,
            far_future(),
        )
        .await;
        h.registry
            .selector()
            .set_priority_accounts(vec!["a".into()], &h.registry.valid_account_ids())
            .await
            .unwrap();

        let outcome = h.coordinator.dispatch(request()).await.unwrap();
        assert_eq!(outcome.account_id, "b");
        assert!(!h.cooldowns.is_available("a"), "cooldown recorded");
    }

    #[tokio::test]
    async fn exhausted_quota_disables_account() {
        let h = harness_with(
            &["a", "b"],
            vec![
                Script::Status(429, "monthly quota exceeded for plan"),
                Script::Success,
            ],
            RateLimitConfig::default(),
            false,
            far_future(),
        )
        .await;
        h.registry
            .selector()
            .set_priority_accounts(vec!["a".into()], &h.registry.valid_account_ids())
            .await
            .unwrap();

        let outcome = h.coordinator.dispatch(request()).await.unwrap();
        assert_eq!(outcome.account_id, "b");

        let exhausted = h.registry.get("a").unwrap();
        assert!(!exhausted.enabled());
        let snapshot = h.registry.quota_cache().get("a").unwrap();
        assert!(snapshot.is_exhausted);
    }

    #[tokio::test]
    async fn auth_failure_replays_once_after_refresh() {
        let h = harness_with(
            &["a"],
            vec![Script::Status(401, "token expired"), Script::Success],
            RateLimitConfig::default(),
            false,
            far_future(),
        )
        .await;

        let outcome = h.coordinator.dispatch(request()).await.unwrap();
        assert_eq!(outcome.account_id, "a");
        assert_eq!(h.upstream.calls(), 2, "forward ran exactly twice");
        assert_eq!(
            h.token_client.calls.load(Ordering::SeqCst),
            1,
            "token refreshed exactly once"
        );
    }

    #[tokio::test]
    async fn persistent_auth_failure_surfaces() {
        let h = harness_with(
            &["a"],
            vec![
                Script::Status(401, "token expired"),
                Script::Status(401, "token expired"),
            ],
            RateLimitConfig::default(),
            false,
            far_future(),
        )
        .await;

        let err = h.coordinator.dispatch(request()).await.unwrap_err();
        assert!(matches!(err, Error::UpstreamAuthFailed(_)));
        assert_eq!(h.upstream.calls(), 2);
        assert_eq!(h.registry.get("a").unwrap().error_count(), 1);
    }

    #[tokio::test]
    async fn oversized_history_is_compressed_before_send() {
        let h = harness_with(
            &["a"],
            vec![Script::Success],
            RateLimitConfig::default(),
            false,
            far_future(),
        )
        .await;

        let outcome = h.coordinator.dispatch(big_request()).await.unwrap();
        assert!(outcome.warning.is_some(), "truncation note surfaces");
        assert!(h.summarizer.calls.load(Ordering::SeqCst) >= 1);
        // the upstream saw the compressed window, not 220 entries
        assert!(h.upstream.last_history_len.load(Ordering::SeqCst) < 30);
    }

    #[tokio::test]
    async fn length_error_recompresses_and_retries_same_account() {
        let h = harness_with(
            &["a"],
            vec![
                Script::Status(400, "CONTENT_LENGTH_EXCEEDS_THRESHOLD"),
                Script::Success,
            ],
            RateLimitConfig::default(),
            false,
            far_future(),
        )
        .await;

        let outcome = h.coordinator.dispatch(big_request()).await.unwrap();
        assert_eq!(outcome.account_id, "a");
        assert_eq!(h.upstream.calls(), 2);
    }

    #[tokio::test]
    async fn persistent_length_error_gives_up_after_max_retries() {
        let h = harness_with(
            &["a"],
            vec![
                Script::Status(400, "Input is too long"),
                Script::Status(400, "Input is too long"),
                Script::Status(400, "Input is too long"),
                Script::Status(400, "Input is too long"),
                Script::Status(400, "Input is too long"),
            ],
            RateLimitConfig::default(),
            false,
            far_future(),
        )
        .await;

        let err = h.coordinator.dispatch(big_request()).await.unwrap_err();
        assert!(matches!(err, Error::InputTooLong(_)));
        // first attempt + max_retries recompression retries
        assert_eq!(h.upstream.calls(), 4);
        assert_eq!(h.registry.get("a").unwrap().error_count(), 1);
    }

    #[tokio::test]
    async fn transient_errors_fail_over() {
        let h = harness_with(
            &["a", "b"],
            vec![Script::Status(503, "unavailable"), Script::Success],
            RateLimitConfig::default(),
            false,
            far_future(),
        )
        .await;
        h.registry
            .selector()
            .set_priority_accounts(vec!["a".into()], &h.registry.valid_account_ids())
            .await
            .unwrap();

        let outcome = h.coordinator.dispatch(request()).await.unwrap();
        assert_eq!(outcome.account_id, "b");
        assert_eq!(h.registry.get("a").unwrap().error_count(), 1);
    }

    #[tokio::test]
    async fn single_account_transient_exhausts_failover() {
        let h = harness_with(
            &["a"],
            vec![Script::Status(503, "unavailable")],
            RateLimitConfig::default(),
            false,
            far_future(),
        )
        .await;

        let err = h.coordinator.dispatch(request()).await.unwrap_err();
        assert!(matches!(err, Error::UpstreamTransient(_)));
    }

    #[tokio::test]
    async fn terminal_token_failure_surfaces_when_no_other_account() {
        // expiring token + failing refresh endpoint
        let h = harness_with(
            &["a"],
            vec![],
            RateLimitConfig::default(),
            true,
            codeassist_auth::now_millis() + 1_000,
        )
        .await;

        let err = h.coordinator.dispatch(request()).await.unwrap_err();
        assert!(matches!(err, Error::TokenRefreshFailed(_)));
        assert_eq!(h.upstream.calls(), 0);
        assert_eq!(
            h.registry.get("a").unwrap().status(),
            crate::account::AccountStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn session_sticks_to_the_serving_account() {
        let h = harness_with(
            &["a", "b"],
            vec![Script::Success, Script::Success],
            RateLimitConfig::default(),
            false,
            far_future(),
        )
        .await;

        let first = h.coordinator.dispatch(request()).await.unwrap();
        let second = h.coordinator.dispatch(request()).await.unwrap();
        assert_eq!(first.account_id, second.account_id);
    }
}
