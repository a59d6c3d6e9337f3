//! Capability seams between the dispatch core and the outside world
//!
//! The core never talks HTTP itself. Four narrow traits cover everything it
//! consumes: token refresh against the auth endpoint, usage fetch, upstream
//! forwarding, and history summarization. The gateway binary provides
//! reqwest-backed implementations; tests provide hand-written mocks with
//! call counters.
//!
//! Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
//! (`Arc<dyn UsageClient>` etc.).

pub mod classify;

pub use classify::{classify_status, is_length_error, is_quota_exhausted_message};

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use codeassist_auth::Credential;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

/// Classification of an upstream reply, driving retry/failover strategy.
///
/// - `Transient` retries on another account (timeouts, 5xx)
/// - `RateLimited` is a pace throttle; cools the account down only when the
///   rate limiter is enabled
/// - `QuotaExhausted` is terminal for the account until its quota refills
/// - `AuthFailed` triggers one token refresh + replay
/// - `InputTooLong` triggers history recompression on the same account
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    Transient,
    RateLimited,
    QuotaExhausted,
    AuthFailed,
    InputTooLong,
}

/// Result of a credential refresh against the auth endpoint.
///
/// `expires_at` is an absolute unix timestamp in milliseconds, already
/// converted from whatever delta the endpoint reported.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    /// Some endpoints rotate the refresh token, some echo the old one.
    pub refresh_token: Option<String>,
    pub expires_at: u64,
}

/// Per-account usage numbers reported by the usage endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageInfo {
    pub subscription_title: String,
    pub usage_limit: f64,
    pub current_usage: f64,
    pub free_trial_limit: f64,
    pub free_trial_usage: f64,
    pub bonus_limit: f64,
    pub bonus_usage: f64,
}

impl UsageInfo {
    /// Remaining quota.
    pub fn balance(&self) -> f64 {
        self.usage_limit - self.current_usage
    }
}

/// A prepared forward request: serialized history entries plus the pending
/// user content. Dialect translation happens outside the core; the history
/// values are already in the wire shape the upstream expects.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub history: Vec<serde_json::Value>,
    pub user_content: String,
    pub model_id: Option<String>,
}

/// Streamed 2xx response body.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Outcome of a forward: a byte stream on success, or a buffered error body
/// for classification. Non-2xx statuses are not transport errors.
pub enum UpstreamReply {
    Stream(ByteStream),
    Failure { status: u16, body: String },
}

impl std::fmt::Debug for UpstreamReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamReply::Stream(_) => f.write_str("UpstreamReply::Stream(..)"),
            UpstreamReply::Failure { status, body } => f
                .debug_struct("Failure")
                .field("status", status)
                .field("body", body)
                .finish(),
        }
    }
}

/// Errors from provider calls (network failures, unusable responses).
///
/// The Display text is what the refresh manager's string classifiers see,
/// so endpoint failures embed the HTTP status verbatim.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Http(String),

    #[error("endpoint returned {status}: {body}")]
    Endpoint { status: u16, body: String },

    #[error("invalid response: {0}")]
    Invalid(String),
}

/// Result alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Refreshes credentials against the auth endpoint.
pub trait TokenClient: Send + Sync {
    fn refresh<'a>(
        &'a self,
        credential: &'a Credential,
    ) -> Pin<Box<dyn Future<Output = Result<RefreshedToken>> + Send + 'a>>;
}

/// Fetches per-account usage/quota numbers.
pub trait UsageClient: Send + Sync {
    fn fetch_usage<'a>(
        &'a self,
        credential: &'a Credential,
        machine_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<UsageInfo>> + Send + 'a>>;
}

/// Forwards a prepared request to the upstream code-assist service.
pub trait UpstreamClient: Send + Sync {
    fn forward<'a>(
        &'a self,
        request: &'a UpstreamRequest,
        access_token: &'a str,
        machine_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamReply>> + Send + 'a>>;
}

/// Produces a conversation summary for history compression.
pub trait SummaryClient: Send + Sync {
    fn summarize<'a>(
        &'a self,
        prompt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;
}
