//! Error types for the dispatch core
//!
//! Every failure surfaced to callers carries a stable kind identifier
//! (for admin payloads and tests) plus a human-readable message.

/// Errors from the account-lifecycle and dispatch engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("account not found: {0}")]
    NotFound(String),

    #[error("no available account")]
    NoAvailableAccount,

    #[error("token refresh failed: {0}")]
    TokenRefreshFailed(String),

    #[error("upstream rate limited: {0}")]
    UpstreamRateLimited(String),

    #[error("upstream auth failed: {0}")]
    UpstreamAuthFailed(String),

    #[error("upstream quota exhausted: {0}")]
    UpstreamQuotaExhausted(String),

    #[error("input too long: {0}")]
    InputTooLong(String),

    #[error("upstream transient error: {0}")]
    UpstreamTransient(String),

    #[error("request cancelled")]
    Cancelled,
}

impl Error {
    /// Stable machine-readable identifier for this error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ConfigInvalid(_) => "config_invalid",
            Error::NotFound(_) => "not_found",
            Error::NoAvailableAccount => "no_available_account",
            Error::TokenRefreshFailed(_) => "token_refresh_failed",
            Error::UpstreamRateLimited(_) => "upstream_rate_limited",
            Error::UpstreamAuthFailed(_) => "upstream_auth_failed",
            Error::UpstreamQuotaExhausted(_) => "upstream_quota_exhausted",
            Error::InputTooLong(_) => "input_too_long",
            Error::UpstreamTransient(_) => "upstream_transient",
            Error::Cancelled => "cancelled",
        }
    }
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
