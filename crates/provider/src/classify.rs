//! Upstream reply classification
//!
//! Distinguishes pace throttles from quota exhaustion on 429s, and detects
//! input-length overruns buried in error bodies. Dispatch uses the verdict
//! to decide between retry, failover, cooldown, token replay, and history
//! recompression.

use crate::ErrorClassification;

/// Phrases marking a 429 as subscription-quota exhaustion rather than a
/// transient per-minute throttle.
const QUOTA_EXHAUSTED_PATTERNS: &[&str] = &[
    "quota exceeded",
    "quota exhausted",
    "usage limit reached",
    "usage limit for your plan",
    "insufficient balance",
];

/// Generic prose markers of an input-length overrun, checked after the
/// upstream's explicit codes.
const LENGTH_ERROR_PATTERNS: &[&str] = &["context length", "token limit"];

/// Check a response body for quota-exhaustion phrasing (case-insensitive).
pub fn is_quota_exhausted_message(body: &str) -> bool {
    let lower = body.to_lowercase();
    QUOTA_EXHAUSTED_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Check a response body for an input-length overrun.
///
/// Matches the upstream's explicit code, the literal "Input is too long",
/// a case-insensitive "too long" co-occurring with input/content/message,
/// or the generic context-length / token-limit phrasings.
pub fn is_length_error(body: &str) -> bool {
    if body.contains("CONTENT_LENGTH_EXCEEDS_THRESHOLD") || body.contains("Input is too long") {
        return true;
    }
    let lower = body.to_lowercase();
    if lower.contains("too long")
        && (lower.contains("input") || lower.contains("content") || lower.contains("message"))
    {
        return true;
    }
    LENGTH_ERROR_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Classify an upstream failure by HTTP status and response body.
///
/// 429 bodies are inspected for exhaustion phrasing; that is the hook that
/// downgrades a rate-limit reply to a terminal per-account exhaustion.
/// Length overruns are detected body-first since upstreams report them with
/// varying 4xx statuses.
pub fn classify_status(status: u16, body: &str) -> ErrorClassification {
    if is_length_error(body) {
        return ErrorClassification::InputTooLong;
    }
    match status {
        429 => {
            if is_quota_exhausted_message(body) {
                ErrorClassification::QuotaExhausted
            } else {
                ErrorClassification::RateLimited
            }
        }
        401 | 403 => ErrorClassification::AuthFailed,
        _ => ErrorClassification::Transient,
    }
}
