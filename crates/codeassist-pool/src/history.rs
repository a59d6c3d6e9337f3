//! Conversation history compression
//!
//! Shields the upstream input ceiling: oversized histories are compressed
//! by keeping a window of recent turns and replacing everything older with
//! a model-generated summary, framed as a synthetic user/assistant exchange
//! at the front of the conversation. Compression runs before a forward when
//! the size check trips, and again (with shrinking targets) when the
//! upstream rejects a request as too long.
//!
//! Two wire envelopes exist for history entries: the framed shape
//! (`userInputMessage`/`assistantResponseMessage`) and the generic
//! role+content shape. The compressor preserves whichever shape the input
//! arrived in.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use provider::SummaryClient;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Serialized size above which a history is compressed before sending.
pub const AUTO_COMPRESS_THRESHOLD: usize = 120_000;

/// Compression target in characters.
pub const SAFE_CHAR_LIMIT: usize = 100_000;

/// Minimum recent entries kept verbatim.
pub const MIN_KEEP_MESSAGES: usize = 6;

/// Maximum recent entries kept verbatim.
pub const MAX_KEEP_MESSAGES: usize = 20;

/// Upper bound on the generated summary.
pub const SUMMARY_MAX_LENGTH: usize = 3000;

/// Bounded size of the summary cache.
const SUMMARY_CACHE_MAX_ENTRIES: usize = 64;

/// Model id used for the synthetic summary turn when the recent window
/// carries none.
const DEFAULT_MODEL_ID: &str = "claude-sonnet-4";

/// Wire envelope of a conversation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryShape {
    /// `userInputMessage` / `assistantResponseMessage` envelopes
    Framed,
    /// `role` + `content` envelopes
    Generic,
}

/// A tool invocation recorded on an assistant turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUse {
    pub tool_use_id: String,
    pub name: String,
    pub input: Value,
}

/// A tool result attached to a user turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub content: Value,
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryEntry {
    User {
        text: String,
        model_id: Option<String>,
        tool_results: Vec<ToolResult>,
    },
    Assistant {
        text: String,
        model_id: Option<String>,
        tool_uses: Vec<ToolUse>,
    },
}

impl HistoryEntry {
    pub fn user(text: impl Into<String>) -> Self {
        HistoryEntry::User {
            text: text.into(),
            model_id: None,
            tool_results: Vec::new(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        HistoryEntry::Assistant {
            text: text.into(),
            model_id: None,
            tool_uses: Vec::new(),
        }
    }

    fn text(&self) -> &str {
        match self {
            HistoryEntry::User { text, .. } | HistoryEntry::Assistant { text, .. } => text,
        }
    }

    fn model_id(&self) -> Option<&str> {
        match self {
            HistoryEntry::User { model_id, .. } | HistoryEntry::Assistant { model_id, .. } => {
                model_id.as_deref()
            }
        }
    }

    /// Serialize into the given wire envelope.
    pub fn to_value(&self, shape: HistoryShape) -> Value {
        match self {
            HistoryEntry::User {
                text,
                model_id,
                tool_results,
            } => {
                let results: Vec<Value> = tool_results
                    .iter()
                    .map(|r| json!({"toolUseId": r.tool_use_id, "content": r.content}))
                    .collect();
                match shape {
                    HistoryShape::Framed => {
                        let mut message = json!({"content": text, "origin": "AI_EDITOR"});
                        if let Some(model_id) = model_id {
                            message["modelId"] = json!(model_id);
                        }
                        if !results.is_empty() {
                            message["userInputMessageContext"] = json!({"toolResults": results});
                        }
                        json!({"userInputMessage": message})
                    }
                    HistoryShape::Generic => {
                        let mut value = json!({"role": "user", "content": text});
                        if !results.is_empty() {
                            value["toolResults"] = json!(results);
                        }
                        value
                    }
                }
            }
            HistoryEntry::Assistant {
                text,
                model_id,
                tool_uses,
            } => {
                let uses: Vec<Value> = tool_uses
                    .iter()
                    .map(|u| json!({"toolUseId": u.tool_use_id, "name": u.name, "input": u.input}))
                    .collect();
                match shape {
                    HistoryShape::Framed => {
                        let mut message = json!({"content": text});
                        if let Some(model_id) = model_id {
                            message["modelId"] = json!(model_id);
                        }
                        if !uses.is_empty() {
                            message["toolUses"] = json!(uses);
                        }
                        json!({"assistantResponseMessage": message})
                    }
                    HistoryShape::Generic => {
                        let mut value = json!({"role": "assistant", "content": text});
                        if !uses.is_empty() {
                            value["toolUses"] = json!(uses);
                        }
                        value
                    }
                }
            }
        }
    }
}

/// Serialize a whole history into its wire envelope.
pub fn serialize_history(history: &[HistoryEntry], shape: HistoryShape) -> Vec<Value> {
    history.iter().map(|e| e.to_value(shape)).collect()
}

/// Character length of the serialized history.
pub fn serialized_len(history: &[HistoryEntry], shape: HistoryShape) -> usize {
    serde_json::to_string(&serialize_history(history, shape))
        .map(|s| s.len())
        .unwrap_or(0)
}

fn entry_len(entry: &HistoryEntry, shape: HistoryShape) -> usize {
    serde_json::to_string(&entry.to_value(shape))
        .map(|s| s.len())
        .unwrap_or(0)
}

/// History compression knobs, settable through the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Compression strategies in effect; error-driven recompression only
    /// runs while `ErrorRetry` is present
    pub strategies: Vec<CompressionStrategy>,
    /// Recompression attempts after upstream length errors
    pub max_retries: u32,
    /// Rough token estimation divisor
    pub chars_per_token: f64,
    pub summary_cache_enabled: bool,
    pub summary_cache_max_age_seconds: u64,
    /// Expose the truncation note for the transport to attach as a header
    pub add_warning_header: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionStrategy {
    /// Recompress and retry on upstream length errors
    ErrorRetry,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            strategies: vec![CompressionStrategy::ErrorRetry],
            max_retries: 3,
            chars_per_token: 3.0,
            summary_cache_enabled: true,
            summary_cache_max_age_seconds: 300,
            add_warning_header: true,
        }
    }
}

impl HistoryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chars_per_token <= 0.0 {
            return Err(Error::ConfigInvalid(
                "chars_per_token must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Result of a compression attempt.
#[derive(Debug, Clone)]
pub struct CompressionOutcome {
    pub history: Vec<HistoryEntry>,
    pub truncated: bool,
    pub info: String,
}

impl CompressionOutcome {
    fn unchanged(history: Vec<HistoryEntry>) -> Self {
        Self {
            history,
            truncated: false,
            info: String::new(),
        }
    }
}

struct SummaryCacheEntry {
    summary: String,
    old_history_hash: String,
    updated_at: Instant,
    last_access: u64,
}

/// Bounded LRU of conversation summaries, keyed by `(cache_key, keep)`.
struct SummaryCache {
    entries: HashMap<String, SummaryCacheEntry>,
    tick: u64,
}

impl SummaryCache {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            tick: 0,
        }
    }

    fn get(&mut self, key: &str, old_history_hash: &str, max_age: Duration) -> Option<String> {
        let expired = match self.entries.get(key) {
            None => return None,
            Some(entry) => entry.updated_at.elapsed() > max_age,
        };
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.tick += 1;
        let tick = self.tick;
        let entry = self.entries.get_mut(key)?;
        if entry.old_history_hash != old_history_hash {
            return None;
        }
        entry.last_access = tick;
        Some(entry.summary.clone())
    }

    fn insert(&mut self, key: String, summary: String, old_history_hash: String) {
        self.tick += 1;
        self.entries.insert(
            key,
            SummaryCacheEntry {
                summary,
                old_history_hash,
                updated_at: Instant::now(),
                last_access: self.tick,
            },
        );
        if self.entries.len() > SUMMARY_CACHE_MAX_ENTRIES {
            if let Some(lru_key) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(key, _)| key.clone())
            {
                self.entries.remove(&lru_key);
            }
        }
    }
}

/// Summary-based history compressor.
pub struct HistoryCompressor {
    config: Mutex<HistoryConfig>,
    cache: Mutex<SummaryCache>,
}

impl HistoryCompressor {
    pub fn new(config: HistoryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Mutex::new(config),
            cache: Mutex::new(SummaryCache::new()),
        })
    }

    pub fn config(&self) -> HistoryConfig {
        crate::lock(&self.config).clone()
    }

    pub fn set_config(&self, config: HistoryConfig) -> Result<()> {
        config.validate()?;
        *crate::lock(&self.config) = config;
        Ok(())
    }

    /// Rough token estimate for a text.
    pub fn estimate_tokens(&self, text: &str) -> usize {
        (text.len() as f64 / crate::lock(&self.config).chars_per_token) as usize
    }

    /// Size check: serialized history plus pending user content.
    pub fn needs_compression(
        &self,
        history: &[HistoryEntry],
        user_content: &str,
        shape: HistoryShape,
    ) -> bool {
        if history.is_empty() {
            return false;
        }
        serialized_len(history, shape) + user_content.len() > AUTO_COMPRESS_THRESHOLD
    }

    /// Pre-send pass: compress when the size check trips, otherwise pass
    /// the history through untouched.
    pub async fn pre_process(
        &self,
        history: Vec<HistoryEntry>,
        user_content: &str,
        shape: HistoryShape,
        summarizer: &dyn SummaryClient,
        cache_key: Option<&str>,
    ) -> CompressionOutcome {
        if !self.needs_compression(&history, user_content, shape) {
            return CompressionOutcome::unchanged(history);
        }
        self.smart_compress(history, shape, summarizer, SAFE_CHAR_LIMIT, 0, cache_key)
            .await
    }

    /// Compress: keep a recent window, summarize the rest.
    ///
    /// `retry_level` shrinks the target by 0.8 per level for error-driven
    /// recompression. When the summarizer yields nothing the old turns are
    /// dropped entirely and only the recent window survives.
    pub async fn smart_compress(
        &self,
        history: Vec<HistoryEntry>,
        shape: HistoryShape,
        summarizer: &dyn SummaryClient,
        target_chars: usize,
        retry_level: u32,
        cache_key: Option<&str>,
    ) -> CompressionOutcome {
        if history.is_empty() {
            return CompressionOutcome::unchanged(history);
        }
        let original_len = history.len();
        let adjusted_target = (target_chars as f64 * 0.8f64.powi(retry_level as i32)) as usize;
        if serialized_len(&history, shape) <= adjusted_target {
            return CompressionOutcome::unchanged(history);
        }

        let mut keep = self.calculate_keep_count(&history, shape, adjusted_target);
        if keep >= original_len {
            keep = MIN_KEEP_MESSAGES.max(original_len.saturating_sub(2));
        }
        let keep = keep.min(original_len);

        let split_at = original_len - keep;
        let old: Vec<HistoryEntry> = history[..split_at].to_vec();
        let mut recent: Vec<HistoryEntry> = history[split_at..].to_vec();
        sanitize_recent(&mut recent);

        if old.is_empty() {
            return CompressionOutcome::unchanged(recent);
        }

        let old_hash = history_fingerprint(&old, shape);
        let (cache_enabled, max_age) = {
            let config = crate::lock(&self.config);
            (
                config.summary_cache_enabled,
                Duration::from_secs(config.summary_cache_max_age_seconds),
            )
        };
        let full_key = cache_key.map(|key| format!("{key}:{keep}"));

        if cache_enabled {
            if let Some(key) = full_key.as_deref() {
                let cached = crate::lock(&self.cache).get(key, &old_hash, max_age);
                if let Some(summary) = cached {
                    debug!(kept = recent.len(), "compressed history from cached summary");
                    let compressed = build_compressed(&summary, recent, shape);
                    return CompressionOutcome {
                        info: format!(
                            "compressed (cached summary): {original_len} -> {} entries",
                            compressed.len()
                        ),
                        history: compressed,
                        truncated: true,
                    };
                }
            }
        }

        match self.generate_summary(&old, summarizer).await {
            Some(summary) => {
                if cache_enabled {
                    if let Some(key) = full_key {
                        crate::lock(&self.cache).insert(key, summary.clone(), old_hash);
                    }
                }
                let summary_len = summary.chars().count();
                let compressed = build_compressed(&summary, recent, shape);
                CompressionOutcome {
                    info: format!(
                        "compressed: {original_len} -> {} entries (summary {summary_len} chars)",
                        compressed.len()
                    ),
                    history: compressed,
                    truncated: true,
                }
            }
            None => CompressionOutcome {
                info: format!("summary unavailable, keeping {} recent entries", recent.len()),
                truncated: true,
                history: recent,
            },
        }
    }

    /// Error-driven recompression after an upstream length rejection.
    /// Returns the (possibly) compressed history and whether a retry
    /// should happen.
    pub async fn handle_length_error(
        &self,
        history: Vec<HistoryEntry>,
        shape: HistoryShape,
        retry_count: u32,
        summarizer: &dyn SummaryClient,
        cache_key: Option<&str>,
    ) -> (CompressionOutcome, bool) {
        let (max_retries, error_retry_enabled) = {
            let config = crate::lock(&self.config);
            (
                config.max_retries,
                config.strategies.contains(&CompressionStrategy::ErrorRetry),
            )
        };
        if retry_count >= max_retries || !error_retry_enabled || history.is_empty() {
            return (CompressionOutcome::unchanged(history), false);
        }

        let outcome = self
            .smart_compress(
                history,
                shape,
                summarizer,
                SAFE_CHAR_LIMIT,
                retry_count,
                cache_key,
            )
            .await;
        (outcome, true)
    }

    /// Truncation note for the response headers, when enabled.
    pub fn warning_header(&self, outcome: &CompressionOutcome) -> Option<String> {
        if !crate::lock(&self.config).add_warning_header || !outcome.truncated {
            return None;
        }
        Some(outcome.info.clone())
    }

    /// Walk backwards accumulating entry sizes until the target is spent
    /// (with at least the minimum kept) or the maximum window is reached.
    fn calculate_keep_count(
        &self,
        history: &[HistoryEntry],
        shape: HistoryShape,
        target_chars: usize,
    ) -> usize {
        if history.is_empty() {
            return 0;
        }
        let mut total = 0usize;
        let mut count = 0usize;
        for entry in history.iter().rev() {
            let len = entry_len(entry, shape);
            if total + len > target_chars && count >= MIN_KEEP_MESSAGES {
                break;
            }
            total += len;
            count += 1;
            if count >= MAX_KEEP_MESSAGES {
                break;
            }
        }
        MIN_KEEP_MESSAGES.max(count.min(history.len().saturating_sub(1)))
    }

    async fn generate_summary(
        &self,
        old: &[HistoryEntry],
        summarizer: &dyn SummaryClient,
    ) -> Option<String> {
        if old.is_empty() {
            return None;
        }
        let prompt = summary_prompt(old);
        match summarizer.summarize(&prompt).await {
            Ok(summary) if !summary.trim().is_empty() => Some(clamp_summary(&summary)),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "summary generation failed");
                None
            }
        }
    }
}

/// Drop a leading assistant turn and strip tool results that no assistant
/// turn in the window accounts for. The first user turn loses its tool
/// results entirely, since nothing before it can have produced them.
fn sanitize_recent(recent: &mut Vec<HistoryEntry>) {
    if matches!(recent.first(), Some(HistoryEntry::Assistant { .. })) {
        recent.remove(0);
    }

    let tool_use_ids: HashSet<String> = recent
        .iter()
        .filter_map(|entry| match entry {
            HistoryEntry::Assistant { tool_uses, .. } => Some(tool_uses),
            _ => None,
        })
        .flatten()
        .map(|tool_use| tool_use.tool_use_id.clone())
        .collect();

    let mut first_user = true;
    for entry in recent.iter_mut() {
        if let HistoryEntry::User { tool_results, .. } = entry {
            if first_user {
                tool_results.clear();
                first_user = false;
            } else if tool_use_ids.is_empty() {
                tool_results.clear();
            } else {
                tool_results.retain(|result| tool_use_ids.contains(&result.tool_use_id));
            }
        }
    }
}

/// Cheap fingerprint of the summarized prefix: entry count + serialized
/// length.
fn history_fingerprint(history: &[HistoryEntry], shape: HistoryShape) -> String {
    format!("{}:{}", history.len(), serialized_len(history, shape))
}

/// Prepend the summary exchange to the kept window, in the window's shape.
fn build_compressed(
    summary: &str,
    recent: Vec<HistoryEntry>,
    _shape: HistoryShape,
) -> Vec<HistoryEntry> {
    let model_id = recent
        .iter()
        .rev()
        .find_map(|entry| entry.model_id().map(str::to_string))
        .unwrap_or_else(|| DEFAULT_MODEL_ID.to_string());

    let mut result = vec![
        HistoryEntry::User {
            text: format!(
                "[Earlier conversation summary]\n{summary}\n\n[Continuing from recent context...]"
            ),
            model_id: Some(model_id),
            tool_results: Vec::new(),
        },
        HistoryEntry::assistant("I understand the context from the summary. Let's continue."),
    ];
    result.extend(recent);
    result
}

fn summary_prompt(old: &[HistoryEntry]) -> String {
    let mut formatted = format_for_summary(old);
    if formatted.len() > 15_000 {
        formatted = formatted.chars().take(15_000).collect::<String>() + "\n...(truncated)";
    }
    format!(
        "Summarize the key information from the conversation below:\n\
         1. The user's main goals\n\
         2. Important actions taken and decisions made\n\
         3. Current working state and key context\n\n\
         Conversation:\n{formatted}\n\n\
         Keep the summary under {SUMMARY_MAX_LENGTH} characters and focus on \
         information useful for continuing the conversation:"
    )
}

fn format_for_summary(history: &[HistoryEntry]) -> String {
    history
        .iter()
        .map(|entry| {
            let role = match entry {
                HistoryEntry::User { .. } => "user",
                HistoryEntry::Assistant { .. } => "assistant",
            };
            let mut content = entry.text().to_string();
            if content.chars().count() > 800 {
                content = content.chars().take(800).collect::<String>() + "...";
            }
            format!("[{role}]: {content}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn clamp_summary(summary: &str) -> String {
    if summary.chars().count() <= SUMMARY_MAX_LENGTH {
        summary.to_string()
    } else {
        summary.chars().take(SUMMARY_MAX_LENGTH).collect::<String>() + "..."
    }
}
