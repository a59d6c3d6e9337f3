//! Inbound history parsing
//!
//! The dialect translators hand the gateway history entries as JSON in one
//! of two envelopes; this module detects which and lifts them into the
//! core's typed entries so the compressor can work shape-preserving.

use codeassist_pool::HistoryShape;
use codeassist_pool::history::{HistoryEntry, ToolResult, ToolUse};
use serde_json::Value;

/// Detect the envelope and parse every entry. Entries that fit neither
/// envelope are rejected by index.
pub fn parse_history(values: &[Value]) -> Result<(Vec<HistoryEntry>, HistoryShape), String> {
    let shape = if values
        .iter()
        .any(|v| v.get("userInputMessage").is_some() || v.get("assistantResponseMessage").is_some())
    {
        HistoryShape::Framed
    } else {
        HistoryShape::Generic
    };

    let mut entries = Vec::with_capacity(values.len());
    for (index, value) in values.iter().enumerate() {
        match parse_entry(value) {
            Some(entry) => entries.push(entry),
            None => return Err(format!("unrecognized history entry at index {index}")),
        }
    }
    Ok((entries, shape))
}

fn parse_entry(value: &Value) -> Option<HistoryEntry> {
    if let Some(message) = value.get("userInputMessage") {
        return Some(HistoryEntry::User {
            text: text_of(message.get("content"))?,
            model_id: message
                .get("modelId")
                .and_then(Value::as_str)
                .map(str::to_string),
            tool_results: message
                .get("userInputMessageContext")
                .and_then(|context| context.get("toolResults"))
                .map(parse_tool_results)
                .unwrap_or_default(),
        });
    }
    if let Some(message) = value.get("assistantResponseMessage") {
        return Some(HistoryEntry::Assistant {
            text: text_of(message.get("content"))?,
            model_id: message
                .get("modelId")
                .and_then(Value::as_str)
                .map(str::to_string),
            tool_uses: message
                .get("toolUses")
                .map(parse_tool_uses)
                .unwrap_or_default(),
        });
    }

    let role = value.get("role")?.as_str()?;
    let text = text_of(value.get("content"))?;
    match role {
        "user" => Some(HistoryEntry::User {
            text,
            model_id: None,
            tool_results: value
                .get("toolResults")
                .map(parse_tool_results)
                .unwrap_or_default(),
        }),
        "assistant" => Some(HistoryEntry::Assistant {
            text,
            model_id: None,
            tool_uses: value.get("toolUses").map(parse_tool_uses).unwrap_or_default(),
        }),
        _ => None,
    }
}

/// Content is usually a string; text blocks are concatenated.
fn text_of(content: Option<&Value>) -> Option<String> {
    match content? {
        Value::String(text) => Some(text.clone()),
        Value::Array(blocks) => Some(
            blocks
                .iter()
                .filter_map(|block| match block {
                    Value::String(text) => Some(text.as_str()),
                    Value::Object(_) => block.get("text").and_then(Value::as_str),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        _ => None,
    }
}

fn parse_tool_results(value: &Value) -> Vec<ToolResult> {
    value
        .as_array()
        .map(|results| {
            results
                .iter()
                .filter_map(|result| {
                    Some(ToolResult {
                        tool_use_id: result.get("toolUseId")?.as_str()?.to_string(),
                        content: result.get("content").cloned().unwrap_or(Value::Null),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_tool_uses(value: &Value) -> Vec<ToolUse> {
    value
        .as_array()
        .map(|uses| {
            uses.iter()
                .filter_map(|tool_use| {
                    Some(ToolUse {
                        tool_use_id: tool_use.get("toolUseId")?.as_str()?.to_string(),
                        name: tool_use
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        input: tool_use.get("input").cloned().unwrap_or(Value::Null),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}
