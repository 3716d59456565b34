//! Session fingerprinter: derive a stable session identity
//! from a request body so a conversation reuses the same upstream account.
//!
//! Pure, total, no I/O. Four fallbacks, first match wins.

use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

static USER_ID_SESSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"session_([a-f0-9-]{36})").expect("valid regex"));

/// Flattened view of the `string | [{text}]` shape both the fingerprinter
/// and validator need to tolerate.
fn textual_content(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| {
                if let Value::String(s) = part {
                    Some(s.clone())
                } else {
                    part.get("text").and_then(Value::as_str).map(str::to_string)
                }
            })
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn sha256_32(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().take(16).map(|b| format!("{b:02x}")).collect()
}

/// Any `cache_control.type == "ephemeral"` part under `system[]` or
/// `messages[].content[]`.
fn has_ephemeral_cache_control(body: &Value) -> bool {
    let is_ephemeral = |part: &Value| {
        part.get("cache_control")
            .and_then(|cc| cc.get("type"))
            .and_then(Value::as_str)
            == Some("ephemeral")
    };

    if let Some(Value::Array(parts)) = body.get("system") {
        if parts.iter().any(is_ephemeral) {
            return true;
        }
    }
    if let Some(Value::Array(messages)) = body.get("messages") {
        for message in messages {
            if let Some(Value::Array(parts)) = message.get("content")
                && parts.iter().any(is_ephemeral)
            {
                return true;
            }
        }
    }
    false
}

/// The first message's textual content, for level-2 hashing.
fn first_message_text(body: &Value) -> Option<String> {
    let messages = body.get("messages")?.as_array()?;
    let first = messages.first()?;
    let content = first.get("content")?;
    let text = textual_content(content);
    (!text.is_empty()).then_some(text)
}

fn system_text(body: &Value) -> Option<String> {
    let system = body.get("system")?;
    let text = textual_content(system);
    (!text.is_empty()).then_some(text)
}

/// Runs the four-level fallback algorithm. Returns `None` iff no source
/// produces a non-empty value.
pub fn derive(body: &Value) -> Option<String> {
    // Level 1: provider-supplied session identity.
    if let Some(user_id) = body.get("metadata").and_then(|m| m.get("user_id")).and_then(Value::as_str)
        && let Some(captures) = USER_ID_SESSION_RE.captures(user_id)
    {
        return Some(captures[1].to_string());
    }

    // Level 2: prompt-caching boundary.
    if has_ephemeral_cache_control(body)
        && let Some(text) = first_message_text(body)
    {
        return Some(sha256_32(&text));
    }

    // Level 3: system prompt heuristic.
    if let Some(text) = system_text(body) {
        return Some(sha256_32(&text));
    }

    // Level 4: first message heuristic.
    if let Some(text) = first_message_text(body) {
        return Some(sha256_32(&text));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn level1_extracts_uuid_verbatim() {
        let body = json!({
            "metadata": { "user_id": "user_abc_account__session_11111111-1111-1111-1111-111111111111" }
        });
        assert_eq!(
            derive(&body).unwrap(),
            "11111111-1111-1111-1111-111111111111"
        );
    }

    #[test]
    fn level2_hashes_first_message_on_ephemeral_cache_control() {
        let body = json!({
            "system": [{"type": "text", "text": "preamble", "cache_control": {"type": "ephemeral"}}],
            "messages": [{"role": "user", "content": "hello there"}]
        });
        let fp = derive(&body).unwrap();
        assert_eq!(fp.len(), 32);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn level3_hashes_system_string() {
        let body = json!({ "system": "You are a helpful assistant", "messages": [] });
        let fp = derive(&body).unwrap();
        assert_eq!(fp.len(), 32);
    }

    #[test]
    fn level3_hashes_system_parts_array() {
        let a = json!({ "system": "same text", "messages": [] });
        let b = json!({ "system": [{"type": "text", "text": "same text"}], "messages": [] });
        assert_eq!(derive(&a), derive(&b));
    }

    #[test]
    fn level4_hashes_first_message() {
        let body = json!({ "messages": [{"role": "user", "content": "hi"}] });
        let fp = derive(&body).unwrap();
        assert_eq!(fp.len(), 32);
    }

    #[test]
    fn level4_handles_structured_content_parts() {
        let a = json!({ "messages": [{"role": "user", "content": "hi there"}] });
        let b = json!({ "messages": [{"role": "user", "content": [{"type": "text", "text": "hi there"}]}] });
        assert_eq!(derive(&a), derive(&b));
    }

    #[test]
    fn malformed_body_returns_none() {
        assert_eq!(derive(&json!({})), None);
        assert_eq!(derive(&json!({"messages": []})), None);
        assert_eq!(derive(&json!(null)), None);
    }

    #[test]
    fn stable_across_turns_distinct_across_conversations() {
        let conv_a_turn1 = json!({ "system": "conversation A", "messages": [{"role": "user", "content": "t1"}] });
        let conv_a_turn2 = json!({ "system": "conversation A", "messages": [{"role": "user", "content": "t2"}] });
        let conv_b = json!({ "system": "conversation B", "messages": [{"role": "user", "content": "t1"}] });
        assert_eq!(derive(&conv_a_turn1), derive(&conv_a_turn2));
        assert_ne!(derive(&conv_a_turn1), derive(&conv_b));
    }
}
