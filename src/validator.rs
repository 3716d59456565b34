//! Inbound client validator: cryptographically-unhelpful but
//! policy-critical gating that only the two approved CLIs may use the relay.
//!
//! Total on any input: validation failures are reported, never panicked.

use std::sync::LazyLock;

use axum::http::HeaderMap;
use regex::Regex;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientType {
    CodeCli,
    CodexCli,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub client_type: ClientType,
    pub reason: Option<String>,
    pub version: Option<String>,
}

impl ValidationOutcome {
    fn reject(reason: &str) -> Self {
        Self { valid: false, client_type: ClientType::Unknown, reason: Some(reason.to_string()), version: None }
    }

    fn accept(client_type: ClientType, version: Option<String>) -> Self {
        Self { valid: true, client_type, reason: None, version }
    }
}

/// Case-insensitive header lookup, shared by both CLI profiles.
fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_nonblank(headers: &HeaderMap, name: &str) -> bool {
    header_str(headers, name).is_some_and(|v| !v.trim().is_empty())
}

// ---------------------------------------------------------------------------
// semver parse/compare, shared with the headers cache (§4.5).
// ---------------------------------------------------------------------------

pub mod semver {
    /// Numeric-tuple parse; missing parts default to 0. Tolerant of trailing
    /// prerelease/build suffixes (e.g. `1.2.3-beta`).
    pub fn parse(raw: &str) -> (u32, u32, u32) {
        let core = raw.split(['-', '+']).next().unwrap_or(raw);
        let mut parts = core.split('.').map(|p| p.parse::<u32>().unwrap_or(0));
        (
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
        )
    }

    pub fn is_strictly_greater(candidate: &str, current: &str) -> bool {
        parse(candidate) > parse(current)
    }
}

// ---------------------------------------------------------------------------
// Code-assistant CLI ("claude-cli")
// ---------------------------------------------------------------------------

static CODE_CLI_UA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^claude-cli/([\d.]+)(?:\S*)?\s+\(external,\s*(cli|claude-[\w-]+|sdk-[\w-]+)\)$")
        .expect("valid regex")
});

static CODE_CLI_USER_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^user_[a-fA-F0-9]{64}_account__session_[\w-]+$").expect("valid regex"));

const CODE_CLI_KEYWORDS: &[&str] =
    &["You are Claude Code", "coding assistant", "Anthropic", "tools you can use"];

fn system_text_parts(body: &Value) -> Vec<String> {
    let Some(system) = body.get("system") else {
        return Vec::new();
    };
    match system {
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str).map(str::to_string))
            .collect(),
        Value::String(s) => vec![s.clone()],
        _ => Vec::new(),
    }
}

fn system_prompt_similarity(body: &Value) -> f64 {
    let texts = system_text_parts(body);
    if texts.is_empty() {
        return 0.0;
    }
    let joined = texts.join(" ");
    let matched = CODE_CLI_KEYWORDS.iter().filter(|kw| joined.contains(*kw)).count();
    matched as f64 / CODE_CLI_KEYWORDS.len() as f64
}

fn validate_code_cli(headers: &HeaderMap, body: &Value, path: &str) -> Option<ValidationOutcome> {
    let ua = header_str(headers, "user-agent")?;
    let captures = CODE_CLI_UA_RE.captures(ua)?;
    let version = captures.get(1).map(|m| m.as_str().to_string());

    if !path.contains("messages") {
        return Some(ValidationOutcome::accept(ClientType::CodeCli, version));
    }

    if system_prompt_similarity(body) < 0.8 {
        return None;
    }
    if body.get("model").and_then(Value::as_str).is_none() {
        return None;
    }
    for header in ["x-app", "anthropic-beta", "anthropic-version"] {
        if !header_nonblank(headers, header) {
            return None;
        }
    }
    let user_id = body.get("metadata").and_then(|m| m.get("user_id")).and_then(Value::as_str)?;
    if !CODE_CLI_USER_ID_RE.is_match(user_id) {
        return None;
    }

    Some(ValidationOutcome::accept(ClientType::CodeCli, version))
}

// ---------------------------------------------------------------------------
// Codex CLI
// ---------------------------------------------------------------------------

static CODEX_UA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(codex_vscode|codex_cli_rs)/([\d.]+)").expect("valid regex"));

const CODEX_INSTRUCTIONS_PREFIX: &str =
    "You are a coding agent running in the Codex CLI, a terminal-based coding assistant.";

fn validate_codex_cli(headers: &HeaderMap, body: &Value, path: &str) -> Option<ValidationOutcome> {
    let ua = header_str(headers, "user-agent")?;
    let captures = CODEX_UA_RE.captures(ua)?;
    let client_kind = captures.get(1)?.as_str().to_string();
    let version = captures.get(2).map(|m| m.as_str().to_string());

    if !(path.starts_with("/openai") || path.starts_with("/azure")) {
        return Some(ValidationOutcome::accept(ClientType::CodexCli, version));
    }

    let originator = header_str(headers, "originator")?;
    if !originator.eq_ignore_ascii_case(&client_kind) {
        return None;
    }
    let session_id = header_str(headers, "session_id")?;
    if session_id.len() <= 20 {
        return None;
    }
    if path.contains("/openai/responses") || path.contains("/azure/response") {
        let instructions = body.get("instructions").and_then(Value::as_str)?;
        if !instructions.starts_with(CODEX_INSTRUCTIONS_PREFIX) {
            return None;
        }
    }

    Some(ValidationOutcome::accept(ClientType::CodexCli, version))
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Accept iff the request matches one of the two approved CLI profiles.
/// Total: any internal failure (missing header, malformed body) falls
/// through to rejection rather than propagating an error.
pub fn validate(headers: &HeaderMap, body: &Value, path: &str) -> ValidationOutcome {
    if let Some(outcome) = validate_code_cli(headers, body, path) {
        return outcome;
    }
    if let Some(outcome) = validate_codex_cli(headers, body, path) {
        return outcome;
    }
    ValidationOutcome::reject("Validation error")
}
