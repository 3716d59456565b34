//! Single-pass SSE usage scanner.
//!
//! Buffers incomplete frames across chunk boundaries and scans complete
//! `event:`/`data:` lines as they arrive. Never rewrites a byte — it only
//! watches them go by on the way to the client.

use serde_json::Value;

use crate::domain::{LongContextUsage, Usage};

#[derive(Debug, Default)]
struct PendingFrame {
    event: Option<String>,
    data: String,
}

/// Feed raw upstream bytes in; get `Usage` back exactly once, when
/// `message_stop` is observed. Tolerates `\n\n` or `\r\n\r\n` separators and
/// never buffers more than the current, not-yet-terminated frame.
#[derive(Default)]
pub struct SseUsageScanner {
    line_buffer: String,
    frame: PendingFrame,
    input_tokens: u64,
    cache_create_tokens: u64,
    cache_read_tokens: u64,
    output_tokens: u64,
    ephemeral_5m_tokens: Option<u64>,
    ephemeral_1h_tokens: Option<u64>,
    seen_message_start: bool,
    latched: Option<Usage>,
}

impl SseUsageScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `Some(Usage)` the first time `message_stop` is observed in
    /// this call's chunk; `None` otherwise (including on repeat calls after
    /// latching, per "emits one Usage object").
    pub fn feed(&mut self, chunk: &[u8]) -> Option<Usage> {
        if self.latched.is_some() {
            return None;
        }
        let text = String::from_utf8_lossy(chunk);
        self.line_buffer.push_str(&text);

        let mut result = None;
        loop {
            let Some(newline_pos) = self.line_buffer.find('\n') else { break };
            let raw_line = self.line_buffer[..newline_pos].to_string();
            self.line_buffer.drain(..=newline_pos);
            let line = raw_line.strip_suffix('\r').unwrap_or(&raw_line);

            if line.is_empty() {
                if let Some(usage) = self.flush_frame() {
                    result = Some(usage);
                }
                continue;
            }

            if let Some(event) = line.strip_prefix("event: ").or_else(|| line.strip_prefix("event:")) {
                self.frame.event = Some(event.trim().to_string());
            } else if let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) {
                self.frame.data.push_str(data.trim());
            }
        }
        result
    }

    fn flush_frame(&mut self) -> Option<Usage> {
        let frame = std::mem::take(&mut self.frame);
        let Some(event) = frame.event else { return None };
        if frame.data.is_empty() {
            return None;
        }
        let Ok(json): Result<Value, _> = serde_json::from_str(&frame.data) else { return None };

        match event.as_str() {
            "message_start" => {
                if let Some(usage) = json.get("message").and_then(|m| m.get("usage")) {
                    self.input_tokens = usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
                    self.cache_create_tokens =
                        usage.get("cache_creation_input_tokens").and_then(Value::as_u64).unwrap_or(0);
                    self.cache_read_tokens =
                        usage.get("cache_read_input_tokens").and_then(Value::as_u64).unwrap_or(0);
                    self.ephemeral_5m_tokens = usage
                        .get("cache_creation")
                        .and_then(|cc| cc.get("ephemeral_5m_input_tokens"))
                        .and_then(Value::as_u64);
                    self.ephemeral_1h_tokens = usage
                        .get("cache_creation")
                        .and_then(|cc| cc.get("ephemeral_1h_input_tokens"))
                        .and_then(Value::as_u64);
                    self.seen_message_start = true;
                }
                None
            }
            "message_delta" => {
                if let Some(tokens) = json.get("usage").and_then(|u| u.get("output_tokens")).and_then(Value::as_u64) {
                    self.output_tokens = tokens;
                }
                None
            }
            "message_stop" => {
                let usage = Usage {
                    input_tokens: self.input_tokens,
                    output_tokens: self.output_tokens,
                    cache_create_tokens: self.cache_create_tokens,
                    cache_read_tokens: self.cache_read_tokens,
                    ephemeral_5m_tokens: self.ephemeral_5m_tokens,
                    ephemeral_1h_tokens: self.ephemeral_1h_tokens,
                    long_context: None,
                    cost: None,
                };
                self.latched = Some(usage);
                Some(usage)
            }
            _ => None,
        }
    }
}

/// Unary usage extraction: copy
/// `response.usage.*` verbatim, likewise for `cache_creation`.
pub fn usage_from_unary_response(response: &Value) -> Option<Usage> {
    let usage = response.get("usage")?;
    Some(Usage {
        input_tokens: usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
        output_tokens: usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
        cache_create_tokens: usage.get("cache_creation_input_tokens").and_then(Value::as_u64).unwrap_or(0),
        cache_read_tokens: usage.get("cache_read_input_tokens").and_then(Value::as_u64).unwrap_or(0),
        ephemeral_5m_tokens: usage
            .get("cache_creation")
            .and_then(|cc| cc.get("ephemeral_5m_input_tokens"))
            .and_then(Value::as_u64),
        ephemeral_1h_tokens: usage
            .get("cache_creation")
            .and_then(|cc| cc.get("ephemeral_1h_input_tokens"))
            .and_then(Value::as_u64),
        long_context: None::<LongContextUsage>,
        cost: None,
    })
}
