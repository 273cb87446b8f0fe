//! Server-sent-event framing for the chat stream.
//!
//! Lines arrive already split and UTF-8 decoded (see `streaming`); this module
//! groups them into events and decodes each event's JSON payload.

use crate::constants::MAX_SSE_PAYLOAD_BYTES;
use crate::str_utils;
use serde::Deserialize;

/// Assembles `data:` lines into complete events.
///
/// An event ends at a blank line. Comment lines (leading `:`) are dropped and
/// also discard any data collected so far for the current event.
#[derive(Debug, Default)]
pub struct SseEventParser {
    data_lines: Vec<String>,
}

impl SseEventParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one line (without its terminator). Returns the joined data of an
    /// event when `line` completes it.
    pub fn push_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            return self.dispatch();
        }

        if line.starts_with(':') {
            self.data_lines.clear();
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => self.data_lines.push(value.to_string()),
            "event" | "id" | "retry" => {}
            other => tracing::trace!("[SSE] Ignoring unknown field: {}", other),
        }
        None
    }

    /// Flushes a trailing event that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<String> {
        self.dispatch()
    }

    fn dispatch(&mut self) -> Option<String> {
        if self.data_lines.is_empty() {
            return None;
        }
        let joined = self.data_lines.join("\n");
        self.data_lines.clear();
        Some(joined)
    }
}

/// One decoded event from the backend.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct StreamPayload {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub end: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
}

impl StreamPayload {
    pub fn delta(&self) -> Option<&str> {
        match self.text.as_deref() {
            Some(t) if !t.is_empty() => Some(t),
            _ => None,
        }
    }

    pub fn is_end(&self) -> bool {
        self.end == Some(true)
    }
}

/// Decodes event data. `[DONE]` is accepted as an end marker. Returns `None`
/// for data that is not a payload object; the caller skips it.
pub fn parse_payload(data: &str) -> Option<StreamPayload> {
    let data = data.trim();
    if data.len() > MAX_SSE_PAYLOAD_BYTES {
        tracing::warn!("[SSE] Payload too large: {} bytes", data.len());
        return None;
    }
    if data == "[DONE]" {
        return Some(StreamPayload {
            end: Some(true),
            ..StreamPayload::default()
        });
    }
    match serde_json::from_str::<StreamPayload>(data) {
        Ok(payload) => Some(payload),
        Err(e) => {
            tracing::debug!(
                "[SSE] Unknown payload format ({}): {}",
                e,
                str_utils::snippet(data, 200)
            );
            None
        }
    }
}
