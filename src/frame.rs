//! Classifier for the backend's line-oriented event stream.
//!
//! Every line is judged on its own: the backend interleaves metadata and
//! text frames without any framing that spans lines, so the parser keeps no
//! state and can be driven one line at a time.

use serde_json::Value;

use crate::error::ProxyError;

const DATA_PREFIX: &str = "data:";
const DONE_MARKER: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A fragment of assistant text
    Text(String),
    /// The backend finished the answer
    End,
    /// Metadata or an unknown frame kind; carries nothing for the caller
    Ignorable,
    /// In-band error frame
    Error(String),
}

impl StreamEvent {
    /// Turn an in-band error frame into the error the orchestrator handles.
    pub fn into_result(self) -> Result<StreamEvent, ProxyError> {
        match self {
            StreamEvent::Error(message) => Err(ProxyError::BackendStream(message)),
            other => Ok(other),
        }
    }
}

/// Parse one raw backend line. Returns `None` for lines that carry no
/// frame at all (blank, or not `data:` prefixed).
pub fn parse_line(raw: &str) -> Option<StreamEvent> {
    let line = raw.trim();
    let payload = line.strip_prefix(DATA_PREFIX)?.trim();
    if payload.is_empty() {
        return None;
    }
    Some(parse_payload(payload))
}

/// Classify a frame payload (the part after `data:`).
pub fn parse_payload(payload: &str) -> StreamEvent {
    if payload == DONE_MARKER {
        return StreamEvent::End;
    }

    if payload.starts_with('{') {
        return parse_json_frame(payload);
    }

    let Some((prefix, content)) = payload.split_once(':') else {
        log::debug!("Unexpected stream frame: {}", payload);
        return StreamEvent::Ignorable;
    };

    match prefix.trim() {
        "a0" => StreamEvent::Text(unquote(content.trim())),
        "ae" | "ad" => StreamEvent::End,
        "af" | "cookie" => StreamEvent::Ignorable,
        other => {
            log::debug!("Ignoring stream prefix {}", other);
            StreamEvent::Ignorable
        }
    }
}

fn parse_json_frame(payload: &str) -> StreamEvent {
    let data: Value = match serde_json::from_str(payload) {
        Ok(data) => data,
        Err(e) => {
            log::debug!("Skipping malformed JSON frame ({}): {}", e, payload);
            return StreamEvent::Ignorable;
        }
    };

    ["message", "error"]
        .iter()
        .filter_map(|key| data.get(key))
        .find_map(error_text)
        .map(StreamEvent::Error)
        .unwrap_or(StreamEvent::Ignorable)
}

fn error_text(value: &Value) -> Option<String> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::String(text) if text.is_empty() => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

/// Decode a JSON string literal; anything not wrapped in quotes is taken
/// literally.
fn unquote(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        match serde_json::from_str::<String>(value) {
            Ok(text) => text,
            Err(_) => value[1..value.len() - 1].to_string(),
        }
    } else {
        value.to_string()
    }
}
