use crate::error::SignalingError;
use serde_json::{json, Value};

// SignalR JSON: каждая запись завершается 0x1E, вид сообщения в числовом `type`
pub const RECORD_SEPARATOR: char = '\u{1e}';

const INVOCATION: u64 = 1;
const PING: u64 = 6;
const CLOSE: u64 = 7;

#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation {
        target: String,
        arguments: Vec<Value>,
    },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// Completion, stream items и т.п. — клиенту звонка не нужны
    Other(u64),
}

pub fn handshake_request() -> String {
    format!(r#"{{"protocol":"json","version":1}}{RECORD_SEPARATOR}"#)
}

/// Ответ на рукопожатие: `{}` либо `{"error": "..."}`
pub fn parse_handshake_response(frame: &str) -> Result<(), SignalingError> {
    let value: Value = serde_json::from_str(frame)?;
    match value.get("error").and_then(Value::as_str) {
        Some(error) => Err(SignalingError::Handshake(error.to_string())),
        None => Ok(()),
    }
}

pub fn split_frames(text: &str) -> impl Iterator<Item = &str> {
    text.split(RECORD_SEPARATOR).filter(|f| !f.trim().is_empty())
}

pub fn decode(frame: &str) -> Result<HubMessage, SignalingError> {
    let value: Value = serde_json::from_str(frame)?;
    let kind = value
        .get("type")
        .and_then(Value::as_u64)
        .ok_or_else(|| SignalingError::Protocol("message without numeric type".into()))?;

    Ok(match kind {
        INVOCATION => {
            let target = value
                .get("target")
                .and_then(Value::as_str)
                .ok_or_else(|| SignalingError::Protocol("invocation without target".into()))?
                .to_string();
            let arguments = match value.get("arguments") {
                Some(Value::Array(args)) => args.clone(),
                None | Some(Value::Null) => Vec::new(),
                Some(_) => {
                    return Err(SignalingError::Protocol(
                        "invocation arguments must be an array".into(),
                    ))
                }
            };
            HubMessage::Invocation { target, arguments }
        }
        PING => HubMessage::Ping,
        CLOSE => HubMessage::Close {
            error: value
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string),
            allow_reconnect: value
                .get("allowReconnect")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        },
        other => HubMessage::Other(other),
    })
}

/// Non-blocking invocation: no `invocationId`, the server sends no completion.
pub fn encode_invocation(target: &str, arguments: Vec<Value>) -> Result<String, SignalingError> {
    let body = serde_json::to_string(&json!({
        "type": INVOCATION,
        "target": target,
        "arguments": arguments,
    }))?;
    Ok(format!("{body}{RECORD_SEPARATOR}"))
}

pub fn encode_ping() -> String {
    format!(r#"{{"type":6}}{RECORD_SEPARATOR}"#)
}
