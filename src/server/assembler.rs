//! Maps raw engine output into reply text and SSE frames.
//!
//! Engine results are llama.cpp-style dictionaries. Anything that does not
//! have the expected shape is a contract violation by the engine and becomes
//! `model_response_error`.

use axum::response::sse::Event;
use serde::Serialize;
use serde_json::Value;

use crate::error::ChatError;
use crate::server::bridge::StreamEvent;

/// Pull the reply text out of a complete result
/// (`choices[0].message.content`), trimmed.
pub fn extract_reply(completion: &Value) -> Result<String, ChatError> {
    let choice = first_choice(completion)?;
    let message = choice
        .get("message")
        .ok_or_else(|| malformed("missing 'message' in first choice"))?;
    let content = message
        .get("content")
        .ok_or_else(|| malformed("missing 'content' in message"))?;
    content
        .as_str()
        .map(|s| s.trim().to_string())
        .ok_or_else(|| malformed("'content' is not a string"))
}

/// Pull the incremental text out of a streaming fragment.
///
/// Prefers `choices[0].delta.content`, falls back to
/// `choices[0].message.content`. Returns `None` for fragments that carry no
/// text, such as the role-only opener and the `finish_reason` closer.
pub fn extract_delta(chunk: &Value) -> Result<Option<String>, ChatError> {
    let choice = first_choice(chunk)?;

    for key in ["delta", "message"] {
        let content = match choice.get(key) {
            None | Some(Value::Null) => continue,
            Some(Value::Object(fields)) => fields.get("content"),
            Some(_) => return Err(malformed(&format!("'{key}' is not an object"))),
        };
        match content {
            Some(Value::String(s)) if !s.is_empty() => return Ok(Some(s.clone())),
            None | Some(Value::Null) | Some(Value::String(_)) => {}
            Some(_) => return Err(malformed(&format!("'{key}.content' is not a string"))),
        }
    }
    Ok(None)
}

fn first_choice(value: &Value) -> Result<&serde_json::Map<String, Value>, ChatError> {
    let choices = value
        .get("choices")
        .ok_or_else(|| malformed("missing 'choices'"))?
        .as_array()
        .ok_or_else(|| malformed("'choices' is not a list"))?;
    choices
        .first()
        .ok_or_else(|| malformed("'choices' is empty"))?
        .as_object()
        .ok_or_else(|| malformed("first choice is not an object"))
}

fn malformed(what: &str) -> ChatError {
    ChatError::ModelResponse(what.to_string())
}

#[derive(Serialize)]
struct DeltaFrame<'a> {
    delta: &'a str,
}

#[derive(Serialize)]
struct ErrorFrame<'a> {
    message: &'a str,
    code: &'a str,
    status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<&'a str>,
}

/// JSON payload of the `data:` line for an event.
pub fn frame_data(event: &StreamEvent) -> String {
    let data = match event {
        StreamEvent::Delta(text) => serde_json::to_string(&DeltaFrame { delta: text }),
        StreamEvent::Error {
            code,
            message,
            status,
            detail,
        } => serde_json::to_string(&ErrorFrame {
            message,
            code,
            status: *status,
            detail: detail.as_deref(),
        }),
        StreamEvent::Done => Ok("{}".to_string()),
    };
    data.unwrap_or_else(|_| "{}".to_string())
}

/// Wire frame for an event: plain `data:` for deltas, named `error` and
/// `done` events for the terminal frames.
///
/// The event name must be set before the data so it is written first.
pub fn sse_event(event: &StreamEvent) -> Event {
    let frame = match event {
        StreamEvent::Delta(_) => Event::default(),
        StreamEvent::Error { .. } => Event::default().event("error"),
        StreamEvent::Done => Event::default().event("done"),
    };
    frame.data(frame_data(event))
}
