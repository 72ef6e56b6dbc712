//! Typed events of a streaming turn and the wire-line parser.
//!
//! # Wire format
//!
//! The body of `GET /chat/stream` is newline-delimited. Only lines that
//! start with `data:` carry a JSON payload; everything else (blank
//! separators, SSE comments) is ignored. The payload's `type` selects the
//! event and defaults to `"text"`:
//!
//! | `type`        | Fields                                               | Event                        |
//! |---------------|------------------------------------------------------|------------------------------|
//! | `text`        | `chunk`, `done`                                      | [`StreamEvent::TextChunk`], [`StreamEvent::Done`] |
//! | `tool_start`  | `name`, `agent`, `args`                              | [`StreamEvent::ToolStart`]   |
//! | `tool_result` | `name`, `agent`, `result`                            | [`StreamEvent::ToolResult`]  |
//! | `form`        | `form_id`, `title`, `description`, `buttons`, `fields` | [`StreamEvent::FormRequest`] |
//! | `error`       | `text`                                               | [`StreamEvent::Error`]       |

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::form::{FormButton, FormField};
use crate::{AppError, Result};

/// Marker that prefixes every payload line.
pub const DATA_PREFIX: &str = "data:";

/// One event of a streaming turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A fragment of assistant text.
    TextChunk {
        /// Text to append.
        data: String,
    },
    /// The agent invoked a tool.
    ToolStart {
        /// Tool name.
        name: String,
        /// Agent that made the call.
        agent: String,
        /// Call arguments as sent by the server.
        args: serde_json::Value,
    },
    /// A tool call finished.
    ToolResult {
        /// Tool name.
        name: String,
        /// Agent that made the call.
        agent: String,
        /// Result summary, possibly truncated by the server.
        result: String,
    },
    /// The agent asks the user to fill in a form.
    FormRequest {
        /// Form id, echoed back in the response.
        id: String,
        /// Heading.
        title: String,
        /// One-line explanation.
        description: String,
        /// Choices; the chosen value is sent back.
        buttons: Vec<FormButton>,
        /// Free-text inputs.
        fields: Vec<FormField>,
    },
    /// The turn finished.
    Done,
    /// The server reported a failure for this turn.
    Error {
        /// Server-provided description.
        message: String,
    },
}

impl StreamEvent {
    /// Whether this event ends the turn.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }
}

fn default_kind() -> String {
    "text".into()
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(rename = "type", default = "default_kind")]
    kind: String,
    #[serde(default)]
    chunk: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    name: String,
    #[serde(default)]
    agent: String,
    #[serde(default)]
    args: serde_json::Value,
    #[serde(default)]
    result: serde_json::Value,
    form_id: Option<String>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    buttons: Vec<FormButton>,
    #[serde(default)]
    fields: Vec<FormField>,
    text: Option<String>,
}

/// Parse one line of the stream body.
///
/// Returns the events the line carries, usually zero or one. A final text
/// payload with both a `chunk` and `done: true` yields the chunk followed
/// by [`StreamEvent::Done`].
///
/// # Errors
///
/// Returns `AppError::MalformedEvent` when a `data:` line does not hold a
/// valid payload. Callers skip such lines; they never end the turn.
pub fn parse_line(line: &str) -> Result<Vec<StreamEvent>> {
    let Some(payload) = line.trim().strip_prefix(DATA_PREFIX) else {
        return Ok(Vec::new());
    };
    let payload = payload.trim_start();
    if payload.is_empty() {
        return Ok(Vec::new());
    }

    let wire: WireEvent = serde_json::from_str(payload)
        .map_err(|e| AppError::MalformedEvent(format!("invalid payload: {e}")))?;

    let event = match wire.kind.as_str() {
        "text" => {
            let mut events = Vec::with_capacity(2);
            if !wire.chunk.is_empty() {
                events.push(StreamEvent::TextChunk { data: wire.chunk });
            }
            if wire.done {
                events.push(StreamEvent::Done);
            }
            return Ok(events);
        }
        "tool_start" => StreamEvent::ToolStart {
            name: wire.name,
            agent: wire.agent,
            args: wire.args,
        },
        "tool_result" => StreamEvent::ToolResult {
            name: wire.name,
            agent: wire.agent,
            result: match wire.result {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            },
        },
        "form" => StreamEvent::FormRequest {
            id: wire
                .form_id
                .ok_or_else(|| AppError::MalformedEvent("form event without form_id".into()))?,
            title: wire.title,
            description: wire.description,
            buttons: wire.buttons,
            fields: wire.fields,
        },
        "error" => StreamEvent::Error {
            message: wire
                .text
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "unknown server error".into()),
        },
        other => {
            debug!(kind = other, "skipping unknown stream event type");
            return Ok(Vec::new());
        }
    };

    Ok(vec![event])
}
