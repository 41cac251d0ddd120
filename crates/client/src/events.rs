use serde::Deserialize;
use serde_json::Value;
use snafu::ResultExt;

use crate::error::{ChatError, ChatResult, DecodePayloadSnafu, UnexpectedPayloadSnafu};
use crate::patch::PatchOp;

/// SSE event name the backend uses for keep-alives.
pub const PING_EVENT: &str = "ping";

/// Error body carried by an `{"error": ...}` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiErrorPayload {
    pub code: Option<String>,
    pub detail: Option<String>,
}

impl From<ApiErrorPayload> for ChatError {
    fn from(payload: ApiErrorPayload) -> Self {
        ChatError::Api {
            code: payload.code,
            detail: payload.detail,
        }
    }
}

/// One step of a streamed turn, in arrival order.
///
/// A transport yields `Open` first and `Close` last; everything between comes
/// straight from the event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Open { status: u16 },
    Ping,
    Patch(Vec<PatchOp>),
    Error(ApiErrorPayload),
    Close,
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Open { .. } => "open",
            StreamEvent::Ping => "ping",
            StreamEvent::Patch(_) => "patch",
            StreamEvent::Error(_) => "error",
            StreamEvent::Close => "close",
        }
    }

    /// Events after which nothing else is consumed for the turn.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Error(_) | StreamEvent::Close)
    }
}

#[derive(Deserialize)]
struct PatchEnvelope {
    #[serde(default)]
    patch: Option<Vec<PatchOp>>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Value,
    #[serde(default)]
    detail: Option<String>,
}

/// Decodes one server-sent event into a [`StreamEvent`].
pub fn decode_event(event_name: &str, data: &str) -> ChatResult<StreamEvent> {
    if event_name == PING_EVENT || data.trim().is_empty() {
        return Ok(StreamEvent::Ping);
    }

    let envelope: PatchEnvelope = serde_json::from_str(data).context(DecodePayloadSnafu {
        stage: "decode-sse-payload",
    })?;

    if let Some(error) = envelope.error {
        return Ok(StreamEvent::Error(ApiErrorPayload {
            code: code_to_string(error.code),
            detail: error.detail,
        }));
    }

    match envelope.patch {
        Some(ops) => Ok(StreamEvent::Patch(ops)),
        None => UnexpectedPayloadSnafu {
            stage: "decode-sse-payload",
            payload: data.to_string(),
        }
        .fail(),
    }
}

fn code_to_string(code: Value) -> Option<String> {
    match code {
        Value::Null => None,
        Value::String(code) => Some(code),
        other => Some(other.to_string()),
    }
}
