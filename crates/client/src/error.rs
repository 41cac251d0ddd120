use snafu::Snafu;

use crate::patch::PatchFailure;
use crate::turn::{TurnId, TurnTransitionRejection};
use crate::validate::SchemaViolation;

/// Shown when the backend reports an error without a `detail`.
pub const GENERIC_ERROR_MESSAGE: &str = "Unknown error";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("rate limited"))]
    RateLimited { stage: &'static str },
    #[snafu(display("Bad Response Status Code {status}"))]
    BadResponseStatus { stage: &'static str, status: u16 },
    #[snafu(display(
        "assistant api error: {}",
        detail.as_deref().unwrap_or(GENERIC_ERROR_MESSAGE)
    ))]
    Api {
        code: Option<String>,
        detail: Option<String>,
    },
    #[snafu(display("malformed patch on `{stage}`: {source}"))]
    MalformedPatch {
        stage: &'static str,
        source: PatchFailure,
    },
    #[snafu(display("invalid message on `{stage}`: {source}"))]
    Schema {
        stage: &'static str,
        source: SchemaViolation,
    },
    #[snafu(display("turn {active:?} is still streaming"))]
    TurnInProgress { stage: &'static str, active: TurnId },
    #[snafu(display("turn transition rejected on `{stage}`: {rejection:?}"))]
    TurnRejected {
        stage: &'static str,
        rejection: TurnTransitionRejection,
    },
    #[snafu(display("http request failed on `{stage}`, {source}"))]
    Http {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("event stream failed on `{stage}`: {message}"))]
    EventStream { stage: &'static str, message: String },
    #[snafu(display("failed to decode event payload on `{stage}`: {source}"))]
    DecodePayload {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("event payload carries neither `patch` nor `error`: {payload}"))]
    UnexpectedPayload { stage: &'static str, payload: String },
    #[snafu(display("failed to resolve request headers on `{stage}`: {message}"))]
    ResolveHeaders { stage: &'static str, message: String },
    #[snafu(display("header `{name}` has an invalid value"))]
    InvalidHeader {
        stage: &'static str,
        name: String,
        source: reqwest::header::InvalidHeaderValue,
    },
}

pub type ChatResult<T> = Result<T, ChatError>;

impl ChatError {
    /// The single error string a chat UI shows for a failed turn.
    pub fn user_message(&self) -> String {
        match self {
            Self::Api {
                detail: Some(detail),
                ..
            } if !detail.trim().is_empty() => detail.clone(),
            Self::Api { .. } => GENERIC_ERROR_MESSAGE.to_string(),
            other => other.to_string(),
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}
