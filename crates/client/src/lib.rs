#![deny(unsafe_code)]

//! Chat core for OpenAssistants backends: the message model, JSON-patch
//! accumulation of streamed responses and the session that drives one turn
//! at a time.

pub mod accumulator;
/// Function library listing for an assistant.
pub mod catalog;
pub mod error;
pub mod events;
/// Input request forms.
pub mod form;
pub mod message;
pub mod patch;
pub mod reconcile;
pub mod session;
pub mod transport;
pub mod turn;
pub mod validate;

pub use accumulator::ResponseAccumulator;
pub use catalog::{FunctionCatalog, FunctionDescriptor};
pub use error::{ChatError, ChatResult, GENERIC_ERROR_MESSAGE};
pub use events::{ApiErrorPayload, StreamEvent, decode_event};
pub use form::{FieldKind, FormError, FormField, build_arguments, form_fields, form_title};
pub use message::{
    Arguments, AssistantMessage, ContentPart, Dataframe, FollowUp, FunctionCall, FunctionMessage,
    InputRequest, Message, Output, Role, Stage, UserContent, UserMessage, Visualization,
};
pub use patch::{PatchError, PatchFailure, PatchOp, apply_patch};
pub use reconcile::{
    MessageAction, can_clear, display_content, follow_ups, is_collapsible, is_control_record,
    pending_input_request, reconcile, renders_content, supported_actions, visible_follow_ups,
};
pub use session::{ChatSession, ChatSnapshot, SessionOptions, TurnOutcome};
pub use transport::{
    BearerAuth, BoxFuture, ChatRequest, ChatTransport, EventStream, HeaderSource, HttpTransport,
    NoAuth, StaticToken, TokenSource, chat_endpoint,
};
pub use turn::{TurnId, TurnState};
pub use validate::{SchemaViolation, check, validate, validate_messages};
