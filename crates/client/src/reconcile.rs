//! Derived views over a message list: what gets rendered, which actions a
//! message offers and which follow-ups are on screen.

use std::borrow::Cow;

use crate::message::{ContentPart, FollowUp, InputRequest, Message, Output, UserContent};

/// The list to render for a turn: the known prefix followed by the streamed
/// messages, in order.
pub fn reconcile(prefix: &[Message], streamed: Vec<Message>) -> Vec<Message> {
    let mut messages = Vec::with_capacity(prefix.len() + streamed.len());
    messages.extend_from_slice(prefix);
    messages.extend(streamed);
    messages
}

/// Text shown for a message. Empty means the message has no text body.
pub fn display_content(message: &Message) -> Cow<'_, str> {
    match message {
        Message::Function(function) => function
            .outputs
            .iter()
            .find_map(|output| match output {
                Output::Text { text } => Some(Cow::Borrowed(text.as_str())),
                _ => None,
            })
            .unwrap_or(Cow::Borrowed("")),
        Message::User(user) => match &user.content {
            Some(UserContent::Text(text)) => Cow::Borrowed(text.as_str()),
            Some(UserContent::Parts(parts)) => Cow::Owned(
                parts
                    .iter()
                    .filter_map(|part| match part {
                        ContentPart::Text { text } => Some(text.as_str()),
                        ContentPart::ImageUrl { .. } | ContentPart::Other(_) => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            None => Cow::Borrowed(""),
        },
        Message::Assistant(assistant) if assistant.function_call.is_some() => Cow::Borrowed(""),
        Message::Assistant(assistant) => {
            Cow::Borrowed(assistant.content.as_deref().unwrap_or(""))
        }
    }
}

/// Function call traces and form replies. They stay in the history sent to
/// the backend but are not rendered as chat text.
pub fn is_control_record(message: &Message) -> bool {
    match message {
        Message::Assistant(assistant) => assistant.function_call.is_some(),
        Message::User(user) => user.input_response.is_some(),
        Message::Function(_) => false,
    }
}

/// Whether the message has text of its own to show.
pub fn renders_content(message: &Message) -> bool {
    !is_control_record(message) && !display_content(message).is_empty()
}

/// Function results and call traces render folded.
pub fn is_collapsible(message: &Message) -> bool {
    match message {
        Message::Function(_) => true,
        Message::Assistant(assistant) => assistant.function_call.is_some(),
        Message::User(_) => false,
    }
}

/// The input request of the last message, if the turn is waiting on a form.
pub fn pending_input_request(messages: &[Message]) -> Option<&InputRequest> {
    match messages.last()? {
        Message::Assistant(assistant) => assistant.input_request.as_ref(),
        Message::User(_) | Message::Function(_) => None,
    }
}

/// Per-message affordances offered by a chat view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageAction {
    /// Copy the displayed text.
    Copy,
    /// Rewrite the message and reload from it.
    Edit,
}

/// Copy for everything that does not render folded; edit for user messages.
pub fn supported_actions(message: &Message) -> Vec<MessageAction> {
    let mut actions = Vec::new();
    if !is_collapsible(message) {
        actions.push(MessageAction::Copy);
    }
    if matches!(message, Message::User(_)) {
        actions.push(MessageAction::Edit);
    }
    actions
}

/// Suggestions carried by the most recent message.
pub fn follow_ups(messages: &[Message]) -> &[FollowUp] {
    messages
        .last()
        .and_then(|message| {
            message.outputs().iter().find_map(|output| match output {
                Output::FollowUps { follow_ups } => Some(follow_ups.as_slice()),
                _ => None,
            })
        })
        .unwrap_or(&[])
}

/// Follow-ups are hidden while a turn is streaming.
pub fn visible_follow_ups(messages: &[Message], is_loading: bool) -> &[FollowUp] {
    if is_loading {
        return &[];
    }
    follow_ups(messages)
}

/// Whether the "clear conversation" affordance is offered. Follow-ups take its
/// place while there are any.
pub fn can_clear(messages: &[Message], is_loading: bool) -> bool {
    !is_loading && !messages.is_empty() && follow_ups(messages).is_empty()
}

/// History for an edit: everything before `index`, then the replacement.
pub fn truncate_and_replace(messages: &[Message], index: usize, updated: Message) -> Vec<Message> {
    let keep = index.min(messages.len());
    let mut history = Vec::with_capacity(keep + 1);
    history.extend_from_slice(&messages[..keep]);
    history.push(updated);
    history
}
