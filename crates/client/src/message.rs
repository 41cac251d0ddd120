//! Conversation message model exchanged with the assistant backend.
//!
//! Messages are a closed set of variants discriminated by `role`; function
//! outputs are discriminated by `type`. The serde representation matches the
//! wire format, but untrusted payloads should go through [`crate::validate`]
//! so that shape errors carry a path.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// JSON object holding function or form arguments.
pub type Arguments = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
    Function(FunctionMessage),
}

/// Speaker role, without the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
    Function,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Function => "function",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<UserContent>,
    /// Reply to an earlier [`InputRequest`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_response: Option<FunctionCall>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ImageUrl {
        image_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    /// Any other part, passed through untouched.
    #[serde(untagged)]
    Other(Map<String, Value>),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Trace of a function the assistant decided to run. Not actionable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    /// Pauses the turn until the user answers with a filled form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_request: Option<InputRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionMessage {
    /// Function id, when the backend reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub stage: Stage,
    #[serde(default)]
    pub outputs: Vec<Output>,
}

/// Whether a message can still change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Confirmed,
    Unconfirmed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Arguments,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: Arguments,
    /// JSON Schema for the additional input the user must supply.
    #[serde(default)]
    pub json_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Output {
    Dataframe {
        dataframe: Dataframe,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    Visualization {
        visualization: Visualization,
    },
    Text {
        text: String,
    },
    FollowUps {
        #[serde(default)]
        follow_ups: Vec<FollowUp>,
    },
}

/// Row-major string table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataframe {
    pub cols: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Opaque plotting payload, passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Visualization(pub Value);

impl Visualization {
    pub fn data(&self) -> Option<&Value> {
        self.0.get("data")
    }

    pub fn layout(&self) -> Option<&Value> {
        self.0.get("layout")
    }
}

/// A suggested next prompt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FollowUp {
    pub title: String,
    pub prompt: String,
}

impl FollowUp {
    pub fn new(title: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            prompt: prompt.into(),
        }
    }
}

impl Message {
    pub fn user_text(content: impl Into<String>) -> Self {
        Self::User(UserMessage {
            content: Some(UserContent::Text(content.into())),
            input_response: None,
        })
    }

    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self::User(UserMessage {
            content: Some(UserContent::Parts(parts)),
            input_response: None,
        })
    }

    /// User reply carrying the values of a filled input form.
    pub fn input_response(name: impl Into<String>, arguments: Arguments) -> Self {
        Self::User(UserMessage {
            content: Some(UserContent::Text(String::new())),
            input_response: Some(FunctionCall {
                name: name.into(),
                arguments,
            }),
        })
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self::Assistant(AssistantMessage {
            content: Some(content.into()),
            ..AssistantMessage::default()
        })
    }

    pub fn role(&self) -> Role {
        match self {
            Message::User(_) => Role::User,
            Message::Assistant(_) => Role::Assistant,
            Message::Function(_) => Role::Function,
        }
    }

    /// Function outputs; empty for other roles.
    pub fn outputs(&self) -> &[Output] {
        match self {
            Message::Function(message) => &message.outputs,
            Message::User(_) | Message::Assistant(_) => &[],
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            Message::Function(message) => Some(message.stage),
            Message::Assistant(message) => message.stage,
            Message::User(_) => None,
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.stage() == Some(Stage::Unconfirmed)
    }
}

impl Output {
    pub fn kind(&self) -> &'static str {
        match self {
            Output::Dataframe { .. } => "dataframe",
            Output::Visualization { .. } => "visualization",
            Output::Text { .. } => "text",
            Output::FollowUps { .. } => "follow_ups",
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn serializes_without_absent_optionals() {
        let value = serde_json::to_value(Message::user_text("hi")).unwrap();
        assert_eq!(value, json!({"role": "user", "content": "hi"}));

        let value = serde_json::to_value(Message::input_response(
            "find_email",
            Arguments::from_iter([("name".to_string(), json!("Ada"))]),
        ))
        .unwrap();
        assert_eq!(
            value,
            json!({
                "role": "user",
                "content": "",
                "input_response": {"name": "find_email", "arguments": {"name": "Ada"}}
            })
        );
    }

    #[test]
    fn function_outputs_use_type_tags() {
        let message = Message::Function(FunctionMessage {
            name: None,
            stage: Stage::Unconfirmed,
            outputs: vec![
                Output::Text {
                    text: "two rows".to_string(),
                },
                Output::FollowUps {
                    follow_ups: vec![FollowUp::new("More", "show more")],
                },
            ],
        });
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["stage"], "unconfirmed");
        assert_eq!(value["outputs"][0]["type"], "text");
        assert_eq!(value["outputs"][1]["follow_ups"][0]["prompt"], "show more");
        assert!(message.is_provisional());
        assert_eq!(message.outputs().len(), 2);
    }

    #[test]
    fn visualization_exposes_data_and_layout() {
        let vis = Visualization(json!({"data": [{"x": [1]}], "layout": {"title": "t"}}));
        assert_eq!(vis.layout(), Some(&json!({"title": "t"})));
        assert!(vis.data().is_some_and(Value::is_array));
    }
}
