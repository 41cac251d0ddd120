//! Boundary parsing from untyped JSON into [`Message`] values.
//!
//! Every failure names the JSON pointer of the offending value so that a
//! broken server payload can be traced back to the patch that produced it.

use std::fmt::Display;

use serde_json::{Map, Value};
use snafu::Snafu;

use crate::message::{
    Arguments, AssistantMessage, ContentPart, Dataframe, FollowUp, FunctionCall, FunctionMessage,
    InputRequest, Message, Output, Stage, UserContent, UserMessage, Visualization,
};

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(display(
    "schema violation at `{}`: {reason}",
    if path.is_empty() { "/" } else { path.as_str() }
))]
pub struct SchemaViolation {
    pub path: String,
    pub reason: String,
}

impl SchemaViolation {
    fn new(path: &str, reason: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

type Validated<T> = Result<T, SchemaViolation>;

/// Parses one message.
pub fn validate(raw: &Value) -> Validated<Message> {
    message_at(raw, "")
}

/// Parses an array of messages located at `path` inside a larger document.
pub fn validate_messages(raw: &Value, path: &str) -> Validated<Vec<Message>> {
    let Value::Array(items) = raw else {
        return Err(SchemaViolation::new(path, "expected an array of messages"));
    };
    items
        .iter()
        .enumerate()
        .map(|(index, item)| message_at(item, &child(path, index)))
        .collect()
}

/// Re-checks a typed message, e.g. one built from user input before sending.
pub fn check(message: &Message) -> Validated<()> {
    let raw = serde_json::to_value(message)
        .map_err(|error| SchemaViolation::new("", format!("unserializable message: {error}")))?;
    validate(&raw).map(|_| ())
}

fn message_at(raw: &Value, path: &str) -> Validated<Message> {
    let object = as_object(raw, path)?;
    let role_path = child(path, "role");
    let role = match object.get("role") {
        Some(Value::String(role)) => role.as_str(),
        Some(_) => return Err(SchemaViolation::new(&role_path, "expected a string")),
        None => return Err(SchemaViolation::new(&role_path, "missing required field")),
    };

    match role {
        "user" => user_message(object, path).map(Message::User),
        "assistant" => assistant_message(object, path).map(Message::Assistant),
        "function" => function_message(object, path).map(Message::Function),
        other => Err(SchemaViolation::new(
            &role_path,
            format!("unknown role `{other}`, expected user, assistant or function"),
        )),
    }
}

fn user_message(object: &Map<String, Value>, path: &str) -> Validated<UserMessage> {
    let content = optional(object, "content")
        .map(|value| user_content(value, &child(path, "content")))
        .transpose()?;
    let input_response = optional(object, "input_response")
        .map(|value| function_call(value, &child(path, "input_response")))
        .transpose()?;
    Ok(UserMessage {
        content,
        input_response,
    })
}

fn assistant_message(object: &Map<String, Value>, path: &str) -> Validated<AssistantMessage> {
    Ok(AssistantMessage {
        content: optional(object, "content")
            .map(|value| string(value, &child(path, "content")))
            .transpose()?,
        function_call: optional(object, "function_call")
            .map(|value| function_call(value, &child(path, "function_call")))
            .transpose()?,
        input_request: optional(object, "input_request")
            .map(|value| input_request(value, &child(path, "input_request")))
            .transpose()?,
        stage: optional(object, "stage")
            .map(|value| stage(value, &child(path, "stage")))
            .transpose()?,
    })
}

fn function_message(object: &Map<String, Value>, path: &str) -> Validated<FunctionMessage> {
    let stage = stage(required(object, "stage", path)?, &child(path, "stage"))?;
    let name = optional(object, "name")
        .map(|value| string(value, &child(path, "name")))
        .transpose()?;
    let outputs_path = child(path, "outputs");
    let outputs = match optional(object, "outputs") {
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(index, item)| output(item, &child(&outputs_path, index)))
            .collect::<Validated<Vec<_>>>()?,
        Some(_) => return Err(SchemaViolation::new(&outputs_path, "expected an array")),
        None => Vec::new(),
    };
    Ok(FunctionMessage {
        name,
        stage,
        outputs,
    })
}

fn user_content(value: &Value, path: &str) -> Validated<UserContent> {
    match value {
        Value::String(text) => Ok(UserContent::Text(text.clone())),
        Value::Array(parts) => parts
            .iter()
            .enumerate()
            .map(|(index, part)| content_part(part, &child(path, index)))
            .collect::<Validated<Vec<_>>>()
            .map(UserContent::Parts),
        _ => Err(SchemaViolation::new(
            path,
            "expected a string or an array of content parts",
        )),
    }
}

fn content_part(value: &Value, path: &str) -> Validated<ContentPart> {
    let object = as_object(value, path)?;
    match object.get("type").and_then(Value::as_str).unwrap_or_default() {
        "text" => Ok(ContentPart::Text {
            text: string(required(object, "text", path)?, &child(path, "text"))?,
        }),
        "image_url" => Ok(ContentPart::ImageUrl {
            image_url: string(
                required(object, "image_url", path)?,
                &child(path, "image_url"),
            )?,
            filename: optional(object, "filename")
                .map(|value| string(value, &child(path, "filename")))
                .transpose()?,
        }),
        _ => Ok(ContentPart::Other(object.clone())),
    }
}

fn output(value: &Value, path: &str) -> Validated<Output> {
    let object = as_object(value, path)?;
    match type_tag(object, path)? {
        "dataframe" => Ok(Output::Dataframe {
            dataframe: dataframe(
                required(object, "dataframe", path)?,
                &child(path, "dataframe"),
            )?,
            title: optional(object, "title")
                .map(|value| string(value, &child(path, "title")))
                .transpose()?,
        }),
        "visualization" => Ok(Output::Visualization {
            visualization: Visualization(
                object.get("visualization").cloned().unwrap_or(Value::Null),
            ),
        }),
        "text" => Ok(Output::Text {
            text: string(required(object, "text", path)?, &child(path, "text"))?,
        }),
        "follow_ups" => {
            let list_path = child(path, "follow_ups");
            let follow_ups = match optional(object, "follow_ups") {
                Some(Value::Array(items)) => items
                    .iter()
                    .enumerate()
                    .map(|(index, item)| follow_up(item, &child(&list_path, index)))
                    .collect::<Validated<Vec<_>>>()?,
                Some(_) => return Err(SchemaViolation::new(&list_path, "expected an array")),
                None => Vec::new(),
            };
            Ok(Output::FollowUps { follow_ups })
        }
        other => Err(SchemaViolation::new(
            &child(path, "type"),
            format!("unknown output type `{other}`"),
        )),
    }
}

fn dataframe(value: &Value, path: &str) -> Validated<Dataframe> {
    let object = as_object(value, path)?;
    let cols = string_array(required(object, "cols", path)?, &child(path, "cols"))?;
    let rows_path = child(path, "rows");
    let Value::Array(raw_rows) = required(object, "rows", path)? else {
        return Err(SchemaViolation::new(&rows_path, "expected an array of rows"));
    };

    let mut rows = Vec::with_capacity(raw_rows.len());
    for (index, raw_row) in raw_rows.iter().enumerate() {
        let row_path = child(&rows_path, index);
        let row = string_array(raw_row, &row_path)?;
        if row.len() != cols.len() {
            return Err(SchemaViolation::new(
                &row_path,
                format!("row has {} cells but there are {} columns", row.len(), cols.len()),
            ));
        }
        rows.push(row);
    }

    Ok(Dataframe { cols, rows })
}

fn follow_up(value: &Value, path: &str) -> Validated<FollowUp> {
    let object = as_object(value, path)?;
    Ok(FollowUp {
        title: string(required(object, "title", path)?, &child(path, "title"))?,
        prompt: string(required(object, "prompt", path)?, &child(path, "prompt"))?,
    })
}

fn function_call(value: &Value, path: &str) -> Validated<FunctionCall> {
    let object = as_object(value, path)?;
    Ok(FunctionCall {
        name: string(required(object, "name", path)?, &child(path, "name"))?,
        arguments: arguments(object, path)?,
    })
}

fn input_request(value: &Value, path: &str) -> Validated<InputRequest> {
    let object = as_object(value, path)?;
    Ok(InputRequest {
        name: string(required(object, "name", path)?, &child(path, "name"))?,
        arguments: arguments(object, path)?,
        json_schema: object.get("json_schema").cloned().unwrap_or(Value::Null),
    })
}

fn arguments(object: &Map<String, Value>, path: &str) -> Validated<Arguments> {
    match optional(object, "arguments") {
        Some(Value::Object(arguments)) => Ok(arguments.clone()),
        Some(_) => Err(SchemaViolation::new(
            &child(path, "arguments"),
            "expected an object",
        )),
        None => Ok(Arguments::new()),
    }
}

fn stage(value: &Value, path: &str) -> Validated<Stage> {
    match value.as_str() {
        Some("confirmed") => Ok(Stage::Confirmed),
        Some("unconfirmed") => Ok(Stage::Unconfirmed),
        _ => Err(SchemaViolation::new(
            path,
            "expected `confirmed` or `unconfirmed`",
        )),
    }
}

fn type_tag<'a>(object: &'a Map<String, Value>, path: &str) -> Validated<&'a str> {
    string_ref(required(object, "type", path)?, &child(path, "type"))
}

fn string(value: &Value, path: &str) -> Validated<String> {
    string_ref(value, path).map(str::to_string)
}

fn string_ref<'a>(value: &'a Value, path: &str) -> Validated<&'a str> {
    value
        .as_str()
        .ok_or_else(|| SchemaViolation::new(path, "expected a string"))
}

fn string_array(value: &Value, path: &str) -> Validated<Vec<String>> {
    let Value::Array(items) = value else {
        return Err(SchemaViolation::new(path, "expected an array of strings"));
    };
    items
        .iter()
        .enumerate()
        .map(|(index, item)| string(item, &child(path, index)))
        .collect()
}

fn as_object<'a>(value: &'a Value, path: &str) -> Validated<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| SchemaViolation::new(path, "expected an object"))
}

/// Backend payloads spell unset optionals as `null`.
fn optional<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    object.get(key).filter(|value| !value.is_null())
}

fn required<'a>(object: &'a Map<String, Value>, key: &str, path: &str) -> Validated<&'a Value> {
    optional(object, key)
        .ok_or_else(|| SchemaViolation::new(&child(path, key), "missing required field"))
}

fn child(path: &str, token: impl Display) -> String {
    let token = token.to_string().replace('~', "~0").replace('/', "~1");
    format!("{path}/{token}")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_each_role() {
        let user = validate(&json!({"role": "user", "content": "hi"})).unwrap();
        assert_eq!(user, Message::user_text("hi"));

        let assistant = validate(&json!({
            "role": "assistant",
            "content": "",
            "function_call": {"name": "lookup", "arguments": {"id": 3}},
            "stage": "confirmed"
        }))
        .unwrap();
        let Message::Assistant(assistant) = assistant else {
            panic!("expected assistant");
        };
        assert_eq!(assistant.function_call.unwrap().arguments["id"], 3);
        assert_eq!(assistant.stage, Some(Stage::Confirmed));

        let function = validate(&json!({
            "role": "function",
            "stage": "unconfirmed",
            "outputs": [
                {"type": "dataframe", "dataframe": {"cols": ["a", "b"], "rows": [["1", "2"]]}},
                {"type": "visualization", "visualization": {"data": [], "layout": {}}},
                {"type": "text", "text": "done"},
                {"type": "follow_ups", "follow_ups": [{"title": "t", "prompt": "p"}]}
            ]
        }))
        .unwrap();
        let kinds = function.outputs().iter().map(Output::kind).collect::<Vec<_>>();
        assert_eq!(kinds, ["dataframe", "visualization", "text", "follow_ups"]);
    }

    #[test]
    fn null_optionals_are_treated_as_absent() {
        let message = validate(&json!({
            "role": "assistant",
            "content": "ok",
            "input_request": null,
            "function_call": null,
            "extra": "ignored"
        }))
        .unwrap();
        assert_eq!(message, Message::assistant_text("ok"));
    }

    #[test]
    fn user_content_parts_are_typed() {
        let message = validate(&json!({
            "role": "user",
            "content": [
                {"type": "image_url", "image_url": "data:image/png;base64,AA==", "filename": "dog.png"},
                {"type": "text", "text": "what breed?"}
            ]
        }))
        .unwrap();
        let Message::User(UserMessage {
            content: Some(UserContent::Parts(parts)),
            ..
        }) = message
        else {
            panic!("expected content parts");
        };
        assert_eq!(parts.len(), 2);

        let error = validate(&json!({"role": "user", "content": [{"type": "text"}]})).unwrap_err();
        assert_eq!(error.path, "/content/0/text");
        let error = validate(&json!({"role": "user", "content": ["loose text"]})).unwrap_err();
        assert_eq!(error.path, "/content/0");
    }

    #[test]
    fn unknown_content_parts_pass_through() {
        let raw = json!({
            "role": "user",
            "content": [
                {"type": "input_audio", "input_audio": {"data": "AA==", "format": "wav"}},
                {"note": "untyped"},
                {"type": "text", "text": "transcribe this"}
            ]
        });
        let message = validate(&raw).unwrap();

        let Message::User(UserMessage {
            content: Some(UserContent::Parts(parts)),
            ..
        }) = &message
        else {
            panic!("expected content parts");
        };
        assert!(matches!(&parts[0], ContentPart::Other(part) if part["type"] == "input_audio"));
        assert!(matches!(&parts[1], ContentPart::Other(_)));
        assert_eq!(serde_json::to_value(&message).unwrap(), raw);
    }

    #[test]
    fn rejects_unknown_and_missing_roles() {
        let error = validate(&json!({"role": "system", "content": "x"})).unwrap_err();
        assert_eq!(error.path, "/role");
        assert!(error.reason.contains("system"));

        let error = validate(&json!({"content": "x"})).unwrap_err();
        assert_eq!(error.path, "/role");

        let error = validate(&json!("just text")).unwrap_err();
        assert_eq!(error.path, "");
        assert!(error.to_string().contains("`/`"));
    }

    #[test]
    fn function_message_requires_stage() {
        let error = validate(&json!({"role": "function", "outputs": []})).unwrap_err();
        assert_eq!(error.path, "/stage");

        let error = validate(&json!({"role": "function", "stage": "done"})).unwrap_err();
        assert_eq!(error.reason, "expected `confirmed` or `unconfirmed`");
    }

    #[test]
    fn dataframe_rows_must_match_columns() {
        let raw = json!([
            {"role": "user", "content": "rows?"},
            {
                "role": "function",
                "stage": "confirmed",
                "outputs": [{
                    "type": "dataframe",
                    "dataframe": {"cols": ["a", "b"], "rows": [["1", "2"], ["3"]]}
                }]
            }
        ]);
        let error = validate_messages(&raw, "/messages").unwrap_err();
        assert_eq!(error.path, "/messages/1/outputs/0/dataframe/rows/1");
    }

    #[test]
    fn check_accepts_well_formed_user_messages() {
        assert!(check(&Message::user_text("hello")).is_ok());
        assert!(check(&Message::input_response("form", Arguments::new())).is_ok());
    }

    #[test]
    fn child_paths_escape_pointer_characters() {
        assert_eq!(child("/a", "b/c~d"), "/a/b~1c~0d");
    }
}
