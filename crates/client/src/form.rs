//! Fields of an input request form, read from its JSON schema, and the
//! conversion of typed-in text back into function arguments.

use serde_json::{Number, Value};
use snafu::{OptionExt, Snafu, ensure};

use crate::message::{Arguments, InputRequest};

#[derive(Debug, Snafu, PartialEq)]
#[snafu(visibility(pub(crate)))]
pub enum FormError {
    #[snafu(display("`{field}` is required"))]
    MissingRequired { field: String },
    #[snafu(display("`{field}` expects {expected}, got `{input}`"))]
    InvalidValue {
        field: String,
        expected: &'static str,
        input: String,
    },
    #[snafu(display("`{input}` is not one of the options for `{field}`"))]
    NotAnOption { field: String, input: String },
    #[snafu(display("input request schema does not compile: {reason}"))]
    InvalidSchema { reason: String },
    /// The merged arguments break a schema constraint. `path` points at the
    /// offending value, `""` for the arguments object itself.
    #[snafu(display("`{}` {reason}", if path.is_empty() { "/" } else { path.as_str() }))]
    SchemaMismatch { path: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
}

impl FieldKind {
    fn from_schema(schema: &Value) -> Self {
        match schema.get("type").and_then(Value::as_str) {
            Some("integer") => Self::Integer,
            Some("number") => Self::Number,
            Some("boolean") => Self::Boolean,
            _ => Self::String,
        }
    }

    fn expected(&self) -> &'static str {
        match self {
            Self::String => "text",
            Self::Integer => "a whole number",
            Self::Number => "a number",
            Self::Boolean => "yes or no",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormField {
    /// Property name in the schema and key in the submitted arguments.
    pub name: String,
    pub label: String,
    pub description: Option<String>,
    pub kind: FieldKind,
    pub required: bool,
    /// Allowed values from the schema's `enum`; empty means free input.
    pub options: Vec<Value>,
    /// Pre-filled value from the request arguments or the schema default.
    pub prefill: Option<Value>,
}

impl FormField {
    /// Label with a trailing `*` on required fields.
    pub fn display_label(&self) -> String {
        if self.required {
            format!("{}*", self.label)
        } else {
            self.label.clone()
        }
    }

    /// Converts typed-in text to the field's JSON type. Blank input yields
    /// `None`.
    pub fn coerce(&self, input: &str) -> Result<Option<Value>, FormError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        let value = match self.kind {
            FieldKind::String => Some(Value::String(trimmed.to_string())),
            FieldKind::Integer => trimmed.parse::<i64>().ok().map(Value::from),
            FieldKind::Number => trimmed
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number),
            FieldKind::Boolean => match trimmed.to_ascii_lowercase().as_str() {
                "true" | "yes" | "y" | "1" => Some(Value::Bool(true)),
                "false" | "no" | "n" | "0" => Some(Value::Bool(false)),
                _ => None,
            },
        };
        let value = value.context(InvalidValueSnafu {
            field: self.name.as_str(),
            expected: self.kind.expected(),
            input: trimmed,
        })?;

        ensure!(
            self.options.is_empty() || self.options.contains(&value),
            NotAnOptionSnafu {
                field: self.name.as_str(),
                input: trimmed,
            }
        );
        Ok(Some(value))
    }
}

/// `first_name` becomes `First Name`.
pub fn proper_case(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Heading for the form: the schema title, or the function name.
pub fn form_title(request: &InputRequest) -> String {
    let title = request
        .json_schema
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or(&request.name);
    proper_case(title)
}

/// One field per schema property, in declaration order.
pub fn form_fields(request: &InputRequest) -> Vec<FormField> {
    let schema = &request.json_schema;
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Vec::new();
    };
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    properties
        .iter()
        .map(|(name, property)| {
            let title = property
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or(name);
            FormField {
                name: name.clone(),
                label: proper_case(title),
                description: property
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                kind: FieldKind::from_schema(property),
                required: required.contains(&name.as_str()),
                options: property
                    .get("enum")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
                prefill: request
                    .arguments
                    .get(name)
                    .filter(|value| !value.is_null())
                    .or_else(|| property.get("default"))
                    .cloned(),
            }
        })
        .collect()
}

/// Merges the filled values over the request's own arguments, checks that
/// every required field ends up set and validates the result against the
/// request's JSON schema (formats included).
pub fn build_arguments(request: &InputRequest, values: Arguments) -> Result<Arguments, FormError> {
    let mut arguments = request.arguments.clone();
    arguments.extend(values);

    for field in form_fields(request) {
        if !arguments.contains_key(&field.name) {
            if let Some(prefill) = field.prefill.clone() {
                arguments.insert(field.name.clone(), prefill);
            }
        }
        let present = arguments
            .get(&field.name)
            .is_some_and(|value| !value.is_null() && value != "");
        ensure!(
            present || !field.required,
            MissingRequiredSnafu { field: field.name }
        );
    }

    validate_against_schema(&request.json_schema, &Value::Object(arguments.clone()))?;
    Ok(arguments)
}

/// Reports the first violation. Requests without an object schema are not
/// checked.
fn validate_against_schema(schema: &Value, instance: &Value) -> Result<(), FormError> {
    if !schema.is_object() {
        return Ok(());
    }
    let validator = jsonschema::options()
        .should_validate_formats(true)
        .build(schema)
        .map_err(|error| {
            InvalidSchemaSnafu {
                reason: error.to_string(),
            }
            .build()
        })?;

    match validator.iter_errors(instance).next() {
        Some(error) => SchemaMismatchSnafu {
            path: error.instance_path().to_string(),
            reason: error.to_string(),
        }
        .fail(),
        None => Ok(()),
    }
}
