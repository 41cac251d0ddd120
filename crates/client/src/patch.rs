//! JSON Patch (RFC 6902) over `serde_json::Value`.
//!
//! A patch document is applied all-or-nothing: when any operation fails the
//! target is left exactly as it was, so it remains a valid base for the next
//! patch in the stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::Snafu;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
    Move { from: String, path: String },
    Copy { from: String, path: String },
    Test { path: String, value: Value },
}

impl PatchOp {
    pub fn name(&self) -> &'static str {
        match self {
            PatchOp::Add { .. } => "add",
            PatchOp::Remove { .. } => "remove",
            PatchOp::Replace { .. } => "replace",
            PatchOp::Move { .. } => "move",
            PatchOp::Copy { .. } => "copy",
            PatchOp::Test { .. } => "test",
        }
    }

    pub fn path(&self) -> &str {
        match self {
            PatchOp::Add { path, .. }
            | PatchOp::Remove { path }
            | PatchOp::Replace { path, .. }
            | PatchOp::Move { path, .. }
            | PatchOp::Copy { path, .. }
            | PatchOp::Test { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum PatchError {
    #[snafu(display("invalid JSON pointer `{pointer}`: {reason}"))]
    InvalidPointer {
        pointer: String,
        reason: &'static str,
    },
    #[snafu(display("`{path}` does not exist"))]
    PathNotFound { path: String },
    #[snafu(display("index {index} is out of bounds at `{path}` (length {len})"))]
    IndexOutOfBounds {
        path: String,
        index: usize,
        len: usize,
    },
    #[snafu(display("`{token}` is not a valid array index at `{path}`"))]
    InvalidIndex { path: String, token: String },
    #[snafu(display("`{path}` does not address an object or array member"))]
    NotAContainer { path: String },
    #[snafu(display("test failed at `{path}`"))]
    TestFailed { path: String },
    #[snafu(display("cannot move `{from}` into its own child `{path}`"))]
    MoveIntoDescendant { from: String, path: String },
    #[snafu(display("the document root cannot be removed"))]
    RemoveRoot,
}

/// A failed patch, with the position of the offending operation.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(display("operation {op_index} (`{op}`) failed: {source}"))]
pub struct PatchFailure {
    pub op_index: usize,
    pub op: &'static str,
    pub source: PatchError,
}

type PatchResult<T> = Result<T, PatchError>;

/// Applies `ops` in order. On failure `doc` is unchanged.
pub fn apply_patch(doc: &mut Value, ops: &[PatchOp]) -> Result<(), PatchFailure> {
    let mut working = doc.clone();
    for (op_index, op) in ops.iter().enumerate() {
        apply_op(&mut working, op).map_err(|source| PatchFailure {
            op_index,
            op: op.name(),
            source,
        })?;
    }
    *doc = working;
    Ok(())
}

fn apply_op(doc: &mut Value, op: &PatchOp) -> PatchResult<()> {
    match op {
        PatchOp::Add { path, value } => add(doc, path, value.clone()),
        PatchOp::Remove { path } => remove(doc, path).map(|_| ()),
        PatchOp::Replace { path, value } => {
            let tokens = parse_pointer(path)?;
            *resolve_mut(doc, &tokens, path)? = value.clone();
            Ok(())
        }
        PatchOp::Move { from, path } => {
            if from == path {
                // Still has to exist.
                return resolve(doc, &parse_pointer(from)?, from).map(|_| ());
            }
            if path.starts_with(&format!("{from}/")) {
                return Err(PatchError::MoveIntoDescendant {
                    from: from.clone(),
                    path: path.clone(),
                });
            }
            let value = remove(doc, from)?;
            add(doc, path, value)
        }
        PatchOp::Copy { from, path } => {
            let value = resolve(doc, &parse_pointer(from)?, from)?.clone();
            add(doc, path, value)
        }
        PatchOp::Test { path, value } => {
            if resolve(doc, &parse_pointer(path)?, path)? == value {
                Ok(())
            } else {
                Err(PatchError::TestFailed { path: path.clone() })
            }
        }
    }
}

fn add(doc: &mut Value, path: &str, value: Value) -> PatchResult<()> {
    let tokens = parse_pointer(path)?;
    let Some((last, parent_tokens)) = tokens.split_last() else {
        *doc = value;
        return Ok(());
    };

    match resolve_mut(doc, parent_tokens, path)? {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            if last == "-" {
                items.push(value);
                return Ok(());
            }
            let index = parse_index(last, path)?;
            if index > items.len() {
                return Err(PatchError::IndexOutOfBounds {
                    path: path.to_string(),
                    index,
                    len: items.len(),
                });
            }
            items.insert(index, value);
            Ok(())
        }
        _ => Err(PatchError::NotAContainer {
            path: path.to_string(),
        }),
    }
}

fn remove(doc: &mut Value, path: &str) -> PatchResult<Value> {
    let tokens = parse_pointer(path)?;
    let Some((last, parent_tokens)) = tokens.split_last() else {
        return Err(PatchError::RemoveRoot);
    };

    match resolve_mut(doc, parent_tokens, path)? {
        Value::Object(map) => map.remove(last).ok_or_else(|| PatchError::PathNotFound {
            path: path.to_string(),
        }),
        Value::Array(items) => {
            let index = parse_index(last, path)?;
            if index >= items.len() {
                return Err(PatchError::IndexOutOfBounds {
                    path: path.to_string(),
                    index,
                    len: items.len(),
                });
            }
            Ok(items.remove(index))
        }
        _ => Err(PatchError::NotAContainer {
            path: path.to_string(),
        }),
    }
}

fn resolve<'a>(doc: &'a Value, tokens: &[String], path: &str) -> PatchResult<&'a Value> {
    tokens.iter().try_fold(doc, |current, token| match current {
        Value::Object(map) => map.get(token).ok_or_else(|| PatchError::PathNotFound {
            path: path.to_string(),
        }),
        Value::Array(items) => {
            let index = parse_index(token, path)?;
            items.get(index).ok_or(PatchError::IndexOutOfBounds {
                path: path.to_string(),
                index,
                len: items.len(),
            })
        }
        _ => Err(PatchError::NotAContainer {
            path: path.to_string(),
        }),
    })
}

fn resolve_mut<'a>(
    doc: &'a mut Value,
    tokens: &[String],
    path: &str,
) -> PatchResult<&'a mut Value> {
    let mut current = doc;
    for token in tokens {
        current = match current {
            Value::Object(map) => map.get_mut(token).ok_or_else(|| PatchError::PathNotFound {
                path: path.to_string(),
            })?,
            Value::Array(items) => {
                let index = parse_index(token, path)?;
                let len = items.len();
                items
                    .get_mut(index)
                    .ok_or_else(|| PatchError::IndexOutOfBounds {
                        path: path.to_string(),
                        index,
                        len,
                    })?
            }
            _ => {
                return Err(PatchError::NotAContainer {
                    path: path.to_string(),
                });
            }
        };
    }
    Ok(current)
}

/// Splits an RFC 6901 pointer into unescaped reference tokens.
pub fn parse_pointer(pointer: &str) -> PatchResult<Vec<String>> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    let Some(rest) = pointer.strip_prefix('/') else {
        return Err(PatchError::InvalidPointer {
            pointer: pointer.to_string(),
            reason: "must be empty or start with `/`",
        });
    };

    rest.split('/')
        .map(|token| unescape(token, pointer))
        .collect()
}

fn unescape(token: &str, pointer: &str) -> PatchResult<String> {
    let mut out = String::with_capacity(token.len());
    let mut chars = token.chars();
    while let Some(ch) = chars.next() {
        if ch != '~' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('0') => out.push('~'),
            Some('1') => out.push('/'),
            _ => {
                return Err(PatchError::InvalidPointer {
                    pointer: pointer.to_string(),
                    reason: "`~` must be followed by `0` or `1`",
                });
            }
        }
    }
    Ok(out)
}

fn parse_index(token: &str, path: &str) -> PatchResult<usize> {
    let well_formed = !token.is_empty()
        && token.bytes().all(|byte| byte.is_ascii_digit())
        && (token == "0" || !token.starts_with('0'));
    if !well_formed {
        return Err(PatchError::InvalidIndex {
            path: path.to_string(),
            token: token.to_string(),
        });
    }
    token.parse().map_err(|_| PatchError::InvalidIndex {
        path: path.to_string(),
        token: token.to_string(),
    })
}
