use serde_json::{Value, json};
use snafu::ResultExt;

use crate::error::{ChatResult, MalformedPatchSnafu, SchemaSnafu};
use crate::message::Message;
use crate::patch::{PatchOp, apply_patch};
use crate::validate::validate_messages;

const MESSAGES_POINTER: &str = "/messages";

/// In-flight response document for one turn, rebuilt from `{"messages": []}`
/// on every `append`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseAccumulator {
    document: Value,
    patches_applied: usize,
}

impl Default for ResponseAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseAccumulator {
    pub fn new() -> Self {
        Self {
            document: json!({ "messages": [] }),
            patches_applied: 0,
        }
    }

    /// Applies one patch document. A failing patch leaves the document as it was.
    pub fn apply(&mut self, ops: &[PatchOp]) -> ChatResult<()> {
        apply_patch(&mut self.document, ops).context(MalformedPatchSnafu {
            stage: "apply-stream-patch",
        })?;
        self.patches_applied += 1;
        Ok(())
    }

    /// Streamed messages parsed from the current document.
    pub fn messages(&self) -> ChatResult<Vec<Message>> {
        let raw = self
            .document
            .pointer(MESSAGES_POINTER)
            .unwrap_or(&Value::Null);
        validate_messages(raw, MESSAGES_POINTER).context(SchemaSnafu {
            stage: "validate-streamed-messages",
        })
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    pub fn patches_applied(&self) -> usize {
        self.patches_applied
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ChatError;

    fn ops(raw: Value) -> Vec<PatchOp> {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn accumulates_patches_into_messages() {
        let mut accumulator = ResponseAccumulator::new();
        accumulator
            .apply(&ops(json!([
                {"op": "add", "path": "/messages/0", "value": {"role": "assistant", "content": ""}}
            ])))
            .unwrap();
        accumulator
            .apply(&ops(json!([
                {"op": "replace", "path": "/messages/0/content", "value": "Hello"}
            ])))
            .unwrap();

        assert_eq!(accumulator.patches_applied(), 2);
        assert_eq!(
            accumulator.messages().unwrap(),
            vec![Message::assistant_text("Hello")]
        );
    }

    #[test]
    fn malformed_patch_is_reported_and_not_counted() {
        let mut accumulator = ResponseAccumulator::new();
        let error = accumulator
            .apply(&ops(json!([
                {"op": "replace", "path": "/messages/0/content", "value": "x"}
            ])))
            .unwrap_err();

        assert!(matches!(error, ChatError::MalformedPatch { .. }));
        assert_eq!(accumulator.patches_applied(), 0);
        assert_eq!(accumulator.document(), &json!({"messages": []}));
        assert!(accumulator.messages().unwrap().is_empty());
    }

    #[test]
    fn schema_violations_carry_document_paths() {
        let mut accumulator = ResponseAccumulator::new();
        accumulator
            .apply(&ops(json!([
                {"op": "add", "path": "/messages/-", "value": {"role": "function", "outputs": []}}
            ])))
            .unwrap();

        let Err(ChatError::Schema { source, .. }) = accumulator.messages() else {
            panic!("expected a schema violation");
        };
        assert_eq!(source.path, "/messages/0/stage");
    }

    #[test]
    fn replacing_the_root_without_messages_is_a_schema_violation() {
        let mut accumulator = ResponseAccumulator::new();
        accumulator
            .apply(&ops(json!([{"op": "replace", "path": "", "value": {}}])))
            .unwrap();
        let Err(ChatError::Schema { source, .. }) = accumulator.messages() else {
            panic!("expected a schema violation");
        };
        assert_eq!(source.path, "/messages");
    }
}
