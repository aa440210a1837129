//! A thin bridge over compiled JSON Schema validation, used for connector
//! config on install, action input/output, and webhook payloads. This is the
//! only gate between external bytes and handler code, so it never attempts
//! to be clever about coercion — a value either matches the compiled schema
//! or it doesn't.

use jsonschema::JSONSchema;
use serde_json::Value;

use crate::error::ValidationIssue;

/// A compiled JSON Schema. Cheap to clone (backed by an `Arc` internally via
/// `jsonschema::JSONSchema`'s own structure); connectors compile their
/// schemas once at registration time.
pub struct Schema {
    compiled: JSONSchema,
}

/// The outcome of validating a value against a [`Schema`].
pub enum ValidationOutcome {
    Ok(Value),
    Err(Vec<ValidationIssue>),
}

impl Schema {
    /// Compile a schema from its JSON Schema document. Returns an error
    /// string (not [`crate::error::Error`], to keep this module free of a
    /// dependency on the crate's own error type — callers decide how a bad
    /// schema document should surface, typically at connector registration).
    pub fn compile(document: Value) -> Result<Self, String> {
        let compiled = JSONSchema::compile(&document).map_err(|e| e.to_string())?;
        Ok(Self { compiled })
    }

    /// Validate `input` against the schema, returning the (owned) value back
    /// on success so callers can move it onward without re-cloning.
    pub fn validate(&self, input: Value) -> ValidationOutcome {
        let result = self.compiled.validate(&input);
        match result {
            Ok(()) => ValidationOutcome::Ok(input),
            Err(errors) => {
                let issues = errors
                    .map(|e| ValidationIssue { path: e.instance_path.to_string(), message: e.to_string() })
                    .collect();
                ValidationOutcome::Err(issues)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Schema {
        Schema::compile(json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"],
        }))
        .unwrap()
    }

    #[test]
    fn accepts_matching_value() {
        let s = schema();
        match s.validate(json!({"text": "hi"})) {
            ValidationOutcome::Ok(v) => assert_eq!(v["text"], "hi"),
            ValidationOutcome::Err(issues) => panic!("unexpected issues: {issues:?}"),
        }
    }

    #[test]
    fn reports_issues_for_missing_required_field() {
        let s = schema();
        match s.validate(json!({})) {
            ValidationOutcome::Ok(_) => panic!("expected validation failure"),
            ValidationOutcome::Err(issues) => assert!(!issues.is_empty()),
        }
    }
}
