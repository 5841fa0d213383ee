//! Task payload schemas.
//!
//! A schema lists the top-level fields a task payload must carry and,
//! optionally, the JSON kind of each. Task types without a schema accept any
//! payload.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestrationError, Result};

/// JSON kinds a payload field may be constrained to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl FieldKind {
    fn matches(self, value: &serde_json::Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

/// Required shape of a task payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadSchema {
    /// Fields that must be present.
    #[serde(default)]
    pub required_fields: Vec<String>,
    /// Expected kind per field, checked when the field is present.
    #[serde(default)]
    pub field_kinds: HashMap<String, FieldKind>,
}

impl PayloadSchema {
    /// Schema requiring `fields`.
    #[must_use]
    pub fn requiring<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { required_fields: fields.into_iter().map(Into::into).collect(), ..Self::default() }
    }

    /// Adds a kind constraint.
    #[must_use]
    pub fn with_kind(mut self, field: impl Into<String>, kind: FieldKind) -> Self {
        self.field_kinds.insert(field.into(), kind);
        self
    }

    fn validate(&self, task_type: &str, payload: &serde_json::Value) -> Result<()> {
        let Some(object) = payload.as_object() else {
            return Err(OrchestrationError::Validation(format!(
                "payload for task type '{task_type}' must be a JSON object"
            )));
        };

        let missing: Vec<&str> = self
            .required_fields
            .iter()
            .filter(|field| !object.contains_key(field.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(OrchestrationError::Validation(format!(
                "payload for task type '{task_type}' is missing fields: {}",
                missing.join(", ")
            )));
        }

        for (field, kind) in &self.field_kinds {
            if let Some(value) = object.get(field) {
                if !kind.matches(value) {
                    return Err(OrchestrationError::Validation(format!(
                        "field '{field}' of task type '{task_type}' must be {kind:?}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Payload schemas keyed by task type.
#[derive(Debug, Clone, Default)]
pub struct TaskSchemaRegistry {
    schemas: HashMap<String, PayloadSchema>,
}

impl TaskSchemaRegistry {
    /// Creates a registry from configured schemas.
    #[must_use]
    pub fn new(schemas: HashMap<String, PayloadSchema>) -> Self {
        Self { schemas }
    }

    /// Registers or replaces the schema for `task_type`.
    pub fn register(&mut self, task_type: impl Into<String>, schema: PayloadSchema) {
        self.schemas.insert(task_type.into(), schema);
    }

    /// Validates `payload` against the schema for `task_type`, if any.
    ///
    /// # Errors
    /// Returns a validation error describing the first mismatch.
    pub fn validate(&self, task_type: &str, payload: &serde_json::Value) -> Result<()> {
        match self.schemas.get(task_type) {
            Some(schema) => schema.validate(task_type, payload),
            None => Ok(()),
        }
    }

    /// Number of registered schemas.
    #[must_use]
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    /// Whether no schemas are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> TaskSchemaRegistry {
        let mut registry = TaskSchemaRegistry::default();
        registry.register(
            "grade_quiz",
            PayloadSchema::requiring(["quizId", "answers"]).with_kind("answers", FieldKind::Array),
        );
        registry
    }

    #[test]
    fn test_unknown_task_type_passes() {
        assert!(registry().validate("summarize", &json!("anything")).is_ok());
    }

    #[test]
    fn test_missing_fields_rejected() {
        let err = registry().validate("grade_quiz", &json!({"quizId": 1})).unwrap_err();
        assert!(err.to_string().contains("answers"));
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let result = registry().validate("grade_quiz", &json!({"quizId": 1, "answers": "b"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(registry().validate("grade_quiz", &json!([1, 2])).is_err());
    }

    #[test]
    fn test_valid_payload() {
        let payload = json!({"quizId": 1, "answers": ["a", "c"]});
        assert!(registry().validate("grade_quiz", &payload).is_ok());
    }

    #[test]
    fn test_schema_from_config() {
        let schema: PayloadSchema =
            serde_json::from_str(r#"{"required_fields": ["lessonId"], "field_kinds": {"lessonId": "string"}}"#)
                .unwrap();
        assert_eq!(schema.field_kinds.get("lessonId"), Some(&FieldKind::String));
    }
}
