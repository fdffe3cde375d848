//! Per-queue payload schema validation.
//!
//! Queues may carry a [`MessageSchema`]: a list of rules evaluated against
//! the payload JSON at publish time. A payload that violates any rule is
//! rejected as `invalid_request` before it reaches the backend.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl FieldType {
    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "rule")]
pub enum ValidationRule {
    Required { field: String },
    Type { field: String, expected: FieldType },
    MinLength { field: String, min: usize },
    MaxLength { field: String, max: usize },
    MinValue { field: String, min: f64 },
    MaxValue { field: String, max: f64 },
    Pattern { field: String, pattern: String },
    Enum { field: String, values: Vec<String> },
}

impl ValidationRule {
    fn field(&self) -> &str {
        match self {
            Self::Required { field }
            | Self::Type { field, .. }
            | Self::MinLength { field, .. }
            | Self::MaxLength { field, .. }
            | Self::MinValue { field, .. }
            | Self::MaxValue { field, .. }
            | Self::Pattern { field, .. }
            | Self::Enum { field, .. } => field,
        }
    }

    /// Returns a violation message, or `None` when the rule holds.
    ///
    /// Rules other than `required` pass vacuously on an absent field, so a
    /// schema can constrain optional fields without forcing their presence.
    fn check(&self, payload: &Value) -> Option<String> {
        let field = self.field();
        let value = payload.get(field);

        match self {
            Self::Required { .. } => match value {
                Some(v) if !v.is_null() => None,
                _ => Some(format!("field '{field}' is required")),
            },
            Self::Type { expected, .. } => value.and_then(|v| {
                (!expected.matches(v))
                    .then(|| format!("field '{field}' must be of type {}", expected.name()))
            }),
            Self::MinLength { min, .. } => value.and_then(Value::as_str).and_then(|s| {
                (s.chars().count() < *min)
                    .then(|| format!("field '{field}' must be at least {min} characters"))
            }),
            Self::MaxLength { max, .. } => value.and_then(Value::as_str).and_then(|s| {
                (s.chars().count() > *max)
                    .then(|| format!("field '{field}' must be at most {max} characters"))
            }),
            Self::MinValue { min, .. } => value.and_then(Value::as_f64).and_then(|n| {
                (n < *min).then(|| format!("field '{field}' must be >= {min}"))
            }),
            Self::MaxValue { max, .. } => value.and_then(Value::as_f64).and_then(|n| {
                (n > *max).then(|| format!("field '{field}' must be <= {max}"))
            }),
            Self::Pattern { pattern, .. } => value.and_then(Value::as_str).and_then(|s| {
                // The whole value must match, not just a substring.
                match regex::Regex::new(&format!("^(?:{pattern})$")) {
                    Ok(re) => (!re.is_match(s))
                        .then(|| format!("field '{field}' must match pattern '{pattern}'")),
                    Err(_) => Some(format!(
                        "field '{field}' has an unparseable pattern '{pattern}'"
                    )),
                }
            }),
            Self::Enum { values, .. } => value.and_then(Value::as_str).and_then(|s| {
                (!values.iter().any(|v| v == s)).then(|| {
                    format!("field '{field}' must be one of [{}]", values.join(", "))
                })
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSchema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub rules: Vec<ValidationRule>,
}

/// Registry of per-queue schemas, safe for concurrent use by the mailbox
/// workers. Queues without a registered schema accept any payload.
#[derive(Default)]
pub struct MessageValidator {
    schemas: RwLock<HashMap<String, MessageSchema>>,
}

impl MessageValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_schema(&self, queue: impl Into<String>, schema: MessageSchema) {
        self.schemas.write().insert(queue.into(), schema);
    }

    pub fn unregister_schema(&self, queue: &str) {
        self.schemas.write().remove(queue);
    }

    pub fn has_schema(&self, queue: &str) -> bool {
        self.schemas.read().contains_key(queue)
    }

    pub fn validate(&self, queue: &str, payload: &str) -> Result<(), Error> {
        let schemas = self.schemas.read();
        let Some(schema) = schemas.get(queue) else {
            return Ok(());
        };

        let value: Value = serde_json::from_str(payload).map_err(|e| {
            Error::invalid_request(format!("payload is not valid JSON: {e}"))
        })?;

        let errors: Vec<String> = schema
            .rules
            .iter()
            .filter_map(|rule| rule.check(&value))
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::invalid_request(format!(
                "schema '{}': {}",
                schema.name,
                errors.join("; ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(rules: Vec<ValidationRule>) -> MessageSchema {
        MessageSchema {
            name: "order".into(),
            description: String::new(),
            rules,
        }
    }

    fn validator_with(rules: Vec<ValidationRule>) -> MessageValidator {
        let v = MessageValidator::new();
        v.register_schema("orders", schema(rules));
        v
    }

    #[test]
    fn queue_without_schema_accepts_anything() {
        let v = MessageValidator::new();
        assert!(v.validate("orders", "not even json").is_ok());
    }

    #[test]
    fn required_field_must_be_present_and_non_null() {
        let v = validator_with(vec![ValidationRule::Required {
            field: "sku".into(),
        }]);
        assert!(v.validate("orders", r#"{"sku": "a-1"}"#).is_ok());
        assert!(v.validate("orders", r#"{"sku": null}"#).is_err());
        assert!(v.validate("orders", r#"{}"#).is_err());
    }

    #[test]
    fn type_and_range_rules() {
        let v = validator_with(vec![
            ValidationRule::Type {
                field: "qty".into(),
                expected: FieldType::Number,
            },
            ValidationRule::MinValue {
                field: "qty".into(),
                min: 1.0,
            },
            ValidationRule::MaxValue {
                field: "qty".into(),
                max: 100.0,
            },
        ]);
        assert!(v.validate("orders", r#"{"qty": 10}"#).is_ok());
        assert!(v.validate("orders", r#"{"qty": "ten"}"#).is_err());
        assert!(v.validate("orders", r#"{"qty": 0}"#).is_err());
        assert!(v.validate("orders", r#"{"qty": 101}"#).is_err());
    }

    #[test]
    fn optional_fields_pass_constraint_rules_when_absent() {
        let v = validator_with(vec![ValidationRule::MinLength {
            field: "note".into(),
            min: 3,
        }]);
        assert!(v.validate("orders", r#"{}"#).is_ok());
        assert!(v.validate("orders", r#"{"note": "ab"}"#).is_err());
        assert!(v.validate("orders", r#"{"note": "abc"}"#).is_ok());
    }

    #[test]
    fn pattern_rule_requires_a_full_match() {
        let v = validator_with(vec![ValidationRule::Pattern {
            field: "sku".into(),
            pattern: "[a-z]+-[0-9]+".into(),
        }]);
        assert!(v.validate("orders", r#"{"sku": "ab-12"}"#).is_ok());
        assert!(v.validate("orders", r#"{"sku": "AB-12"}"#).is_err());
        // A substring match is not enough.
        assert!(v.validate("orders", r#"{"sku": "xab-12x"}"#).is_err());
        // Absent fields pass; pairing with `required` forces presence.
        assert!(v.validate("orders", r#"{}"#).is_ok());
    }

    #[test]
    fn unparseable_pattern_is_a_violation() {
        let v = validator_with(vec![ValidationRule::Pattern {
            field: "sku".into(),
            pattern: "(".into(),
        }]);
        assert!(v.validate("orders", r#"{"sku": "anything"}"#).is_err());
    }

    #[test]
    fn enum_rule_restricts_values() {
        let v = validator_with(vec![ValidationRule::Enum {
            field: "kind".into(),
            values: vec!["std".into(), "express".into()],
        }]);
        assert!(v.validate("orders", r#"{"kind": "express"}"#).is_ok());
        assert!(v.validate("orders", r#"{"kind": "teleport"}"#).is_err());
    }

    #[test]
    fn non_json_payload_is_rejected_when_schema_present() {
        let v = validator_with(vec![]);
        assert!(v.validate("orders", "{{nope").is_err());
    }

    #[test]
    fn all_violations_are_reported() {
        let v = validator_with(vec![
            ValidationRule::Required {
                field: "sku".into(),
            },
            ValidationRule::Required {
                field: "qty".into(),
            },
        ]);
        let err = v.validate("orders", r#"{}"#).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("sku"));
        assert!(text.contains("qty"));
    }
}
