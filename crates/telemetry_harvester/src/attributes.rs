//! Attribute bags and their validation pass.
//!
//! Callers hand the harvester arbitrary `serde_json::Value`s. Before anything
//! is buffered the bag is vetted into [`AttributeValue`]s; entries outside
//! bool/number/string are dropped and reported as [`AttributeError`]s.

use crate::error::{AttributeError, AttributeErrorKind};
use serde::Serialize;
use serde_json::value::RawValue;
use serde_json::{Number, Value};
use std::collections::{BTreeMap, HashMap};

/// Attribute input type accepted by spans, metrics and the common block.
pub type Attributes = HashMap<String, Value>;

/// Validated attribute map. Sorted so encoded payloads are stable.
pub type VettedAttributes = BTreeMap<String, AttributeValue>;

/// An attribute value that survived validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Number(Number),
    String(String),
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        Self::Number(v.into())
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Vets a single value.
pub fn vet_value(key: &str, value: &Value) -> Result<AttributeValue, AttributeError> {
    match value {
        Value::Bool(b) => Ok(AttributeValue::Bool(*b)),
        Value::Number(n) => Ok(AttributeValue::Number(n.clone())),
        Value::String(s) => Ok(AttributeValue::String(s.clone())),
        Value::Null => Err(AttributeError {
            key: key.to_string(),
            kind: AttributeErrorKind::Nil,
        }),
        other => Err(AttributeError {
            key: key.to_string(),
            kind: AttributeErrorKind::Unsupported(type_name(other)),
        }),
    }
}

/// Vets a whole bag, keeping valid entries and collecting the rejects.
pub fn vet_attributes(attributes: &Attributes) -> (VettedAttributes, Vec<AttributeError>) {
    let mut vetted = VettedAttributes::new();
    let mut errors = Vec::new();

    for (key, value) in attributes {
        match vet_value(key, value) {
            Ok(v) => {
                vetted.insert(key.clone(), v);
            }
            Err(e) => errors.push(e),
        }
    }

    // Deterministic report order regardless of HashMap iteration.
    errors.sort_by(|a, b| a.key.cmp(&b.key));
    (vetted, errors)
}

/// Pre-serializes a vetted bag. Empty bags encode to `None`.
pub(crate) fn to_raw(vetted: &VettedAttributes) -> Option<Box<RawValue>> {
    if vetted.is_empty() {
        return None;
    }
    serde_json::value::to_raw_value(vetted).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bag(value: Value) -> Attributes {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_vet_keeps_scalars() {
        let (vetted, errors) = vet_attributes(&bag(json!({
            "bool": true,
            "int": 123,
            "float": 1.5,
            "str": "zap",
        })));

        assert!(errors.is_empty());
        assert_eq!(vetted.len(), 4);
        assert_eq!(vetted["bool"], AttributeValue::Bool(true));
        assert_eq!(vetted["int"], AttributeValue::from(123));
        assert_eq!(vetted["str"], AttributeValue::from("zap"));
    }

    #[test]
    fn test_vet_drops_invalid() {
        let (vetted, errors) = vet_attributes(&bag(json!({
            "bool": true,
            "bad": {},
            "int": 123,
            "remove-me": [1, 2],
            "nil-is-invalid": null,
        })));

        assert_eq!(vetted.len(), 2);
        assert_eq!(errors.len(), 3);
        assert_eq!(errors[0].key, "bad");
        assert_eq!(errors[0].kind, AttributeErrorKind::Unsupported("object"));
        assert_eq!(errors[1].kind, AttributeErrorKind::Nil);
        assert_eq!(errors[2].kind, AttributeErrorKind::Unsupported("array"));
    }

    #[test]
    fn test_integers_encode_without_fraction() {
        let (vetted, _) = vet_attributes(&bag(json!({"a": 1, "b": "x", "c": false})));
        let raw = to_raw(&vetted).unwrap();
        assert_eq!(raw.get(), r#"{"a":1,"b":"x","c":false}"#);
    }

    #[test]
    fn test_empty_bag_has_no_raw_form() {
        assert!(to_raw(&VettedAttributes::new()).is_none());
    }
}
