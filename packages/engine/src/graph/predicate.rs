// packages/engine/src/graph/predicate.rs
//! Conditions on the scratch state

use super::execution::Scratch;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Condition on a single scratch key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    Equals { key: String, value: Value },
    NotEquals { key: String, value: Value },
    Exists { key: String },
    Missing { key: String },
    GreaterThan { key: String, value: f64 },
    LessThan { key: String, value: f64 },
    /// Substring for strings, membership for arrays
    Contains { key: String, value: Value },
    /// Non-empty, non-zero, non-false, non-null
    Truthy { key: String },
}

impl Predicate {
    pub fn key(&self) -> &str {
        match self {
            Predicate::Equals { key, .. }
            | Predicate::NotEquals { key, .. }
            | Predicate::Exists { key }
            | Predicate::Missing { key }
            | Predicate::GreaterThan { key, .. }
            | Predicate::LessThan { key, .. }
            | Predicate::Contains { key, .. }
            | Predicate::Truthy { key } => key,
        }
    }

    pub fn evaluate(&self, scratch: &Scratch) -> bool {
        let current = scratch.get(self.key());
        match self {
            Predicate::Equals { value, .. } => current == Some(value),
            Predicate::NotEquals { value, .. } => current != Some(value),
            Predicate::Exists { .. } => current.is_some(),
            Predicate::Missing { .. } => current.is_none(),
            Predicate::GreaterThan { value, .. } => {
                current.and_then(as_number).map(|n| n > *value).unwrap_or(false)
            }
            Predicate::LessThan { value, .. } => {
                current.and_then(as_number).map(|n| n < *value).unwrap_or(false)
            }
            Predicate::Contains { value, .. } => match (current, value) {
                (Some(Value::String(haystack)), Value::String(needle)) => {
                    haystack.contains(needle.as_str())
                }
                (Some(Value::Array(items)), needle) => items.contains(needle),
                _ => false,
            },
            Predicate::Truthy { .. } => current.map(is_truthy).unwrap_or(false),
        }
    }
}

/// Numbers, and strings that parse as numbers (model output is text)
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "false" && s != "0",
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scratch() -> Scratch {
        let mut s = Scratch::new();
        s.insert("verdict".into(), json!("approve"));
        s.insert("score".into(), json!(0.72));
        s.insert("count".into(), json!("3"));
        s.insert("tags".into(), json!(["urgent", "billing"]));
        s.insert("flag".into(), json!(false));
        s
    }

    #[test]
    fn test_equality() {
        let s = scratch();
        assert!(Predicate::Equals { key: "verdict".into(), value: json!("approve") }.evaluate(&s));
        assert!(Predicate::NotEquals { key: "verdict".into(), value: json!("reject") }.evaluate(&s));
        assert!(!Predicate::Equals { key: "nope".into(), value: json!(null) }.evaluate(&s));
    }

    #[test]
    fn test_numeric_comparisons() {
        let s = scratch();
        assert!(Predicate::GreaterThan { key: "score".into(), value: 0.5 }.evaluate(&s));
        assert!(Predicate::LessThan { key: "count".into(), value: 5.0 }.evaluate(&s));
        assert!(!Predicate::GreaterThan { key: "verdict".into(), value: 0.0 }.evaluate(&s));
    }

    #[test]
    fn test_presence_and_contains() {
        let s = scratch();
        assert!(Predicate::Exists { key: "tags".into() }.evaluate(&s));
        assert!(Predicate::Missing { key: "summary".into() }.evaluate(&s));
        assert!(Predicate::Contains { key: "tags".into(), value: json!("billing") }.evaluate(&s));
        assert!(Predicate::Contains { key: "verdict".into(), value: json!("prov") }.evaluate(&s));
    }

    #[test]
    fn test_truthiness() {
        let s = scratch();
        assert!(Predicate::Truthy { key: "verdict".into() }.evaluate(&s));
        assert!(!Predicate::Truthy { key: "flag".into() }.evaluate(&s));
        assert!(!Predicate::Truthy { key: "missing".into() }.evaluate(&s));
    }

    #[test]
    fn test_parse_from_yaml() {
        let p: Predicate = serde_yaml::from_str("op: greater_than\nkey: score\nvalue: 0.9\n").unwrap();
        assert_eq!(p, Predicate::GreaterThan { key: "score".into(), value: 0.9 });
    }
}
