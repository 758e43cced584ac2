use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Values resolved for dependent parameters so far.
///
/// Each round produces a new accumulator; earlier ones are left as they were.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedArguments {
    values: BTreeMap<String, Value>,
}

impl ResolvedArguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(&self, parameter: impl Into<String>, value: Value) -> Self {
        let mut values = self.values.clone();
        values.insert(parameter.into(), value);
        Self { values }
    }

    pub fn get(&self, parameter: &str) -> Option<&Value> {
        self.values.get(parameter)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.values.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    /// `arguments` with every resolved value filled in where the key is absent.
    pub fn fill_missing(&self, arguments: &Value) -> Value {
        let mut out = arguments.as_object().cloned().unwrap_or_else(Map::new);
        for (k, v) in &self.values {
            out.entry(k.clone()).or_insert_with(|| v.clone());
        }
        Value::Object(out)
    }

    /// `arguments` with every resolved value written over.
    pub fn overlay(&self, arguments: &Value) -> Value {
        let mut out = arguments.as_object().cloned().unwrap_or_else(Map::new);
        for (k, v) in &self.values {
            out.insert(k.clone(), v.clone());
        }
        Value::Object(out)
    }
}

/// One narrowed resolution round, kept for tracing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct XDepTrace {
    pub prompt: String,
    /// The dependent parameter this round resolved; `None` for the final round.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn with_leaves_the_original_untouched() {
        let first = ResolvedArguments::new();
        let second = first.with("user_id", json!(7));
        assert!(first.is_empty());
        assert_eq!(second.get("user_id"), Some(&json!(7)));
    }

    #[test]
    fn fill_missing_keeps_model_arguments() {
        let r = ResolvedArguments::new().with("a", json!(1)).with("b", json!(2));
        let out = r.fill_missing(&json!({"a": 9, "c": 3}));
        assert_eq!(out, json!({"a": 9, "b": 2, "c": 3}));
        let out = r.overlay(&json!({"a": 9}));
        assert_eq!(out, json!({"a": 1, "b": 2}));
    }
}
