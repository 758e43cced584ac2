use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

/// Nested `$ref` chains deeper than this are left unexpanded.
const MAX_REF_DEPTH: usize = 16;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum OpenApiParseError {
    #[error("OpenAPI document has no servers[0].url")]
    MissingServerUrl,
    #[error("OpenAPI document has no paths")]
    NoPaths,
    #[error("unsupported request body media type for {method} {path}: {media_types:?}")]
    UnsupportedMediaType {
        path: String,
        method: String,
        media_types: Vec<String>,
    },
    #[error("invalid OpenAPI document: {0}")]
    InvalidDocument(String),
    #[error("unresolved reference `{0}`")]
    UnresolvedRef(String),
}

/// A parsed OpenAPI 3.x document with its `#/components/...` reference map.
#[derive(Debug, Clone)]
pub struct OpenApiDoc {
    raw: Value,
    refs: HashMap<String, Value>,
}

impl OpenApiDoc {
    /// Accepts JSON or YAML text.
    pub fn parse(text: &str) -> Result<Self, OpenApiParseError> {
        let trimmed = text.trim_start();
        let raw: Value = if trimmed.starts_with('{') {
            serde_json::from_str(trimmed).map_err(|e| OpenApiParseError::InvalidDocument(format!("json: {e}")))?
        } else {
            serde_yaml_bw::from_str(text).map_err(|e| OpenApiParseError::InvalidDocument(format!("yaml: {e}")))?
        };
        Self::from_value(raw)
    }

    pub fn from_value(raw: Value) -> Result<Self, OpenApiParseError> {
        if !raw.is_object() {
            return Err(OpenApiParseError::InvalidDocument(
                "top level must be an object".to_string(),
            ));
        }
        let mut refs = HashMap::new();
        if let Some(components) = raw.get("components").and_then(Value::as_object) {
            for (kind, entries) in components {
                let Some(entries) = entries.as_object() else {
                    continue;
                };
                for (name, value) in entries {
                    refs.insert(format!("#/components/{kind}/{name}"), value.clone());
                }
            }
        }
        debug!(refs = refs.len(), "openapi reference map built");
        Ok(Self { raw, refs })
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn title(&self) -> Option<&str> {
        self.raw.pointer("/info/title").and_then(Value::as_str)
    }

    pub fn server_url(&self) -> Result<&str, OpenApiParseError> {
        self.raw
            .pointer("/servers/0/url")
            .and_then(Value::as_str)
            .filter(|u| !u.trim().is_empty())
            .ok_or(OpenApiParseError::MissingServerUrl)
    }

    pub fn paths(&self) -> Result<&Map<String, Value>, OpenApiParseError> {
        self.raw
            .get("paths")
            .and_then(Value::as_object)
            .filter(|p| !p.is_empty())
            .ok_or(OpenApiParseError::NoPaths)
    }

    pub fn lookup_ref(&self, reference: &str) -> Result<&Value, OpenApiParseError> {
        self.refs
            .get(reference)
            .ok_or_else(|| OpenApiParseError::UnresolvedRef(reference.to_string()))
    }

    /// Expand every `$ref` inside `value`.
    ///
    /// A reference already being expanded further up (a cycle), or one past
    /// the depth limit, is left in place as `{"$ref": ...}`.
    pub fn resolve(&self, value: &Value) -> Result<Value, OpenApiParseError> {
        let mut stack = Vec::new();
        self.resolve_inner(value, &mut stack)
    }

    fn resolve_inner(&self, value: &Value, stack: &mut Vec<String>) -> Result<Value, OpenApiParseError> {
        match value {
            Value::Object(map) => {
                if let Some(reference) = map.get("$ref").and_then(Value::as_str) {
                    if stack.iter().any(|r| r == reference) || stack.len() >= MAX_REF_DEPTH {
                        warn!(reference, depth = stack.len(), "not expanding recursive $ref");
                        return Ok(value.clone());
                    }
                    let target = self.lookup_ref(reference)?;
                    stack.push(reference.to_string());
                    let resolved = self.resolve_inner(target, stack);
                    stack.pop();
                    return resolved;
                }
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.resolve_inner(v, stack)?);
                }
                Ok(Value::Object(out))
            }
            Value::Array(items) => items
                .iter()
                .map(|v| self.resolve_inner(v, stack))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            other => Ok(other.clone()),
        }
    }
}

/// Join a server URL and a path, collapsing one shared slash.
pub fn join_url(server: &str, path: &str) -> String {
    match (server.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", server, &path[1..]),
        (false, false) if !path.is_empty() => format!("{server}/{path}"),
        _ => format!("{server}{path}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_yaml_and_keeps_path_order() {
        let yaml = r#"
openapi: 3.0.0
info:
  title: Todo
servers:
  - url: https://api.example.com/
paths:
  /todos:
    get:
      summary: list
  /alpha:
    post:
      summary: create
"#;
        let doc = OpenApiDoc::parse(yaml).unwrap();
        assert_eq!(doc.title(), Some("Todo"));
        assert_eq!(doc.server_url().unwrap(), "https://api.example.com/");
        let keys: Vec<_> = doc.paths().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["/todos", "/alpha"]);
    }

    #[test]
    fn missing_server_and_paths_are_errors() {
        let doc = OpenApiDoc::from_value(json!({"openapi": "3.0.0"})).unwrap();
        assert_eq!(doc.server_url(), Err(OpenApiParseError::MissingServerUrl));
        assert_eq!(doc.paths().unwrap_err(), OpenApiParseError::NoPaths);
        assert!(matches!(
            OpenApiDoc::parse("[1, 2]"),
            Err(OpenApiParseError::InvalidDocument(_))
        ));
    }

    #[test]
    fn resolves_nested_refs() {
        let doc = OpenApiDoc::from_value(json!({
            "components": {"schemas": {
                "Pet": {"type": "object", "properties": {"owner": {"$ref": "#/components/schemas/Owner"}}},
                "Owner": {"type": "object", "properties": {"name": {"type": "string"}}}
            }}
        }))
        .unwrap();
        let resolved = doc.resolve(&json!({"$ref": "#/components/schemas/Pet"})).unwrap();
        assert_eq!(resolved.pointer("/properties/owner/properties/name/type"), Some(&json!("string")));
    }

    #[test]
    fn cyclic_refs_stop_expanding() {
        let doc = OpenApiDoc::from_value(json!({
            "components": {"schemas": {
                "Node": {"type": "object", "properties": {"next": {"$ref": "#/components/schemas/Node"}}}
            }}
        }))
        .unwrap();
        let resolved = doc.resolve(&json!({"$ref": "#/components/schemas/Node"})).unwrap();
        assert_eq!(
            resolved.pointer("/properties/next"),
            Some(&json!({"$ref": "#/components/schemas/Node"}))
        );
    }

    #[test]
    fn unknown_ref_is_reported() {
        let doc = OpenApiDoc::from_value(json!({})).unwrap();
        let err = doc.resolve(&json!({"$ref": "#/components/schemas/Missing"})).unwrap_err();
        assert_eq!(err, OpenApiParseError::UnresolvedRef("#/components/schemas/Missing".into()));
    }

    #[test]
    fn join_url_collapses_one_slash() {
        assert_eq!(join_url("https://a.io/", "/x"), "https://a.io/x");
        assert_eq!(join_url("https://a.io", "/x"), "https://a.io/x");
        assert_eq!(join_url("https://a.io", "x"), "https://a.io/x");
        assert_eq!(join_url("https://a.io/v1/", "x"), "https://a.io/v1/x");
    }
}
