use super::ExecutionError;
use crate::function::{Function, PropertyLocation};
use crate::http::query_value_string;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

static PATH_PARAM: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{([^{}]+)\}").unwrap());

/// Everything needed to perform one plugin API call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OperationExecutionParams {
    /// May still contain `{name}` placeholders.
    pub url: String,
    /// Upper-case HTTP verb.
    pub method: String,
    /// Query and path arguments. Path entries are removed when substituted.
    pub query_params: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_media_type: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// The user's request, used to phrase a clarifying question.
    #[serde(default)]
    pub prompt: String,
}

impl OperationExecutionParams {
    /// Split detected arguments by where each property goes in the request.
    pub fn from_detected(
        function: &Function,
        arguments: &Value,
        headers: BTreeMap<String, String>,
        auth_query_params: BTreeMap<String, String>,
    ) -> Self {
        let mut query_params = BTreeMap::new();
        let mut body = Map::new();
        let mut headers = headers;
        let mut cookies = Vec::new();

        if let Some(args) = arguments.as_object() {
            for (name, value) in args {
                match function.property(name).map(|p| p.location) {
                    Some(PropertyLocation::Path | PropertyLocation::Query) => {
                        query_params.insert(name.clone(), value.clone());
                    }
                    Some(PropertyLocation::Header) => {
                        headers.insert(name.clone(), query_value_string(value));
                    }
                    Some(PropertyLocation::Cookie) => {
                        cookies.push(format!("{name}={}", query_value_string(value)));
                    }
                    Some(PropertyLocation::Body) => {
                        body.insert(name.clone(), value.clone());
                    }
                    None => {
                        debug!(argument = %name, function = %function.name, "argument not in schema, sending as query");
                        query_params.insert(name.clone(), value.clone());
                    }
                }
            }
        }
        if !cookies.is_empty() {
            headers.insert("Cookie".to_string(), cookies.join("; "));
        }
        for (k, v) in auth_query_params {
            query_params.insert(k, Value::String(v));
        }

        let body_media_type = function.body_media_type.clone();
        // a scalar body travels alone, not wrapped in an object
        let scalar_body = function
            .property("body")
            .is_some_and(|p| p.location == PropertyLocation::Body && p.prop_type != "object");
        let body = if body.is_empty() {
            None
        } else if scalar_body && body.len() == 1 {
            body.remove("body")
        } else {
            Some(Value::Object(body))
        };

        Self {
            url: function.api.url.clone(),
            method: function.http_method(),
            query_params,
            body,
            body_media_type,
            headers,
            prompt: String::new(),
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }
}

/// Replace `{name}` placeholders in `url` with values taken out of `query`,
/// each percent-encoded as a single path segment.
pub fn substitute_path_params(url: &str, query: &mut BTreeMap<String, Value>) -> Result<String, ExecutionError> {
    let mut missing = Vec::new();
    let out = PATH_PARAM.replace_all(url, |caps: &Captures| {
        let name = &caps[1];
        match query.remove(name) {
            Some(v) => urlencoding::encode(&query_value_string(&v)).into_owned(),
            None => {
                missing.push(name.to_string());
                caps[0].to_string()
            }
        }
    });
    if !missing.is_empty() {
        return Err(ExecutionError::InvalidRequest(format!(
            "missing path parameter(s): {}",
            missing.join(", ")
        )));
    }
    Ok(out.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::{ApiInfo, FunctionProperty};
    use serde_json::json;

    fn function() -> Function {
        let mut id = FunctionProperty::new("id", "string", PropertyLocation::Path);
        id.required = true;
        Function {
            name: "patch_todos__id_".into(),
            description: String::new(),
            path: "/todos/{id}".into(),
            method: "patch".into(),
            api: ApiInfo {
                url: "https://todo.io/todos/{id}".into(),
                method: "patch".into(),
            },
            param_type: "object".into(),
            param_properties: vec![
                id,
                FunctionProperty::new("verbose", "boolean", PropertyLocation::Query),
                FunctionProperty::new("X-Trace", "string", PropertyLocation::Header),
                FunctionProperty::new("session", "string", PropertyLocation::Cookie),
                FunctionProperty::new("title", "string", PropertyLocation::Body),
                FunctionProperty::new("done", "boolean", PropertyLocation::Body),
            ],
            x_dependent_parameter_map: Default::default(),
            human_usage_examples: vec![],
            signature_helpers: vec![],
            few_shot_examples: vec![],
            body_media_type: Some("application/json".into()),
        }
    }

    #[test]
    fn splits_arguments_by_location() {
        let args = json!({"id": 7, "verbose": true, "X-Trace": "abc", "session": "s1", "title": "t", "done": false, "extra": 1});
        let mut auth = BTreeMap::new();
        auth.insert("api_key".to_string(), "k".to_string());
        let p = OperationExecutionParams::from_detected(&function(), &args, BTreeMap::new(), auth);

        assert_eq!(p.method, "PATCH");
        assert_eq!(p.query_params.get("id"), Some(&json!(7)));
        assert_eq!(p.query_params.get("verbose"), Some(&json!(true)));
        assert_eq!(p.query_params.get("extra"), Some(&json!(1)));
        assert_eq!(p.query_params.get("api_key"), Some(&json!("k")));
        assert_eq!(p.headers.get("X-Trace").map(String::as_str), Some("abc"));
        assert_eq!(p.headers.get("Cookie").map(String::as_str), Some("session=s1"));
        assert_eq!(p.body, Some(json!({"title": "t", "done": false})));
    }

    #[test]
    fn substitutes_and_removes_path_params() {
        let mut q = BTreeMap::new();
        q.insert("id".to_string(), json!(42));
        q.insert("owner".to_string(), json!("ana"));
        q.insert("limit".to_string(), json!(5));
        let url = substitute_path_params("https://x.io/users/{owner}/todos/{id}", &mut q).unwrap();
        assert_eq!(url, "https://x.io/users/ana/todos/42");
        assert_eq!(q.keys().collect::<Vec<_>>(), vec!["limit"]);
    }

    #[test]
    fn path_values_are_encoded_as_one_segment() {
        let mut q = BTreeMap::new();
        q.insert("name".to_string(), json!("a/b c?d"));
        let url = substitute_path_params("https://x.io/files/{name}/meta", &mut q).unwrap();
        assert_eq!(url, "https://x.io/files/a%2Fb%20c%3Fd/meta");
    }

    #[test]
    fn missing_path_param_is_invalid_request() {
        let mut q = BTreeMap::new();
        let err = substitute_path_params("https://x.io/todos/{id}", &mut q).unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidRequest(ref m) if m.contains("id")));
    }
}
