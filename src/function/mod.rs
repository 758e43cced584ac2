pub mod compiler;

pub use compiler::{compile, sanitize};

use crate::message::FewShotExample;
use crate::openapi::OpenApiParseError;
use crate::plugin::{OperationKey, Plugin};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// Maximum length of a function name accepted by the function-calling APIs.
pub const MAX_FUNCTION_NAME_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Parse(#[from] OpenApiParseError),
    #[error("function `{0}` is already registered")]
    DuplicateFunction(String),
}

/// Where an argument goes in the HTTP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PropertyLocation {
    Path,
    Query,
    Header,
    Cookie,
    Body,
}

impl PropertyLocation {
    pub fn from_openapi(value: &str) -> Option<Self> {
        match value {
            "path" => Some(Self::Path),
            "query" => Some(Self::Query),
            "header" => Some(Self::Header),
            "cookie" => Some(Self::Cookie),
            _ => None,
        }
    }
}

/// One argument of a compiled function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FunctionProperty {
    pub name: String,
    #[serde(rename = "type")]
    pub prop_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<Value>,
    /// Item schema for `array` properties.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Value>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub write_only: bool,
    #[serde(default)]
    pub required: bool,
    pub location: PropertyLocation,
    /// Operation whose response supplies this argument.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_dependent: Option<OperationKey>,
}

impl FunctionProperty {
    pub fn new(name: impl Into<String>, prop_type: impl Into<String>, location: PropertyLocation) -> Self {
        Self {
            name: name.into(),
            prop_type: prop_type.into(),
            description: None,
            enum_values: None,
            example: None,
            default: None,
            format: None,
            pattern: None,
            min_length: None,
            max_length: None,
            minimum: None,
            maximum: None,
            items: None,
            read_only: false,
            write_only: false,
            required: false,
            location,
            x_dependent: None,
        }
    }

    /// JSON Schema fragment for this property as shown to the model.
    pub fn schema_json(&self) -> Value {
        let mut out = Map::new();
        out.insert("type".into(), Value::String(self.prop_type.clone()));
        if let Some(d) = &self.description {
            out.insert("description".into(), Value::String(d.clone()));
        }
        if let Some(e) = &self.enum_values {
            out.insert("enum".into(), Value::Array(e.clone()));
        }
        let optional = [
            ("example", self.example.clone()),
            ("default", self.default.clone()),
            ("format", self.format.clone().map(Value::String)),
            ("pattern", self.pattern.clone().map(Value::String)),
            ("minLength", self.min_length.map(Value::from)),
            ("maxLength", self.max_length.map(Value::from)),
            ("minimum", self.minimum.clone()),
            ("maximum", self.maximum.clone()),
        ];
        for (key, value) in optional {
            if let Some(v) = value {
                out.insert(key.into(), v);
            }
        }
        if self.prop_type == "array" {
            out.insert("items".into(), self.items.clone().unwrap_or_else(|| json!({})));
        }
        if self.read_only {
            out.insert("readOnly".into(), Value::Bool(true));
        }
        if self.write_only {
            out.insert("writeOnly".into(), Value::Bool(true));
        }
        Value::Object(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ApiInfo {
    pub url: String,
    pub method: String,
}

/// An OpenAPI operation compiled into an LLM-callable function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Function {
    pub name: String,
    pub description: String,
    pub path: String,
    /// Lower-case OpenAPI method; `any` for the any-method extension.
    pub method: String,
    pub api: ApiInfo,
    pub param_type: String,
    pub param_properties: Vec<FunctionProperty>,
    #[serde(default)]
    pub x_dependent_parameter_map: BTreeMap<String, OperationKey>,
    #[serde(default)]
    pub human_usage_examples: Vec<String>,
    #[serde(default)]
    pub signature_helpers: Vec<String>,
    #[serde(default)]
    pub few_shot_examples: Vec<FewShotExample>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_media_type: Option<String>,
}

impl Function {
    pub fn operation_key(&self) -> OperationKey {
        OperationKey::new(&self.path, &self.method)
    }

    /// Upper-case verb used on the wire.
    pub fn http_method(&self) -> String {
        http_method_for(&self.method)
    }

    pub fn property(&self, name: &str) -> Option<&FunctionProperty> {
        self.param_properties.iter().find(|p| p.name == name)
    }

    pub fn required_names(&self) -> Vec<&str> {
        self.param_properties
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect()
    }

    pub fn dependent_properties(&self) -> impl Iterator<Item = (&FunctionProperty, &OperationKey)> {
        self.param_properties
            .iter()
            .filter_map(|p| p.x_dependent.as_ref().map(|k| (p, k)))
    }

    /// `{"type": "object", "properties": {..}, "required": [..]}`.
    pub fn parameters_schema(&self) -> Value {
        let properties = self
            .param_properties
            .iter()
            .map(|p| (p.name.clone(), p.schema_json()))
            .collect::<Map<_, _>>();
        json!({
            "type": self.param_type,
            "properties": properties,
            "required": self.required_names(),
        })
    }

    pub fn openai_function_json(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "parameters": self.parameters_schema(),
        })
    }

    pub fn litellm_json(&self) -> Value {
        json!({"type": "function", "function": self.openai_function_json()})
    }
}

pub fn http_method_for(method: &str) -> String {
    match method {
        "any" => "POST".to_string(),
        other => other.to_ascii_uppercase(),
    }
}

/// All functions available for one resolution round, with the plugin each came from.
#[derive(Debug, Clone, Default)]
pub struct Functions {
    functions: Vec<Function>,
    function_map: HashMap<String, usize>,
    plugin_map: HashMap<String, Arc<Plugin>>,
}

impl Functions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile `plugin` (optionally one operation only) and register the results.
    pub fn add_from_plugin(
        &mut self,
        plugin: Arc<Plugin>,
        selected: Option<&OperationKey>,
    ) -> Result<(), CompileError> {
        let compiled = compile(plugin.openapi_doc(), &plugin.plugin_operations, selected)?;
        for function in compiled {
            self.add_function(plugin.clone(), function)?;
        }
        Ok(())
    }

    pub fn add_function(&mut self, plugin: Arc<Plugin>, function: Function) -> Result<(), CompileError> {
        if self.function_map.contains_key(&function.name) {
            return Err(CompileError::DuplicateFunction(function.name));
        }
        self.function_map.insert(function.name.clone(), self.functions.len());
        self.plugin_map.insert(function.name.clone(), plugin);
        self.functions.push(function);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Function> {
        self.functions.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.functions.iter().map(|f| f.name.as_str()).collect()
    }

    /// Map a detected function name back to its plugin and function.
    pub fn get_function(&self, name: &str) -> Option<(Arc<Plugin>, &Function)> {
        let idx = *self.function_map.get(name)?;
        let plugin = self.plugin_map.get(name)?.clone();
        Some((plugin, &self.functions[idx]))
    }

    pub fn openai_json(&self) -> Vec<Value> {
        self.functions.iter().map(Function::openai_function_json).collect()
    }

    pub fn litellm_json(&self) -> Vec<Value> {
        self.functions.iter().map(Function::litellm_json).collect()
    }

    pub fn human_usage_examples_prompt(&self) -> String {
        self.prompt_fragment("Examples of how users phrase requests", |f| &f.human_usage_examples)
    }

    pub fn signature_helpers_prompt(&self) -> String {
        self.prompt_fragment("Hints for choosing arguments", |f| &f.signature_helpers)
    }

    fn prompt_fragment(&self, heading: &str, pick: impl Fn(&Function) -> &Vec<String>) -> String {
        let mut out = String::new();
        for function in &self.functions {
            let lines = pick(function);
            if lines.is_empty() {
                continue;
            }
            if out.is_empty() {
                out.push_str(heading);
                out.push_str(":\n");
            }
            for line in lines {
                out.push_str(&format!("- {}: {}\n", function.name, line));
            }
        }
        out
    }

    pub fn few_shot_examples(&self) -> Vec<FewShotExample> {
        self.functions
            .iter()
            .flat_map(|f| f.few_shot_examples.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_function(name: &str) -> Function {
        let mut id = FunctionProperty::new("id", "string", PropertyLocation::Path);
        id.required = true;
        let mut tags = FunctionProperty::new("tags", "array", PropertyLocation::Query);
        tags.items = Some(json!({"type": "string"}));
        tags.max_length = Some(5);
        Function {
            name: name.to_string(),
            description: "Fetch a todo".into(),
            path: "/todos/{id}".into(),
            method: "get".into(),
            api: ApiInfo {
                url: "https://api.example.com/todos/{id}".into(),
                method: "get".into(),
            },
            param_type: "object".into(),
            param_properties: vec![id, tags],
            x_dependent_parameter_map: BTreeMap::new(),
            human_usage_examples: vec!["show todo 3".into()],
            signature_helpers: vec![],
            few_shot_examples: vec![],
            body_media_type: None,
        }
    }

    #[test]
    fn openai_json_carries_required_and_items() {
        let f = sample_function("get_todos__id_");
        let j = f.openai_function_json();
        assert_eq!(j["name"], "get_todos__id_");
        assert_eq!(j["parameters"]["required"], json!(["id"]));
        assert_eq!(j["parameters"]["properties"]["tags"]["items"], json!({"type": "string"}));
        assert_eq!(j["parameters"]["properties"]["tags"]["maxLength"], json!(5));
        let l = f.litellm_json();
        assert_eq!(l["type"], "function");
        assert_eq!(l["function"], j);
    }

    #[test]
    fn any_method_executes_as_post() {
        assert_eq!(http_method_for("any"), "POST");
        assert_eq!(http_method_for("delete"), "DELETE");
    }

    #[test]
    fn registry_rejects_duplicates_and_resolves_names() {
        let plugin = Arc::new(Plugin::for_tests("todo"));
        let mut functions = Functions::new();
        functions.add_function(plugin.clone(), sample_function("a")).unwrap();
        functions.add_function(plugin.clone(), sample_function("b")).unwrap();
        let err = functions.add_function(plugin, sample_function("a")).unwrap_err();
        assert!(matches!(err, CompileError::DuplicateFunction(n) if n == "a"));
        assert_eq!(functions.names(), vec!["a", "b"]);
        let (p, f) = functions.get_function("b").unwrap();
        assert_eq!(p.name, "todo");
        assert_eq!(f.name, "b");
        assert!(functions.get_function("zzz").is_none());
    }

    #[test]
    fn prompt_fragments_list_examples_per_function() {
        let plugin = Arc::new(Plugin::for_tests("todo"));
        let mut functions = Functions::new();
        functions.add_function(plugin, sample_function("a")).unwrap();
        let text = functions.human_usage_examples_prompt();
        assert!(text.starts_with("Examples of how users phrase requests:"));
        assert!(text.contains("- a: show todo 3"));
        assert_eq!(functions.signature_helpers_prompt(), "");
    }
}
