pub mod loader;

pub use loader::PluginLoader;

use crate::flow_path::{FlowPath, FlowPathConfig};
use crate::message::FewShotExample;
use crate::openapi::{OpenApiDoc, OpenApiParseError, join_url};
use crate::port::PortType;
use crate::processor::ProcessorError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("fetching `{url}` failed: {reason}")]
    Fetch { url: String, reason: String },
    #[error("`{url}` returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("reading `{path}` failed: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid manifest: {0}")]
    Manifest(String),
    #[error("invalid url `{0}`")]
    InvalidUrl(String),
    #[error(transparent)]
    OpenApi(#[from] OpenApiParseError),
    #[error("invalid module `{module}`: {source}")]
    Module {
        module: String,
        #[source]
        source: ProcessorError,
    },
}

/// Identifies one OpenAPI operation. The method is always lower-case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct OperationKey {
    pub path: String,
    #[serde(deserialize_with = "lowercase")]
    pub method: String,
}

fn lowercase<'de, D: serde::Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    String::deserialize(d).map(|s| s.to_ascii_lowercase())
}

impl OperationKey {
    pub fn new(path: impl Into<String>, method: impl AsRef<str>) -> Self {
        Self {
            path: path.into(),
            method: method.as_ref().to_ascii_lowercase(),
        }
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method.to_ascii_uppercase(), self.path)
    }
}

/// Manifest-side hints for one operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PluginOperation {
    #[serde(default)]
    pub human_usage_examples: Vec<String>,
    #[serde(default)]
    pub plugin_signature_helpers: Vec<String>,
    #[serde(default)]
    pub few_shot_examples: Vec<FewShotExample>,
    /// Names of the output modules this operation supports. Empty means all.
    #[serde(default)]
    pub output_modules: Vec<String>,
    /// Parameters filled from another operation's response.
    #[serde(default)]
    pub x_dependent_parameters: BTreeMap<String, OperationKey>,
}

/// path → method → hints
pub type PluginOperations = BTreeMap<String, BTreeMap<String, PluginOperation>>;

/// The plugin manifest as published next to the OpenAPI document.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PluginManifest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legal_info_url: Option<String>,
    /// Absolute, or relative to the manifest location.
    pub openapi_doc_url: String,
    #[serde(default)]
    pub auth: Value,
    #[serde(default)]
    pub plugin_operations: PluginOperations,
    #[serde(default)]
    pub input_modules: Vec<FlowPathConfig>,
    #[serde(default)]
    pub output_modules: Vec<FlowPathConfig>,
    #[serde(default)]
    pub preferred_approaches: Vec<Value>,
}

/// A loaded plugin. Immutable once built; shared as `Arc<Plugin>`.
#[derive(Debug)]
pub struct Plugin {
    pub name: String,
    pub description: String,
    pub version: Option<String>,
    pub contact_email: Option<String>,
    pub logo_url: Option<String>,
    pub legal_info_url: Option<String>,
    pub openapi_doc_url: String,
    pub manifest_url: Option<String>,
    pub auth: Value,
    pub api_endpoints: BTreeSet<String>,
    pub plugin_operations: PluginOperations,
    pub input_modules: Vec<FlowPath>,
    pub output_modules: Vec<FlowPath>,
    pub preferred_approaches: Vec<Value>,
    openapi_doc: OpenApiDoc,
}

impl Plugin {
    pub fn from_manifest(
        manifest: PluginManifest,
        openapi_doc: OpenApiDoc,
        manifest_url: Option<String>,
    ) -> Result<Self, PluginError> {
        let server = openapi_doc.server_url()?;
        let api_endpoints = openapi_doc
            .paths()?
            .keys()
            .map(|path| join_url(server, path))
            .collect();

        let build = |configs: &[FlowPathConfig]| -> Result<Vec<FlowPath>, PluginError> {
            configs
                .iter()
                .map(|cfg| {
                    FlowPath::build(cfg).map_err(|source| PluginError::Module {
                        module: cfg.name.clone(),
                        source,
                    })
                })
                .collect()
        };
        let input_modules = build(&manifest.input_modules)?;
        let output_modules = build(&manifest.output_modules)?;

        Ok(Self {
            name: manifest.name,
            description: manifest.description,
            version: manifest.version,
            contact_email: manifest.contact_email,
            logo_url: manifest.logo_url,
            legal_info_url: manifest.legal_info_url,
            openapi_doc_url: manifest.openapi_doc_url,
            manifest_url,
            auth: manifest.auth,
            api_endpoints,
            plugin_operations: manifest.plugin_operations,
            input_modules,
            output_modules,
            preferred_approaches: manifest.preferred_approaches,
            openapi_doc,
        })
    }

    pub fn openapi_doc(&self) -> &OpenApiDoc {
        &self.openapi_doc
    }

    pub fn operation(&self, key: &OperationKey) -> Option<&PluginOperation> {
        self.plugin_operations.get(&key.path)?.get(&key.method)
    }

    /// Output modules the operation supports, in declaration order.
    pub fn supported_output_modules(&self, key: &OperationKey) -> Vec<&FlowPath> {
        let allowed = self
            .operation(key)
            .map(|op| op.output_modules.as_slice())
            .unwrap_or_default();
        self.output_modules
            .iter()
            .filter(|m| allowed.is_empty() || allowed.iter().any(|a| a == m.name()))
            .collect()
    }

    /// First input module that accepts `port_type` and produces text.
    pub fn input_module_for(&self, port_type: PortType) -> Option<&FlowPath> {
        self.input_modules
            .iter()
            .find(|m| m.initial_input_port() == port_type && m.finish_output_port() == PortType::Text)
    }

    #[cfg(test)]
    pub(crate) fn for_tests(name: &str) -> Self {
        let doc = OpenApiDoc::from_value(serde_json::json!({
            "servers": [{"url": "https://example.com"}],
            "paths": {"/ping": {"get": {"summary": "ping"}}}
        }))
        .unwrap();
        let manifest = PluginManifest {
            name: name.to_string(),
            description: String::new(),
            version: None,
            contact_email: None,
            logo_url: None,
            legal_info_url: None,
            openapi_doc_url: "openapi.json".into(),
            auth: Value::Null,
            plugin_operations: PluginOperations::new(),
            input_modules: vec![],
            output_modules: vec![],
            preferred_approaches: vec![],
        };
        Self::from_manifest(manifest, doc, None).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest_json() -> Value {
        json!({
            "name": "todo",
            "description": "Todo list",
            "openapi_doc_url": "openapi.yaml",
            "plugin_operations": {
                "/todos": {"get": {"output_modules": ["as_text"]}}
            },
            "output_modules": [
                {"name": "as_text", "initial_input_port": "JSON", "finish_output_port": "TEXT",
                 "processors": [{"processor_type": "template_engine", "processor_implementation_type": "handlebars",
                                 "metadata": {"template": "{{title}}"}}]},
                {"name": "as_file", "initial_input_port": "JSON", "finish_output_port": "FILEPATH",
                 "processors": [{"processor_type": "text_to_file", "processor_implementation_type": "local_file"}]}
            ]
        })
    }

    fn doc() -> OpenApiDoc {
        OpenApiDoc::from_value(json!({
            "servers": [{"url": "https://todo.io/"}],
            "paths": {"/todos": {"get": {}}, "/todos/{id}": {"get": {}}}
        }))
        .unwrap()
    }

    #[test]
    fn operation_key_lowercases_method() {
        let key: OperationKey = serde_json::from_value(json!({"path": "/a", "method": "GET"})).unwrap();
        assert_eq!(key, OperationKey::new("/a", "get"));
        assert_eq!(key.to_string(), "GET /a");
    }

    #[test]
    fn plugin_from_manifest_builds_endpoints_and_modules() {
        let manifest: PluginManifest = serde_json::from_value(manifest_json()).unwrap();
        let plugin = Plugin::from_manifest(manifest, doc(), Some("https://todo.io/manifest.json".into())).unwrap();
        assert_eq!(
            plugin.api_endpoints.iter().cloned().collect::<Vec<_>>(),
            vec!["https://todo.io/todos", "https://todo.io/todos/{id}"]
        );
        assert_eq!(plugin.output_modules.len(), 2);

        let listed = plugin.supported_output_modules(&OperationKey::new("/todos", "get"));
        assert_eq!(listed.iter().map(|m| m.name()).collect::<Vec<_>>(), vec!["as_text"]);
        let all = plugin.supported_output_modules(&OperationKey::new("/todos/{id}", "get"));
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn unknown_processor_in_module_is_rejected() {
        let mut raw = manifest_json();
        raw["output_modules"][0]["processors"][0]["processor_implementation_type"] = json!("openai_whisper");
        let manifest: PluginManifest = serde_json::from_value(raw).unwrap();
        let err = Plugin::from_manifest(manifest, doc(), None).unwrap_err();
        assert!(matches!(err, PluginError::Module { ref module, .. } if module == "as_text"));
    }
}
