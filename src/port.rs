use crate::util::truncate_for_log;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use thiserror::Error;

/// Trace entries keep at most this many characters of a port value.
const TRACE_TEXT_LEN: usize = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PortType {
    Boolean,
    Int,
    Float,
    Text,
    List,
    Json,
    Html,
    Httpurl,
    RemoteFileUrl,
    Filepath,
    File,
    Directorypath,
}

impl PortType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortType::Boolean => "BOOLEAN",
            PortType::Int => "INT",
            PortType::Float => "FLOAT",
            PortType::Text => "TEXT",
            PortType::List => "LIST",
            PortType::Json => "JSON",
            PortType::Html => "HTML",
            PortType::Httpurl => "HTTPURL",
            PortType::RemoteFileUrl => "REMOTE_FILE_URL",
            PortType::Filepath => "FILEPATH",
            PortType::File => "FILE",
            PortType::Directorypath => "DIRECTORYPATH",
        }
    }

    /// Whether `value` has the shape this type carries.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            PortType::Boolean => value.is_boolean(),
            PortType::Int => value.is_i64() || value.is_u64(),
            PortType::Float => value.is_number(),
            PortType::List => value.is_array(),
            PortType::Json => !value.is_null(),
            PortType::File => value.get("path").is_some_and(Value::is_string),
            PortType::Text
            | PortType::Html
            | PortType::Httpurl
            | PortType::RemoteFileUrl
            | PortType::Filepath
            | PortType::Directorypath => value.is_string(),
        }
    }
}

impl fmt::Display for PortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PortError {
    #[error("input port type {actual} not accepted, expected one of {expected:?}")]
    InvalidInputPort { expected: Vec<PortType>, actual: PortType },
    #[error("output port type {actual} not produced, expected one of {expected:?}")]
    InvalidOutputPort { expected: Vec<PortType>, actual: PortType },
    #[error("port `{port}` ({data_type}): {reason}")]
    PortValue {
        port: String,
        data_type: PortType,
        reason: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PortMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_text: Option<String>,
    #[serde(default)]
    pub default_output_module: bool,
}

/// A typed value flowing between processors.
///
/// Only the metadata changes after construction; processors build new ports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Port {
    name: String,
    data_type: PortType,
    #[serde(default)]
    mime_types: Vec<String>,
    value: Option<Value>,
    #[serde(default)]
    metadata: PortMetadata,
}

impl Port {
    /// Build a port, rejecting a value whose shape does not match `data_type`.
    pub fn new(name: impl Into<String>, data_type: PortType, value: Option<Value>) -> Result<Self, PortError> {
        let name = name.into();
        if let Some(v) = &value {
            if !data_type.accepts(v) {
                return Err(PortError::PortValue {
                    port: name,
                    data_type,
                    reason: format!("value {} does not match", truncate_for_log(&v.to_string(), 80)),
                });
            }
        }
        Ok(Self {
            name,
            data_type,
            mime_types: Vec::new(),
            value,
            metadata: PortMetadata::default(),
        })
    }

    pub fn text(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::unchecked(name, PortType::Text, Value::String(text.into()))
    }

    pub fn json(name: impl Into<String>, value: Value) -> Self {
        Self::unchecked(name, PortType::Json, value)
    }

    /// For string-valued types (`FILEPATH`, `HTML`, `HTTPURL`, ...).
    pub fn string(name: impl Into<String>, data_type: PortType, value: impl Into<String>) -> Result<Self, PortError> {
        Self::new(name, data_type, Some(Value::String(value.into())))
    }

    pub fn file(name: impl Into<String>, path: impl Into<String>, original_name: Option<String>) -> Self {
        Self::unchecked(name, PortType::File, json!({"path": path.into(), "name": original_name}))
    }

    fn unchecked(name: impl Into<String>, data_type: PortType, value: Value) -> Self {
        Self {
            name: name.into(),
            data_type,
            mime_types: Vec::new(),
            value: Some(value),
            metadata: PortMetadata::default(),
        }
    }

    pub fn with_mime_types(mut self, mime_types: Vec<String>) -> Self {
        self.mime_types = mime_types;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> PortType {
        self.data_type
    }

    pub fn mime_types(&self) -> &[String] {
        &self.mime_types
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn metadata(&self) -> &PortMetadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut PortMetadata {
        &mut self.metadata
    }

    /// The value, or `PortValue` when absent.
    pub fn require_value(&self) -> Result<&Value, PortError> {
        self.value.as_ref().ok_or_else(|| PortError::PortValue {
            port: self.name.clone(),
            data_type: self.data_type,
            reason: "value is missing".to_string(),
        })
    }

    pub fn require_str(&self) -> Result<&str, PortError> {
        self.require_value()?.as_str().ok_or_else(|| PortError::PortValue {
            port: self.name.clone(),
            data_type: self.data_type,
            reason: "value is not a string".to_string(),
        })
    }

    /// Local path of a `FILE` or `FILEPATH` port.
    pub fn file_path(&self) -> Result<&str, PortError> {
        match self.data_type {
            PortType::File => self
                .require_value()?
                .get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| PortError::PortValue {
                    port: self.name.clone(),
                    data_type: self.data_type,
                    reason: "file value has no path".to_string(),
                }),
            _ => self.require_str(),
        }
    }

    /// Short textual rendering for trace entries.
    pub fn display_text(&self) -> Option<String> {
        let text = match self.value.as_ref()? {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Some(truncate_for_log(&text, TRACE_TEXT_LEN))
    }
}
