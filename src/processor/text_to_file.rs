use super::{Processor, ProcessorContext, ProcessorError, ProcessorImplementationType, ProcessorType};
use crate::port::{Port, PortType};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocalFileSettings {
    /// File name without extension; a random one is used when unset.
    #[serde(default)]
    pub file_name: Option<String>,
    /// Defaults to `txt` for text and `json` for JSON input.
    #[serde(default)]
    pub extension: Option<String>,
}

/// Writes text or JSON into the storage directory and outputs the file path.
#[derive(Debug, Clone)]
pub struct LocalFileProcessor {
    label: String,
    settings: LocalFileSettings,
}

impl LocalFileProcessor {
    pub fn new(label: String, settings: LocalFileSettings) -> Self {
        Self { label, settings }
    }
}

#[async_trait]
impl Processor for LocalFileProcessor {
    fn processor_type(&self) -> ProcessorType {
        ProcessorType::TextToFile
    }

    fn implementation_type(&self) -> ProcessorImplementationType {
        ProcessorImplementationType::LocalFile
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn input_port_types(&self) -> &'static [PortType] {
        &[PortType::Text, PortType::Json]
    }

    fn output_port_types(&self) -> &'static [PortType] {
        &[PortType::Filepath]
    }

    async fn process_input(&self, input: &Port, ctx: &ProcessorContext) -> Result<Port, ProcessorError> {
        let (contents, default_ext) = match input.require_value()? {
            Value::String(s) if input.data_type() == PortType::Text => (s.clone(), "txt"),
            other => (
                serde_json::to_string_pretty(other).map_err(|e| ProcessorError::Failed(format!("{e}")))?,
                "json",
            ),
        };
        let stem = self
            .settings
            .file_name
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let ext = self.settings.extension.as_deref().unwrap_or(default_ext);
        let path = ctx.storage_dir.join(format!("{stem}.{ext}"));

        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| ProcessorError::Failed(format!("writing {} failed: {e}", path.display())))?;
        info!(path = %path.display(), "wrote output file");

        let mut out = Port::string(input.name(), PortType::Filepath, path.display().to_string())?;
        if let Some(mime) = crate::util::mime_from_extension(ext) {
            out = out.with_mime_types(vec![mime.to_string()]);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::test_support::context;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn writes_json_with_default_extension() {
        let dir = TempDir::new().unwrap();
        let p = LocalFileProcessor::new("f".into(), LocalFileSettings::default());
        let out = p
            .process(&Port::json("r", json!({"a": 1})), &context(&dir))
            .await
            .unwrap();
        let path = out.file_path().unwrap().to_string();
        assert!(path.ends_with(".json"));
        assert!(path.starts_with(dir.path().to_str().unwrap()));
        let written: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, json!({"a": 1}));
        assert_eq!(out.mime_types(), ["application/json".to_string()]);
    }

    #[tokio::test]
    async fn writes_text_with_configured_name() {
        let dir = TempDir::new().unwrap();
        let p = LocalFileProcessor::new(
            "f".into(),
            LocalFileSettings {
                file_name: Some("summary".into()),
                extension: Some("md".into()),
            },
        );
        let out = p.process(&Port::text("t", "# hi"), &context(&dir)).await.unwrap();
        let expected = dir.path().join("summary.md");
        assert_eq!(out.file_path().unwrap(), expected.display().to_string());
        assert_eq!(std::fs::read_to_string(expected).unwrap(), "# hi");
    }
}
