//! Processors transform one typed [`Port`] into another.
//!
//! Every processor follows the same three steps: validate the input port,
//! run its own transformation, validate the output port. Manifests name a
//! processor by `(processor_type, processor_implementation_type)` and
//! [`build_processor`] turns that pair into a concrete processor.
pub mod audio_to_text;
pub mod html_to_text;
pub mod template_engine;
pub mod text_to_audio;
pub mod text_to_file;
pub mod url_to_html;

use crate::config::Config;
use crate::port::{Port, PortError, PortType};
use async_trait::async_trait;
use reqwest::Client;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub use audio_to_text::OpenAiWhisperProcessor;
pub use html_to_text::RegexHtmlToTextProcessor;
pub use template_engine::HandlebarsTemplateProcessor;
pub use text_to_audio::OpenAiTtsProcessor;
pub use text_to_file::LocalFileProcessor;
pub use url_to_html::ReqwestUrlToHtmlProcessor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorType {
    AudioToText,
    TextToAudio,
    HtmlToText,
    UrlToHtml,
    TemplateEngine,
    TextToFile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorImplementationType {
    OpenaiWhisper,
    OpenaiTts,
    Regex,
    Reqwest,
    Handlebars,
    LocalFile,
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Port(#[from] PortError),
    #[error("unsupported processor {processor_type:?} / {implementation:?}")]
    Unsupported {
        processor_type: ProcessorType,
        implementation: ProcessorImplementationType,
    },
    #[error("invalid processor settings: {0}")]
    Config(String),
    #[error("missing credential `{0}`")]
    MissingCredential(String),
    #[error("processing failed: {0}")]
    Failed(String),
}

/// A processor as declared in a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProcessorConfig {
    pub processor_type: ProcessorType,
    pub processor_implementation_type: ProcessorImplementationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Implementation specific settings.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ProcessorConfig {
    pub fn new(processor_type: ProcessorType, implementation: ProcessorImplementationType) -> Self {
        Self {
            processor_type,
            processor_implementation_type: implementation,
            label: None,
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    fn label_or_default(&self) -> String {
        self.label.clone().unwrap_or_else(|| {
            let ty = serde_json::to_value(self.processor_type).unwrap_or_default();
            let imp = serde_json::to_value(self.processor_implementation_type).unwrap_or_default();
            format!("{}_{}", ty.as_str().unwrap_or("processor"), imp.as_str().unwrap_or("impl"))
        })
    }

    fn settings<T: DeserializeOwned>(&self) -> Result<T, ProcessorError> {
        serde_json::from_value(Value::Object(self.metadata.clone()))
            .map_err(|e| ProcessorError::Config(format!("{}: {e}", self.label_or_default())))
    }
}

/// What a processor may touch while running.
#[derive(Clone)]
pub struct ProcessorContext {
    pub config: Config,
    pub client: Client,
    pub storage_dir: PathBuf,
}

impl ProcessorContext {
    /// Files go to `config.storage_dir`, or `<tmp>/openplugin` when unset.
    pub fn new(config: Config, client: Client) -> Result<Self, ProcessorError> {
        let storage_dir = resolve_or_create_storage_dir(config.storage_dir.as_deref())?;
        Ok(Self {
            config,
            client,
            storage_dir,
        })
    }

    pub fn openai_key(&self) -> Result<&str, ProcessorError> {
        self.config
            .openai_api_key
            .as_deref()
            .ok_or_else(|| ProcessorError::MissingCredential(crate::config::OPENAI_API_KEY.to_string()))
    }

    pub fn openai_url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.config.openai_base_url.trim_end_matches('/'), endpoint)
    }
}

impl fmt::Debug for ProcessorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorContext")
            .field("config", &self.config)
            .field("storage_dir", &self.storage_dir)
            .finish()
    }
}

fn resolve_or_create_storage_dir(dir: Option<&Path>) -> Result<PathBuf, ProcessorError> {
    let dir = match dir {
        Some(d) => d.to_path_buf(),
        None => std::env::temp_dir().join("openplugin"),
    };
    std::fs::create_dir_all(&dir)
        .map_err(|e| ProcessorError::Config(format!("cannot create storage dir {}: {e}", dir.display())))?;
    Ok(dir)
}

#[async_trait]
pub trait Processor: Send + Sync + fmt::Debug {
    fn processor_type(&self) -> ProcessorType;

    fn implementation_type(&self) -> ProcessorImplementationType;

    fn label(&self) -> &str;

    fn input_port_types(&self) -> &'static [PortType];

    fn output_port_types(&self) -> &'static [PortType];

    /// The implementation specific step. Only called with a validated input.
    async fn process_input(&self, input: &Port, ctx: &ProcessorContext) -> Result<Port, ProcessorError>;

    fn validate_input_port(&self, input: &Port) -> Result<(), PortError> {
        if !self.input_port_types().contains(&input.data_type()) {
            return Err(PortError::InvalidInputPort {
                expected: self.input_port_types().to_vec(),
                actual: input.data_type(),
            });
        }
        input.require_value()?;
        Ok(())
    }

    fn validate_output_port(&self, output: &Port) -> Result<(), PortError> {
        if !self.output_port_types().contains(&output.data_type()) {
            return Err(PortError::InvalidOutputPort {
                expected: self.output_port_types().to_vec(),
                actual: output.data_type(),
            });
        }
        output.require_value()?;
        Ok(())
    }

    async fn process(&self, input: &Port, ctx: &ProcessorContext) -> Result<Port, ProcessorError> {
        self.validate_input_port(input)?;
        let output = self.process_input(input, ctx).await?;
        self.validate_output_port(&output)?;
        Ok(output)
    }
}

/// Build the processor a manifest entry names.
pub fn build_processor(config: &ProcessorConfig) -> Result<Arc<dyn Processor>, ProcessorError> {
    use ProcessorImplementationType as I;
    use ProcessorType as T;

    let label = config.label_or_default();
    let processor: Arc<dyn Processor> = match (config.processor_type, config.processor_implementation_type) {
        (T::AudioToText, I::OpenaiWhisper) => Arc::new(OpenAiWhisperProcessor::new(label, config.settings()?)),
        (T::TextToAudio, I::OpenaiTts) => Arc::new(OpenAiTtsProcessor::new(label, config.settings()?)),
        (T::HtmlToText, I::Regex) => Arc::new(RegexHtmlToTextProcessor::new(label)),
        (T::UrlToHtml, I::Reqwest) => Arc::new(ReqwestUrlToHtmlProcessor::new(label)),
        (T::TemplateEngine, I::Handlebars) => Arc::new(HandlebarsTemplateProcessor::new(label, config.settings()?)?),
        (T::TextToFile, I::LocalFile) => Arc::new(LocalFileProcessor::new(label, config.settings()?)),
        (processor_type, implementation) => {
            return Err(ProcessorError::Unsupported {
                processor_type,
                implementation,
            });
        }
    };
    Ok(processor)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    pub fn context(dir: &TempDir) -> ProcessorContext {
        let config = Config::default().with_storage_dir(dir.path());
        ProcessorContext::new(config, Client::new()).unwrap()
    }
}
