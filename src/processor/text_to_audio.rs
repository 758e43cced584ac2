use super::{Processor, ProcessorContext, ProcessorError, ProcessorImplementationType, ProcessorType};
use crate::port::{Port, PortType};
use crate::util::{extension_from_mime, mime_from_extension};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct TtsSettings {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_voice")]
    pub voice: String,
    /// `mp3`, `wav`, `flac`, `aac` or `opus`.
    #[serde(default = "default_format")]
    pub response_format: String,
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            model: default_model(),
            voice: default_voice(),
            response_format: default_format(),
        }
    }
}

fn default_model() -> String {
    "tts-1".to_string()
}

fn default_voice() -> String {
    "alloy".to_string()
}

fn default_format() -> String {
    "mp3".to_string()
}

/// Speaks text with the OpenAI speech endpoint and stores the audio file.
#[derive(Debug, Clone)]
pub struct OpenAiTtsProcessor {
    label: String,
    settings: TtsSettings,
}

impl OpenAiTtsProcessor {
    pub fn new(label: String, settings: TtsSettings) -> Self {
        Self { label, settings }
    }
}

#[async_trait]
impl Processor for OpenAiTtsProcessor {
    fn processor_type(&self) -> ProcessorType {
        ProcessorType::TextToAudio
    }

    fn implementation_type(&self) -> ProcessorImplementationType {
        ProcessorImplementationType::OpenaiTts
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn input_port_types(&self) -> &'static [PortType] {
        &[PortType::Text]
    }

    fn output_port_types(&self) -> &'static [PortType] {
        &[PortType::Filepath]
    }

    #[tracing::instrument(name = "openai_tts_process", skip(self, input, ctx))]
    async fn process_input(&self, input: &Port, ctx: &ProcessorContext) -> Result<Port, ProcessorError> {
        let api_key = ctx.openai_key()?;
        let text = input.require_str()?;

        let body = json!({
            "model": self.settings.model,
            "voice": self.settings.voice,
            "input": text,
            "response_format": self.settings.response_format,
        });
        let resp = ctx
            .client
            .post(ctx.openai_url("audio/speech"))
            .bearer_auth(api_key)
            .timeout(Duration::from_secs(ctx.config.http_timeout_secs))
            .json(&body)
            .send()
            .await
            .map_err(|e| ProcessorError::Failed(format!("OpenAI speech request failed: {e}")))?;

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_else(|_| "<no body>".into());
            error!("OpenAI speech error: {}", text);
            return Err(ProcessorError::Failed(format!("OpenAI speech returned error: {text}")));
        }

        let mime = mime_from_extension(&self.settings.response_format).unwrap_or("audio/mpeg");
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ProcessorError::Failed(format!("reading speech audio failed: {e}")))?;

        let path = ctx
            .storage_dir
            .join(format!("{}.{}", Uuid::new_v4(), extension_from_mime(mime)));
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| ProcessorError::Failed(format!("writing {} failed: {e}", path.display())))?;
        info!(path = %path.display(), bytes = bytes.len(), "stored speech audio");

        Ok(Port::string(input.name(), PortType::Filepath, path.display().to_string())?
            .with_mime_types(vec![mime.to_string()]))
    }
}
