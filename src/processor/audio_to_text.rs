use super::{Processor, ProcessorContext, ProcessorError, ProcessorImplementationType, ProcessorType};
use crate::port::{Port, PortType};
use crate::util::mime_from_path;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error};

#[derive(Debug, Clone, Deserialize)]
pub struct WhisperSettings {
    #[serde(default = "default_model")]
    pub model: String,
    /// ISO-639-1 hint passed to the transcription endpoint.
    #[serde(default)]
    pub language: Option<String>,
}

impl Default for WhisperSettings {
    fn default() -> Self {
        Self {
            model: default_model(),
            language: None,
        }
    }
}

fn default_model() -> String {
    "whisper-1".to_string()
}

/// Transcribes an audio file with the OpenAI transcription endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiWhisperProcessor {
    label: String,
    settings: WhisperSettings,
}

impl OpenAiWhisperProcessor {
    pub fn new(label: String, settings: WhisperSettings) -> Self {
        Self { label, settings }
    }
}

#[async_trait]
impl Processor for OpenAiWhisperProcessor {
    fn processor_type(&self) -> ProcessorType {
        ProcessorType::AudioToText
    }

    fn implementation_type(&self) -> ProcessorImplementationType {
        ProcessorImplementationType::OpenaiWhisper
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn input_port_types(&self) -> &'static [PortType] {
        &[PortType::File, PortType::Filepath]
    }

    fn output_port_types(&self) -> &'static [PortType] {
        &[PortType::Text]
    }

    #[tracing::instrument(name = "openai_whisper_process", skip(self, input, ctx))]
    async fn process_input(&self, input: &Port, ctx: &ProcessorContext) -> Result<Port, ProcessorError> {
        let api_key = ctx.openai_key()?;
        let path = input.file_path()?;

        // 1) read the audio
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ProcessorError::Failed(format!("reading {path} failed: {e}")))?;
        let file_name = input
            .value()
            .and_then(|v| v.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Path::new(path).file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "audio".to_string());
        let mime = input
            .mime_types()
            .first()
            .map(String::as_str)
            .or_else(|| mime_from_path(&file_name))
            .unwrap_or("application/octet-stream");
        debug!(file_name, mime, bytes = bytes.len(), "uploading audio");

        // 2) build the multipart form
        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime)
            .map_err(|e| ProcessorError::Failed(format!("invalid mime type {mime}: {e}")))?;
        let mut form = Form::new().text("model", self.settings.model.clone()).part("file", part);
        if let Some(lang) = &self.settings.language {
            form = form.text("language", lang.clone());
        }

        // 3) call the API
        let resp = ctx
            .client
            .post(ctx.openai_url("audio/transcriptions"))
            .bearer_auth(api_key)
            .timeout(Duration::from_secs(ctx.config.http_timeout_secs))
            .multipart(form)
            .send()
            .await
            .map_err(|e| ProcessorError::Failed(format!("OpenAI transcription request failed: {e}")))?;

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_else(|_| "<no body>".into());
            error!("OpenAI transcription error: {}", text);
            return Err(ProcessorError::Failed(format!(
                "OpenAI transcription returned error: {text}"
            )));
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| ProcessorError::Failed(format!("Invalid OpenAI response: {e}")))?;
        let text = json
            .pointer("/text")
            .and_then(Value::as_str)
            .ok_or_else(|| ProcessorError::Failed("OpenAI response missing text".into()))?;

        Ok(Port::text(input.name(), text))
    }
}
