pub mod ollama;
pub mod openai;
pub mod pricing;

pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;

use crate::config::Config;
use crate::message::{FewShotExample, Message};
use async_trait::async_trait;
use reqwest::Client;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::ops::AddAssign;
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an assistant that maps user requests onto API operations. \
When a function matches the request, call it with arguments taken only from the conversation. \
Never invent values. If nothing matches, answer in plain text.";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("missing credential `{0}`")]
    MissingCredential(String),
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("provider returned HTTP {status}: {body}")]
    Api { status: u16, body: String },
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens += rhs.prompt_tokens;
        self.completion_tokens += rhs.completion_tokens;
        self.total_tokens += rhs.total_tokens;
    }
}

/// What one provider round produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FunctionResponse {
    pub response_content: Option<String>,
    pub is_function_call: bool,
    pub detected_function_name: Option<String>,
    /// Parsed arguments, always a JSON object for a function call.
    pub detected_function_arguments: Value,
    pub usage: TokenUsage,
    /// USD
    pub cost: f64,
    pub latency_seconds: f64,
    /// Raw provider payload, kept for tracing.
    #[serde(default)]
    pub llm_api_response_metadata: Value,
}

impl FunctionResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            response_content: Some(content.into()),
            detected_function_arguments: json!({}),
            ..Default::default()
        }
    }

    pub fn function_call(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            is_function_call: true,
            detected_function_name: Some(name.into()),
            detected_function_arguments: arguments,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Openai,
    Ollama,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProviderSettings {
    #[serde(default)]
    pub provider: ProviderKind,
    pub model_name: String,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Overrides the endpoint from `Config`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

fn default_top_p() -> f32 {
    1.0
}

fn default_max_tokens() -> u32 {
    1024
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Openai,
            model_name: "gpt-4o-mini".to_string(),
            temperature: 0.0,
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
            base_url: None,
        }
    }
}

/// An LLM that can pick one of the offered functions.
#[async_trait]
pub trait FunctionProvider: Send + Sync {
    fn model_name(&self) -> &str;

    /// `function_schemas` are tool definitions (`{"type": "function", "function": {..}}`).
    /// An empty slice asks for a plain completion.
    async fn run(
        &self,
        prompt: &str,
        function_schemas: &[Value],
        config: &Config,
        conversation: &[Message],
        few_shot_examples: &[FewShotExample],
    ) -> Result<FunctionResponse, ProviderError>;
}

/// System prompt, few-shot pairs, prior conversation, then the prompt.
pub fn chat_messages(prompt: &str, conversation: &[Message], few_shot_examples: &[FewShotExample]) -> Vec<Value> {
    let mut messages = vec![Message::system(DEFAULT_SYSTEM_PROMPT).to_chat_json()];
    messages.extend(
        few_shot_examples
            .iter()
            .flat_map(FewShotExample::to_messages)
            .map(|m| m.to_chat_json()),
    );
    messages.extend(conversation.iter().map(Message::to_chat_json));
    messages.push(Message::user(prompt).to_chat_json());
    messages
}

pub fn build_provider(settings: ProviderSettings, client: Client) -> Arc<dyn FunctionProvider> {
    match settings.provider {
        ProviderKind::Openai => Arc::new(OpenAiProvider::new(settings, client)),
        ProviderKind::Ollama => Arc::new(OllamaProvider::new(settings, client)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_accumulates() {
        let mut total = TokenUsage::default();
        total += TokenUsage::new(10, 5);
        total += TokenUsage::new(1, 2);
        assert_eq!(total, TokenUsage::new(11, 7));
        assert_eq!(total.total_tokens, 18);
    }

    #[test]
    fn chat_messages_order() {
        let few = vec![FewShotExample {
            prompt: "p".into(),
            function_name: "f".into(),
            arguments: json!({}),
        }];
        let conv = vec![Message::user("earlier"), Message::assistant("ok")];
        let msgs = chat_messages("now", &conv, &few);
        let roles: Vec<_> = msgs.iter().map(|m| m["role"].as_str().unwrap()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user", "assistant", "user"]);
        assert_eq!(msgs.last().unwrap()["content"], "now");
    }

    #[test]
    fn settings_defaults_from_json() {
        let s: ProviderSettings = serde_json::from_value(json!({"provider": "ollama", "model_name": "llama3"})).unwrap();
        assert_eq!(s.provider, ProviderKind::Ollama);
        assert_eq!(s.top_p, 1.0);
        assert_eq!(s.max_tokens, 1024);
        let p = build_provider(s, Client::new());
        assert_eq!(p.model_name(), "llama3");
    }
}
