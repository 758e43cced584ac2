use super::pricing::cost_usd;
use super::{FunctionProvider, FunctionResponse, ProviderError, ProviderSettings, TokenUsage, chat_messages};
use crate::config::{Config, OPENAI_API_KEY};
use crate::message::{FewShotExample, Message};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Chat-completions function calling against OpenAI or any compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    settings: ProviderSettings,
    client: Client,
}

impl OpenAiProvider {
    pub fn new(settings: ProviderSettings, client: Client) -> Self {
        Self { settings, client }
    }

    fn request_body(&self, messages: Vec<Value>, function_schemas: &[Value]) -> Value {
        let mut body = json!({
            "model": self.settings.model_name,
            "messages": messages,
            "temperature": self.settings.temperature,
            "top_p": self.settings.top_p,
            "max_tokens": self.settings.max_tokens,
        });
        if !function_schemas.is_empty() {
            body["tools"] = Value::Array(function_schemas.to_vec());
            body["tool_choice"] = json!("auto");
        }
        body
    }
}

/// Turn a chat-completions payload into a [`FunctionResponse`].
pub fn parse_chat_completion(json: Value, model: &str) -> Result<FunctionResponse, ProviderError> {
    let message = json
        .pointer("/choices/0/message")
        .ok_or_else(|| ProviderError::InvalidResponse("OpenAI response missing message".into()))?;

    let usage = TokenUsage::new(
        json.pointer("/usage/prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
        json.pointer("/usage/completion_tokens").and_then(Value::as_u64).unwrap_or(0),
    );
    let content = message
        .get("content")
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut response = match message.pointer("/tool_calls/0/function") {
        Some(call) => {
            let name = call
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| ProviderError::InvalidResponse("tool call without a name".into()))?;
            let arguments = match call.get("arguments") {
                Some(Value::String(raw)) if raw.trim().is_empty() => json!({}),
                Some(Value::String(raw)) => serde_json::from_str(raw).map_err(|e| {
                    ProviderError::InvalidResponse(format!("tool call arguments are not JSON: {e}"))
                })?,
                Some(Value::Object(obj)) => Value::Object(obj.clone()),
                _ => json!({}),
            };
            let mut r = FunctionResponse::function_call(name, arguments);
            r.response_content = content;
            r
        }
        None => FunctionResponse::text(content.unwrap_or_default()),
    };
    response.cost = cost_usd(model, &usage);
    response.usage = usage;
    response.llm_api_response_metadata = json;
    Ok(response)
}

#[async_trait]
impl FunctionProvider for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.settings.model_name
    }

    #[tracing::instrument(name = "openai_provider_run", skip_all, fields(model = %self.settings.model_name))]
    async fn run(
        &self,
        prompt: &str,
        function_schemas: &[Value],
        config: &Config,
        conversation: &[Message],
        few_shot_examples: &[FewShotExample],
    ) -> Result<FunctionResponse, ProviderError> {
        let api_key = config
            .openai_api_key
            .as_deref()
            .ok_or_else(|| ProviderError::MissingCredential(OPENAI_API_KEY.to_string()))?;
        let base_url = self
            .settings
            .base_url
            .as_deref()
            .unwrap_or(&config.openai_base_url);

        let body = self.request_body(chat_messages(prompt, conversation, few_shot_examples), function_schemas);
        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));

        let start = Instant::now();
        let resp = self
            .client
            .post(url)
            .bearer_auth(api_key)
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Request(format!("OpenAI request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_else(|_| "<no body>".into());
            error!("OpenAI error: {}", text);
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body: text,
            });
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("Invalid OpenAI response: {e}")))?;
        let mut response = parse_chat_completion(json, &self.settings.model_name)?;
        response.latency_seconds = start.elapsed().as_secs_f64();
        debug!(
            function_call = response.is_function_call,
            tokens = response.usage.total_tokens,
            "OpenAI round finished"
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tool_call() {
        let payload = json!({
            "choices": [{"message": {"content": null, "tool_calls": [{
                "type": "function",
                "function": {"name": "get_todos", "arguments": "{\"limit\": 3}"}
            }]}}],
            "usage": {"prompt_tokens": 100, "completion_tokens": 20}
        });
        let r = parse_chat_completion(payload, "gpt-4o-mini").unwrap();
        assert!(r.is_function_call);
        assert_eq!(r.detected_function_name.as_deref(), Some("get_todos"));
        assert_eq!(r.detected_function_arguments, json!({"limit": 3}));
        assert_eq!(r.usage.total_tokens, 120);
        assert!(r.cost > 0.0);
    }

    #[test]
    fn parses_plain_text() {
        let payload = json!({"choices": [{"message": {"content": "Hello!"}}]});
        let r = parse_chat_completion(payload, "gpt-4o").unwrap();
        assert!(!r.is_function_call);
        assert_eq!(r.response_content.as_deref(), Some("Hello!"));
        assert_eq!(r.usage, TokenUsage::default());
    }

    #[test]
    fn bad_arguments_are_invalid_response() {
        let payload = json!({"choices": [{"message": {"tool_calls": [{
            "function": {"name": "f", "arguments": "{not json"}
        }]}}]});
        assert!(matches!(
            parse_chat_completion(payload, "gpt-4o"),
            Err(ProviderError::InvalidResponse(_))
        ));
        assert!(parse_chat_completion(json!({"choices": []}), "gpt-4o").is_err());
    }

    #[test]
    fn tools_only_sent_when_offered() {
        let p = OpenAiProvider::new(ProviderSettings::default(), Client::new());
        let plain = p.request_body(vec![], &[]);
        assert!(plain.get("tools").is_none());
        let with_tools = p.request_body(vec![], &[json!({"type": "function"})]);
        assert_eq!(with_tools["tool_choice"], "auto");
    }

    #[tokio::test]
    async fn missing_key_is_reported_without_network() {
        let p = OpenAiProvider::new(ProviderSettings::default(), Client::new());
        let err = p.run("hi", &[], &Config::default(), &[], &[]).await.unwrap_err();
        assert!(matches!(err, ProviderError::MissingCredential(_)));
    }
}
