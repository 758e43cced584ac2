use super::{FunctionProvider, FunctionResponse, ProviderError, ProviderSettings, TokenUsage, chat_messages};
use crate::config::Config;
use crate::message::{FewShotExample, Message};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Function calling through a local Ollama server's `/api/chat`.
#[derive(Debug, Clone)]
pub struct OllamaProvider {
    settings: ProviderSettings,
    client: Client,
}

impl OllamaProvider {
    pub fn new(settings: ProviderSettings, client: Client) -> Self {
        Self { settings, client }
    }
}

pub fn parse_ollama_chat(json: Value) -> Result<FunctionResponse, ProviderError> {
    let message = json
        .get("message")
        .ok_or_else(|| ProviderError::InvalidResponse("Ollama response missing message".into()))?;
    let usage = TokenUsage::new(
        json.get("prompt_eval_count").and_then(Value::as_u64).unwrap_or(0),
        json.get("eval_count").and_then(Value::as_u64).unwrap_or(0),
    );

    let mut response = match message.pointer("/tool_calls/0/function") {
        Some(call) => {
            let name = call
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| ProviderError::InvalidResponse("tool call without a name".into()))?;
            // Ollama sends arguments as an object; some models emit a string
            let arguments = match call.get("arguments") {
                Some(Value::String(raw)) => serde_json::from_str(raw)
                    .map_err(|e| ProviderError::InvalidResponse(format!("tool call arguments are not JSON: {e}")))?,
                Some(args @ Value::Object(_)) => args.clone(),
                _ => json!({}),
            };
            FunctionResponse::function_call(name, arguments)
        }
        None => FunctionResponse::text(
            message
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default(),
        ),
    };
    response.usage = usage;
    response.llm_api_response_metadata = json;
    Ok(response)
}

#[async_trait]
impl FunctionProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.settings.model_name
    }

    #[tracing::instrument(name = "ollama_provider_run", skip_all, fields(model = %self.settings.model_name))]
    async fn run(
        &self,
        prompt: &str,
        function_schemas: &[Value],
        config: &Config,
        conversation: &[Message],
        few_shot_examples: &[FewShotExample],
    ) -> Result<FunctionResponse, ProviderError> {
        let base_url = self.settings.base_url.as_deref().unwrap_or(&config.ollama_url);
        let mut body = json!({
            "model": self.settings.model_name,
            "messages": chat_messages(prompt, conversation, few_shot_examples),
            "stream": false,
            "options": {
                "temperature": self.settings.temperature,
                "top_p": self.settings.top_p,
                "num_predict": self.settings.max_tokens,
            },
        });
        if !function_schemas.is_empty() {
            body["tools"] = Value::Array(function_schemas.to_vec());
        }

        let start = Instant::now();
        let resp = self
            .client
            .post(format!("{}/api/chat", base_url.trim_end_matches('/')))
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Request(format!("Ollama request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_else(|_| "<no body>".into());
            error!("Ollama error: {}", text);
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body: text,
            });
        }
        let json: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("Invalid Ollama response: {e}")))?;

        let mut response = parse_ollama_chat(json)?;
        response.latency_seconds = start.elapsed().as_secs_f64();
        debug!(function_call = response.is_function_call, "Ollama round finished");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_object_arguments() {
        let r = parse_ollama_chat(json!({
            "message": {"role": "assistant", "content": "", "tool_calls": [
                {"function": {"name": "get_weather", "arguments": {"city": "Oslo"}}}
            ]},
            "prompt_eval_count": 40,
            "eval_count": 8
        }))
        .unwrap();
        assert!(r.is_function_call);
        assert_eq!(r.detected_function_arguments, json!({"city": "Oslo"}));
        assert_eq!(r.usage.total_tokens, 48);
        assert_eq!(r.cost, 0.0);
    }

    #[test]
    fn parses_text_reply() {
        let r = parse_ollama_chat(json!({"message": {"role": "assistant", "content": "Hi"}})).unwrap();
        assert_eq!(r.response_content.as_deref(), Some("Hi"));
        assert!(!r.is_function_call);
    }

    #[test]
    fn missing_message_is_invalid() {
        assert!(matches!(
            parse_ollama_chat(json!({"error": "model not found"})),
            Err(ProviderError::InvalidResponse(_))
        ));
    }
}
