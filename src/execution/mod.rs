pub mod params;
pub mod retry;

pub use params::{OperationExecutionParams, substitute_path_params};
pub use retry::RetryPolicy;

use crate::config::Config;
use crate::http::{HttpCall, HttpError, HttpRequest, HttpResponse, query_pairs};
use crate::provider::{FunctionProvider, TokenUsage};
use crate::util::truncate_for_log;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

/// Response excerpts kept in errors.
const SNIPPET_LEN: usize = 500;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("API returned HTTP {status_code}: {response}")]
    Status { status_code: u16, response: String },
    #[error("API reported an error (HTTP {status_code}): {response}")]
    Semantic { status_code: u16, response: String },
    #[error(transparent)]
    Transport(#[from] HttpError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ExecutionError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ExecutionError::Status { status_code, .. } | ExecutionError::Semantic { status_code, .. } => {
                Some(*status_code)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OperationExecutionResponse {
    /// Parsed JSON body, or the raw text as a JSON string.
    pub original_response: Value,
    pub status_code: u16,
    pub api_call_response_seconds: f64,
    /// Attempts made for the call that produced this response.
    pub attempts: u32,
    pub is_a_clarifying_question: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarifying_response: Option<String>,
    #[serde(default)]
    pub clarifying_usage: TokenUsage,
    #[serde(default)]
    pub clarifying_cost: f64,
    #[serde(default)]
    pub clarifying_latency_seconds: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Success(OperationExecutionResponse),
    ClarifyingQuestion(OperationExecutionResponse),
    Failure(ExecutionError),
}

/// Runs a resolved operation against the plugin API.
#[derive(Clone)]
pub struct OperationExecutor {
    http: Arc<dyn HttpCall>,
    provider: Arc<dyn FunctionProvider>,
    config: Config,
    retry: RetryPolicy,
}

impl OperationExecutor {
    pub fn new(http: Arc<dyn HttpCall>, provider: Arc<dyn FunctionProvider>, config: Config) -> Self {
        Self {
            http,
            provider,
            config,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[tracing::instrument(name = "operation_execute", skip(self, params), fields(method = %params.method, url = %params.url))]
    pub async fn execute(&self, params: OperationExecutionParams) -> ExecutionOutcome {
        let mut query = params.query_params.clone();
        let url = match substitute_path_params(&params.url, &mut query) {
            Ok(url) => url,
            Err(e) => return ExecutionOutcome::Failure(e),
        };

        let request = HttpRequest {
            url,
            method: params.method.clone(),
            headers: params.headers.clone(),
            query,
            body: params.body.clone(),
            body_media_type: params.body_media_type.clone(),
        };

        // 1) first call, with retries
        let (resp, attempts) = match self.call_with_retry(&request).await {
            Ok(r) => r,
            Err(e) => return ExecutionOutcome::Failure(e.into()),
        };

        // 2) some gateways reject a separate query set on GET; retry once with it inlined
        if resp.status_code == 403 && request.method == "GET" && !request.query.is_empty() {
            warn!(url = %request.url, "403 on GET, retrying with query string in the url");
            let fallback = HttpRequest {
                url: inline_query(&request.url, &request.query),
                query: BTreeMap::new(),
                ..request.clone()
            };
            return match self.call_with_retry(&fallback).await {
                Ok((resp, more)) => self.evaluate(resp, attempts + more, &params.prompt).await,
                Err(e) => ExecutionOutcome::Failure(e.into()),
            };
        }

        self.evaluate(resp, attempts, &params.prompt).await
    }

    async fn evaluate(&self, resp: HttpResponse, attempts: u32, prompt: &str) -> ExecutionOutcome {
        let status_code = resp.status_code;
        let original_response = parse_body(&resp.body);
        let response = OperationExecutionResponse {
            original_response,
            status_code,
            api_call_response_seconds: resp.elapsed_seconds,
            attempts,
            ..Default::default()
        };

        match status_code {
            // 202 and 204 count as success alongside 200/201
            200..=299 => {
                if is_semantic_error(&response.original_response) {
                    return ExecutionOutcome::Failure(ExecutionError::Semantic {
                        status_code,
                        response: truncate_for_log(&resp.body, SNIPPET_LEN),
                    });
                }
                info!(status_code, attempts, "operation succeeded");
                ExecutionOutcome::Success(response)
            }
            400 => ExecutionOutcome::ClarifyingQuestion(self.clarify(response, &resp.body, prompt).await),
            _ => ExecutionOutcome::Failure(ExecutionError::Status {
                status_code,
                response: truncate_for_log(&resp.body, SNIPPET_LEN),
            }),
        }
    }

    /// Ask the provider for a question the user can answer to fix the 400.
    async fn clarify(&self, mut response: OperationExecutionResponse, body: &str, prompt: &str) -> OperationExecutionResponse {
        response.is_a_clarifying_question = true;
        let question_prompt = format!(
            "The API rejected the request with HTTP 400 and this response:\n{}\n\n\
             The user's request was:\n{}\n\n\
             Write one short, friendly question asking the user for the missing or invalid information.",
            truncate_for_log(body, SNIPPET_LEN),
            prompt
        );
        match self.provider.run(&question_prompt, &[], &self.config, &[], &[]).await {
            Ok(r) => {
                response.clarifying_response = Some(r.response_content.unwrap_or_default());
                response.clarifying_usage = r.usage;
                response.clarifying_cost = r.cost;
                response.clarifying_latency_seconds = r.latency_seconds;
            }
            Err(e) => {
                warn!("clarifying question failed: {e}");
                response.clarifying_response = Some(format!("Failed: {e}"));
            }
        }
        response
    }

    async fn call_with_retry(&self, request: &HttpRequest) -> Result<(HttpResponse, u32), HttpError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.http.call(request.clone()).await {
                Ok(resp) if RetryPolicy::is_retryable_status(resp.status_code) && attempt < max_attempts => {
                    warn!(status = resp.status_code, attempt, "retrying plugin API call");
                }
                Ok(resp) => return Ok((resp, attempt)),
                Err(HttpError::InvalidRequest(e)) => return Err(HttpError::InvalidRequest(e)),
                Err(e) if attempt < max_attempts => {
                    warn!(error = %e, attempt, "retrying plugin API call");
                }
                Err(e) => return Err(e),
            }
            sleep(self.retry.backoff_delay(attempt)).await;
        }
    }
}

fn parse_body(body: &str) -> Value {
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}

/// 2xx bodies that still describe a failure.
pub fn is_semantic_error(body: &Value) -> bool {
    let Some(obj) = body.as_object() else {
        return false;
    };
    obj.contains_key("error")
        || obj
            .get("message")
            .and_then(Value::as_str)
            .is_some_and(|m| m.starts_with("Internal Server Error"))
}

/// Append the query verbatim to the url.
fn inline_query(url: &str, query: &BTreeMap<String, Value>) -> String {
    let qs = query_pairs(query)
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}{qs}")
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::message::{FewShotExample, Message};
    use crate::provider::{FunctionResponse, ProviderError};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned responses and records each request.
    #[derive(Default)]
    pub struct ScriptedHttp {
        pub responses: Mutex<VecDeque<Result<HttpResponse, HttpError>>>,
        pub requests: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedHttp {
        pub fn new(responses: Vec<Result<HttpResponse, HttpError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn requests(&self) -> Vec<HttpRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    pub fn ok(status_code: u16, body: &str) -> Result<HttpResponse, HttpError> {
        Ok(HttpResponse {
            body: body.to_string(),
            status_code,
            elapsed_seconds: 0.01,
        })
    }

    #[async_trait]
    impl HttpCall for ScriptedHttp {
        async fn call(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
            self.requests.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(HttpError::Transport("script exhausted".into())))
        }
    }

    /// Replays canned provider replies and records each prompt.
    #[derive(Default)]
    pub struct ScriptedProvider {
        pub replies: Mutex<VecDeque<Result<FunctionResponse, ProviderError>>>,
        pub prompts: Mutex<Vec<(String, usize)>>,
    }

    impl ScriptedProvider {
        pub fn new(replies: Vec<Result<FunctionResponse, ProviderError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        /// `(prompt, number of offered functions)` per round.
        pub fn prompts(&self) -> Vec<(String, usize)> {
            self.prompts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FunctionProvider for ScriptedProvider {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn run(
            &self,
            prompt: &str,
            function_schemas: &[Value],
            _config: &Config,
            _conversation: &[Message],
            _few_shot_examples: &[FewShotExample],
        ) -> Result<FunctionResponse, ProviderError> {
            self.prompts
                .lock()
                .unwrap()
                .push((prompt.to_string(), function_schemas.len()));
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ProviderError::Request("script exhausted".into())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::provider::{FunctionResponse, ProviderError};
    use serde_json::json;

    fn executor(http: Arc<ScriptedHttp>, provider: Arc<ScriptedProvider>) -> OperationExecutor {
        OperationExecutor::new(http, provider, Config::default()).with_retry_policy(RetryPolicy::no_wait(2))
    }

    fn get_params() -> OperationExecutionParams {
        let mut query = BTreeMap::new();
        query.insert("id".to_string(), json!(3));
        query.insert("q".to_string(), json!("a b"));
        OperationExecutionParams {
            url: "https://todo.io/todos/{id}".into(),
            method: "GET".into(),
            query_params: query,
            prompt: "show todo 3".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn success_parses_json_and_substitutes_path() {
        let http = Arc::new(ScriptedHttp::new(vec![ok(200, r#"{"id": 3, "title": "milk"}"#)]));
        let exec = executor(http.clone(), Arc::new(ScriptedProvider::default()));
        let ExecutionOutcome::Success(resp) = exec.execute(get_params()).await else {
            panic!("expected success");
        };
        assert_eq!(resp.original_response["title"], "milk");
        assert_eq!(resp.attempts, 1);
        let sent = http.requests();
        assert_eq!(sent[0].url, "https://todo.io/todos/3");
        assert!(!sent[0].query.contains_key("id"));
        assert_eq!(sent[0].query.get("q"), Some(&json!("a b")));
    }

    #[tokio::test]
    async fn non_json_body_is_kept_as_string() {
        let http = Arc::new(ScriptedHttp::new(vec![ok(200, "plain words")]));
        let exec = executor(http, Arc::new(ScriptedProvider::default()));
        let ExecutionOutcome::Success(resp) = exec.execute(get_params()).await else {
            panic!("expected success");
        };
        assert_eq!(resp.original_response, json!("plain words"));
    }

    #[tokio::test]
    async fn empty_no_content_is_success() {
        let http = Arc::new(ScriptedHttp::new(vec![ok(204, "")]));
        let exec = executor(http, Arc::new(ScriptedProvider::default()));
        let ExecutionOutcome::Success(resp) = exec.execute(get_params()).await else {
            panic!("expected success");
        };
        assert_eq!(resp.status_code, 204);
        assert_eq!(resp.original_response, json!(""));
    }

    #[tokio::test]
    async fn retries_5xx_then_succeeds() {
        let http = Arc::new(ScriptedHttp::new(vec![ok(503, "busy"), ok(200, "{}")]));
        let exec = executor(http.clone(), Arc::new(ScriptedProvider::default()));
        let ExecutionOutcome::Success(resp) = exec.execute(get_params()).await else {
            panic!("expected success");
        };
        assert_eq!(resp.attempts, 2);
        assert_eq!(http.requests().len(), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let http = Arc::new(ScriptedHttp::new(vec![ok(500, "a"), ok(500, "b"), ok(200, "{}")]));
        let exec = executor(http.clone(), Arc::new(ScriptedProvider::default()));
        let outcome = exec.execute(get_params()).await;
        assert!(matches!(
            outcome,
            ExecutionOutcome::Failure(ExecutionError::Status { status_code: 500, .. })
        ));
        assert_eq!(http.requests().len(), 2);
    }

    #[tokio::test]
    async fn transport_errors_are_retried() {
        let http = Arc::new(ScriptedHttp::new(vec![
            Err(HttpError::Transport("reset".into())),
            ok(200, "{}"),
        ]));
        let exec = executor(http, Arc::new(ScriptedProvider::default()));
        assert!(matches!(exec.execute(get_params()).await, ExecutionOutcome::Success(_)));
    }

    #[tokio::test]
    async fn four_xx_is_not_retried() {
        let http = Arc::new(ScriptedHttp::new(vec![ok(404, "nope"), ok(200, "{}")]));
        let exec = executor(http.clone(), Arc::new(ScriptedProvider::default()));
        let outcome = exec.execute(get_params()).await;
        assert!(matches!(outcome, ExecutionOutcome::Failure(ExecutionError::Status { status_code: 404, .. })));
        assert_eq!(http.requests().len(), 1);
    }

    #[tokio::test]
    async fn forbidden_get_retries_with_inline_query() {
        let http = Arc::new(ScriptedHttp::new(vec![ok(403, "forbidden"), ok(200, r#"{"ok": true}"#)]));
        let exec = executor(http.clone(), Arc::new(ScriptedProvider::default()));
        assert!(matches!(exec.execute(get_params()).await, ExecutionOutcome::Success(_)));
        let sent = http.requests();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].url, "https://todo.io/todos/3?q=a b");
        assert!(sent[1].query.is_empty());
    }

    #[tokio::test]
    async fn bad_request_becomes_clarifying_question() {
        let http = Arc::new(ScriptedHttp::new(vec![ok(400, r#"{"detail": "city is required"}"#)]));
        let mut reply = FunctionResponse::text("Which city do you mean?");
        reply.cost = 0.001;
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(reply)]));
        let exec = executor(http, provider.clone());

        let ExecutionOutcome::ClarifyingQuestion(resp) = exec.execute(get_params()).await else {
            panic!("expected clarifying question");
        };
        assert!(resp.is_a_clarifying_question);
        assert_eq!(resp.clarifying_response.as_deref(), Some("Which city do you mean?"));
        assert_eq!(resp.clarifying_cost, 0.001);
        let prompts = provider.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].0.contains("city is required"));
        assert!(prompts[0].0.contains("show todo 3"));
        assert_eq!(prompts[0].1, 0);
    }

    #[tokio::test]
    async fn clarifying_failure_degrades_to_message() {
        let http = Arc::new(ScriptedHttp::new(vec![ok(400, "bad")]));
        let provider = Arc::new(ScriptedProvider::new(vec![Err(ProviderError::Request("down".into()))]));
        let exec = executor(http, provider);
        let ExecutionOutcome::ClarifyingQuestion(resp) = exec.execute(get_params()).await else {
            panic!("expected clarifying question");
        };
        assert!(resp.clarifying_response.unwrap().starts_with("Failed: "));
    }

    #[tokio::test]
    async fn semantic_errors_in_2xx() {
        for body in [r#"{"error": "quota"}"#, r#"{"message": "Internal Server Error: db"}"#] {
            let http = Arc::new(ScriptedHttp::new(vec![ok(200, body)]));
            let exec = executor(http, Arc::new(ScriptedProvider::default()));
            assert!(matches!(
                exec.execute(get_params()).await,
                ExecutionOutcome::Failure(ExecutionError::Semantic { status_code: 200, .. })
            ));
        }
        assert!(!is_semantic_error(&json!({"message": "ok"})));
        assert!(!is_semantic_error(&json!([{"error": 1}])));
    }

    #[tokio::test]
    async fn missing_path_param_never_calls_api() {
        let http = Arc::new(ScriptedHttp::default());
        let exec = executor(http.clone(), Arc::new(ScriptedProvider::default()));
        let mut params = get_params();
        params.query_params.remove("id");
        assert!(matches!(
            exec.execute(params).await,
            ExecutionOutcome::Failure(ExecutionError::InvalidRequest(_))
        ));
        assert!(http.requests().is_empty());
    }
}
