//! Operation signature resolution.
//!
//! One function-calling round picks an operation and its arguments. When the
//! chosen operation has dependent parameters, each of them gets a narrowed
//! round whose function call is executed right away, and a final round over
//! the original function folds the fetched values back into its arguments.

pub mod resolved;

pub use resolved::{ResolvedArguments, XDepTrace};

use crate::config::Config;
use crate::execution::{ExecutionOutcome, OperationExecutionParams, OperationExecutor};
use crate::function::{Function, Functions, compile};
use crate::message::{Message, latest_user_message};
use crate::plugin::{OperationKey, Plugin};
use crate::provider::{FunctionProvider, FunctionResponse, TokenUsage};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// The operation the model picked, with its final arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PluginDetectedParams {
    pub plugin_name: String,
    /// Absolute URL, placeholders not yet substituted.
    pub api_called: String,
    pub method: String,
    pub path: String,
    pub function_name: String,
    pub mapped_operation_parameters: Value,
}

impl PluginDetectedParams {
    fn new(plugin: &Plugin, function: &Function, arguments: Value) -> Self {
        Self {
            plugin_name: plugin.name.clone(),
            api_called: function.api.url.clone(),
            method: function.http_method(),
            path: function.path.clone(),
            function_name: function.name.clone(),
            mapped_operation_parameters: arguments,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DetectedOperation {
    pub params: PluginDetectedParams,
    pub function: Function,
}

impl DetectedOperation {
    pub fn operation_key(&self) -> OperationKey {
        self.function.operation_key()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SignatureOutcome {
    ToolCall(Box<DetectedOperation>),
    /// The model answered in text instead of calling a function.
    FreeText(String),
    Failure(String),
}

/// Everything the resolution step produced, including per-round accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SelectedOperation {
    pub outcome: SignatureOutcome,
    pub model_name: String,
    /// The user message that was resolved.
    pub prompt: String,
    #[serde(default)]
    pub x_dep_tracing: Vec<XDepTrace>,
    pub total_usage: TokenUsage,
    pub total_cost: f64,
    /// Sum of provider latencies over all rounds.
    pub llm_latency_seconds: f64,
    pub response_time_seconds: f64,
    /// Raw provider payload of the first round.
    #[serde(default)]
    pub llm_api_response_metadata: Value,
}

impl SelectedOperation {
    fn new(model_name: &str) -> Self {
        Self {
            outcome: SignatureOutcome::Failure("not resolved".into()),
            model_name: model_name.to_string(),
            prompt: String::new(),
            x_dep_tracing: Vec::new(),
            total_usage: TokenUsage::default(),
            total_cost: 0.0,
            llm_latency_seconds: 0.0,
            response_time_seconds: 0.0,
            llm_api_response_metadata: Value::Null,
        }
    }

    fn record(&mut self, response: &FunctionResponse) {
        self.total_usage += response.usage;
        self.total_cost += response.cost;
        self.llm_latency_seconds += response.latency_seconds;
    }

    pub fn run_completed(&self) -> bool {
        !matches!(self.outcome, SignatureOutcome::Failure(_))
    }

    pub fn detected(&self) -> Option<&DetectedOperation> {
        match &self.outcome {
            SignatureOutcome::ToolCall(d) => Some(d),
            _ => None,
        }
    }
}

/// Borrowed state shared by the rounds of one dependent loop.
struct DependentLoop<'a> {
    plugin: &'a Plugin,
    function: &'a Function,
    initial_arguments: &'a Value,
    user_prompt: &'a str,
    conversation: &'a [Message],
}

pub struct SignatureResolver {
    provider: Arc<dyn FunctionProvider>,
    executor: OperationExecutor,
    config: Config,
    headers: BTreeMap<String, String>,
    auth_query_params: BTreeMap<String, String>,
}

impl SignatureResolver {
    pub fn new(provider: Arc<dyn FunctionProvider>, executor: OperationExecutor, config: Config) -> Self {
        Self {
            provider,
            executor,
            config,
            headers: BTreeMap::new(),
            auth_query_params: BTreeMap::new(),
        }
    }

    /// Credentials sent along with dependent operation calls.
    pub fn with_auth(mut self, headers: BTreeMap<String, String>, auth_query_params: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self.auth_query_params = auth_query_params;
        self
    }

    #[tracing::instrument(name = "signature_resolve", skip_all, fields(plugin = %plugin.name))]
    pub async fn resolve(
        &self,
        plugin: Arc<Plugin>,
        messages: &[Message],
        conversation: &[Message],
        selected_operation: Option<&OperationKey>,
    ) -> SelectedOperation {
        let start = Instant::now();
        let mut selected = SelectedOperation::new(self.provider.model_name());
        selected.outcome = self
            .resolve_outcome(plugin, messages, conversation, selected_operation, &mut selected)
            .await;
        selected.response_time_seconds = start.elapsed().as_secs_f64();
        match &selected.outcome {
            SignatureOutcome::ToolCall(d) => info!(function = %d.params.function_name, "operation resolved"),
            SignatureOutcome::FreeText(_) => info!("model answered without a function call"),
            SignatureOutcome::Failure(e) => warn!("signature resolution failed: {e}"),
        }
        selected
    }

    async fn resolve_outcome(
        &self,
        plugin: Arc<Plugin>,
        messages: &[Message],
        conversation: &[Message],
        selected_operation: Option<&OperationKey>,
        selected: &mut SelectedOperation,
    ) -> SignatureOutcome {
        let Some(user) = latest_user_message(messages) else {
            return SignatureOutcome::Failure("no user message to resolve".into());
        };
        selected.prompt = user.content().to_string();

        let mut functions = Functions::new();
        if let Err(e) = functions.add_from_plugin(plugin, selected_operation) {
            return SignatureOutcome::Failure(format!("failed to compile plugin functions: {e}"));
        }
        if functions.is_empty() {
            return SignatureOutcome::Failure("plugin offers no operations to call".into());
        }

        // 1) pick an operation
        let prompt = build_prompt(&functions, &selected.prompt);
        let response = match self
            .provider
            .run(
                &prompt,
                &functions.litellm_json(),
                &self.config,
                conversation,
                &functions.few_shot_examples(),
            )
            .await
        {
            Ok(r) => r,
            Err(e) => return SignatureOutcome::Failure(e.to_string()),
        };
        selected.record(&response);
        selected.llm_api_response_metadata = response.llm_api_response_metadata.clone();

        if !response.is_function_call {
            return SignatureOutcome::FreeText(response.response_content.unwrap_or_default());
        }
        let name = response.detected_function_name.unwrap_or_default();
        let Some((plugin, function)) = functions.get_function(&name) else {
            return SignatureOutcome::Failure(format!("model called unknown function `{name}`"));
        };
        let mut arguments = response.detected_function_arguments;

        // 2) fill dependent parameters from other operations
        if function.dependent_properties().next().is_some() {
            let user_prompt = selected.prompt.clone();
            let dependent = DependentLoop {
                plugin: &plugin,
                function,
                initial_arguments: &arguments,
                user_prompt: &user_prompt,
                conversation,
            };
            match self.resolve_dependents(&dependent, selected).await {
                Ok(args) => arguments = args,
                Err(e) => return SignatureOutcome::Failure(e),
            }
        }

        validate_arguments(function, &arguments);
        SignatureOutcome::ToolCall(Box::new(DetectedOperation {
            params: PluginDetectedParams::new(&plugin, function, arguments),
            function: function.clone(),
        }))
    }

    async fn resolve_dependents(
        &self,
        dependent: &DependentLoop<'_>,
        selected: &mut SelectedOperation,
    ) -> Result<Value, String> {
        let mut resolved = ResolvedArguments::new();
        for (property, key) in dependent.function.dependent_properties() {
            let (next, trace) = self
                .resolve_dependent(dependent, &property.name, key, &resolved, selected)
                .await?;
            selected.x_dep_tracing.push(trace);
            resolved = next;
        }

        // final round over the original function only
        let function = dependent.function;
        let prompt = final_prompt(function, &resolved, dependent.user_prompt);
        let response = self
            .provider
            .run(
                &prompt,
                &[function.litellm_json()],
                &self.config,
                dependent.conversation,
                &function.few_shot_examples,
            )
            .await
            .map_err(|e| format!("final dependent round failed: {e}"))?;
        selected.record(&response);

        let mut trace = XDepTrace {
            prompt,
            function_name: Some(function.name.clone()),
            ..Default::default()
        };
        let arguments = if response.is_function_call && response.detected_function_name.as_deref() == Some(&function.name) {
            resolved.fill_missing(&response.detected_function_arguments)
        } else {
            trace.error = Some("final round did not call the function, keeping first-round arguments".into());
            resolved.overlay(dependent.initial_arguments)
        };
        trace.arguments = arguments.clone();
        selected.x_dep_tracing.push(trace);
        Ok(arguments)
    }

    /// One narrowed round. Failures to resolve leave the parameter out; only provider errors abort.
    async fn resolve_dependent(
        &self,
        dependent: &DependentLoop<'_>,
        parameter: &str,
        key: &OperationKey,
        resolved: &ResolvedArguments,
        selected: &mut SelectedOperation,
    ) -> Result<(ResolvedArguments, XDepTrace), String> {
        let prompt = dependent_prompt(dependent, parameter, resolved);
        let mut trace = XDepTrace {
            prompt: prompt.clone(),
            parameter: Some(parameter.to_string()),
            ..Default::default()
        };

        let plugin = dependent.plugin;
        let dep_function = match compile(plugin.openapi_doc(), &plugin.plugin_operations, Some(key)) {
            Ok(mut fns) if !fns.is_empty() => fns.remove(0),
            Ok(_) => {
                trace.error = Some(format!("dependent operation {key} not found"));
                return Ok((resolved.clone(), trace));
            }
            Err(e) => {
                trace.error = Some(format!("dependent operation {key} failed to compile: {e}"));
                return Ok((resolved.clone(), trace));
            }
        };
        trace.function_name = Some(dep_function.name.clone());

        let response = self
            .provider
            .run(
                &prompt,
                &[dep_function.litellm_json()],
                &self.config,
                dependent.conversation,
                &dep_function.few_shot_examples,
            )
            .await
            .map_err(|e| format!("dependent round for `{parameter}` failed: {e}"))?;
        selected.record(&response);

        if !response.is_function_call {
            trace.error = Some(format!("no function call to resolve `{parameter}`"));
            return Ok((resolved.clone(), trace));
        }
        trace.arguments = response.detected_function_arguments.clone();

        let params = OperationExecutionParams::from_detected(
            &dep_function,
            &response.detected_function_arguments,
            self.headers.clone(),
            self.auth_query_params.clone(),
        )
        .with_prompt(dependent.user_prompt);

        match self.executor.execute(params).await {
            ExecutionOutcome::Success(resp) => {
                debug!(parameter, function = %dep_function.name, "dependent parameter resolved");
                trace.api_response = Some(resp.original_response.clone());
                Ok((resolved.with(parameter, resp.original_response), trace))
            }
            ExecutionOutcome::ClarifyingQuestion(resp) => {
                selected.total_usage += resp.clarifying_usage;
                selected.total_cost += resp.clarifying_cost;
                trace.error = Some(format!("dependent operation returned HTTP {}", resp.status_code));
                trace.api_response = Some(resp.original_response);
                Ok((resolved.clone(), trace))
            }
            ExecutionOutcome::Failure(e) => {
                warn!(parameter, "dependent operation failed: {e}");
                trace.error = Some(e.to_string());
                Ok((resolved.clone(), trace))
            }
        }
    }
}

fn build_prompt(functions: &Functions, user_prompt: &str) -> String {
    let mut prompt = String::new();
    for fragment in [functions.human_usage_examples_prompt(), functions.signature_helpers_prompt()] {
        if !fragment.is_empty() {
            prompt.push_str(&fragment);
            prompt.push('\n');
        }
    }
    prompt.push_str(user_prompt);
    prompt
}

fn dependent_prompt(dependent: &DependentLoop<'_>, parameter: &str, resolved: &ResolvedArguments) -> String {
    let known = resolved.overlay(dependent.initial_arguments);
    format!(
        "To call `{}`, the value of `{parameter}` must first be fetched from another operation.\n\
         Arguments known so far: {known}\n\
         Call the operation that provides `{parameter}` for this request:\n{}",
        dependent.function.name, dependent.user_prompt
    )
}

fn final_prompt(function: &Function, resolved: &ResolvedArguments, user_prompt: &str) -> String {
    format!(
        "Call `{}` for this request. These values were fetched for its dependent parameters; \
         extract the argument values from them:\n{}\n\n{user_prompt}",
        function.name,
        resolved.to_json()
    )
}

/// Log schema violations in the model's arguments. Never fatal.
fn validate_arguments(function: &Function, arguments: &Value) {
    let schema = function.parameters_schema();
    let validator = match jsonschema::validator_for(&schema) {
        Ok(v) => v,
        Err(e) => {
            warn!(function = %function.name, "unusable parameter schema: {e}");
            return;
        }
    };
    for error in validator.iter_errors(arguments) {
        warn!(function = %function.name, path = %error.instance_path, "argument does not match schema: {error}");
    }
}
