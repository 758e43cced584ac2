//! The plugin execution pipeline: input normalisation, input module, signature
//! resolution, execution, and the concurrent output module fan-out.

use crate::config::Config;
use crate::execution::{
    ExecutionError, ExecutionOutcome, OperationExecutionParams, OperationExecutionResponse, OperationExecutor,
    RetryPolicy,
};
use crate::flow_path::{FlowPath, FlowPathReport, StepRecord};
use crate::http::HttpCall;
use crate::message::Message;
use crate::plugin::{OperationKey, Plugin};
use crate::port::{Port, PortType};
use crate::processor::ProcessorContext;
use crate::provider::{FunctionProvider, TokenUsage};
use crate::signature::{SelectedOperation, SignatureOutcome, SignatureResolver};
use crate::util::{mime_from_path, truncate_for_log};
use futures::future::join_all;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Implicit output module carrying the raw API response.
pub const ORIGINAL_RESPONSE: &str = "original_response";
/// Single output module when the model answered in text.
pub const LLM_RESPONSE: &str = "llm_response";
/// Single output module when the API asked for more information.
pub const CLARIFYING_RESPONSE: &str = "clarifying_response";

const TRACE_TEXT_LEN: usize = 2000;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no input module accepts {0} input")]
    UnsupportedInput(PortType),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("input module `{module}` failed: {message}")]
    InputModule { module: String, message: String },
    #[error("signature resolution failed: {0}")]
    SignatureResolution(String),
    #[error("operation execution failed: {0}")]
    Execution(#[from] ExecutionError),
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::UnsupportedInput(_) => "unsupported_input",
            PipelineError::InvalidInput(_) => "invalid_input",
            PipelineError::InputModule { .. } => "input_module",
            PipelineError::SignatureResolution(_) => "signature_resolution",
            PipelineError::Execution(_) => "execution",
        }
    }

    /// `{ "error": kind, "message": ... }`, plus the API status when there is one.
    pub fn to_payload(&self) -> Value {
        let mut payload = json!({"error": self.kind(), "message": self.to_string()});
        if let PipelineError::Execution(e) = self {
            if let Some(code) = e.status_code() {
                payload["status_code"] = json!(code);
            }
        }
        payload
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PipelineInput {
    Text(String),
    File {
        path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_type: Option<String>,
    },
    Url(String),
}

impl PipelineInput {
    /// Turn the raw input into the first port of the run.
    pub fn to_port(&self) -> Result<Port, PipelineError> {
        match self {
            PipelineInput::Text(text) => Ok(Port::text("input", text.clone())),
            PipelineInput::File { path, content_type } => {
                let original_name = path.file_name().map(|n| n.to_string_lossy().into_owned());
                let path_str = path.to_string_lossy().into_owned();
                let mime = content_type
                    .clone()
                    .or_else(|| mime_from_path(&path_str).map(str::to_string));
                Ok(Port::file("input", path_str, original_name).with_mime_types(mime.into_iter().collect()))
            }
            PipelineInput::Url(raw) => {
                let url = url::Url::parse(raw).map_err(|e| PipelineError::InvalidInput(format!("{raw}: {e}")))?;
                let port = match mime_from_path(url.path()) {
                    Some(mime) if mime != "text/html" => {
                        Port::string("input", PortType::RemoteFileUrl, raw.clone())
                            .map(|p| p.with_mime_types(vec![mime.to_string()]))
                    }
                    _ => Port::string("input", PortType::Httpurl, raw.clone()),
                };
                port.map_err(|e| PipelineError::InvalidInput(e.to_string()))
            }
        }
    }
}

/// One invocation of a plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRequest {
    pub input: PipelineInput,
    /// Earlier turns, oldest first.
    pub conversation: Vec<Message>,
    pub headers: BTreeMap<String, String>,
    pub auth_query_params: BTreeMap<String, String>,
    pub selected_operation: Option<OperationKey>,
    pub output_module_names: Vec<String>,
    pub run_all_output_modules: bool,
}

impl PipelineRequest {
    pub fn new(input: PipelineInput) -> Self {
        Self {
            input,
            conversation: Vec::new(),
            headers: BTreeMap::new(),
            auth_query_params: BTreeMap::new(),
            selected_operation: None,
            output_module_names: Vec::new(),
            run_all_output_modules: false,
        }
    }

    pub fn text(prompt: impl Into<String>) -> Self {
        Self::new(PipelineInput::Text(prompt.into()))
    }

    pub fn with_conversation(mut self, conversation: Vec<Message>) -> Self {
        self.conversation = conversation;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_auth_query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.auth_query_params.insert(name.into(), value.into());
        self
    }

    pub fn with_selected_operation(mut self, key: OperationKey) -> Self {
        self.selected_operation = Some(key);
        self
    }

    pub fn with_output_modules<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_module_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn run_all(mut self) -> Self {
        self.run_all_output_modules = true;
        self
    }
}

/// Records of one input or output module run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ModuleTrace {
    pub name: String,
    pub records: Vec<StepRecord>,
    pub total_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ModuleTrace {
    fn from_report(report: &FlowPathReport) -> Self {
        Self {
            name: report.name.clone(),
            records: report.records.clone(),
            total_seconds: report.total_seconds(),
            error: report.error.as_ref().map(|(label, e)| format!("{label}: {e}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionStep {
    pub params: OperationExecutionParams,
    pub response: OperationExecutionResponse,
}

/// Flat view of every timed step of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TracingStep {
    pub name: String,
    pub label: String,
    pub processing_time_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub input_text: Option<String>,
    pub output_text: Option<String>,
}

impl TracingStep {
    fn from_record(module: &str, record: &StepRecord) -> Self {
        Self {
            name: module.to_string(),
            label: record.label.clone(),
            processing_time_seconds: (record.finished - record.started).num_milliseconds() as f64 / 1_000.0,
            status_code: None,
            input_text: record.input_text.clone(),
            output_text: record.output_text.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PluginExecutionResponse {
    pub request_id: String,
    pub run_completed: bool,
    pub input_modules: Vec<ModuleTrace>,
    pub signature_step: Option<SelectedOperation>,
    pub execution_step: Option<ExecutionStep>,
    /// Successful outputs by module name.
    pub output_module_map: BTreeMap<String, Port>,
    /// Traces of the output modules that ran, in declaration order.
    pub output_modules: Vec<ModuleTrace>,
    pub output_module_errors: BTreeMap<String, String>,
    pub default_output_module: Option<String>,
    pub clarifying_response: Option<String>,
    pub total_usage: TokenUsage,
    pub total_cost: f64,
    pub total_time_seconds: f64,
}

impl PluginExecutionResponse {
    fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            run_completed: false,
            input_modules: Vec::new(),
            signature_step: None,
            execution_step: None,
            output_module_map: BTreeMap::new(),
            output_modules: Vec::new(),
            output_module_errors: BTreeMap::new(),
            default_output_module: None,
            clarifying_response: None,
            total_usage: TokenUsage::default(),
            total_cost: 0.0,
            total_time_seconds: 0.0,
        }
    }

    pub fn default_output(&self) -> Option<&Port> {
        self.output_module_map.get(self.default_output_module.as_deref()?)
    }

    pub fn tracing_steps(&self) -> Vec<TracingStep> {
        let mut steps = Vec::new();
        for module in &self.input_modules {
            steps.extend(module.records.iter().map(|r| TracingStep::from_record(&module.name, r)));
        }
        if let Some(signature) = &self.signature_step {
            let output_text = match &signature.outcome {
                SignatureOutcome::ToolCall(d) => Some(format!(
                    "{}({})",
                    d.params.function_name, d.params.mapped_operation_parameters
                )),
                SignatureOutcome::FreeText(text) => Some(text.clone()),
                SignatureOutcome::Failure(e) => Some(e.clone()),
            };
            steps.push(TracingStep {
                name: "signature".into(),
                label: signature.model_name.clone(),
                processing_time_seconds: signature.response_time_seconds,
                status_code: None,
                input_text: Some(signature.prompt.clone()),
                output_text: output_text.map(|t| truncate_for_log(&t, TRACE_TEXT_LEN)),
            });
        }
        if let Some(exec) = &self.execution_step {
            steps.push(TracingStep {
                name: "api_execution".into(),
                label: format!("{} {}", exec.params.method, exec.params.url),
                processing_time_seconds: exec.response.api_call_response_seconds,
                status_code: Some(exec.response.status_code),
                input_text: Some(truncate_for_log(&json!(exec.params.query_params).to_string(), TRACE_TEXT_LEN)),
                output_text: Some(truncate_for_log(&exec.response.original_response.to_string(), TRACE_TEXT_LEN)),
            });
        }
        for module in &self.output_modules {
            steps.extend(module.records.iter().map(|r| TracingStep::from_record(&module.name, r)));
        }
        steps
    }

    /// The response as JSON, with `tracing_steps` included.
    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        value["tracing_steps"] = serde_json::to_value(self.tracing_steps())?;
        Ok(value)
    }
}

/// Runs plugin requests against a provider and an HTTP client.
pub struct Pipeline {
    provider: Arc<dyn FunctionProvider>,
    executor: OperationExecutor,
    config: Config,
    ctx: ProcessorContext,
}

impl Pipeline {
    pub fn new(provider: Arc<dyn FunctionProvider>, http: Arc<dyn HttpCall>, ctx: ProcessorContext) -> Self {
        let config = ctx.config.clone();
        let executor = OperationExecutor::new(http, provider.clone(), config.clone());
        Self {
            provider,
            executor,
            config,
            ctx,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.executor = self.executor.with_retry_policy(retry);
        self
    }

    #[tracing::instrument(name = "pipeline_run", skip_all, fields(plugin = %plugin.name))]
    pub async fn run(
        &self,
        plugin: Arc<Plugin>,
        request: PipelineRequest,
    ) -> Result<PluginExecutionResponse, PipelineError> {
        let start = Instant::now();
        let mut response = PluginExecutionResponse::new();
        info!(request_id = %response.request_id, "plugin run started");

        // 1) normalise and adapt the input to text
        let input = request.input.to_port()?;
        let prompt = self.input_text(&plugin, input, &mut response).await?;

        // 2) pick the operation
        let resolver = SignatureResolver::new(self.provider.clone(), self.executor.clone(), self.config.clone())
            .with_auth(request.headers.clone(), request.auth_query_params.clone());
        let selected = resolver
            .resolve(
                plugin.clone(),
                &[Message::user(prompt.clone())],
                &request.conversation,
                request.selected_operation.as_ref(),
            )
            .await;
        response.total_usage += selected.total_usage;
        response.total_cost += selected.total_cost;

        let detected = match &selected.outcome {
            SignatureOutcome::ToolCall(d) => d.as_ref().clone(),
            SignatureOutcome::FreeText(text) => {
                let text = text.clone();
                response.signature_step = Some(selected);
                finish_single(&mut response, LLM_RESPONSE, Port::text(LLM_RESPONSE, text));
                response.total_time_seconds = start.elapsed().as_secs_f64();
                return Ok(response);
            }
            SignatureOutcome::Failure(e) => return Err(PipelineError::SignatureResolution(e.clone())),
        };
        response.signature_step = Some(selected);

        // 3) call the API
        let params = OperationExecutionParams::from_detected(
            &detected.function,
            &detected.params.mapped_operation_parameters,
            request.headers.clone(),
            request.auth_query_params.clone(),
        )
        .with_prompt(prompt);
        let api_response = match self.executor.execute(params.clone()).await {
            ExecutionOutcome::Success(r) => r,
            ExecutionOutcome::ClarifyingQuestion(r) => {
                response.total_usage += r.clarifying_usage;
                response.total_cost += r.clarifying_cost;
                let question = r.clarifying_response.clone().unwrap_or_default();
                response.clarifying_response = Some(question.clone());
                response.execution_step = Some(ExecutionStep { params, response: r });
                finish_single(&mut response, CLARIFYING_RESPONSE, Port::text(CLARIFYING_RESPONSE, question));
                response.total_time_seconds = start.elapsed().as_secs_f64();
                return Ok(response);
            }
            ExecutionOutcome::Failure(e) => return Err(e.into()),
        };
        let original = api_response.original_response.clone();
        let status_code = api_response.status_code;
        response.execution_step = Some(ExecutionStep {
            params,
            response: api_response,
        });

        // 4) fan out to the output modules
        let supported = plugin.supported_output_modules(&detected.operation_key());
        let plan = OutputPlan::new(&supported, &request);
        let reports = join_all(
            plan.modules
                .iter()
                .map(|m| m.run(response_port(m.initial_input_port(), &original), &self.ctx)),
        )
        .await;

        for report in reports {
            response.output_modules.push(ModuleTrace::from_report(&report));
            let name = report.name.clone();
            match report.into_result() {
                Ok(mut port) => {
                    port.metadata_mut().default_output_module = plan.default.as_deref() == Some(name.as_str());
                    response.output_module_map.insert(name, port);
                }
                Err((label, e)) => {
                    warn!(module = %name, "output module failed: {e}");
                    response.output_module_errors.insert(name, format!("{label}: {e}"));
                }
            }
        }
        if plan.include_original {
            let mut port = Port::json(ORIGINAL_RESPONSE, original);
            let meta = port.metadata_mut();
            meta.status_code = Some(status_code);
            meta.default_output_module = plan.default.as_deref() == Some(ORIGINAL_RESPONSE);
            response.output_module_map.insert(ORIGINAL_RESPONSE.to_string(), port);
        }

        response.default_output_module = plan.default;
        response.run_completed = true;
        response.total_time_seconds = start.elapsed().as_secs_f64();
        info!(
            request_id = %response.request_id,
            outputs = response.output_module_map.len(),
            failed = response.output_module_errors.len(),
            "plugin run finished"
        );
        Ok(response)
    }

    /// Run the matching input module, if any, and return the prompt text.
    async fn input_text(
        &self,
        plugin: &Plugin,
        input: Port,
        response: &mut PluginExecutionResponse,
    ) -> Result<String, PipelineError> {
        let Some(module) = plugin.input_module_for(input.data_type()) else {
            if input.data_type() == PortType::Text {
                return input.require_str().map(str::to_string).map_err(|e| PipelineError::InvalidInput(e.to_string()));
            }
            return Err(PipelineError::UnsupportedInput(input.data_type()));
        };

        let report = module.run(input, &self.ctx).await;
        response.input_modules.push(ModuleTrace::from_report(&report));
        let port = report.into_result().map_err(|(label, e)| PipelineError::InputModule {
            module: module.name().to_string(),
            message: format!("{label}: {e}"),
        })?;
        port.require_str()
            .map(str::to_string)
            .map_err(|e| PipelineError::InvalidInput(e.to_string()))
    }
}

fn finish_single(response: &mut PluginExecutionResponse, name: &str, mut port: Port) {
    port.metadata_mut().default_output_module = true;
    response.output_module_map.insert(name.to_string(), port);
    response.default_output_module = Some(name.to_string());
    response.run_completed = true;
}

/// The API response shaped for a module's first port.
fn response_port(initial: PortType, original: &Value) -> Port {
    match (initial, original) {
        (PortType::Text, Value::String(s)) => Port::text(ORIGINAL_RESPONSE, s.clone()),
        (PortType::Text, other) => Port::text(ORIGINAL_RESPONSE, other.to_string()),
        // anything else gets the JSON port; the flow path rejects a mismatch
        _ => Port::json(ORIGINAL_RESPONSE, original.clone()),
    }
}

/// Which output modules run and which one is the default.
#[derive(Debug)]
struct OutputPlan<'a> {
    modules: Vec<&'a FlowPath>,
    include_original: bool,
    default: Option<String>,
}

impl<'a> OutputPlan<'a> {
    fn new(supported: &[&'a FlowPath], request: &PipelineRequest) -> Self {
        let requested_original = request.output_module_names.iter().any(|n| n == ORIGINAL_RESPONSE);

        let (modules, include_original) = if request.run_all_output_modules {
            (supported.to_vec(), requested_original || supported.is_empty())
        } else if !request.output_module_names.is_empty() {
            for name in &request.output_module_names {
                if name != ORIGINAL_RESPONSE && !supported.iter().any(|m| m.name() == name) {
                    warn!(module = %name, "requested output module is not supported, ignoring");
                }
            }
            let modules = supported
                .iter()
                .copied()
                .filter(|m| request.output_module_names.iter().any(|n| n == m.name()))
                .collect();
            (modules, requested_original)
        } else {
            let default = supported.iter().copied().find(|m| m.is_default()).or(supported.first().copied());
            match default {
                Some(m) => (vec![m], false),
                None => (Vec::new(), true),
            }
        };

        let default = if requested_original {
            Some(ORIGINAL_RESPONSE.to_string())
        } else {
            modules
                .iter()
                .find(|m| m.is_default())
                .or(modules.first())
                .map(|m| m.name().to_string())
                .or_else(|| include_original.then(|| ORIGINAL_RESPONSE.to_string()))
        };

        Self {
            modules,
            include_original,
            default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_path::FlowPathConfig;
    use crate::processor::{ProcessorConfig, ProcessorImplementationType, ProcessorType};
    use std::path::Path;

    fn module(name: &str, initial: PortType, default: bool) -> FlowPath {
        let processors = match initial {
            PortType::Html => vec![ProcessorConfig::new(
                ProcessorType::HtmlToText,
                ProcessorImplementationType::Regex,
            )],
            _ => vec![],
        };
        let finish = if initial == PortType::Html { PortType::Text } else { initial };
        FlowPath::build(&FlowPathConfig {
            name: name.into(),
            description: String::new(),
            initial_input_port: initial,
            finish_output_port: finish,
            processors,
            default,
        })
        .unwrap()
    }

    fn plan_names(plan: &OutputPlan<'_>) -> Vec<String> {
        plan.modules.iter().map(|m| m.name().to_string()).collect()
    }

    #[test]
    fn default_plan_prefers_flagged_module() {
        let a = module("a", PortType::Json, false);
        let b = module("b", PortType::Json, true);
        let supported = vec![&a, &b];
        let plan = OutputPlan::new(&supported, &PipelineRequest::text("x"));
        assert_eq!(plan_names(&plan), vec!["b"]);
        assert!(!plan.include_original);
        assert_eq!(plan.default.as_deref(), Some("b"));
    }

    #[test]
    fn default_plan_falls_back_to_first_then_original() {
        let a = module("a", PortType::Json, false);
        let b = module("b", PortType::Json, false);
        let plan = OutputPlan::new(&[&a, &b], &PipelineRequest::text("x"));
        assert_eq!(plan.default.as_deref(), Some("a"));

        let plan = OutputPlan::new(&[], &PipelineRequest::text("x"));
        assert!(plan.include_original);
        assert_eq!(plan.default.as_deref(), Some(ORIGINAL_RESPONSE));
    }

    #[test]
    fn requested_original_wins_and_unknown_names_are_ignored() {
        let a = module("a", PortType::Json, true);
        let b = module("b", PortType::Json, false);
        let request = PipelineRequest::text("x").with_output_modules(["b", "nope", ORIGINAL_RESPONSE]);
        let plan = OutputPlan::new(&[&a, &b], &request);
        assert_eq!(plan_names(&plan), vec!["b"]);
        assert!(plan.include_original);
        assert_eq!(plan.default.as_deref(), Some(ORIGINAL_RESPONSE));
    }

    #[test]
    fn run_all_keeps_declaration_order() {
        let a = module("a", PortType::Json, false);
        let b = module("b", PortType::Json, true);
        let c = module("c", PortType::Json, false);
        let plan = OutputPlan::new(&[&a, &b, &c], &PipelineRequest::text("x").run_all());
        assert_eq!(plan_names(&plan), vec!["a", "b", "c"]);
        assert!(!plan.include_original);
        assert_eq!(plan.default.as_deref(), Some("b"));

        let plan = OutputPlan::new(&[], &PipelineRequest::text("x").run_all());
        assert!(plan.include_original);
        assert_eq!(plan.default.as_deref(), Some(ORIGINAL_RESPONSE));

        let request = PipelineRequest::text("x").run_all().with_output_modules([ORIGINAL_RESPONSE]);
        let plan = OutputPlan::new(&[&a, &b], &request);
        assert_eq!(plan_names(&plan), vec!["a", "b"]);
        assert!(plan.include_original);
    }

    #[test]
    fn input_normalisation() {
        let port = PipelineInput::Text("hi".into()).to_port().unwrap();
        assert_eq!(port.data_type(), PortType::Text);

        let port = PipelineInput::Url("https://cdn.io/a/song.mp3".into()).to_port().unwrap();
        assert_eq!(port.data_type(), PortType::RemoteFileUrl);
        assert_eq!(port.mime_types(), ["audio/mpeg".to_string()]);

        let port = PipelineInput::Url("https://news.io/story".into()).to_port().unwrap();
        assert_eq!(port.data_type(), PortType::Httpurl);

        assert!(matches!(
            PipelineInput::Url("not a url".into()).to_port(),
            Err(PipelineError::InvalidInput(_))
        ));

        let port = PipelineInput::File {
            path: Path::new("/tmp/voice.wav").to_path_buf(),
            content_type: None,
        }
        .to_port()
        .unwrap();
        assert_eq!(port.data_type(), PortType::File);
        assert_eq!(port.file_path().unwrap(), "/tmp/voice.wav");
        assert_eq!(port.value().unwrap()["name"], "voice.wav");
    }

    #[test]
    fn response_port_shapes() {
        assert_eq!(response_port(PortType::Text, &json!("plain")).value(), Some(&json!("plain")));
        assert_eq!(response_port(PortType::Text, &json!({"a": 1})).value(), Some(&json!("{\"a\":1}")));
        assert_eq!(response_port(PortType::Html, &json!({"a": 1})).data_type(), PortType::Json);
    }

    #[test]
    fn error_payload() {
        let e = PipelineError::Execution(ExecutionError::Status {
            status_code: 502,
            response: "bad gateway".into(),
        });
        let payload = e.to_payload();
        assert_eq!(payload["error"], "execution");
        assert_eq!(payload["status_code"], 502);
        assert_eq!(PipelineError::UnsupportedInput(PortType::File).to_payload()["error"], "unsupported_input");
    }
}
