use crate::port::{Port, PortError, PortType};
use crate::processor::{Processor, ProcessorConfig, ProcessorContext, ProcessorError, build_processor};
use chrono::{DateTime, TimeDelta, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

/// A named processor chain as declared in a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FlowPathConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub initial_input_port: PortType,
    pub finish_output_port: PortType,
    #[serde(default)]
    pub processors: Vec<ProcessorConfig>,
    /// Marks the module returned when the caller asks for none.
    #[serde(default)]
    pub default: bool,
}

/// One record per processor step, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepRecord {
    pub label: String,
    pub input_text: Option<String>,
    pub output_text: Option<String>,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct FlowPathReport {
    pub name: String,
    /// Present only when every step succeeded.
    pub output: Option<Port>,
    pub records: Vec<StepRecord>,
    /// Label of the failing step (or the path name for port checks) and its error.
    pub error: Option<(String, ProcessorError)>,
    pub total: TimeDelta,
}

impl FlowPathReport {
    pub fn total_seconds(&self) -> f64 {
        self.total.num_milliseconds() as f64 / 1_000.0
    }

    pub fn into_result(self) -> Result<Port, (String, ProcessorError)> {
        match (self.output, self.error) {
            (_, Some(err)) => Err(err),
            (Some(port), None) => Ok(port),
            (None, None) => Err((
                self.name,
                ProcessorError::Failed("flow path produced no output".to_string()),
            )),
        }
    }
}

/// A built chain of processors turning `initial_input_port` into `finish_output_port`.
#[derive(Debug, Clone)]
pub struct FlowPath {
    name: String,
    description: String,
    initial_input_port: PortType,
    finish_output_port: PortType,
    default: bool,
    processors: Vec<Arc<dyn Processor>>,
}

impl FlowPath {
    /// Build every processor and check adjacent steps can connect.
    pub fn build(config: &FlowPathConfig) -> Result<Self, ProcessorError> {
        let processors = config
            .processors
            .iter()
            .map(build_processor)
            .collect::<Result<Vec<_>, _>>()?;

        let mut current = vec![config.initial_input_port];
        for p in &processors {
            if !current.iter().any(|t| p.input_port_types().contains(t)) {
                return Err(ProcessorError::Config(format!(
                    "`{}` cannot take {:?} in flow path `{}`",
                    p.label(),
                    current,
                    config.name
                )));
            }
            current = p.output_port_types().to_vec();
        }
        if !current.contains(&config.finish_output_port) {
            return Err(ProcessorError::Config(format!(
                "flow path `{}` cannot finish with {}",
                config.name, config.finish_output_port
            )));
        }

        Ok(Self {
            name: config.name.clone(),
            description: config.description.clone(),
            initial_input_port: config.initial_input_port,
            finish_output_port: config.finish_output_port,
            default: config.default,
            processors,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn initial_input_port(&self) -> PortType {
        self.initial_input_port
    }

    pub fn finish_output_port(&self) -> PortType {
        self.finish_output_port
    }

    pub fn is_default(&self) -> bool {
        self.default
    }

    pub fn processors(&self) -> &[Arc<dyn Processor>] {
        &self.processors
    }

    /// Feed `input` through each processor in order, stopping at the first error.
    #[tracing::instrument(name = "flow_path_run", skip(self, input, ctx), fields(flow_path = %self.name))]
    pub async fn run(&self, input: Port, ctx: &ProcessorContext) -> FlowPathReport {
        let run_start = Utc::now();
        let mut records = Vec::new();

        if input.data_type() != self.initial_input_port {
            let err = PortError::InvalidInputPort {
                expected: vec![self.initial_input_port],
                actual: input.data_type(),
            };
            error!("flow path `{}` rejected input: {}", self.name, err);
            return FlowPathReport {
                name: self.name.clone(),
                output: None,
                records,
                error: Some((self.name.clone(), err.into())),
                total: Utc::now() - run_start,
            };
        }

        let input_text = input.display_text();
        let mut current = input;
        for processor in &self.processors {
            let started = Utc::now();
            let result = processor.process(&current, ctx).await;
            let finished = Utc::now();

            match result {
                Ok(output) => {
                    records.push(StepRecord {
                        label: processor.label().to_string(),
                        input_text: current.display_text(),
                        output_text: output.display_text(),
                        started,
                        finished,
                        error: None,
                    });
                    current = output;
                }
                Err(err) => {
                    error!("step `{}` of `{}` failed: {}", processor.label(), self.name, err);
                    records.push(StepRecord {
                        label: processor.label().to_string(),
                        input_text: current.display_text(),
                        output_text: None,
                        started,
                        finished,
                        error: Some(err.to_string()),
                    });
                    return FlowPathReport {
                        name: self.name.clone(),
                        output: None,
                        records,
                        error: Some((processor.label().to_string(), err)),
                        total: Utc::now() - run_start,
                    };
                }
            }
        }

        if current.data_type() != self.finish_output_port {
            let err = PortError::InvalidOutputPort {
                expected: vec![self.finish_output_port],
                actual: current.data_type(),
            };
            error!("flow path `{}` produced the wrong port: {}", self.name, err);
            return FlowPathReport {
                name: self.name.clone(),
                output: None,
                records,
                error: Some((self.name.clone(), err.into())),
                total: Utc::now() - run_start,
            };
        }

        let total = Utc::now() - run_start;
        let output_text = current.display_text();
        let meta = current.metadata_mut();
        meta.processing_time_seconds = Some(total.num_milliseconds() as f64 / 1_000.0);
        meta.input_text = input_text;
        meta.output_text = output_text;
        info!(steps = records.len(), "flow path `{}` finished", self.name);

        FlowPathReport {
            name: self.name.clone(),
            output: Some(current),
            records,
            error: None,
            total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::test_support::context;
    use crate::processor::{ProcessorImplementationType as I, ProcessorType as T};
    use serde_json::json;
    use tempfile::TempDir;

    fn template(tpl: &str) -> ProcessorConfig {
        ProcessorConfig::new(T::TemplateEngine, I::Handlebars).with_metadata("template", json!(tpl))
    }

    fn config(processors: Vec<ProcessorConfig>, initial: PortType, finish: PortType) -> FlowPathConfig {
        FlowPathConfig {
            name: "m".into(),
            description: String::new(),
            initial_input_port: initial,
            finish_output_port: finish,
            processors,
            default: false,
        }
    }

    #[tokio::test]
    async fn runs_chain_and_records_steps() {
        let dir = TempDir::new().unwrap();
        let path = FlowPath::build(&config(
            vec![
                template("<p>{{title}}</p>"),
                {
                    let mut c = template("{{text}}!");
                    c.label = Some("shout".into());
                    c
                },
            ],
            PortType::Json,
            PortType::Text,
        ))
        .unwrap();

        let report = path.run(Port::json("r", json!({"title": "hi"})), &context(&dir)).await;
        assert!(report.error.is_none());
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.records[1].label, "shout");
        assert_eq!(report.records[1].input_text.as_deref(), Some("<p>hi</p>"));
        let out = report.output.unwrap();
        assert_eq!(out.value(), Some(&json!("<p>hi</p>!")));
        assert!(out.metadata().processing_time_seconds.is_some());
        assert_eq!(out.metadata().input_text.as_deref(), Some(r#"{"title":"hi"}"#));
    }

    #[tokio::test]
    async fn wrong_initial_port_stops_before_any_step() {
        let dir = TempDir::new().unwrap();
        let path = FlowPath::build(&config(vec![template("x")], PortType::Json, PortType::Text)).unwrap();
        let report = path.run(Port::text("t", "hello"), &context(&dir)).await;
        assert!(report.records.is_empty());
        let (_, err) = report.error.unwrap();
        assert!(matches!(err, ProcessorError::Port(PortError::InvalidInputPort { .. })));
    }

    #[tokio::test]
    async fn failing_step_keeps_earlier_records() {
        let dir = TempDir::new().unwrap();
        let mut bad_json = template("not json");
        bad_json.metadata.insert("output_port_type".into(), json!("JSON"));
        let path = FlowPath::build(&config(vec![template("{{title}}"), bad_json], PortType::Json, PortType::Json)).unwrap();
        let report = path.run(Port::json("r", json!({"title": "a"})), &context(&dir)).await;
        assert_eq!(report.records.len(), 2);
        assert!(report.records[0].error.is_none());
        assert!(report.records[1].error.is_some());
        assert!(report.output.is_none());
        assert!(report.into_result().is_err());
    }

    #[tokio::test]
    async fn finish_port_mismatch_is_an_error() {
        let dir = TempDir::new().unwrap();
        // handlebars may emit TEXT or JSON, so this builds, but renders TEXT by default
        let path = FlowPath::build(&config(vec![template("Todo: {{title}}")], PortType::Json, PortType::Json)).unwrap();
        let report = path.run(Port::json("r", json!({"title": "buy milk"})), &context(&dir)).await;
        assert_eq!(report.records.len(), 1);
        assert!(report.output.is_none());
        let (label, err) = report.error.unwrap();
        assert_eq!(label, "m");
        assert!(matches!(
            err,
            ProcessorError::Port(PortError::InvalidOutputPort {
                actual: PortType::Text,
                ..
            })
        ));
    }

    #[test]
    fn build_rejects_disconnected_chain() {
        let html = ProcessorConfig::new(T::HtmlToText, I::Regex);
        let err = FlowPath::build(&config(vec![html], PortType::Json, PortType::Text)).unwrap_err();
        assert!(matches!(err, ProcessorError::Config(_)));

        let err = FlowPath::build(&config(vec![template("x")], PortType::Text, PortType::Filepath)).unwrap_err();
        assert!(matches!(err, ProcessorError::Config(_)));
    }

    #[test]
    fn empty_chain_passes_through_matching_types() {
        assert!(FlowPath::build(&config(vec![], PortType::Json, PortType::Json)).is_ok());
        assert!(FlowPath::build(&config(vec![], PortType::Json, PortType::Text)).is_err());
    }
}
