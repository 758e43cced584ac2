use super::{Processor, ProcessorContext, ProcessorError, ProcessorImplementationType, ProcessorType};
use crate::port::{Port, PortType};
use async_trait::async_trait;
use handlebars::Handlebars;
use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateSettings {
    pub template: String,
    /// `TEXT` (default) or `JSON`; a `JSON` result must parse as JSON.
    #[serde(default = "default_output")]
    pub output_port_type: PortType,
}

fn default_output() -> PortType {
    PortType::Text
}

/// Renders a Handlebars template over the incoming value.
///
/// The template sees:
/// - `response`: the whole input value (e.g. `{{response.items.0.title}}`)
/// - the top-level fields of a JSON object input directly (e.g. `{{title}}`)
/// - `text`: the input when it is plain text
///
/// Missing fields render as empty strings.
#[derive(Debug, Clone)]
pub struct HandlebarsTemplateProcessor {
    label: String,
    settings: TemplateSettings,
}

impl HandlebarsTemplateProcessor {
    pub fn new(label: String, settings: TemplateSettings) -> Result<Self, ProcessorError> {
        if !matches!(settings.output_port_type, PortType::Text | PortType::Json) {
            return Err(ProcessorError::Config(format!(
                "{label}: output_port_type must be TEXT or JSON, got {}",
                settings.output_port_type
            )));
        }
        Ok(Self { label, settings })
    }
}

fn template_data(input: &Value) -> Value {
    let mut data = Map::new();
    match input {
        Value::Object(fields) => {
            data.extend(fields.clone());
        }
        Value::String(s) => {
            // stringified JSON is unpacked like a JSON input
            if let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(s) {
                data.extend(fields);
            }
            data.insert("text".to_string(), Value::String(s.clone()));
        }
        _ => {}
    }
    data.insert("response".to_string(), input.clone());
    Value::Object(data)
}

#[async_trait]
impl Processor for HandlebarsTemplateProcessor {
    fn processor_type(&self) -> ProcessorType {
        ProcessorType::TemplateEngine
    }

    fn implementation_type(&self) -> ProcessorImplementationType {
        ProcessorImplementationType::Handlebars
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn input_port_types(&self) -> &'static [PortType] {
        &[PortType::Text, PortType::Json]
    }

    fn output_port_types(&self) -> &'static [PortType] {
        &[PortType::Text, PortType::Json]
    }

    #[tracing::instrument(name = "template_engine_process", skip(self, input, _ctx), fields(label = %self.label))]
    async fn process_input(&self, input: &Port, _ctx: &ProcessorContext) -> Result<Port, ProcessorError> {
        let mut hbs = Handlebars::new();
        hbs.register_escape_fn(handlebars::no_escape);

        let data = template_data(input.require_value()?);
        let rendered = hbs
            .render_template(&self.settings.template, &data)
            .map_err(|e| ProcessorError::Failed(format!("Template render error: {e}")))?;

        match self.settings.output_port_type {
            PortType::Json => {
                let value: Value = serde_json::from_str(&rendered)
                    .map_err(|e| ProcessorError::Failed(format!("rendered template is not JSON: {e}")))?;
                Ok(Port::json(input.name(), value))
            }
            _ => Ok(Port::text(input.name(), rendered)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::test_support::context;
    use serde_json::json;
    use tempfile::TempDir;

    fn processor(template: &str, output: PortType) -> HandlebarsTemplateProcessor {
        HandlebarsTemplateProcessor::new(
            "tpl".into(),
            TemplateSettings {
                template: template.into(),
                output_port_type: output,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn renders_json_fields_and_response() {
        let dir = TempDir::new().unwrap();
        let p = processor("{{title}} ({{response.id}})", PortType::Text);
        let out = p
            .process(&Port::json("r", json!({"title": "Buy milk", "id": 3})), &context(&dir))
            .await
            .unwrap();
        assert_eq!(out.data_type(), PortType::Text);
        assert_eq!(out.value(), Some(&json!("Buy milk (3)")));
    }

    #[tokio::test]
    async fn iterates_arrays_without_html_escaping() {
        let dir = TempDir::new().unwrap();
        let p = processor("{{#each response}}- {{this.name}}\n{{/each}}", PortType::Text);
        let out = p
            .process(&Port::json("r", json!([{"name": "a&b"}, {"name": "c"}])), &context(&dir))
            .await
            .unwrap();
        assert_eq!(out.value(), Some(&json!("- a&b\n- c\n")));
    }

    #[tokio::test]
    async fn text_input_and_missing_fields() {
        let dir = TempDir::new().unwrap();
        let p = processor("Said: {{text}}{{missing}}", PortType::Text);
        let out = p.process(&Port::text("t", "hello"), &context(&dir)).await.unwrap();
        assert_eq!(out.value(), Some(&json!("Said: hello")));
    }

    #[tokio::test]
    async fn json_output_must_parse() {
        let dir = TempDir::new().unwrap();
        let ok = processor(r#"{"t": "{{title}}"}"#, PortType::Json);
        let out = ok
            .process(&Port::json("r", json!({"title": "x"})), &context(&dir))
            .await
            .unwrap();
        assert_eq!(out.value(), Some(&json!({"t": "x"})));

        let bad = processor("not json {{title}}", PortType::Json);
        let err = bad
            .process(&Port::json("r", json!({"title": "x"})), &context(&dir))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessorError::Failed(_)));
    }

    #[test]
    fn rejects_non_text_output_type() {
        let err = HandlebarsTemplateProcessor::new(
            "tpl".into(),
            TemplateSettings {
                template: String::new(),
                output_port_type: PortType::Filepath,
            },
        )
        .unwrap_err();
        assert!(matches!(err, ProcessorError::Config(_)));
    }
}
