use super::{Processor, ProcessorContext, ProcessorError, ProcessorImplementationType, ProcessorType};
use crate::port::{Port, PortType};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Fetches a web page and passes its body on as HTML.
#[derive(Debug, Clone)]
pub struct ReqwestUrlToHtmlProcessor {
    label: String,
}

impl ReqwestUrlToHtmlProcessor {
    pub fn new(label: String) -> Self {
        Self { label }
    }
}

#[async_trait]
impl Processor for ReqwestUrlToHtmlProcessor {
    fn processor_type(&self) -> ProcessorType {
        ProcessorType::UrlToHtml
    }

    fn implementation_type(&self) -> ProcessorImplementationType {
        ProcessorImplementationType::Reqwest
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn input_port_types(&self) -> &'static [PortType] {
        &[PortType::Httpurl]
    }

    fn output_port_types(&self) -> &'static [PortType] {
        &[PortType::Html]
    }

    #[tracing::instrument(name = "url_to_html_process", skip(self, input, ctx))]
    async fn process_input(&self, input: &Port, ctx: &ProcessorContext) -> Result<Port, ProcessorError> {
        let url = input.require_str()?;
        let resp = ctx
            .client
            .get(url)
            .timeout(Duration::from_secs(ctx.config.http_timeout_secs))
            .send()
            .await
            .map_err(|e| ProcessorError::Failed(format!("GET {url} failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ProcessorError::Failed(format!("GET {url} returned {status}")));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| ProcessorError::Failed(format!("reading {url} failed: {e}")))?;
        debug!(url, bytes = body.len(), "fetched page");

        let mut out = Port::string(input.name(), PortType::Html, body)?;
        out.metadata_mut().status_code = Some(status.as_u16());
        Ok(out)
    }
}
