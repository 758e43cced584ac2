use super::{Processor, ProcessorContext, ProcessorError, ProcessorImplementationType, ProcessorType};
use crate::port::{Port, PortType};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

static SCRIPT_STYLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(script|style|noscript|head)\b.*?</(script|style|noscript|head)\s*>").unwrap());
static COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
static BLOCK_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<\s*(br|/p|/div|/li|/h[1-6]|/tr|/title)\b[^>]*>").unwrap());
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\r\f]+").unwrap());
static BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n+").unwrap());

/// Strips markup from an HTML document, keeping block boundaries as newlines.
#[derive(Debug, Clone)]
pub struct RegexHtmlToTextProcessor {
    label: String,
}

impl RegexHtmlToTextProcessor {
    pub fn new(label: String) -> Self {
        Self { label }
    }
}

pub fn html_to_text(html: &str) -> String {
    let text = SCRIPT_STYLE.replace_all(html, " ");
    let text = COMMENT.replace_all(&text, " ");
    let text = BLOCK_BREAK.replace_all(&text, "\n");
    let text = TAG.replace_all(&text, " ");
    let text = decode_entities(&text);
    let text = SPACES.replace_all(&text, " ");
    let text = BLANK_LINES.replace_all(&text, "\n");
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_entities(text: &str) -> String {
    // &amp; last so "&amp;lt;" stays "&lt;"
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[async_trait]
impl Processor for RegexHtmlToTextProcessor {
    fn processor_type(&self) -> ProcessorType {
        ProcessorType::HtmlToText
    }

    fn implementation_type(&self) -> ProcessorImplementationType {
        ProcessorImplementationType::Regex
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn input_port_types(&self) -> &'static [PortType] {
        &[PortType::Html]
    }

    fn output_port_types(&self) -> &'static [PortType] {
        &[PortType::Text]
    }

    async fn process_input(&self, input: &Port, _ctx: &ProcessorContext) -> Result<Port, ProcessorError> {
        Ok(Port::text(input.name(), html_to_text(input.require_str()?)))
    }
}
