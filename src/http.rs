use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum HttpError {
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpRequest {
    pub url: String,
    /// Upper-case HTTP verb.
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, Value>,
    pub body: Option<Value>,
    pub body_media_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub body: String,
    pub status_code: u16,
    pub elapsed_seconds: f64,
}

/// The outbound HTTP seam used to call plugin APIs.
#[async_trait]
pub trait HttpCall: Send + Sync {
    async fn call(&self, request: HttpRequest) -> Result<HttpResponse, HttpError>;
}

/// Render a scalar query value the way it appears in a URL.
pub fn query_value_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Flatten the query map; arrays repeat their key.
pub fn query_pairs(query: &BTreeMap<String, Value>) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for (k, v) in query {
        match v {
            Value::Array(items) => pairs.extend(items.iter().map(|i| (k.clone(), query_value_string(i)))),
            other => pairs.push((k.clone(), query_value_string(other))),
        }
    }
    pairs
}

fn object_pairs(body: &Value) -> Vec<(String, String)> {
    match body {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), query_value_string(v))).collect(),
        _ => Vec::new(),
    }
}

/// [`HttpCall`] over a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestHttp {
    client: Client,
    timeout: Duration,
}

impl ReqwestHttp {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl HttpCall for ReqwestHttp {
    #[tracing::instrument(name = "http_call", skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn call(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| HttpError::InvalidRequest(format!("method {}: {e}", request.method)))?;

        let mut builder = self.client.request(method, &request.url).timeout(self.timeout);
        for (k, v) in &request.headers {
            builder = builder.header(k, v);
        }
        let pairs = query_pairs(&request.query);
        if !pairs.is_empty() {
            builder = builder.query(&pairs);
        }

        if let Some(body) = &request.body {
            builder = match request.body_media_type.as_deref() {
                Some("application/x-www-form-urlencoded") => builder.form(&object_pairs(body)),
                Some("multipart/form-data") => {
                    let form = object_pairs(body)
                        .into_iter()
                        .fold(reqwest::multipart::Form::new(), |f, (k, v)| f.text(k, v));
                    builder.multipart(form)
                }
                Some(media @ ("application/xml" | "application/octet-stream")) => {
                    let raw = match body {
                        Value::Object(map) if map.len() == 1 && map.contains_key("body") => {
                            query_value_string(&map["body"])
                        }
                        other => query_value_string(other),
                    };
                    builder.header(reqwest::header::CONTENT_TYPE, media).body(raw)
                }
                _ => builder.json(body),
            };
        }

        let start = Instant::now();
        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                HttpError::Timeout
            } else if e.is_builder() {
                HttpError::InvalidRequest(format!("{e}"))
            } else {
                HttpError::Transport(format!("{e}"))
            }
        })?;
        let status_code = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| HttpError::Transport(format!("reading body failed: {e}")))?;
        let elapsed_seconds = start.elapsed().as_secs_f64();
        debug!(status_code, elapsed_seconds, "http call finished");

        Ok(HttpResponse {
            body,
            status_code,
            elapsed_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_pairs_repeat_array_keys() {
        let mut q = BTreeMap::new();
        q.insert("tag".to_string(), json!(["a", "b"]));
        q.insert("limit".to_string(), json!(5));
        q.insert("name".to_string(), json!("x y"));
        assert_eq!(
            query_pairs(&q),
            vec![
                ("limit".to_string(), "5".to_string()),
                ("name".to_string(), "x y".to_string()),
                ("tag".to_string(), "a".to_string()),
                ("tag".to_string(), "b".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn bad_method_is_invalid_request() {
        let http = ReqwestHttp::new(Client::new(), Duration::from_secs(1));
        let err = http
            .call(HttpRequest {
                url: "http://127.0.0.1:9".into(),
                method: "NOT A VERB".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn refused_connection_is_transport_error() {
        let http = ReqwestHttp::new(Client::new(), Duration::from_secs(2));
        let err = http
            .call(HttpRequest {
                url: "http://127.0.0.1:9/x".into(),
                method: "GET".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::Transport(_) | HttpError::Timeout));
    }
}
