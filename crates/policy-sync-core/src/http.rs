//! Minimal retrying HTTP transport for the resource-management API.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;

use crate::config::RetrySettings;
use crate::credentials::AccessToken;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub uri: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
}

impl HttpRequest {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub status_message: String,
    /// Header names are lower-cased
    pub headers: HashMap<String, String>,
    /// Parsed JSON when possible, raw text otherwise, `Null` when empty
    pub body: Value,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn body_text(&self) -> String {
        match &self.body {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// Sends one HTTP request and returns whatever status came back.
///
/// Implementations only fail for transport problems; non-success statuses are
/// returned to the caller as ordinary responses.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// `reqwest`-backed transport with bearer auth and bounded retries.
pub struct RestClient {
    http: reqwest::Client,
    token: String,
    retry: RetrySettings,
}

impl RestClient {
    pub fn new(access: &AccessToken, retry: RetrySettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            token: access.token.clone(),
            retry,
        }
    }

    async fn send_once(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let mut req = self
            .http
            .request(request.method.clone(), &request.uri)
            .bearer_auth(&self.token)
            .header("Accept", "application/json");
        for (name, value) in &request.headers {
            req = req.header(name, value);
        }
        if let Some(body) = &request.body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let text = resp.text().await.unwrap_or_default();

        Ok(HttpResponse {
            status: status.as_u16(),
            status_message: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body: parse_body(&text),
        })
    }
}

#[async_trait]
impl HttpTransport for RestClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut attempt = 0;
        loop {
            let result = self.send_once(&request).await;
            let retryable = match &result {
                Ok(resp) => self.retry.retryable_statuses.contains(&resp.status),
                Err(e) => e.is_transient(),
            };
            if !retryable || attempt >= self.retry.max_retries {
                return result;
            }
            attempt += 1;
            tracing::debug!(
                method = %request.method,
                uri = %request.uri,
                attempt,
                "Retrying request"
            );
            tokio::time::sleep(self.retry.retry_interval()).await;
        }
    }
}

fn parse_body(text: &str) -> Value {
    if text.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}
