//! Client for the resource-management batch endpoint.
//!
//! Logical operations are numbered, split into chunks, posted one chunk per
//! physical call, and the collected responses are sorted back into request
//! order. A chunk answered with `202 Accepted` is polled at its `location`
//! until it completes or the poll timeout elapses.

use std::sync::Arc;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::time::Instant;

use crate::config::BatchSettings;
use crate::error::{Result, SyncError};
use crate::http::{HttpRequest, HttpResponse, HttpTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BatchMethod {
    Get,
    Put,
    Delete,
}

impl BatchMethod {
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::Get)
    }
}

/// One logical operation inside a batch call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    /// Correlation token: the operation's index in the caller's list
    pub name: String,
    pub http_method: BatchMethod,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub name: String,
    #[serde(default)]
    pub http_status_code: u16,
    #[serde(default)]
    pub headers: Map<String, Value>,
    #[serde(default)]
    pub content: Value,
}

impl BatchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.http_status_code)
    }

    pub fn error(&self) -> Option<&Value> {
        self.content.get("error")
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error()?.get("code")?.as_str()
    }

    pub fn error_message(&self) -> Option<String> {
        let error = self.error()?;
        Some(
            error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string()),
        )
    }
}

#[derive(Deserialize)]
struct BatchResult {
    #[serde(default, alias = "value")]
    responses: Vec<BatchResponse>,
}

pub struct BatchClient {
    transport: Arc<dyn HttpTransport>,
    management_url: String,
    settings: BatchSettings,
    api_version: String,
}

impl BatchClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        management_url: &str,
        settings: BatchSettings,
        api_version: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            management_url: management_url.trim_end_matches('/').to_string(),
            settings,
            api_version: api_version.into(),
        }
    }

    /// Absolute URL of a resource id, e.g. `/subscriptions/..` -> `https://host/subscriptions/..?api-version=..`
    pub fn resource_url(&self, id: &str, api_version: &str) -> String {
        let separator = if id.contains('?') { '&' } else { '?' };
        format!(
            "{}{}{}api-version={}",
            self.management_url, id, separator, api_version
        )
    }

    fn batch_url(&self) -> String {
        format!(
            "{}/batch?api-version={}",
            self.management_url, self.api_version
        )
    }

    pub async fn get(&self, urls: Vec<String>) -> Result<Vec<BatchResponse>> {
        self.execute(
            BatchMethod::Get,
            urls.into_iter().map(|url| (url, None)).collect(),
        )
        .await
    }

    pub async fn put(&self, items: Vec<(String, Value)>) -> Result<Vec<BatchResponse>> {
        self.execute(
            BatchMethod::Put,
            items
                .into_iter()
                .map(|(url, body)| (url, Some(body)))
                .collect(),
        )
        .await
    }

    pub async fn delete(&self, urls: Vec<String>) -> Result<Vec<BatchResponse>> {
        self.execute(
            BatchMethod::Delete,
            urls.into_iter().map(|url| (url, None)).collect(),
        )
        .await
    }

    /// Run every operation and return responses where `response[i]` answers operation `i`.
    pub async fn execute(
        &self,
        method: BatchMethod,
        operations: Vec<(String, Option<Value>)>,
    ) -> Result<Vec<BatchResponse>> {
        if operations.is_empty() {
            return Ok(Vec::new());
        }

        let requests: Vec<BatchRequest> = operations
            .into_iter()
            .enumerate()
            .map(|(index, (url, content))| BatchRequest {
                name: index.to_string(),
                http_method: method,
                url,
                content,
            })
            .collect();

        let chunk_size = if method.is_read_only() {
            self.settings.read_chunk_size
        } else {
            self.settings.write_chunk_size
        };

        let mut responses = Vec::with_capacity(requests.len());
        let mut pending = Vec::new();

        for (chunk_index, chunk) in requests.chunks(chunk_size.max(1)).enumerate() {
            let request = HttpRequest::new(Method::POST, self.batch_url())
                .with_body(json!({ "requests": chunk }));
            let resp = self.transport.send(request).await?;
            match resp.status {
                200 => responses.extend(parse_responses(&resp)?),
                202 => {
                    let location = resp
                        .header("location")
                        .ok_or(SyncError::MissingPollLocation)?;
                    tracing::debug!(chunk = chunk_index, "Batch chunk accepted for async processing");
                    pending.push(location.to_string());
                }
                status => return Err(SyncError::http_status(status, resp.body_text())),
            }
        }

        self.poll(pending, &mut responses).await?;

        if responses.len() != requests.len() {
            return Err(SyncError::ResponseCountMismatch {
                requests: requests.len(),
                responses: responses.len(),
            });
        }
        sort_by_request_index(&mut responses)?;

        tracing::debug!(
            method = ?method,
            operations = requests.len(),
            "Batch completed"
        );
        Ok(responses)
    }

    async fn poll(&self, mut pending: Vec<String>, responses: &mut Vec<BatchResponse>) -> Result<()> {
        let started = Instant::now();
        let timeout = self.settings.poll_timeout();

        while !pending.is_empty() {
            tokio::time::sleep(self.settings.poll_interval()).await;
            if started.elapsed() >= timeout {
                return Err(SyncError::PollTimeout {
                    pending: pending.len(),
                    elapsed_secs: started.elapsed().as_secs(),
                });
            }

            let mut still_pending = Vec::new();
            for location in pending {
                let resp = self
                    .transport
                    .send(HttpRequest::new(Method::GET, location.as_str()))
                    .await?;
                match resp.status {
                    200 => responses.extend(parse_responses(&resp)?),
                    202 => still_pending.push(location),
                    status => return Err(SyncError::http_status(status, resp.body_text())),
                }
            }
            tracing::debug!(pending = still_pending.len(), "Polled batch chunks");
            pending = still_pending;
        }
        Ok(())
    }
}

fn parse_responses(resp: &HttpResponse) -> Result<Vec<BatchResponse>> {
    let result: BatchResult = serde_json::from_value(resp.body.clone())?;
    Ok(result.responses)
}

fn sort_by_request_index(responses: &mut Vec<BatchResponse>) -> Result<()> {
    let mut keyed = Vec::with_capacity(responses.len());
    for response in responses.drain(..) {
        let index: usize = response
            .name
            .parse()
            .map_err(|_| SyncError::InvalidCorrelation(response.name.clone()))?;
        keyed.push((index, response));
    }
    keyed.sort_by_key(|(index, _)| *index);

    for (position, (index, _)) in keyed.iter().enumerate() {
        if *index != position {
            return Err(SyncError::InvalidCorrelation(format!(
                "{index} (expected {position})"
            )));
        }
    }
    responses.extend(keyed.into_iter().map(|(_, response)| response));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(name: &str) -> BatchResponse {
        BatchResponse {
            name: name.into(),
            http_status_code: 200,
            ..Default::default()
        }
    }

    #[test]
    fn test_sort_restores_request_order() {
        let mut responses = vec![response("2"), response("0"), response("10"), response("1")];
        responses.extend((3..10).map(|i| response(&i.to_string())));
        sort_by_request_index(&mut responses).unwrap();
        for (i, r) in responses.iter().enumerate() {
            assert_eq!(r.name, i.to_string());
        }
    }

    #[test]
    fn test_sort_rejects_non_numeric_names() {
        let mut responses = vec![response("0"), response("abc")];
        assert!(matches!(
            sort_by_request_index(&mut responses),
            Err(SyncError::InvalidCorrelation(_))
        ));
    }

    #[test]
    fn test_sort_rejects_duplicate_index() {
        let mut responses = vec![response("0"), response("0")];
        assert!(sort_by_request_index(&mut responses).is_err());
    }

    #[test]
    fn test_request_serializes_wire_shape() {
        let req = BatchRequest {
            name: "0".into(),
            http_method: BatchMethod::Put,
            url: "https://host/x".into(),
            content: Some(json!({"a": 1})),
        };
        let wire = serde_json::to_value(&req).unwrap();
        assert_eq!(wire["httpMethod"], "PUT");
        assert_eq!(wire["content"]["a"], 1);

        let get = BatchRequest {
            content: None,
            http_method: BatchMethod::Get,
            ..req
        };
        assert!(serde_json::to_value(&get).unwrap().get("content").is_none());
    }

    #[test]
    fn test_error_message_extraction() {
        let resp = BatchResponse {
            name: "0".into(),
            http_status_code: 404,
            content: json!({"error": {"code": "PolicyDefinitionNotFound", "message": "gone"}}),
            ..Default::default()
        };
        assert_eq!(resp.error_code(), Some("PolicyDefinitionNotFound"));
        assert_eq!(resp.error_message().as_deref(), Some("gone"));
        assert!(!resp.is_success());
    }
}
