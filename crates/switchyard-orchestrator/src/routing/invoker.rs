//! Downstream invocation of a selected instance.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::types::RouteRequest;
use crate::error::{OrchestrationError, Result};

/// Header carrying the caller's context ID downstream.
pub const CONTEXT_ID_HEADER: &str = "x-context-id";

/// Issues the downstream call for a routed request.
#[async_trait]
pub trait ServiceInvoker: Send + Sync {
    /// Calls `action` on the instance at `instance_url`.
    ///
    /// # Errors
    /// Returns `Validation` when the request itself cannot be built, which
    /// says nothing about the instance. Transport failures, timeouts and
    /// non-2xx responses are `Downstream`.
    async fn invoke(&self, instance_url: &str, request: &RouteRequest) -> Result<serde_json::Value>;
}

/// Invoker posting JSON to `{instance_url}/api/{action}`.
#[derive(Debug, Clone)]
pub struct HttpInvoker {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpInvoker {
    /// Creates an invoker whose requests give up after `timeout`.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OrchestrationError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl ServiceInvoker for HttpInvoker {
    async fn invoke(&self, instance_url: &str, request: &RouteRequest) -> Result<serde_json::Value> {
        let endpoint = format!("{instance_url}/api/{}", request.action.trim_matches('/'));
        debug!(endpoint = %endpoint, "Invoking downstream service");

        let mut builder = self.client.post(&endpoint).json(&request.payload);
        if let Some(context_id) = &request.context_id {
            builder = builder.header(CONTEXT_ID_HEADER, context_id);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_builder() {
                OrchestrationError::Validation(format!("cannot build request to {endpoint}: {e}"))
            } else if e.is_timeout() {
                OrchestrationError::Downstream(format!(
                    "request to {endpoint} timed out after {}ms",
                    self.timeout.as_millis()
                ))
            } else {
                OrchestrationError::Downstream(format!("request to {endpoint} failed: {e}"))
            }
        })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| {
            OrchestrationError::Downstream(format!("failed to read response from {endpoint}: {e}"))
        })?;

        if !status.is_success() {
            return Err(OrchestrationError::Downstream(format!(
                "{endpoint} returned HTTP {status}"
            )));
        }

        if body.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        // Non-JSON bodies are passed through as a string.
        Ok(serde_json::from_slice(&body).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&body).into_owned())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    #[tokio::test]
    async fn test_posts_payload_with_context_header() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/enroll")
            .match_header(CONTEXT_ID_HEADER, "ctx-1")
            .match_body(Matcher::Json(serde_json::json!({"courseId": 7})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"enrolled": true}"#)
            .create_async()
            .await;

        let invoker = HttpInvoker::new(Duration::from_secs(5)).unwrap();
        let request = RouteRequest::new("courses", "enroll", serde_json::json!({"courseId": 7}))
            .with_context("ctx-1");
        let body = invoker.invoke(&server.url(), &request).await.unwrap();

        assert_eq!(body["enrolled"], true);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_success_status_is_downstream_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server.mock("POST", "/api/list").with_status(502).create_async().await;

        let invoker = HttpInvoker::new(Duration::from_secs(5)).unwrap();
        let request = RouteRequest::new("courses", "list", serde_json::Value::Null);
        let err = invoker.invoke(&server.url(), &request).await.unwrap_err();
        assert_eq!(err.code(), "DOWNSTREAM_ERROR");
    }

    #[tokio::test]
    async fn test_empty_body_is_null() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server.mock("POST", "/api/ping").with_status(204).create_async().await;

        let invoker = HttpInvoker::new(Duration::from_secs(5)).unwrap();
        let request = RouteRequest::new("courses", "ping", serde_json::Value::Null);
        assert_eq!(invoker.invoke(&server.url(), &request).await.unwrap(), serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_unreachable_instance() {
        let invoker = HttpInvoker::new(Duration::from_millis(500)).unwrap();
        let request = RouteRequest::new("courses", "list", serde_json::Value::Null);
        assert!(invoker.invoke("http://127.0.0.1:1", &request).await.is_err());
    }
}
