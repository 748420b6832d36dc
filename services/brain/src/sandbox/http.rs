//! Shared HTTP plumbing for the backends.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::SandboxError;

/// JSON-over-HTTP client bound to one backend base URL.
#[derive(Debug, Clone)]
pub(crate) struct BackendClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SandboxError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SandboxError::Http {
                op: "client",
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn get(&self, path: &str) -> RequestBuilder {
        self.client.get(self.url(path))
    }

    pub fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> RequestBuilder {
        self.client.post(self.url(path)).json(body)
    }

    pub fn delete(&self, path: &str) -> RequestBuilder {
        self.client.delete(self.url(path))
    }

    /// Sends a request with the default timeout and checks the status.
    pub async fn send(&self, op: &'static str, request: RequestBuilder) -> Result<Response, SandboxError> {
        self.send_with_timeout(op, request, self.timeout).await
    }

    /// Sends a request with an explicit timeout and checks the status.
    pub async fn send_with_timeout(
        &self,
        op: &'static str,
        request: RequestBuilder,
        timeout: Duration,
    ) -> Result<Response, SandboxError> {
        debug!(op, "sandbox request");
        let response = request
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| SandboxError::from_reqwest(op, timeout, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = error_message(&body).unwrap_or(body);
            return Err(SandboxError::Backend {
                op,
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    /// Sends a request and decodes a JSON reply.
    pub async fn json<T: DeserializeOwned>(
        &self,
        op: &'static str,
        request: RequestBuilder,
        timeout: Duration,
    ) -> Result<T, SandboxError> {
        let response = self.send_with_timeout(op, request, timeout).await?;
        response
            .json()
            .await
            .map_err(|e| SandboxError::from_reqwest(op, timeout, e))
    }
}

/// Pulls `message` (or `error`) out of a JSON error body.
fn error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("message")
        .or_else(|| value.get("error"))
        .and_then(|m| m.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_from_json() {
        assert_eq!(
            error_message(r#"{"status":"error","message":"no window"}"#).as_deref(),
            Some("no window")
        );
        assert_eq!(error_message(r#"{"error":"No data provided"}"#).as_deref(), Some("No data provided"));
        assert_eq!(error_message("plain text"), None);
    }
}
