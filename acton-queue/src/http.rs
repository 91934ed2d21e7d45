//! HTTP [`Executor`] on `reqwest`.

use crate::config::HttpSettings;
use crate::error::UpstreamError;
use crate::executor::Executor;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// POSTs `{"subject_id": .., "payload": ..}` to a fixed endpoint and returns
/// the JSON response body.
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpExecutor {
    /// Build an executor from settings.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::Rejected`] if the endpoint is missing or the
    /// HTTP client cannot be built.
    pub fn from_settings(settings: &HttpSettings) -> Result<Self, UpstreamError> {
        let endpoint = settings
            .endpoint
            .clone()
            .filter(|e| !e.is_empty())
            .ok_or_else(|| UpstreamError::Rejected("no HTTP endpoint configured".into()))?;
        let timeout = Duration::from_secs(settings.timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UpstreamError::Rejected(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            api_key: settings.api_key.clone(),
            timeout,
        })
    }

    /// Target endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn check_http_response(&self, response: reqwest::Response) -> Result<Value, UpstreamError> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(endpoint = %self.endpoint, status = status.as_u16(), "Upstream returned an error status");
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json()
            .await
            .map_err(|e| UpstreamError::InvalidResponse(format!("failed to parse JSON: {e}")))
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    async fn execute(&self, subject_id: &str, payload: &Value) -> Result<Value, UpstreamError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "subject_id": subject_id, "payload": payload }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        debug!(endpoint = %self.endpoint, subject_id, "Calling upstream");
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                UpstreamError::Timeout(self.timeout)
            } else {
                UpstreamError::Status {
                    status: e.status().map_or(503, |s| s.as_u16()),
                    message: e.to_string(),
                }
            }
        })?;

        self.check_http_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_endpoint_is_rejected() {
        let settings = HttpSettings::default();
        let err = HttpExecutor::from_settings(&settings).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_from_settings_keeps_endpoint() {
        let settings = HttpSettings {
            endpoint: Some("http://localhost:9/crawl".into()),
            ..HttpSettings::default()
        };
        let executor = HttpExecutor::from_settings(&settings).unwrap();
        assert_eq!(executor.endpoint(), "http://localhost:9/crawl");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_retryable() {
        let settings = HttpSettings {
            endpoint: Some("http://127.0.0.1:9/unreachable".into()),
            timeout_secs: 2,
            ..HttpSettings::default()
        };
        let executor = HttpExecutor::from_settings(&settings).unwrap();
        let err = executor.execute("s", &Value::Null).await.unwrap_err();
        assert!(err.is_retryable(), "connection failures should be retried: {err}");
    }
}
