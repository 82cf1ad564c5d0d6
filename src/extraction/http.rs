//! HTTP fetch extractor.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ExtractionRequest, Extractor};
use crate::error::ExtractionError;

/// Default cap on the response body kept in the result.
const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Default connect timeout.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Settings for `HttpExtractor`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpExtractorConfig {
    pub user_agent: String,
    /// Bodies longer than this are truncated.
    pub max_body_bytes: usize,
}

impl Default for HttpExtractorConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("crawlfleet/", env!("CARGO_PKG_VERSION")).to_string(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// Fetches `target_url` with a GET request.
///
/// The job config may carry a `headers` object of extra request headers.
/// Non-2xx responses are reported as failures so the retry policy applies.
pub struct HttpExtractor {
    client: Client,
    config: HttpExtractorConfig,
}

impl HttpExtractor {
    /// Creates an extractor.
    ///
    /// # Errors
    ///
    /// Returns `ExtractionError::Failure` if the HTTP client cannot be built
    /// (for example a broken TLS configuration).
    pub fn new(config: HttpExtractorConfig) -> Result<Self, ExtractionError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| ExtractionError::Failure(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Extractor for HttpExtractor {
    async fn execute(
        &self,
        request: &ExtractionRequest,
    ) -> Result<serde_json::Value, ExtractionError> {
        let mut builder = self
            .client
            .get(&request.target_url)
            .timeout(request.timeout);

        if let Some(headers) = request.config.get("headers").and_then(|h| h.as_object()) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    builder = builder.header(name.as_str(), value);
                }
            }
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ExtractionError::Timeout(request.timeout)
            } else {
                ExtractionError::Failure(format!("request failed: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExtractionError::Failure(format!(
                "HTTP {} from {}",
                status.as_u16(),
                request.target_url
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ExtractionError::Failure(format!("failed to read body: {}", e)))?;

        let truncated = bytes.len() > self.config.max_body_bytes;
        let kept = &bytes[..bytes.len().min(self.config.max_body_bytes)];
        let body = String::from_utf8_lossy(kept).into_owned();

        debug!(
            job_id = %request.job_id,
            status = status.as_u16(),
            bytes = bytes.len(),
            truncated = truncated,
            "Fetched target"
        );

        Ok(serde_json::json!({
            "url": request.target_url,
            "template_id": request.template_id,
            "status": status.as_u16(),
            "content_type": content_type,
            "content_length": bytes.len(),
            "truncated": truncated,
            "body": body,
        }))
    }
}
