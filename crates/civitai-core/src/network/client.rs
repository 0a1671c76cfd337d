//! HTTP client for the Civitai API and download endpoints.
//!
//! Provides a wrapper around reqwest with:
//! - Bearer-token authentication
//! - Request/response logging that never affects the request path
//! - A single place where non-success statuses become typed errors

use crate::config::{AppConfig, NetworkConfig};
use crate::{CivitaiError, Result};
use reqwest::{header, Client, Method, RequestBuilder, Response};
use std::time::Duration;
use tracing::debug;

/// HTTP client shared by the API client, the download engine and the scanner.
pub struct HttpClient {
    client: Client,
    api_key: Option<String>,
    /// Timeout for metadata calls. Body streams are not bounded by it.
    request_timeout: Duration,
}

impl HttpClient {
    /// Create a new HTTP client with default configuration.
    pub fn new(api_key: Option<String>) -> Result<Self> {
        Self::with_timeout(api_key, NetworkConfig::REQUEST_TIMEOUT)
    }

    /// Create a new HTTP client with a custom metadata-request timeout.
    pub fn with_timeout(api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(NetworkConfig::CONNECT_TIMEOUT)
            .user_agent(AppConfig::USER_AGENT)
            .build()
            .map_err(|e| CivitaiError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                cause: None,
            })?;

        Ok(Self {
            client,
            api_key: api_key.filter(|k| !k.is_empty()),
            request_timeout: timeout,
        })
    }

    /// Whether requests carry an `Authorization` header.
    pub fn has_auth(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// GET a JSON document, classifying failures.
    pub async fn get_json(&self, url: &str) -> Result<serde_json::Value> {
        let response = self
            .send(self.request(Method::GET, url).timeout(self.request_timeout), url)
            .await?;
        let response = Self::ensure_success(response, url).await?;

        let body = response.text().await.map_err(|e| CivitaiError::Network {
            message: format!("Failed to read response body from {}: {}", url, e),
            cause: Some(e.to_string()),
        })?;
        debug!("Response body from {}: {}", url, excerpt(&body));

        Ok(serde_json::from_str(&body)?)
    }

    /// HEAD a URL (following redirects). Failures are classified.
    pub async fn head(&self, url: &str) -> Result<Response> {
        let response = self
            .send(self.request(Method::HEAD, url).timeout(self.request_timeout), url)
            .await?;
        Self::ensure_success(response, url).await
    }

    /// Start a streaming GET, optionally from a byte offset.
    ///
    /// The response is returned even for error statuses so the caller can
    /// decide how to treat them; use [`HttpClient::ensure_success`].
    pub async fn get_stream(&self, url: &str, range_start: Option<u64>) -> Result<Response> {
        let mut request = self.request(Method::GET, url);
        if let Some(offset) = range_start {
            request = request.header(header::RANGE, format!("bytes={}-", offset));
        }
        self.send(request, url).await
    }

    /// Turn a non-success response into a typed error.
    pub async fn ensure_success(response: Response, url: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = retry_after_secs(&response);
        let body = response.text().await.unwrap_or_default();
        debug!("Error body from {} ({}): {}", url, status, excerpt(&body));

        Err(CivitaiError::from_status(status.as_u16(), url, retry_after).unwrap_or_else(|| {
            CivitaiError::UnexpectedStatus {
                url: url.to_string(),
                status: status.as_u16(),
            }
        }))
    }

    // Internal methods

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let request = self.client.request(method, url);
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, url: &str) -> Result<Response> {
        let request = request.build().map_err(|e| CivitaiError::Network {
            message: format!("Invalid request for {}: {}", url, e),
            cause: None,
        })?;
        debug!(
            "HTTP {} {} (auth: {})",
            request.method(),
            url,
            self.has_auth()
        );

        let response = self.client.execute(request).await.map_err(|e| {
            if e.is_timeout() {
                CivitaiError::Timeout(self.request_timeout)
            } else {
                CivitaiError::Network {
                    message: format!("Request to {} failed: {}", url, e),
                    cause: Some(e.to_string()),
                }
            }
        })?;

        debug!("HTTP {} <- {}", response.status(), url);
        Ok(response)
    }
}

/// Parse `Retry-After` as whole seconds.
fn retry_after_secs(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
}

/// Truncate a body for logging on a char boundary.
fn excerpt(body: &str) -> &str {
    if body.len() <= NetworkConfig::LOG_BODY_EXCERPT {
        return body;
    }
    let mut end = NetworkConfig::LOG_BODY_EXCERPT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
