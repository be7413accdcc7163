//! Common utilities for the device proxy client
//!
//! Provides the authenticated HTTP wrapper shared by every device class.

use crate::error::DeviceError;
use crate::models::ErrorBody;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// HTTP client wrapper with optional bearer authentication
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpClient {
    /// Create a new HTTP client wrapper with a per-request timeout
    pub fn new(base_url: String, token: Option<String>, timeout: Duration) -> Result<Self, DeviceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(DeviceError::Http)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build a full URL from a path
    pub fn build_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header("Accept", "application/json");
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, path: &str, request: RequestBuilder) -> Result<Response, DeviceError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(DeviceError::from_transport)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(error_for_status(path, status, &body))
    }

    /// Make a GET request
    pub async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, DeviceError> {
        let url = self.build_url(path);
        debug!("GET {}", url);

        let response = self.send(path, self.client.get(&url)).await?;
        let text = response.text().await.map_err(DeviceError::from_transport)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Make a PUT request with a JSON body, discarding the response body
    pub async fn put(&self, path: &str, body: &serde_json::Value) -> Result<(), DeviceError> {
        let url = self.build_url(path);
        debug!("PUT {} with body: {}", url, body);

        self.send(path, self.client.put(&url).json(body)).await?;
        Ok(())
    }

    /// Make a DELETE request
    pub async fn delete(&self, path: &str) -> Result<(), DeviceError> {
        let url = self.build_url(path);
        debug!("DELETE {}", url);

        self.send(path, self.client.delete(&url)).await?;
        Ok(())
    }
}

/// Maps a non-success proxy response onto the error taxonomy.
pub fn error_for_status(path: &str, status: StatusCode, body: &str) -> DeviceError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .map(|b| b.error)
        .filter(|e| !e.is_empty())
        .unwrap_or_else(|| body.to_string());

    match status {
        StatusCode::NOT_FOUND => DeviceError::NotFound(format!("{path}: {message}")),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => DeviceError::Rejected(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DeviceError::Authentication(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            DeviceError::Timeout(format!("{path}: {message}"))
        }
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE => {
            DeviceError::Unreachable(format!("{path}: {message}"))
        }
        _ => DeviceError::Api { status: status.as_u16(), message },
    }
}
