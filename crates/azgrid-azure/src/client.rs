//! The management-plane REST client.
//!
//! One thin, typed wrapper over reqwest: every call is a single attempt
//! that promotes any status >= 300 into [`AzureError::Status`], and the
//! public verb helpers wrap that attempt in the retry policy. Bodies in
//! and out are `serde_json::Value` trees — templates are patched as
//! generic JSON, so the client stays schema-agnostic.

use reqwest::Method;
use serde_json::Value;
use tracing::debug;

use crate::error::{AzureError, AzureResult};
use crate::retry::with_retry;
use crate::session::Session;

/// Default management endpoint.
pub const MANAGEMENT_ENDPOINT: &str = "https://management.azure.com";

/// Authenticated client for the Azure management plane.
#[derive(Clone)]
pub struct AzureClient {
    http: reqwest::Client,
    session: Session,
    endpoint: String,
    /// Retry budget applied to every verb helper.
    pub nretry: u32,
    /// Log each request at info level instead of debug.
    pub verbose: bool,
}

impl AzureClient {
    pub fn new(session: Session) -> Self {
        Self {
            http: reqwest::Client::new(),
            session,
            endpoint: MANAGEMENT_ENDPOINT.to_string(),
            nretry: 10,
            verbose: false,
        }
    }

    /// Point the client at a different endpoint (tests use an
    /// in-process mock server).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_nretry(mut self, nretry: u32) -> Self {
        self.nretry = nretry;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Absolute URL for a management-plane path.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    pub async fn get(&self, url: &str) -> AzureResult<Value> {
        with_retry(self.nretry, || self.request(Method::GET, url, None)).await
    }

    pub async fn put(&self, url: &str, body: &Value) -> AzureResult<Value> {
        with_retry(self.nretry, || self.request(Method::PUT, url, Some(body))).await
    }

    pub async fn post(&self, url: &str, body: &Value) -> AzureResult<Value> {
        with_retry(self.nretry, || self.request(Method::POST, url, Some(body))).await
    }

    pub async fn delete(&self, url: &str) -> AzureResult<Value> {
        with_retry(self.nretry, || self.request(Method::DELETE, url, None)).await
    }

    /// One request, no retry. Status >= 300 becomes a typed error
    /// carrying the `retry-after` header so the policy can honor it.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> AzureResult<Value> {
        if self.verbose {
            tracing::info!(%method, %url, "azure request");
        } else {
            debug!(%method, %url, "azure request");
        }

        let mut req = self
            .http
            .request(method, url)
            .bearer_auth(self.session.token());
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();
        if status >= 300 {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let body = resp.text().await.unwrap_or_default();
            return Err(AzureError::Status {
                status,
                retry_after,
                body,
            });
        }

        let text = resp.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }
}
