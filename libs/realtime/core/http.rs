//! JSON request/response exchange used by polling and auxiliary requests

use crate::core::config::TransportConfig;
use crate::traits::*;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Url};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;
use tracing::debug;

/// One-shot JSON requests
#[async_trait]
pub trait HttpExchange: Send + Sync + Debug {
    /// GET `url` and decode the body; an empty body yields `Value::Null`
    async fn get_json(
        &self,
        url: &Url,
        query: &[(&str, String)],
        headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Value>;

    /// POST `body` as JSON, succeeding on any 2xx status
    async fn post_json(
        &self,
        url: &Url,
        body: &Value,
        headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<()>;
}

/// [`HttpExchange`] backed by reqwest
#[derive(Debug, Clone)]
pub struct ReqwestExchange {
    client: Client,
}

impl ReqwestExchange {
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.request_timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .cookie_store(config.with_credentials)
            .build()
            .map_err(|e| TransportError::Configuration(format!("http client: {}", e)))?;
        Ok(Self { client })
    }

    async fn execute(&self, request: RequestBuilder, timeout: Duration) -> Result<reqwest::Response> {
        let response = request
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let reason = status.canonical_reason().unwrap_or("request failed");
            return Err(TransportError::http(status.as_u16(), reason));
        }
        Ok(response)
    }
}

#[async_trait]
impl HttpExchange for ReqwestExchange {
    async fn get_json(
        &self,
        url: &Url,
        query: &[(&str, String)],
        headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Value> {
        debug!("GET {} with {} params", url, query.len());
        let request = with_headers(self.client.get(url.clone()).query(query), headers);
        let response = self.execute(request, timeout).await?;

        let body = response
            .text()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| TransportError::Parse(e.to_string()))
    }

    async fn post_json(
        &self,
        url: &Url,
        body: &Value,
        headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<()> {
        debug!("POST {}", url);
        let request = with_headers(self.client.post(url.clone()).json(body), headers);
        self.execute(request, timeout).await.map(|_| ())
    }
}

pub(crate) fn with_headers(
    mut request: RequestBuilder,
    headers: &HashMap<String, String>,
) -> RequestBuilder {
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }
    request
}

/// Classify a reqwest failure
pub(crate) fn map_reqwest_error(error: reqwest::Error, timeout: Duration) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout(timeout)
    } else if error.is_builder() {
        TransportError::Configuration(error.to_string())
    } else if let Some(status) = error.status() {
        TransportError::http(status.as_u16(), error.to_string())
    } else if error.is_decode() {
        TransportError::Parse(error.to_string())
    } else {
        TransportError::Network(error.to_string())
    }
}
