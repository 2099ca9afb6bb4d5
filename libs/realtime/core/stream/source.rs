//! Byte sources for the push stream

use crate::core::config::{append_query, TransportConfig};
use crate::core::http::{map_reqwest_error, with_headers};
use crate::traits::*;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::{Client, Url};
use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;
use tracing::debug;

/// Chunks of the response body as they arrive
pub type ByteStream = BoxStream<'static, Result<Vec<u8>>>;

/// How the stream request is built
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Plain request; token and cursor travel in the query string
    Basic,
    /// Custom headers attached; the cursor goes in `Last-Event-ID`
    Headers,
}

/// Pick the connection strategy for a config
pub fn select_stream_mode(config: &TransportConfig) -> StreamMode {
    if config.headers.is_empty() {
        StreamMode::Basic
    } else {
        StreamMode::Headers
    }
}

/// Everything needed to open one stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub url: Url,
    pub mode: StreamMode,
    pub headers: HashMap<String, String>,
    pub with_credentials: bool,
}

impl StreamRequest {
    /// Build the request for the current cursor
    pub fn build(config: &TransportConfig, last_event_id: Option<&str>) -> Result<Self> {
        let mode = select_stream_mode(config);
        let mut url = config.endpoint()?;
        let mut headers = HashMap::new();

        match mode {
            StreamMode::Basic => {
                append_query(&mut url, &config.resume_query(last_event_id));
            }
            StreamMode::Headers => {
                append_query(&mut url, &config.resume_query(None));
                headers.extend(config.headers.clone());
                if let Some(id) = last_event_id {
                    headers.insert("Last-Event-ID".to_string(), id.to_string());
                }
            }
        }

        Ok(Self {
            url,
            mode,
            headers,
            with_credentials: config.with_credentials,
        })
    }
}

/// Opens push streams
#[async_trait]
pub trait StreamSource: Send + Sync + Debug {
    /// Resolve once the server accepted the stream
    async fn open(&self, request: &StreamRequest) -> Result<ByteStream>;
}

/// [`StreamSource`] backed by a streaming reqwest body
#[derive(Debug, Clone)]
pub struct HttpStreamSource {
    client: Client,
    connect_timeout: Duration,
}

impl HttpStreamSource {
    pub fn new(config: &TransportConfig) -> Result<Self> {
        // No total timeout: the body stays open for the connection's lifetime
        let client = Client::builder()
            .connect_timeout(config.request_timeout)
            .cookie_store(config.with_credentials)
            .build()
            .map_err(|e| TransportError::Configuration(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            connect_timeout: config.request_timeout,
        })
    }
}

#[async_trait]
impl StreamSource for HttpStreamSource {
    async fn open(&self, request: &StreamRequest) -> Result<ByteStream> {
        debug!("Opening event stream {} ({:?})", request.url, request.mode);
        let builder = self
            .client
            .get(request.url.clone())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        let response = with_headers(builder, &request.headers)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, self.connect_timeout))?;

        let status = response.status();
        if !status.is_success() {
            let reason = status.canonical_reason().unwrap_or("stream rejected");
            return Err(TransportError::http(status.as_u16(), reason));
        }

        let body = response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|e| TransportError::Closed(e.to_string()))
        });
        Ok(body.boxed())
    }
}
