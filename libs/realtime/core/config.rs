use crate::traits::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for one adapter instance
///
/// Built once and never mutated afterwards; orchestrators derive a copy per
/// adapter with [`TransportConfig::with_url`]. Durations are expressed in
/// milliseconds when (de)serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Endpoint (ws:// or wss:// for sockets, http(s):// otherwise)
    pub url: String,

    /// Auth token sent as the `token` query parameter
    pub token: Option<String>,

    #[serde(with = "millis")]
    pub initial_reconnect_delay: Duration,

    #[serde(with = "millis")]
    pub max_reconnect_delay: Duration,

    /// Fraction of the base delay added as random jitter
    pub jitter_factor: f64,

    /// None = unlimited
    pub max_reconnect_attempts: Option<u32>,

    /// Zero disables the heartbeat
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,

    #[serde(with = "millis")]
    pub heartbeat_timeout: Duration,

    pub latency_sampling: bool,

    #[serde(with = "millis")]
    pub latency_sampling_interval: Duration,

    /// Key of the resumption cursor in `cursor_store`
    pub cursor_key: String,

    #[serde(skip, default = "default_cursor_store")]
    pub cursor_store: Arc<dyn CursorStore>,

    /// Extra request headers (push-stream and HTTP requests)
    pub headers: HashMap<String, String>,

    /// Keep and send cookies on HTTP requests
    pub with_credentials: bool,

    /// Per-request deadline (polling and auxiliary requests)
    #[serde(with = "millis")]
    pub request_timeout: Duration,

    /// Delay between polls
    #[serde(with = "millis")]
    pub polling_interval: Duration,
}

fn default_cursor_store() -> Arc<dyn CursorStore> {
    MemoryCursorStore::new()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: None,
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            jitter_factor: 0.3,
            max_reconnect_attempts: Some(10),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            latency_sampling: false,
            latency_sampling_interval: Duration::from_secs(60),
            cursor_key: "lastEventId".to_string(),
            cursor_store: default_cursor_store(),
            headers: HashMap::new(),
            with_credentials: false,
            request_timeout: Duration::from_secs(10),
            polling_interval: Duration::from_secs(1),
        }
    }
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Copy of this config pointing at another endpoint
    ///
    /// The cursor store is shared with the original.
    pub fn with_url(&self, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..self.clone()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_cursor_store(mut self, store: Arc<dyn CursorStore>) -> Self {
        self.cursor_store = store;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_reconnect(
        mut self,
        initial_delay: Duration,
        max_delay: Duration,
        max_attempts: Option<u32>,
    ) -> Self {
        self.initial_reconnect_delay = initial_delay;
        self.max_reconnect_delay = max_delay;
        self.max_reconnect_attempts = max_attempts;
        self
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_latency_sampling(mut self, interval: Duration) -> Self {
        self.latency_sampling = true;
        self.latency_sampling_interval = interval;
        self
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Backoff policy described by this config
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            self.initial_reconnect_delay,
            self.max_reconnect_delay,
            self.max_reconnect_attempts,
        )
        .with_jitter(self.jitter_factor)
    }

    /// Check if a heartbeat is configured
    pub fn has_heartbeat(&self) -> bool {
        !self.heartbeat_interval.is_zero()
    }

    /// Query parameters identifying the client and its resume point
    pub(crate) fn resume_query(&self, last_event_id: Option<&str>) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::with_capacity(2);
        if let Some(token) = &self.token {
            pairs.push(("token", token.clone()));
        }
        if let Some(id) = last_event_id {
            pairs.push(("lastEventId", id.to_string()));
        }
        pairs
    }

    /// Parse and validate the endpoint
    pub fn endpoint(&self) -> Result<reqwest::Url> {
        reqwest::Url::parse(&self.url)
            .map_err(|e| TransportError::Configuration(format!("invalid url '{}': {}", self.url, e)))
    }
}

/// Join `path` onto the endpoint (`http://h/events` + `send` = `http://h/events/send`)
pub(crate) fn join_path(base: &reqwest::Url, path: &str) -> reqwest::Url {
    let mut url = base.clone();
    let joined = format!("{}/{}", base.path().trim_end_matches('/'), path);
    url.set_path(&joined);
    url
}

/// Append query parameters, leaving the url untouched when there are none
pub(crate) fn append_query(url: &mut reqwest::Url, pairs: &[(&str, String)]) {
    if pairs.is_empty() {
        return;
    }
    let mut query = url.query_pairs_mut();
    for (name, value) in pairs {
        query.append_pair(name, value);
    }
}

/// Serde helpers for durations stored as milliseconds
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
