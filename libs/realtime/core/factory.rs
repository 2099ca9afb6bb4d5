use crate::core::config::TransportConfig;
use crate::core::http::{HttpExchange, ReqwestExchange};
use crate::core::polling::PollingTransport;
use crate::core::socket::{SocketConnector, SocketTransport, TungsteniteConnector};
use crate::core::stream::{HttpStreamSource, PushStreamTransport, StreamSource};
use crate::traits::*;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::debug;

/// Builds a fresh adapter for every connect, switch or fallback
pub trait TransportFactory: Send + Sync + Debug {
    fn create(&self, kind: TransportKind, config: TransportConfig) -> Result<Arc<dyn Transport>>;
}

/// Default factory producing the built-in adapters
///
/// Network seams left unset are created from each adapter's config.
#[derive(Debug, Clone, Default)]
pub struct AdapterFactory {
    socket: Option<Arc<dyn SocketConnector>>,
    stream: Option<Arc<dyn StreamSource>>,
    http: Option<Arc<dyn HttpExchange>>,
}

impl AdapterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_socket_connector(mut self, connector: Arc<dyn SocketConnector>) -> Self {
        self.socket = Some(connector);
        self
    }

    pub fn with_stream_source(mut self, source: Arc<dyn StreamSource>) -> Self {
        self.stream = Some(source);
        self
    }

    pub fn with_http(mut self, http: Arc<dyn HttpExchange>) -> Self {
        self.http = Some(http);
        self
    }

    fn http_for(&self, config: &TransportConfig) -> Result<Arc<dyn HttpExchange>> {
        match &self.http {
            Some(http) => Ok(Arc::clone(http)),
            None => Ok(Arc::new(ReqwestExchange::new(config)?)),
        }
    }
}

impl TransportFactory for AdapterFactory {
    fn create(&self, kind: TransportKind, config: TransportConfig) -> Result<Arc<dyn Transport>> {
        config.endpoint()?;
        debug!("Creating {} adapter for {}", kind, config.url);

        let transport: Arc<dyn Transport> = match kind {
            TransportKind::WebSocket => {
                let connector: Arc<dyn SocketConnector> = match &self.socket {
                    Some(connector) => Arc::clone(connector),
                    None => Arc::new(TungsteniteConnector),
                };
                Arc::new(SocketTransport::with_connector(config, connector))
            }
            TransportKind::PushStream => {
                let source: Arc<dyn StreamSource> = match &self.stream {
                    Some(source) => Arc::clone(source),
                    None => Arc::new(HttpStreamSource::new(&config)?),
                };
                let http = self.http_for(&config)?;
                Arc::new(PushStreamTransport::with_parts(config, source, http))
            }
            TransportKind::Polling => {
                let http = self.http_for(&config)?;
                Arc::new(PollingTransport::with_exchange(config, http))
            }
        };
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creates_requested_kind() {
        let factory = AdapterFactory::new();
        for kind in TransportKind::PRIORITY {
            let url = match kind {
                TransportKind::WebSocket => "ws://localhost:8080/live",
                _ => "http://localhost:8080/events",
            };
            let transport = factory.create(kind, TransportConfig::new(url)).unwrap();
            assert_eq!(transport.kind(), kind);
            assert_eq!(transport.state().status, ConnectionStatus::Disconnected);
        }
    }

    #[test]
    fn test_invalid_url_fails_creation() {
        let factory = AdapterFactory::new();
        let result = factory.create(TransportKind::Polling, TransportConfig::new(""));
        assert!(matches!(result, Err(TransportError::Configuration(_))));
    }
}
