//! Transport probe
//!
//! Connects a priority manager using `config/transport.yaml` (or
//! `TRANSPORT_CONFIG_PATH`) and logs every lifecycle event, switch and
//! message until Ctrl+C.

use anyhow::Result;
use realtime_client::bin_common::{
    init_tracing, load_config_from_env, load_priority_config, BinaryRunner, ConfigType, RunConfig,
    ShutdownManager,
};
use realtime_client::realtime::{handler, EventName, EventPayload, PriorityManager, Transport};
use std::time::Duration;
use tracing::{info, warn};

struct TransportProbe {
    config: RunConfig,
    manager: PriorityManager,
    shutdown: ShutdownManager,
}

impl TransportProbe {
    fn subscribe(&self) {
        let names = [
            EventName::Open,
            EventName::Close,
            EventName::Error,
            EventName::Message,
            EventName::Reconnecting,
            EventName::Reconnected,
            EventName::Latency,
            EventName::TransportSwitch,
        ];
        for name in names {
            // Handlers stay registered for the manager's lifetime
            let _ = self.manager.on(
                name,
                handler(|event| match &event.payload {
                    EventPayload::Message(message) => info!(
                        "[{}] {} {}",
                        event.transport.map(|t| t.as_str()).unwrap_or("-"),
                        message.kind.as_deref().unwrap_or("message"),
                        message.data.as_ref().map(|d| d.to_string()).unwrap_or_default()
                    ),
                    EventPayload::Error(error) => warn!("[{}] {}", event.name, error),
                    EventPayload::TransportSwitch { from, to, reason, .. } => {
                        info!("Switch {:?} -> {} ({})", from, to, reason)
                    }
                    payload => info!("[{}] {:?}", event.name, payload),
                }),
            );
        }
    }
}

impl BinaryRunner for TransportProbe {
    async fn run(&mut self) -> Result<()> {
        self.subscribe();
        self.manager.connect()?;

        let interval = Duration::from_secs(self.config.status_interval_secs);
        while self.shutdown.is_running() {
            self.shutdown.interruptible_sleep(interval).await;
            let state = self.manager.priority_state();
            info!(
                "Status: {:?} via {:?} (failures: {}, latency: {:?}ms)",
                state.connection.status,
                state.active_transport,
                state.failure_count,
                state.connection.average_latency
            );
        }

        self.manager.destroy();
        Ok(())
    }

    fn config(&self) -> &RunConfig {
        &self.config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let path = load_config_from_env(ConfigType::Transport);
    info!("Loading transport config from {}", path.display());
    let config = load_priority_config(&path)?;

    let shutdown = ShutdownManager::new();
    shutdown.spawn_signal_handler();

    let mut probe = TransportProbe {
        config: RunConfig::new("transport_probe"),
        manager: PriorityManager::new(config),
        shutdown,
    };
    probe.execute().await
}
