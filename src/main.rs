use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use homenavi::adapter::ProtocolAdapter;
use homenavi::integrations::thread::{ThreadAdapter, ThreadAdapterConfig};
use homenavi::integrations::zigbee::{ZigbeeAdapter, ZigbeeAdapterConfig};
use homenavi::registry::AdapterRegistry;
use homenavi::store::{InMemoryCache, InMemoryRepository};
use homenavi::supervisor::{shutdown_signal, AdapterConfig, LifecycleSupervisor, SupervisorConfig};
use homenavi::transport::RumqttcTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,homenavi=debug")),
        )
        .init();

    tracing::info!("Starting homenavi v{}", env!("CARGO_PKG_VERSION"));

    let supervisor_config = SupervisorConfig::from_env();
    let transport: Arc<dyn homenavi::transport::Transport> = Arc::new(RumqttcTransport::connect(
        &supervisor_config.mqtt_broker_url,
        "homenavi-hub",
    )?);

    // Durable repository/cache drivers are external collaborators; the
    // in-memory reference implementations stand in for them here.
    let repo = Arc::new(InMemoryRepository::new());
    let cache = Arc::new(InMemoryCache::new());
    let registry = Arc::new(AdapterRegistry::new());

    let zigbee_config = AdapterConfig::from_env("zigbee");
    let zigbee_adapter: Arc<dyn ProtocolAdapter> = Arc::new(ZigbeeAdapter::new(
        ZigbeeAdapterConfig {
            adapter_id: zigbee_config.adapter_id.clone(),
            version: zigbee_config.version.clone(),
            refresh_states_on_start: zigbee_config.refresh_states_on_start,
        },
        transport.clone(),
        repo.clone(),
        cache.clone(),
        registry.clone(),
    ));

    let thread_config = AdapterConfig::from_env("thread");
    let thread_adapter: Arc<dyn ProtocolAdapter> = Arc::new(ThreadAdapter::new(
        ThreadAdapterConfig {
            adapter_id: thread_config.adapter_id.clone(),
            version: thread_config.version.clone(),
        },
        transport.clone(),
        registry.clone(),
    ));

    let mut supervisor = LifecycleSupervisor::new(supervisor_config, transport.clone());
    supervisor
        .start_all(vec![
            (zigbee_config.adapter_id.clone(), zigbee_adapter),
            (thread_config.adapter_id.clone(), thread_adapter),
        ])
        .await?;

    let cancel = supervisor.cancellation_token();
    tokio::select! {
        _ = supervisor.heartbeat_loop() => {}
        _ = shutdown_signal() => {
            cancel.cancel();
        }
    }

    supervisor.shutdown().await;
    tracing::info!("homenavi shutdown complete");
    Ok(())
}
