//! Lifecycle Supervisor (spec §4.11): starts/stops adapters, publishes
//! periodic heartbeats, and performs graceful shutdown in reverse
//! start order.
//!
//! Grounded on the teacher's `main.rs` orchestration sequence and its
//! `shutdown_signal()` (ctrl_c raced against SIGTERM), generalized from
//! "one big `main` wiring everything" into an owned supervisor object
//! the new `main.rs` only has to construct and run.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::adapter::ProtocolAdapter;
use crate::error::HdpError;
use crate::transport::Transport;

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub protocol: String,
    pub adapter_id: String,
    pub version: String,
    pub refresh_states_on_start: bool,
}

impl AdapterConfig {
    /// Reads `<PROTOCOL>_ADAPTER_ID`, `<PROTOCOL>_ADAPTER_VERSION`,
    /// `<PROTOCOL>_ADAPTER_REFRESH_STATES` (spec §6 "Configuration").
    pub fn from_env(protocol: &str) -> Self {
        let prefix = protocol.to_uppercase();
        let adapter_id = env::var(format!("{prefix}_ADAPTER_ID")).unwrap_or_else(|_| protocol.to_string());
        let version = env::var(format!("{prefix}_ADAPTER_VERSION")).unwrap_or_else(|_| "dev".to_string());
        let refresh_states_on_start = env::var(format!("{prefix}_ADAPTER_REFRESH_STATES"))
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        Self {
            protocol: protocol.to_string(),
            adapter_id,
            version,
            refresh_states_on_start,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub mqtt_broker_url: String,
    pub heartbeat_interval: Duration,
}

impl SupervisorConfig {
    pub fn from_env() -> Self {
        Self {
            mqtt_broker_url: env::var("MQTT_BROKER_URL")
                .unwrap_or_else(|_| "localhost:1883".to_string()),
            heartbeat_interval: Duration::from_secs(20),
        }
    }
}

struct RunningAdapter {
    adapter: Arc<dyn ProtocolAdapter>,
    adapter_id: String,
}

/// Owns the set of configured adapters and the shutdown coordinator
/// (spec §4.11, §5 "Cancellation & timeouts").
pub struct LifecycleSupervisor {
    config: SupervisorConfig,
    transport: Arc<dyn Transport>,
    running: Vec<RunningAdapter>,
    cancel: CancellationToken,
}

impl LifecycleSupervisor {
    pub fn new(config: SupervisorConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            running: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Starts each adapter in order; aborts the whole startup if any
    /// `start` returns an error (spec §4.11).
    pub async fn start_all(
        &mut self,
        adapters: Vec<(String, Arc<dyn ProtocolAdapter>)>,
    ) -> Result<(), HdpError> {
        for (adapter_id, adapter) in adapters {
            info!(%adapter_id, "starting adapter");
            adapter.clone().start(self.cancel.child_token()).await?;
            self.running.push(RunningAdapter { adapter, adapter_id });
        }
        Ok(())
    }

    /// Periodic `status="online"` heartbeat per adapter (default every
    /// 20s), run until `shutdown` is requested. Each adapter re-publishes
    /// its own retained status envelope (spec §4.11) rather than having
    /// the supervisor reconstruct one on its behalf.
    pub async fn heartbeat_loop(&self) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        interval.tick().await; // skip the immediate first tick
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for running in &self.running {
                        running.adapter.heartbeat().await;
                    }
                }
                _ = self.cancel.cancelled() => break,
            }
        }
    }

    /// Stops each adapter in reverse start order, then closes the
    /// transport last (spec §4.11, §5 "Retained-topic hygiene").
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        for running in self.running.iter().rev() {
            if let Err(e) = running.adapter.stop().await {
                error!(adapter_id = %running.adapter_id, error = %e, "adapter stop failed");
            }
        }
        if let Err(e) = self.transport.disconnect().await {
            warn!(error = %e, "transport disconnect failed");
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Races `ctrl_c()` against SIGTERM, matching the teacher's
/// `main.rs::shutdown_signal()`.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_config_defaults_when_env_unset() {
        // Use a protocol prefix unlikely to collide with anything real.
        let config = AdapterConfig::from_env("zzznotset");
        assert_eq!(config.adapter_id, "zzznotset");
        assert_eq!(config.version, "dev");
        assert!(!config.refresh_states_on_start);
    }

    #[test]
    fn adapter_config_reads_env_overrides() {
        std::env::set_var("ZZZOVERRIDE_ADAPTER_ID", "custom-id");
        std::env::set_var("ZZZOVERRIDE_ADAPTER_VERSION", "1.2.3");
        std::env::set_var("ZZZOVERRIDE_ADAPTER_REFRESH_STATES", "true");

        let config = AdapterConfig::from_env("zzzoverride");
        assert_eq!(config.adapter_id, "custom-id");
        assert_eq!(config.version, "1.2.3");
        assert!(config.refresh_states_on_start);

        std::env::remove_var("ZZZOVERRIDE_ADAPTER_ID");
        std::env::remove_var("ZZZOVERRIDE_ADAPTER_VERSION");
        std::env::remove_var("ZZZOVERRIDE_ADAPTER_REFRESH_STATES");
    }

    struct CountingAdapter {
        beats: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ProtocolAdapter for CountingAdapter {
        fn name(&self) -> &str {
            "counting"
        }

        async fn start(self: Arc<Self>, _cancel: CancellationToken) -> Result<(), HdpError> {
            Ok(())
        }

        async fn stop(&self) -> Result<(), HdpError> {
            Ok(())
        }

        async fn heartbeat(&self) {
            self.beats.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn heartbeat_loop_calls_adapter_heartbeat_on_every_tick() {
        let transport = Arc::new(crate::transport::MemoryTransport::new());
        let mut supervisor = LifecycleSupervisor::new(
            SupervisorConfig {
                mqtt_broker_url: "localhost:1883".to_string(),
                heartbeat_interval: Duration::from_millis(10),
            },
            transport,
        );

        let adapter = Arc::new(CountingAdapter {
            beats: std::sync::atomic::AtomicUsize::new(0),
        });
        supervisor
            .start_all(vec![("counting".to_string(), adapter.clone())])
            .await
            .unwrap();

        let cancel = supervisor.cancellation_token();
        let loop_handle = tokio::spawn(async move { supervisor.heartbeat_loop().await });
        tokio::time::sleep(Duration::from_millis(45)).await;
        cancel.cancel();
        loop_handle.await.unwrap();

        assert!(adapter.beats.load(std::sync::atomic::Ordering::SeqCst) >= 2);
    }
}
