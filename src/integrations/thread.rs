//! Skeletal Thread `ProtocolAdapter` (spec §9 "Adapter pluralism").
//!
//! Grounded on the teacher's simpler bridges (`esphome.rs`/`tasmota.rs`)
//! rather than `zigbee2mqtt.rs`'s full complexity — a conformant member
//! of the same trait, advertising presence and heartbeating without a
//! vendor integration behind it yet.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::adapter::ProtocolAdapter;
use crate::device::{AdapterStatus, AdapterStatusKind};
use crate::envelope::{Envelope, HelloBody, StatusBody};
use crate::error::HdpError;
use crate::registry::AdapterRegistry;
use crate::topic;
use crate::transport::Transport;

const PROTOCOL: &str = "thread";

pub struct ThreadAdapterConfig {
    pub adapter_id: String,
    pub version: String,
}

impl Default for ThreadAdapterConfig {
    fn default() -> Self {
        Self {
            adapter_id: PROTOCOL.to_string(),
            version: "dev".to_string(),
        }
    }
}

pub struct ThreadAdapter {
    config: ThreadAdapterConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<AdapterRegistry>,
}

impl ThreadAdapter {
    pub fn new(
        config: ThreadAdapterConfig,
        transport: Arc<dyn Transport>,
        registry: Arc<AdapterRegistry>,
    ) -> Self {
        Self {
            config,
            transport,
            registry,
        }
    }

    async fn publish_status(&self, status: AdapterStatusKind, reason: Option<String>) {
        let status_str = match status {
            AdapterStatusKind::Starting => "starting",
            AdapterStatusKind::Online => "online",
            AdapterStatusKind::Offline => "offline",
            AdapterStatusKind::Unknown => "unknown",
        };
        self.registry.record(AdapterStatus {
            adapter_id: self.config.adapter_id.clone(),
            protocol: PROTOCOL.to_string(),
            status,
            reason: reason.clone(),
            version: self.config.version.clone(),
            last_seen: Utc::now(),
            supports_pairing: false,
            pairing_config: None,
        });
        let envelope = Envelope::Status(StatusBody {
            adapter_id: self.config.adapter_id.clone(),
            status: status_str.to_string(),
            version: self.config.version.clone(),
            protocol: Some(PROTOCOL.to_string()),
            reason,
            features: None,
            pairing: None,
        });
        let payload = envelope.encode();
        let topic = topic::adapter_status(&self.config.adapter_id);
        let _ = self.transport.publish_retained(&topic, payload).await;
    }
}

#[async_trait]
impl ProtocolAdapter for ThreadAdapter {
    fn name(&self) -> &str {
        PROTOCOL
    }

    async fn start(self: Arc<Self>, _cancel: CancellationToken) -> Result<(), HdpError> {
        let hello = Envelope::Hello(HelloBody {
            adapter_id: self.config.adapter_id.clone(),
            protocol: PROTOCOL.to_string(),
            version: self.config.version.clone(),
            hdp_version: crate::envelope::SCHEMA_V1.to_string(),
            features: vec!["supports_ack".to_string()],
            pairing: None,
        });
        let _ = self
            .transport
            .publish(&topic::adapter_hello(), hello.encode())
            .await;

        self.publish_status(AdapterStatusKind::Starting, None).await;
        self.publish_status(AdapterStatusKind::Online, None).await;
        info!(adapter_id = %self.config.adapter_id, "thread adapter started (no vendor bridge wired yet)");
        Ok(())
    }

    async fn stop(&self) -> Result<(), HdpError> {
        self.publish_status(AdapterStatusKind::Offline, Some("shutdown".to_string()))
            .await;
        Ok(())
    }

    async fn heartbeat(&self) {
        self.publish_status(AdapterStatusKind::Online, None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    #[tokio::test]
    async fn start_and_stop_publish_status_transitions() {
        let transport = Arc::new(MemoryTransport::new());
        let registry = Arc::new(AdapterRegistry::new());
        let adapter = Arc::new(ThreadAdapter::new(
            ThreadAdapterConfig::default(),
            transport.clone(),
            registry.clone(),
        ));

        adapter.clone().start(CancellationToken::new()).await.unwrap();
        assert!(registry.has_online_protocol(PROTOCOL));

        adapter.stop().await.unwrap();
        let status_topic = topic::adapter_status(&adapter.config.adapter_id);
        let retained = transport.retained(&status_topic).unwrap();
        match Envelope::decode(&retained).unwrap() {
            Envelope::Status(body) => assert_eq!(body.status, "offline"),
            _ => panic!("expected status envelope"),
        }
    }

    #[tokio::test]
    async fn heartbeat_republishes_retained_online_status() {
        let transport = Arc::new(MemoryTransport::new());
        let registry = Arc::new(AdapterRegistry::new());
        let adapter = Arc::new(ThreadAdapter::new(
            ThreadAdapterConfig::default(),
            transport.clone(),
            registry,
        ));
        adapter.clone().start(CancellationToken::new()).await.unwrap();

        adapter.heartbeat().await;

        let status_topic = topic::adapter_status(&adapter.config.adapter_id);
        let publishes = transport
            .log()
            .into_iter()
            .filter(|(t, _, _)| t == &status_topic)
            .count();
        assert_eq!(publishes, 3); // starting, online (start), online (heartbeat)
    }
}
