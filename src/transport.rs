//! Transport Client (spec §4.2): a typed pub/sub wrapper adapters
//! program against instead of talking to `rumqttc` directly.
//!
//! Grounded on the teacher's `mqtt.rs`, which wraps a broker link
//! behind small async functions; here the wrapping goes one step
//! further into a trait so adapters can be driven against an
//! in-process double in tests, the same way the rest of the crate
//! keeps vendor I/O behind a seam.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tracing::error;

use crate::error::HdpError;

pub type Handler = Arc<dyn Fn(String, Vec<u8>) + Send + Sync>;

/// Subscribe with a handler, publish (retained or transient), unsubscribe,
/// disconnect (spec §4.2).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn subscribe(&self, topic_filter: &str, handler: Handler) -> Result<(), HdpError>;
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), HdpError>;
    async fn publish_retained(&self, topic: &str, payload: Vec<u8>) -> Result<(), HdpError>;
    async fn unsubscribe(&self, topic_filter: &str) -> Result<(), HdpError>;
    async fn disconnect(&self) -> Result<(), HdpError>;
}

/// Real transport backed by an external MQTT broker via `rumqttc`.
///
/// The broker itself (and the client connection to it) is an external
/// collaborator this crate doesn't own — only the subscribe/publish
/// surface above is, matching the "MQTT client assumed" framing in
/// spec §1.
pub struct RumqttcTransport {
    client: AsyncClient,
    handlers: Arc<DashMap<String, Handler>>,
}

impl RumqttcTransport {
    /// Connects to `broker_url` (`host:port`) as `client_id` and spawns
    /// the background event-loop task that dispatches inbound publishes
    /// to registered handlers by topic-filter prefix match.
    pub fn connect(broker_url: &str, client_id: &str) -> Result<Self, HdpError> {
        let (host, port) = broker_url
            .rsplit_once(':')
            .ok_or_else(|| HdpError::Transport(format!("invalid broker url: {broker_url}")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| HdpError::Transport(format!("invalid broker port: {port}")))?;

        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        let handlers: Arc<DashMap<String, Handler>> = Arc::new(DashMap::new());
        let dispatch_handlers = handlers.clone();

        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let topic = publish.topic.clone();
                        let payload = publish.payload.to_vec();
                        for entry in dispatch_handlers.iter() {
                            if topic_matches(entry.key(), &topic) {
                                (entry.value())(topic.clone(), payload.clone());
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "mqtt event loop error, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(Self { client, handlers })
    }
}

fn topic_matches(filter: &str, topic: &str) -> bool {
    if let Some(prefix) = filter.strip_suffix("/#") {
        return topic == prefix || topic.starts_with(&format!("{prefix}/"));
    }
    filter == topic
}

#[async_trait]
impl Transport for RumqttcTransport {
    async fn subscribe(&self, topic_filter: &str, handler: Handler) -> Result<(), HdpError> {
        self.handlers.insert(topic_filter.to_string(), handler);
        self.client
            .subscribe(topic_filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| HdpError::Transport(format!("subscribe {topic_filter}: {e}")))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), HdpError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| HdpError::Transport(format!("publish {topic}: {e}")))
    }

    async fn publish_retained(&self, topic: &str, payload: Vec<u8>) -> Result<(), HdpError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, true, payload)
            .await
            .map_err(|e| HdpError::Transport(format!("publish retained {topic}: {e}")))
    }

    async fn unsubscribe(&self, topic_filter: &str) -> Result<(), HdpError> {
        self.handlers.remove(topic_filter);
        self.client
            .unsubscribe(topic_filter)
            .await
            .map_err(|e| HdpError::Transport(format!("unsubscribe {topic_filter}: {e}")))
    }

    async fn disconnect(&self) -> Result<(), HdpError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| HdpError::Transport(format!("disconnect: {e}")))
    }
}

/// Retained entry kept by [`MemoryTransport`] so late subscribers (and
/// assertions in tests) can see the latest value per topic, mirroring
/// what a real broker's retained-message store does.
#[derive(Clone)]
struct Retained {
    payload: Vec<u8>,
}

/// In-process transport double. No network, no background task: every
/// publish is dispatched synchronously to matching handlers, and
/// retained publishes are remembered so `published_retained()` can be
/// asserted on directly in adapter tests.
#[derive(Default)]
pub struct MemoryTransport {
    handlers: DashMap<String, Handler>,
    retained: DashMap<String, Retained>,
    log: DashMap<u64, (String, Vec<u8>, bool)>,
    seq: std::sync::atomic::AtomicU64,
    disconnected: std::sync::atomic::AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current retained payload for `topic`, if any (`None` after a
    /// tombstone publish with an empty payload — matches the removal
    /// semantics in spec §4.3).
    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.retained.get(topic).and_then(|r| {
            if r.payload.is_empty() {
                None
            } else {
                Some(r.payload.clone())
            }
        })
    }

    /// All publishes observed so far, in publish order, as
    /// `(topic, payload, retained)`.
    pub fn log(&self) -> Vec<(String, Vec<u8>, bool)> {
        let mut entries: Vec<_> = self.log.iter().map(|e| (*e.key(), e.value().clone())).collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, v)| v).collect()
    }

    fn dispatch(&self, topic: &str, payload: &[u8], retained: bool) {
        let seq = self
            .seq
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.log
            .insert(seq, (topic.to_string(), payload.to_vec(), retained));
        if retained {
            self.retained.insert(
                topic.to_string(),
                Retained {
                    payload: payload.to_vec(),
                },
            );
        }
        for entry in self.handlers.iter() {
            if topic_matches(entry.key(), topic) {
                (entry.value())(topic.to_string(), payload.to_vec());
            }
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn subscribe(&self, topic_filter: &str, handler: Handler) -> Result<(), HdpError> {
        self.handlers.insert(topic_filter.to_string(), handler);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), HdpError> {
        self.dispatch(topic, &payload, false);
        Ok(())
    }

    async fn publish_retained(&self, topic: &str, payload: Vec<u8>) -> Result<(), HdpError> {
        self.dispatch(topic, &payload, true);
        Ok(())
    }

    async fn unsubscribe(&self, topic_filter: &str) -> Result<(), HdpError> {
        self.handlers.remove(topic_filter);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), HdpError> {
        self.disconnected
            .store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn memory_transport_dispatches_to_matching_subscribers() {
        let transport = MemoryTransport::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();

        transport
            .subscribe(
                "homenavi/hdp/device/command/zigbee/#",
                Arc::new(move |_topic, _payload| {
                    count2.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        transport
            .publish(
                "homenavi/hdp/device/command/zigbee/zigbee/0xabc",
                b"{}".to_vec(),
            )
            .await
            .unwrap();
        transport
            .publish("homenavi/hdp/device/command/thread/thread/0xabc", b"{}".to_vec())
            .await
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retained_publish_is_visible_and_tombstoned_by_empty_payload() {
        let transport = MemoryTransport::new();
        transport
            .publish_retained("homenavi/hdp/device/state/zigbee/zigbee/0xabc", b"{\"state\":\"ON\"}".to_vec())
            .await
            .unwrap();
        assert!(transport
            .retained("homenavi/hdp/device/state/zigbee/zigbee/0xabc")
            .is_some());

        transport
            .publish_retained("homenavi/hdp/device/state/zigbee/zigbee/0xabc", Vec::new())
            .await
            .unwrap();
        assert!(transport
            .retained("homenavi/hdp/device/state/zigbee/zigbee/0xabc")
            .is_none());
    }
}
