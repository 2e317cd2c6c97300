//! Hub-side Adapter Registry (spec §4.11/§6 "Adapter registry
//! snapshot"): tracks known adapters per protocol from hello/status
//! frames, answers liveness and pairing-support queries.
//!
//! Grounded on the teacher's `services.rs::ServiceRegistry` — a
//! `DashMap`-keyed registry read for consistent snapshots without
//! calling out while holding a lock (spec §5).

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;

use crate::device::{AdapterStatus, AdapterStatusKind};

#[derive(Default)]
pub struct AdapterRegistry {
    by_id: DashMap<String, AdapterStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrationSummary {
    pub protocol: String,
    pub label: String,
    pub status: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PairingConfigSummary {
    pub protocol: String,
    pub label: String,
    pub supported: bool,
    pub supports_interview: bool,
    pub default_timeout_sec: i64,
    pub instructions: Option<String>,
    pub cta_label: Option<String>,
    pub notes: Option<String>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records/refreshes an adapter's status (from `hello` or `status`
    /// envelopes).
    pub fn record(&self, status: AdapterStatus) {
        self.by_id.insert(status.adapter_id.clone(), status);
    }

    /// `hasOnlineProtocol` (testable property 9): true iff at least one
    /// adapter with `protocol` is online within the TTL.
    pub fn has_online_protocol(&self, protocol: &str) -> bool {
        let now = Utc::now();
        self.by_id
            .iter()
            .any(|entry| entry.protocol == protocol && entry.is_online_at(now))
    }

    pub fn is_pairing_supported(&self, protocol: &str) -> bool {
        let now = Utc::now();
        self.by_id
            .iter()
            .any(|e| e.protocol == protocol && e.supports_pairing && e.is_online_at(now))
    }

    pub fn supports_interview(&self, protocol: &str) -> bool {
        self.by_id.iter().any(|e| {
            e.protocol == protocol
                && e.pairing_config
                    .as_ref()
                    .and_then(|c| c.get("supports_interview"))
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false)
        })
    }

    /// Consistent read of the live set without calling out while
    /// holding the `DashMap`'s internal shard locks (spec §5) — we
    /// collect into an owned `Vec` first, then map.
    pub fn integrations_snapshot(&self) -> Vec<IntegrationSummary> {
        let now = Utc::now();
        let statuses: Vec<AdapterStatus> = self.by_id.iter().map(|e| e.value().clone()).collect();
        statuses
            .into_iter()
            .map(|s| IntegrationSummary {
                protocol: s.protocol.clone(),
                label: s.adapter_id.clone(),
                status: if s.is_online_at(now) {
                    "active".to_string()
                } else {
                    "offline".to_string()
                },
                notes: s.reason.clone(),
            })
            .collect()
    }

    /// Implements the "only pair" heuristic from the open design
    /// question: prefer any online config that supports pairing;
    /// otherwise fall back to any online config carrying a non-default
    /// label. Best-effort, not canonical (DESIGN.md).
    pub fn pairing_configs_snapshot(&self) -> Vec<PairingConfigSummary> {
        let now = Utc::now();
        let statuses: Vec<AdapterStatus> = self.by_id.iter().map(|e| e.value().clone()).collect();

        let mut configs: Vec<PairingConfigSummary> = statuses
            .into_iter()
            .filter(|s| s.is_online_at(now))
            .map(|s| {
                let supports_interview = s
                    .pairing_config
                    .as_ref()
                    .and_then(|c| c.get("supports_interview"))
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let default_timeout_sec = s
                    .pairing_config
                    .as_ref()
                    .and_then(|c| c.get("default_timeout_sec"))
                    .and_then(|v| v.as_i64())
                    .unwrap_or(crate::pairing::DEFAULT_TIMEOUT_SECS as i64);
                PairingConfigSummary {
                    protocol: s.protocol.clone(),
                    label: s.adapter_id.clone(),
                    supported: s.supports_pairing,
                    supports_interview,
                    default_timeout_sec,
                    instructions: s
                        .pairing_config
                        .as_ref()
                        .and_then(|c| c.get("instructions"))
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                    cta_label: s
                        .pairing_config
                        .as_ref()
                        .and_then(|c| c.get("cta_label"))
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                    notes: s.reason.clone(),
                }
            })
            .collect();

        configs.sort_by(|a, b| {
            b.supported
                .cmp(&a.supported)
                .then(a.label.cmp(&b.label))
        });
        configs
    }

    pub fn status_for(&self, adapter_id: &str) -> Option<AdapterStatus> {
        self.by_id.get(adapter_id).map(|s| s.clone())
    }

    pub fn all_online(&self) -> Vec<AdapterStatus> {
        let now = Utc::now();
        self.by_id
            .iter()
            .filter(|e| e.is_online_at(now))
            .map(|e| e.value().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn status(protocol: &str, kind: AdapterStatusKind, age_secs: i64) -> AdapterStatus {
        AdapterStatus {
            adapter_id: protocol.to_string(),
            protocol: protocol.to_string(),
            status: kind,
            reason: None,
            version: "dev".to_string(),
            last_seen: Utc::now() - ChronoDuration::seconds(age_secs),
            supports_pairing: true,
            pairing_config: None,
        }
    }

    #[test]
    fn has_online_protocol_respects_ttl() {
        let registry = AdapterRegistry::new();
        registry.record(status("zigbee", AdapterStatusKind::Online, 10));
        assert!(registry.has_online_protocol("zigbee"));

        registry.record(status("thread", AdapterStatusKind::Online, 100));
        assert!(!registry.has_online_protocol("thread"));
    }

    #[test]
    fn offline_status_is_never_online_regardless_of_age() {
        let registry = AdapterRegistry::new();
        registry.record(status("zigbee", AdapterStatusKind::Offline, 0));
        assert!(!registry.has_online_protocol("zigbee"));
    }

    #[test]
    fn integrations_snapshot_reflects_liveness() {
        let registry = AdapterRegistry::new();
        registry.record(status("zigbee", AdapterStatusKind::Online, 5));
        registry.record(status("thread", AdapterStatusKind::Online, 999));
        let snapshot = registry.integrations_snapshot();
        let zigbee = snapshot.iter().find(|s| s.protocol == "zigbee").unwrap();
        let thread = snapshot.iter().find(|s| s.protocol == "thread").unwrap();
        assert_eq!(zigbee.status, "active");
        assert_eq!(thread.status, "offline");
    }
}
