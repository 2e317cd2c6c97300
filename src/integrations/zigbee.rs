//! Reference Zigbee `ProtocolAdapter` (spec §4.10), talking to a
//! zigbee2mqtt vendor bridge.
//!
//! Grounded almost directly on the teacher's
//! `integrations/zigbee2mqtt.rs::Zigbee2MqttBridge` — same topic
//! dispatch shape, same "decode failures are logged and dropped"
//! posture — generalized from a passive metadata tracker into the full
//! adapter the spec describes (identity resolution, capability
//! extraction, correlation, pairing, removal).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::ProtocolAdapter;
use crate::capability::{self, ExtractionResult};
use crate::correlation::CorrelationTable;
use crate::device::{AdapterStatus, AdapterStatusKind, Device, StateBlob};
use crate::envelope::{
    CommandBody, Envelope, EventBody, HelloBody, MetadataBody, PairingProgressBody, StateBody,
    StatusBody,
};
use crate::error::HdpError;
use crate::identity::{self, IdentityIndex};
use crate::pairing::{self, PairingStage, PairingStateMachine};
use crate::registry::AdapterRegistry;
use crate::store::{DeviceRepository, StateCache};
use crate::topic;
use crate::transport::Transport;

const VENDOR_PREFIX: &str = "zigbee2mqtt";
const PROTOCOL: &str = "zigbee";

pub struct ZigbeeAdapterConfig {
    pub adapter_id: String,
    pub version: String,
    pub refresh_states_on_start: bool,
}

impl Default for ZigbeeAdapterConfig {
    fn default() -> Self {
        Self {
            adapter_id: PROTOCOL.to_string(),
            version: "dev".to_string(),
            refresh_states_on_start: false,
        }
    }
}

/// Per-device capability index, keyed by canonical external id, so
/// inbound vendor frames can be normalized without re-running the
/// extractor on every message.
struct DeviceIndexEntry {
    capabilities: Vec<crate::device::Capability>,
    refresh_properties: Vec<String>,
}

pub struct ZigbeeAdapter {
    config: ZigbeeAdapterConfig,
    transport: Arc<dyn Transport>,
    repo: Arc<dyn DeviceRepository>,
    cache: Arc<dyn StateCache>,
    registry: Arc<AdapterRegistry>,
    identity: IdentityIndex,
    correlation: CorrelationTable,
    pairing: PairingStateMachine,
    capability_index: DashMap<String, DeviceIndexEntry>,
    last_state: DashMap<String, StateBlob>,
    permit_join: AtomicBool,
}

impl ZigbeeAdapter {
    pub fn new(
        config: ZigbeeAdapterConfig,
        transport: Arc<dyn Transport>,
        repo: Arc<dyn DeviceRepository>,
        cache: Arc<dyn StateCache>,
        registry: Arc<AdapterRegistry>,
    ) -> Self {
        Self {
            config,
            transport,
            repo,
            cache,
            registry,
            identity: IdentityIndex::new(),
            correlation: CorrelationTable::new(),
            pairing: PairingStateMachine::new(),
            capability_index: DashMap::new(),
            last_state: DashMap::new(),
            permit_join: AtomicBool::new(false),
        }
    }

    fn device_id(&self, external_id: &str) -> String {
        format!("{PROTOCOL}/{}/{external_id}", self.config.adapter_id)
    }

    async fn publish_envelope(&self, topic: String, envelope: Envelope, retained: bool) {
        let payload = envelope.encode();
        let result = if retained {
            self.transport.publish_retained(&topic, payload).await
        } else {
            self.transport.publish(&topic, payload).await
        };
        if let Err(e) = result {
            warn!(%topic, error = %e, "publish failed");
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
            supports_pairing: true,
            pairing_config: Some(serde_json::json!({
                "supports_interview": true,
                "default_timeout_sec": pairing::DEFAULT_TIMEOUT_SECS,
            })),
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
        self.publish_envelope(
            topic::adapter_status(&self.config.adapter_id),
            envelope,
            true,
        )
        .await;
    }

    async fn publish_vendor(&self, suffix: &str, payload: Value) {
        let topic = format!("{VENDOR_PREFIX}/{suffix}");
        if let Err(e) = self
            .transport
            .publish(&topic, serde_json::to_vec(&payload).unwrap_or_default())
            .await
        {
            warn!(%topic, error = %e, "vendor publish failed");
        }
    }

    fn vendor_target(&self, external_id: &str) -> String {
        self.identity
            .friendly_for_external(external_id)
            .unwrap_or_else(|| external_id.to_string())
    }

    // ── Startup sequence (spec §4.10 "On Start()") ──────────────────

    async fn prime_indexes(&self) {
        let devices = match self.repo.list().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!(error = %e, "failed to list devices while priming indexes");
                return;
            }
        };
        for device in devices.into_iter().filter(|d| d.protocol == PROTOCOL) {
            self.identity.link(&device.friendly_name, &device.external_id);
            if !device.capabilities.is_empty() {
                let refresh_properties = device
                    .capabilities
                    .iter()
                    .filter(|c| c.can_read())
                    .filter_map(|c| c.property.clone())
                    .collect();
                self.capability_index.insert(
                    device.external_id.clone(),
                    DeviceIndexEntry {
                        capabilities: device.capabilities.clone(),
                        refresh_properties,
                    },
                );
            }
        }
    }

    async fn republish_cached_state(&self) {
        let devices = match self.repo.list().await {
            Ok(devices) => devices,
            Err(_) => return,
        };
        for device in devices.into_iter().filter(|d| d.protocol == PROTOCOL) {
            if let Ok(Some(blob)) = self.repo.get_device_state(&device.internal_id).await {
                if blob.is_empty() {
                    continue;
                }
                self.cache.set(&device.internal_id, blob.clone()).await;
                let envelope = Envelope::State(StateBody {
                    device_id: self.device_id(&device.external_id),
                    state: blob,
                    corr: None,
                });
                self.publish_envelope(
                    topic::device_state(&self.device_id(&device.external_id)),
                    envelope,
                    true,
                )
                .await;
            }
            if !device.capabilities.is_empty() || !device.inputs.is_empty() {
                self.publish_metadata(&device).await;
            }
        }
    }

    async fn publish_metadata(&self, device: &Device) {
        let envelope = Envelope::Metadata(MetadataBody {
            device_id: self.device_id(&device.external_id),
            protocol: PROTOCOL.to_string(),
            name: device.name.clone(),
            kind: device.r#type.clone(),
            manufacturer: device.manufacturer.clone(),
            model: device.model.clone(),
            firmware: device.firmware.clone(),
            description: device.description.clone(),
            icon: device.icon.clone(),
            capabilities: device.capabilities.clone(),
            inputs: device.inputs.clone(),
        });
        self.publish_envelope(
            topic::device_metadata(&self.device_id(&device.external_id)),
            envelope,
            true,
        )
        .await;
    }

    // ── Inbound vendor dispatch (grounded on Zigbee2MqttBridge::process_message) ──

    pub async fn handle_vendor_message(&self, topic: &str, payload: &[u8]) {
        let Some(subtopic) = topic.strip_prefix(&format!("{VENDOR_PREFIX}/")) else {
            return;
        };
        match subtopic {
            "bridge/devices" => self.handle_bridge_devices(payload).await,
            "bridge/response/device" => self.handle_bridge_device_response(payload).await,
            "bridge/event" => self.handle_bridge_event(payload).await,
            "bridge/state" | "bridge/logging" | "bridge/info" | "bridge/extensions" => {}
            other if other.ends_with("/availability") => {}
            other if !other.contains('/') => self.handle_device_state(other, payload).await,
            _ => {}
        }
    }

    async fn handle_bridge_devices(&self, payload: &[u8]) {
        let descriptors: Vec<Value> = match serde_json::from_slice(payload) {
            Ok(d) => d,
            Err(e) => {
                debug!(error = %e, "failed to parse bridge/devices");
                return;
            }
        };

        let mut announced_externals = Vec::new();
        for descriptor in &descriptors {
            if descriptor.get("type").and_then(Value::as_str) == Some("Coordinator") {
                continue;
            }
            if let Some(external) = self.ingest_device_descriptor(descriptor).await {
                announced_externals.push(external);
            }
        }

        self.cleanup_removed_devices(&announced_externals, "bridge-refresh-prune")
            .await;
    }

    async fn handle_bridge_device_response(&self, payload: &[u8]) {
        let envelope: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "failed to parse bridge/response/device");
                return;
            }
        };
        if let Some(descriptor) = envelope.get("data") {
            self.ingest_device_descriptor(descriptor).await;
        }
    }

    /// Shared by the full-list and single-device bridge responses:
    /// upsert the device, extract capabilities, refresh indexes, emit
    /// retained metadata. Returns the device's canonical external id.
    async fn ingest_device_descriptor(&self, descriptor: &Value) -> Option<String> {
        let friendly_name = descriptor.get("friendly_name").and_then(Value::as_str)?;
        let raw_external = descriptor.get("ieee_address").and_then(Value::as_str);
        let external = identity::canonical_external_id(raw_external, friendly_name);

        let outcome = match identity::resolve_and_upsert(
            self.repo.as_ref(),
            &self.identity,
            PROTOCOL,
            raw_external,
            friendly_name,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "repository failure during device ingest");
                return None;
            }
        };
        let mut device = outcome.device;

        device.manufacturer = descriptor
            .get("manufacturer")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or(device.manufacturer);
        device.model = descriptor
            .get("model_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or(device.model);
        if let Some(definition) = descriptor.get("definition") {
            device.description = definition
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or(device.description);
        }

        let ExtractionResult {
            capabilities,
            inputs,
            refresh_properties,
        } = capability::extract(descriptor);
        device.capabilities = capabilities.clone();
        device.inputs = inputs;

        if let Err(e) = self.repo.upsert_device(device.clone()).await {
            warn!(error = %e, "repository failure saving extracted capabilities");
            return Some(external);
        }

        self.capability_index.insert(
            external.clone(),
            DeviceIndexEntry {
                capabilities,
                refresh_properties,
            },
        );

        self.cleanup_duplicates(&outcome.pruned).await;
        self.publish_metadata(&device).await;

        Some(external)
    }

    async fn handle_bridge_event(&self, payload: &[u8]) {
        let event: Value = match serde_json::from_slice(payload) {
            Ok(e) => e,
            Err(e) => {
                debug!(error = %e, "failed to parse bridge/event");
                return;
            }
        };
        let kind = event.get("type").and_then(Value::as_str).unwrap_or_default();
        let data = event.get("data").cloned().unwrap_or(Value::Null);

        match kind {
            "device_joined" => self.emit_pairing_progress(PairingStage::DeviceJoined, &data).await,
            "device_announce" => {
                self.emit_pairing_progress(PairingStage::DeviceAnnounced, &data)
                    .await
            }
            "device_interview" => {
                let status = data.get("status").and_then(Value::as_str).unwrap_or("");
                let stage = match status {
                    "started" => Some(PairingStage::InterviewStarted),
                    "successful" | "success" => Some(PairingStage::InterviewSucceeded),
                    "failed" => Some(PairingStage::InterviewFailed),
                    _ => None,
                };
                if let Some(stage) = stage {
                    self.emit_pairing_progress(stage, &data).await;
                }
            }
            "device_renamed" => {
                let from = data.get("from").and_then(Value::as_str);
                let to = data.get("to").and_then(Value::as_str);
                if let (Some(from), Some(to)) = (from, to) {
                    self.handle_rename(from, to).await;
                }
            }
            "device_leave" => {
                if let Some(ieee) = data.get("ieee_address").and_then(Value::as_str) {
                    let external = identity::canonical_external_id(Some(ieee), ieee);
                    self.cleanup_removed_devices(
                        &self.snapshot_externals_excluding(&external).await,
                        "device-leave",
                    )
                    .await;
                }
            }
            other => debug!(event = other, "unhandled bridge event"),
        }
    }

    async fn snapshot_externals_excluding(&self, removed: &str) -> Vec<String> {
        match self.repo.list().await {
            Ok(devices) => devices
                .into_iter()
                .filter(|d| d.protocol == PROTOCOL && d.external_id != removed)
                .map(|d| d.external_id)
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    async fn handle_rename(&self, from: &str, to: &str) {
        let Some(external) = self.identity.external_for_friendly(from) else {
            return;
        };
        self.identity.rename(from, to);

        let outcome = match identity::resolve_and_upsert(
            self.repo.as_ref(),
            &self.identity,
            PROTOCOL,
            Some(&external),
            to,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "repository failure during rename");
                return;
            }
        };
        self.cleanup_duplicates(&outcome.pruned).await;

        self.publish_vendor(
            "bridge/request/device",
            serde_json::json!({ "id": to }),
        )
        .await;
    }

    async fn cleanup_duplicates(&self, pruned: &[Device]) {
        if pruned.is_empty() {
            return;
        }
        for duplicate in pruned {
            self.capability_index.remove(&duplicate.external_id);
            self.last_state.remove(&duplicate.internal_id);
        }
    }

    async fn handle_device_state(&self, friendly_name: &str, payload: &[u8]) {
        let raw: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, friendly_name, "failed to parse device state");
                return;
            }
        };
        let Some(raw_state) = raw.as_object() else {
            return;
        };

        let raw_external = raw_state.get("ieee_address").and_then(Value::as_str);
        let outcome = match identity::resolve_and_upsert(
            self.repo.as_ref(),
            &self.identity,
            PROTOCOL,
            raw_external,
            friendly_name,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "repository failure resolving device for state update");
                return;
            }
        };
        self.cleanup_duplicates(&outcome.pruned).await;
        let device = outcome.device;

        let normalized = self.normalize_state(&device.external_id, raw_state);
        if normalized.is_empty() {
            return;
        }

        let previous = self.last_state.get(&device.internal_id).map(|e| e.clone());
        if previous.as_ref() == Some(&normalized) {
            // No change; still counts as a liveness touch but nothing to emit.
            return;
        }
        self.last_state
            .insert(device.internal_id.clone(), normalized.clone());

        let corr = self.correlation.consume(&device.internal_id);

        self.cache.set(&device.internal_id, normalized.clone()).await;
        if let Err(e) = self
            .repo
            .save_device_state(&device.internal_id, normalized.clone())
            .await
        {
            warn!(error = %e, "repository failure saving state");
        }

        let device_id = self.device_id(&device.external_id);
        let envelope = Envelope::State(StateBody {
            device_id: device_id.clone(),
            state: normalized,
            corr,
        });
        self.publish_envelope(topic::device_state(&device_id), envelope, true)
            .await;

        if !device.capabilities.is_empty() {
            self.publish_metadata(&device).await;
        }
    }

    /// Coerces raw vendor values using the capability index: booleans
    /// via `true_value`/`false_value`, numerics rounded to `range.step`,
    /// enum/string left alone, unknown properties loosely normalized
    /// (spec §4.10, §11).
    fn normalize_state(&self, external_id: &str, raw: &serde_json::Map<String, Value>) -> StateBlob {
        let mut out = serde_json::Map::new();
        let index = self.capability_index.get(external_id);

        for (key, value) in raw {
            if key == "ieee_address" || key == "linkquality" {
                continue;
            }
            let capability = index
                .as_ref()
                .and_then(|idx| idx.capabilities.iter().find(|c| c.property.as_deref() == Some(key)));

            let normalized = match capability {
                Some(cap) => normalize_against_capability(cap, value),
                None => normalize_loosely(value),
            };
            out.insert(key.clone(), normalized);
        }
        out
    }

    async fn emit_pairing_progress(&self, stage: PairingStage, data: &Value) {
        let envelope = Envelope::PairingProgress(PairingProgressBody {
            protocol: PROTOCOL.to_string(),
            stage: stage.as_str().to_string(),
            status: Some(stage.as_str().to_string()),
            external_id: data
                .get("ieee_address")
                .and_then(Value::as_str)
                .map(str::to_string),
            friendly_name: data
                .get("friendly_name")
                .and_then(Value::as_str)
                .map(str::to_string),
        });
        self.publish_envelope(topic::pairing_progress(PROTOCOL), envelope, false)
            .await;
    }

    // ── Inbound HDP handling (spec §4.10 "Inbound HDP command") ─────

    pub async fn handle_pairing_command(&self, _topic: &str, payload: &[u8]) {
        let command: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "failed to parse pairing command");
                return;
            }
        };
        let action = command.get("action").and_then(Value::as_str).unwrap_or("");
        match action {
            "start" => {
                let timeout_s = command.get("timeout_sec").and_then(Value::as_i64).unwrap_or(0);
                if let Some(token) = self.pairing.start(timeout_s) {
                    let duration = PairingStateMachine::effective_timeout(timeout_s);
                    self.publish_vendor(
                        "bridge/request/permit_join",
                        serde_json::json!({ "value": true, "time": duration.as_secs() }),
                    )
                    .await;
                    self.permit_join.store(true, Ordering::SeqCst);
                    if pairing::race_timeout(token, duration).await && self.pairing.expire() {
                        self.permit_join.store(false, Ordering::SeqCst);
                        self.publish_vendor(
                            "bridge/request/permit_join",
                            serde_json::json!({ "value": false }),
                        )
                        .await;
                        let envelope = Envelope::PairingProgress(PairingProgressBody {
                            protocol: PROTOCOL.to_string(),
                            stage: "timeout".to_string(),
                            status: Some("timeout".to_string()),
                            external_id: None,
                            friendly_name: None,
                        });
                        self.publish_envelope(
                            topic::pairing_progress(PROTOCOL),
                            envelope,
                            false,
                        )
                        .await;
                    }
                }
            }
            "stop" => {
                if self.pairing.stop() {
                    self.permit_join.store(false, Ordering::SeqCst);
                    self.publish_vendor(
                        "bridge/request/permit_join",
                        serde_json::json!({ "value": false }),
                    )
                    .await;
                }
            }
            other => debug!(action = other, "unknown pairing action"),
        }
    }

    pub async fn handle_command(&self, payload: &[u8]) {
        let envelope = match Envelope::decode(payload) {
            Ok(Envelope::Command(body)) => body,
            Ok(_) => return,
            Err(e) => {
                debug!(error = %e, "bad command envelope");
                return;
            }
        };
        self.dispatch_command(envelope).await;
    }

    async fn dispatch_command(&self, command: CommandBody) {
        let Some(device_id) = crate::envelope::DeviceId::parse(&command.device_id) else {
            self.reject_command(&command, "bad device_id").await;
            return;
        };
        if device_id.protocol != PROTOCOL {
            return; // spec §7.2: silent drop on protocol mismatch.
        }

        let device = self.resolve_device_for_command(&device_id).await;
        let Some(device) = device else {
            if let Some(corr) = &command.corr {
                self.emit_command_result(&command.device_id, corr, false, Some("unknown device"))
                    .await;
            }
            warn!(device_id = %command.device_id, "unknown device for command");
            return;
        };

        match command.command.as_str() {
            "set_state" => self.handle_set_state(&device, &command).await,
            "refresh" => self.handle_refresh(&device, &command).await,
            "remove_device" => {
                self.cleanup_removed_devices(
                    &self.snapshot_externals_excluding(&device.external_id).await,
                    "command-remove",
                )
                .await;
                if let Some(corr) = &command.corr {
                    self.emit_command_result(&command.device_id, corr, true, None)
                        .await;
                }
            }
            other => {
                self.reject_command(&command, &format!("unknown command {other}"))
                    .await;
            }
        }
    }

    async fn resolve_device_for_command(
        &self,
        device_id: &crate::envelope::DeviceId,
    ) -> Option<Device> {
        match self
            .repo
            .get_by_external(PROTOCOL, &device_id.external_id)
            .await
        {
            Ok(Some(device)) => Some(device),
            _ => self.repo.get_by_id(&device_id.external_id).await.ok().flatten(),
        }
    }

    async fn reject_command(&self, command: &CommandBody, error: &str) {
        if let Some(corr) = &command.corr {
            self.emit_command_result(&command.device_id, corr, false, Some(error))
                .await;
        }
    }

    async fn emit_command_result(
        &self,
        device_id: &str,
        corr: &str,
        success: bool,
        error: Option<&str>,
    ) {
        let envelope = Envelope::CommandResult(crate::envelope::CommandResultBody {
            device_id: device_id.to_string(),
            corr: corr.to_string(),
            success,
            status: if success { Some("queued".to_string()) } else { None },
            error: error.map(str::to_string),
        });
        self.publish_envelope(topic::device_command_result(device_id), envelope, false)
            .await;
    }

    async fn handle_set_state(&self, device: &Device, command: &CommandBody) {
        let vendor_args = translate_command_to_vendor(&command.args);
        let target = self.vendor_target(&device.external_id);
        let mut payload = vendor_args;
        if let (Some(obj), Some(corr)) = (payload.as_object_mut(), &command.corr) {
            obj.insert("correlation_id".to_string(), Value::String(corr.clone()));
        }

        if let Some(corr) = &command.corr {
            self.correlation.set(&device.internal_id, corr);
        }

        self.publish_vendor(&format!("{target}/set"), payload).await;

        if let Some(corr) = &command.corr {
            self.emit_command_result(&self.device_id(&device.external_id), corr, true, None)
                .await;
        }
    }

    async fn handle_refresh(&self, device: &Device, command: &CommandBody) {
        let want_metadata = command
            .args
            .get("metadata")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let want_state = command
            .args
            .get("state")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let properties = command
            .args
            .get("properties")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).collect::<Vec<_>>());

        let target = self.vendor_target(&device.external_id);
        if want_metadata {
            self.publish_vendor(
                "bridge/request/device",
                serde_json::json!({ "id": target }),
            )
            .await;
        }
        if want_state {
            let get_payload = match properties {
                Some(props) => Value::Object(
                    props
                        .into_iter()
                        .map(|p| (p.to_string(), Value::String("".to_string())))
                        .collect(),
                ),
                None => serde_json::json!({}),
            };
            self.publish_vendor(&format!("{target}/get"), get_payload)
                .await;
        }

        if let Some(corr) = &command.corr {
            self.emit_command_result(&self.device_id(&device.external_id), corr, true, None)
                .await;
        }
    }

    // ── Removal pipeline (spec §4.10 "cleanupRemovedDevices") ────────

    async fn cleanup_removed_devices(&self, keep_externals: &[String], reason: &str) {
        let devices = match self.repo.list().await {
            Ok(d) => d,
            Err(_) => return,
        };
        let removed: Vec<Device> = devices
            .into_iter()
            .filter(|d| d.protocol == PROTOCOL && !keep_externals.contains(&d.external_id))
            .collect();

        if removed.is_empty() {
            return;
        }

        let keep_ids: Vec<String> = self
            .repo
            .list()
            .await
            .map(|all| {
                all.into_iter()
                    .filter(|d| keep_externals.contains(&d.external_id))
                    .map(|d| d.internal_id)
                    .collect()
            })
            .unwrap_or_default();
        let _ = self.cache.remove_all_except(&keep_ids).await;
        let _ = self.repo.delete_device_states_not_in(&keep_ids).await;

        for device in removed {
            self.retract_device(&device, reason).await;
        }
    }

    async fn retract_device(&self, device: &Device, reason: &str) {
        let device_id = self.device_id(&device.external_id);

        self.cache.delete(&device.internal_id).await;
        if let Err(e) = self.repo.delete_device_and_state(&device.internal_id).await {
            warn!(error = %e, "repository failure deleting device");
        }

        self.publish_envelope(
            topic::device_state(&device_id),
            Envelope::State(StateBody {
                device_id: device_id.clone(),
                state: serde_json::Map::new(),
                corr: None,
            }),
            true,
        )
        .await;
        // Tombstone: empty retained payload (spec §4.3), not a
        // well-formed envelope — publish the empty bytes directly.
        if let Err(e) = self
            .transport
            .publish_retained(&topic::device_state(&device_id), Vec::new())
            .await
        {
            warn!(error = %e, "failed to retract state topic");
        }
        if let Err(e) = self
            .transport
            .publish_retained(&topic::device_metadata(&device_id), Vec::new())
            .await
        {
            warn!(error = %e, "failed to retract metadata topic");
        }

        self.publish_envelope(
            topic::device_event(&device_id),
            Envelope::Event(EventBody {
                device_id: device_id.clone(),
                event: "device_removed".to_string(),
                data: Some(serde_json::json!({ "reason": reason })),
            }),
            false,
        )
        .await;

        self.identity.remove_by_external(&device.external_id);
        self.capability_index.remove(&device.external_id);
        self.last_state.remove(&device.internal_id);
    }
}

fn normalize_against_capability(
    capability: &crate::device::Capability,
    value: &Value,
) -> Value {
    use crate::device::ValueType;
    match capability.value_type {
        ValueType::Boolean => {
            let true_value = capability
                .true_value
                .clone()
                .unwrap_or(Value::String("ON".to_string()));
            Value::Bool(*value == true_value)
        }
        ValueType::Number => {
            let Some(n) = value.as_f64() else {
                return value.clone();
            };
            match capability.range.as_ref().and_then(|r| r.step) {
                Some(step) if step > 0.0 => {
                    let rounded = (n / step).round() * step;
                    serde_json::json!(rounded)
                }
                _ => serde_json::json!(n),
            }
        }
        ValueType::Enum | ValueType::String | ValueType::Object => value.clone(),
    }
}

fn normalize_loosely(value: &Value) -> Value {
    if let Some(s) = value.as_str() {
        match s.to_ascii_uppercase().as_str() {
            "ON" | "TRUE" => return Value::Bool(true),
            "OFF" | "FALSE" => return Value::Bool(false),
            _ => {}
        }
        if let Ok(n) = s.parse::<f64>() {
            return serde_json::json!(n);
        }
    }
    value.clone()
}

/// `{on: true|false} <-> {state: "ON"|"OFF"}` is the only mandatory
/// canonical translation; other keys pass through unchanged (spec
/// §4.10).
fn translate_command_to_vendor(args: &Value) -> Value {
    let Some(obj) = args.as_object() else {
        return args.clone();
    };
    let mut out = obj.clone();
    if let Some(on) = out.remove("on").and_then(|v| v.as_bool().map(|_| v)) {
        let on = on.as_bool().unwrap_or(false);
        out.insert(
            "state".to_string(),
            Value::String(if on { "ON".to_string() } else { "OFF".to_string() }),
        );
    }
    Value::Object(out)
}

#[async_trait]
impl ProtocolAdapter for ZigbeeAdapter {
    fn name(&self) -> &str {
        PROTOCOL
    }

    async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<(), HdpError> {
        let hello = Envelope::Hello(HelloBody {
            adapter_id: self.config.adapter_id.clone(),
            protocol: PROTOCOL.to_string(),
            version: self.config.version.clone(),
            hdp_version: crate::envelope::SCHEMA_V1.to_string(),
            features: vec![
                "supports_ack".to_string(),
                "supports_correlation".to_string(),
                "supports_batch_state".to_string(),
                "supports_pairing".to_string(),
                "supports_interview".to_string(),
            ],
            pairing: None,
        });
        self.publish_envelope(topic::adapter_hello(), hello, false)
            .await;
        self.publish_status(AdapterStatusKind::Starting, None).await;

        // Pub/sub handlers registered with closures (spec §9): each
        // closure holds its own strong `Arc` to the adapter for as long
        // as the subscription lives, rather than a borrowed pointer.
        let command_handler: crate::transport::Handler = {
            let adapter = self.clone();
            Arc::new(move |topic: String, payload: Vec<u8>| {
                let adapter = adapter.clone();
                tokio::spawn(async move {
                    if topic::is_device_command_for(&topic, PROTOCOL) {
                        adapter.handle_command(&payload).await;
                    } else if topic == topic::pairing_command(PROTOCOL) {
                        adapter.handle_pairing_command(&topic, &payload).await;
                    } else {
                        adapter.handle_vendor_message(&topic, &payload).await;
                    }
                    debug!(adapter = %adapter.config.adapter_id, %topic, "dispatched inbound message");
                });
            })
        };

        if let Err(e) = self
            .transport
            .subscribe(&format!("{VENDOR_PREFIX}/#"), command_handler.clone())
            .await
        {
            return Err(HdpError::Transport(format!("vendor subscribe failed: {e}")));
        }
        if let Err(e) = self
            .transport
            .subscribe(&topic::pairing_command(PROTOCOL), command_handler.clone())
            .await
        {
            return Err(HdpError::Transport(format!("pairing subscribe failed: {e}")));
        }
        if let Err(e) = self
            .transport
            .subscribe(&topic::device_command_filter(PROTOCOL), command_handler)
            .await
        {
            return Err(HdpError::Transport(format!("command subscribe failed: {e}")));
        }

        self.prime_indexes().await;
        self.publish_vendor("bridge/request/devices", Value::Null)
            .await;
        self.republish_cached_state().await;

        self.publish_status(AdapterStatusKind::Online, None).await;
        info!(adapter_id = %self.config.adapter_id, "zigbee adapter started");

        let _ = cancel;
        Ok(())
    }

    async fn stop(&self) -> Result<(), HdpError> {
        self.pairing.force_idle();
        self.publish_status(
            AdapterStatusKind::Offline,
            Some("shutdown".to_string()),
        )
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
    use crate::store::{InMemoryCache, InMemoryRepository};
    use crate::transport::MemoryTransport;
    use tokio_util::sync::CancellationToken;

    fn make_adapter() -> (Arc<MemoryTransport>, Arc<ZigbeeAdapter>) {
        let transport = Arc::new(MemoryTransport::new());
        let repo = Arc::new(InMemoryRepository::new());
        let cache = Arc::new(InMemoryCache::new());
        let registry = Arc::new(AdapterRegistry::new());
        let adapter = Arc::new(ZigbeeAdapter::new(
            ZigbeeAdapterConfig::default(),
            transport.clone(),
            repo,
            cache,
            registry,
        ));
        (transport, adapter)
    }

    #[test]
    fn set_state_translates_on_to_vendor_state() {
        let vendor = translate_command_to_vendor(&serde_json::json!({ "on": true }));
        assert_eq!(vendor, serde_json::json!({ "state": "ON" }));
    }

    #[test]
    fn unrelated_keys_pass_through_untranslated() {
        let vendor = translate_command_to_vendor(&serde_json::json!({ "brightness": 128 }));
        assert_eq!(vendor, serde_json::json!({ "brightness": 128 }));
    }

    #[tokio::test]
    async fn start_publishes_hello_and_online_status() {
        let (transport, adapter) = make_adapter();
        adapter.clone().start(CancellationToken::new()).await.unwrap();

        assert!(transport.log().iter().any(|(t, _, _)| t == "homenavi/hdp/adapter/hello"));
        let status_topic = topic::adapter_status(&adapter.config.adapter_id);
        let retained = transport.retained(&status_topic).unwrap();
        let decoded = Envelope::decode(&retained).unwrap();
        match decoded {
            Envelope::Status(body) => assert_eq!(body.status, "online"),
            _ => panic!("expected status envelope"),
        }
    }

    #[tokio::test]
    async fn heartbeat_republishes_retained_online_status() {
        let (transport, adapter) = make_adapter();
        adapter.clone().start(CancellationToken::new()).await.unwrap();

        let status_topic = topic::adapter_status(&adapter.config.adapter_id);
        let publishes_before = transport
            .log()
            .into_iter()
            .filter(|(t, _, _)| t == &status_topic)
            .count();

        adapter.heartbeat().await;

        let publishes_after = transport
            .log()
            .into_iter()
            .filter(|(t, _, _)| t == &status_topic)
            .count();
        assert_eq!(publishes_after, publishes_before + 1);

        let retained = transport.retained(&status_topic).unwrap();
        match Envelope::decode(&retained).unwrap() {
            Envelope::Status(body) => assert_eq!(body.status, "online"),
            _ => panic!("expected status envelope"),
        }
    }

    #[tokio::test]
    async fn bridge_devices_snapshot_prunes_absent_external_ids() {
        let (transport, adapter) = make_adapter();
        adapter.clone().start(CancellationToken::new()).await.unwrap();

        // Seed three devices directly through the repository.
        for external in ["0xa", "0xb", "0xc"] {
            adapter
                .repo
                .upsert_device(Device::new(PROTOCOL, external, external))
                .await
                .unwrap();
        }

        let snapshot = serde_json::json!([
            { "ieee_address": "0xa", "friendly_name": "0xa", "type": "EndDevice" },
            { "ieee_address": "0xb", "friendly_name": "0xb", "type": "EndDevice" },
        ]);
        adapter
            .handle_vendor_message(
                "zigbee2mqtt/bridge/devices",
                serde_json::to_vec(&snapshot).unwrap().as_slice(),
            )
            .await;

        let remaining = adapter.repo.list().await.unwrap();
        let remaining_externals: Vec<_> = remaining.iter().map(|d| d.external_id.as_str()).collect();
        assert!(!remaining_externals.contains(&"0xc"));
        assert!(transport
            .retained(&topic::device_state(&adapter.device_id("0xc")))
            .is_none());
    }

    #[tokio::test]
    async fn device_state_update_emits_retained_hdp_state() {
        let (transport, adapter) = make_adapter();
        adapter.clone().start(CancellationToken::new()).await.unwrap();

        adapter
            .handle_vendor_message(
                "zigbee2mqtt/lamp1",
                br#"{"ieee_address":"0xABC","state":"ON"}"#,
            )
            .await;

        let device_id = adapter.device_id("0xabc");
        let retained = transport.retained(&topic::device_state(&device_id)).unwrap();
        let decoded = Envelope::decode(&retained).unwrap();
        match decoded {
            Envelope::State(body) => {
                assert_eq!(body.state.get("state"), Some(&Value::Bool(true)));
            }
            _ => panic!("expected state envelope"),
        }
    }
}
