//! Core data model (spec §3): devices, capabilities, inputs, adapter
//! status and state blobs.
//!
//! Mirrors the shape of the teacher's `state.rs::EntityState`, but
//! keyed on the hub's own `(protocol, external_id)` identity instead
//! of Home Assistant's flat `entity_id` string.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Read/write/event access bits, matching the vendor `access` bitfield
/// used throughout the capability extractor (spec §4.6).
pub const ACCESS_READ: u8 = 1;
pub const ACCESS_WRITE: u8 = 2;
pub const ACCESS_EVENT: u8 = 4;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Boolean,
    Number,
    Enum,
    String,
    Object,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NumericRange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
}

/// What a device exposes (spec §3 Capability).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Capability {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property: Option<String>,
    pub value_type: ValueType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measurement: Option<String>,
    pub access: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<NumericRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#enum: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub true_value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub false_value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Capability {
    pub fn can_read(&self) -> bool {
        self.access & ACCESS_READ != 0
    }

    pub fn can_write(&self) -> bool {
        self.access & ACCESS_WRITE != 0
    }
}

/// UI control descriptor derived from a writable capability (spec §3 DeviceInput).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceInput {
    pub id: String,
    pub label: String,
    pub r#type: String,
    pub capability_id: String,
    pub property: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<NumericRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, Value>,
}

/// Stable device identity plus descriptive metadata (spec §3 Device).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub internal_id: String,
    pub protocol: String,
    pub external_id: String,
    pub friendly_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub inputs: Vec<DeviceInput>,
    pub online: bool,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    pub fn new(protocol: &str, external_id: &str, friendly_name: &str) -> Self {
        let now = Utc::now();
        Self {
            internal_id: uuid::Uuid::new_v4().to_string(),
            protocol: protocol.to_string(),
            external_id: external_id.to_string(),
            friendly_name: friendly_name.to_string(),
            name: None,
            r#type: None,
            manufacturer: None,
            model: None,
            firmware: None,
            description: None,
            icon: None,
            capabilities: Vec::new(),
            inputs: Vec::new(),
            online: true,
            last_seen: now,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.online = true;
        self.last_seen = Utc::now();
        self.updated_at = Utc::now();
    }
}

/// Hub-side adapter registry entry (spec §3 AdapterStatus).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum AdapterStatusKind {
    Starting,
    Online,
    Offline,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterStatus {
    pub adapter_id: String,
    pub protocol: String,
    pub status: AdapterStatusKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub version: String,
    pub last_seen: DateTime<Utc>,
    pub supports_pairing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing_config: Option<Value>,
}

/// Default TTL (seconds) for adapter liveness (spec §3 "Liveness").
pub const ADAPTER_STATUS_TTL_SECS: i64 = 45;

impl AdapterStatus {
    /// `status != offline` and within the TTL window of `now`.
    pub fn is_online_at(&self, now: DateTime<Utc>) -> bool {
        self.status != AdapterStatusKind::Offline
            && (now - self.last_seen).num_seconds() <= ADAPTER_STATUS_TTL_SECS
    }
}

/// A device's current state blob (spec §3 State Blob): capability
/// property -> current value.
pub type StateBlob = serde_json::Map<String, Value>;
