//! HDP envelope codec (spec §4.1).
//!
//! Two-stage decode, per the design notes (spec §9): every payload is
//! first parsed as a generic [`serde_json::Value`], then validated and
//! lifted into the typed [`Envelope`] enum. Unknown extra fields are
//! never rejected — only the fields a given `type` requires are
//! pulled out, the same way the teacher's `discovery.rs` picks known
//! keys out of an arbitrary HA discovery payload without caring what
//! else is in there.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::device::{Capability, DeviceInput};
use crate::error::HdpError;

pub const SCHEMA_V1: &str = "hdp.v1";

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Canonical `<protocol>/<adapter_id>/<external_id>` (or the two-segment
/// `<protocol>/<external_id>` form) device identifier (spec §4.1).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId {
    pub protocol: String,
    pub adapter_id: Option<String>,
    pub external_id: String,
}

impl DeviceId {
    pub fn new(protocol: &str, adapter_id: Option<&str>, external_id: &str) -> Self {
        Self {
            protocol: protocol.to_lowercase(),
            adapter_id: adapter_id.map(str::to_string),
            external_id: external_id.to_string(),
        }
    }

    /// Case-insensitive on protocol, case-sensitive on the rest.
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [protocol, adapter_id, external_id] => Some(Self {
                protocol: protocol.to_lowercase(),
                adapter_id: Some((*adapter_id).to_string()),
                external_id: (*external_id).to_string(),
            }),
            [protocol, external_id] => Some(Self {
                protocol: protocol.to_lowercase(),
                adapter_id: None,
                external_id: (*external_id).to_string(),
            }),
            _ => None,
        }
    }

    pub fn format(&self) -> String {
        match &self.adapter_id {
            Some(adapter_id) => format!("{}/{}/{}", self.protocol, adapter_id, self.external_id),
            None => format!("{}/{}", self.protocol, self.external_id),
        }
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.format())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HelloBody {
    pub adapter_id: String,
    pub protocol: String,
    pub version: String,
    pub hdp_version: String,
    pub features: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusBody {
    pub adapter_id: String,
    pub status: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct MetadataBody {
    pub device_id: String,
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "type")]
    pub kind: Option<String>,
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
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<Capability>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<DeviceInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateBody {
    pub device_id: String,
    pub state: serde_json::Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corr: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventBody {
    pub device_id: String,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandBody {
    pub device_id: String,
    pub command: String,
    #[serde(default)]
    pub args: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corr: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandResultBody {
    pub device_id: String,
    pub corr: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PairingProgressBody {
    pub protocol: String,
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub friendly_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Hello(HelloBody),
    Status(StatusBody),
    Metadata(MetadataBody),
    State(StateBody),
    Event(EventBody),
    Command(CommandBody),
    CommandResult(CommandResultBody),
    PairingProgress(PairingProgressBody),
}

impl Envelope {
    pub fn type_tag(&self) -> &'static str {
        match self {
            Envelope::Hello(_) => "hello",
            Envelope::Status(_) => "status",
            Envelope::Metadata(_) => "metadata",
            Envelope::State(_) => "state",
            Envelope::Event(_) => "event",
            Envelope::Command(_) => "command",
            Envelope::CommandResult(_) => "command_result",
            Envelope::PairingProgress(_) => "pairing_progress",
        }
    }

    /// Device-scoped envelopes carry a `device_id`; hello/status/pairing
    /// are adapter- or protocol-scoped instead.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Envelope::Metadata(b) => Some(&b.device_id),
            Envelope::State(b) => Some(&b.device_id),
            Envelope::Event(b) => Some(&b.device_id),
            Envelope::Command(b) => Some(&b.device_id),
            Envelope::CommandResult(b) => Some(&b.device_id),
            _ => None,
        }
    }

    /// Encode with the current timestamp, matching the wire shape
    /// `{schema, type, ts, ...fields}`.
    pub fn encode(&self) -> Vec<u8> {
        self.encode_at(now_ms())
    }

    pub fn encode_at(&self, ts: i64) -> Vec<u8> {
        let mut obj = match self {
            Envelope::Hello(b) => to_object(b),
            Envelope::Status(b) => to_object(b),
            Envelope::Metadata(b) => to_object(b),
            Envelope::State(b) => to_object(b),
            Envelope::Event(b) => to_object(b),
            Envelope::Command(b) => to_object(b),
            Envelope::CommandResult(b) => to_object(b),
            Envelope::PairingProgress(b) => to_object(b),
        };
        obj.insert("schema".to_string(), Value::String(SCHEMA_V1.to_string()));
        obj.insert(
            "type".to_string(),
            Value::String(self.type_tag().to_string()),
        );
        obj.insert("ts".to_string(), Value::from(ts));
        serde_json::to_vec(&Value::Object(obj)).unwrap_or_default()
    }

    /// Decode a wire payload. Fails only on a missing/unrecognized
    /// `schema`, an unknown `type`, or a missing required field for
    /// that type — never on unrecognized extra fields (spec §4.1).
    pub fn decode(payload: &[u8]) -> Result<Envelope, HdpError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| HdpError::BadEnvelope(format!("invalid json: {e}")))?;

        let obj = value
            .as_object()
            .ok_or_else(|| HdpError::BadEnvelope("payload is not a JSON object".into()))?;

        match obj.get("schema").and_then(Value::as_str) {
            Some(SCHEMA_V1) => {}
            Some(other) => return Err(HdpError::BadEnvelope(format!("unknown schema {other}"))),
            None => return Err(HdpError::BadEnvelope("missing schema".into())),
        }

        let kind = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| HdpError::BadEnvelope("missing type".into()))?;

        match kind {
            "hello" => from_object(obj).map(Envelope::Hello),
            "status" => from_object(obj).map(Envelope::Status),
            "metadata" => from_object(obj).map(Envelope::Metadata),
            "state" => from_object(obj).map(Envelope::State),
            "event" => from_object(obj).map(Envelope::Event),
            "command" => from_object(obj).map(Envelope::Command),
            "command_result" => from_object(obj).map(Envelope::CommandResult),
            "pairing_progress" => from_object(obj).map(Envelope::PairingProgress),
            other => Err(HdpError::BadEnvelope(format!("unknown type {other}"))),
        }
    }
}

fn to_object<T: Serialize>(body: &T) -> serde_json::Map<String, Value> {
    match serde_json::to_value(body) {
        Ok(Value::Object(obj)) => obj,
        _ => serde_json::Map::new(),
    }
}

fn from_object<T: for<'de> Deserialize<'de>>(
    obj: &serde_json::Map<String, Value>,
) -> Result<T, HdpError> {
    serde_json::from_value(Value::Object(obj.clone()))
        .map_err(|e| HdpError::BadEnvelope(format!("missing or malformed field: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_parses_two_and_three_segment_forms() {
        let three = DeviceId::parse("Zigbee/zigbee/0xabc").unwrap();
        assert_eq!(three.protocol, "zigbee");
        assert_eq!(three.adapter_id.as_deref(), Some("zigbee"));
        assert_eq!(three.external_id, "0xabc");

        let two = DeviceId::parse("zigbee/0xabc").unwrap();
        assert_eq!(two.adapter_id, None);
        assert_eq!(two.external_id, "0xabc");

        assert!(DeviceId::parse("bad").is_none());
    }

    #[test]
    fn round_trips_state_envelope() {
        let mut state = serde_json::Map::new();
        state.insert("state".into(), Value::String("ON".into()));
        let body = StateBody {
            device_id: "zigbee/zigbee/0xabc".into(),
            state,
            corr: Some("c-1".into()),
        };
        let env = Envelope::State(body.clone());
        let bytes = env.encode_at(1000);
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded, Envelope::State(body));
    }

    #[test]
    fn decode_rejects_missing_schema() {
        let err = Envelope::decode(br#"{"type":"hello"}"#).unwrap_err();
        assert!(matches!(err, HdpError::BadEnvelope(_)));
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let err =
            Envelope::decode(br#"{"schema":"hdp.v1","type":"bogus","ts":1}"#).unwrap_err();
        assert!(matches!(err, HdpError::BadEnvelope(_)));
    }

    #[test]
    fn decode_ignores_unknown_extra_fields() {
        let payload = br#"{
            "schema":"hdp.v1","type":"event","ts":1,
            "device_id":"zigbee/zigbee/0xabc","event":"button_press",
            "unexpected_future_field": 42
        }"#;
        let decoded = Envelope::decode(payload).unwrap();
        assert_eq!(
            decoded,
            Envelope::Event(EventBody {
                device_id: "zigbee/zigbee/0xabc".into(),
                event: "button_press".into(),
                data: None,
            })
        );
    }

    #[test]
    fn decode_rejects_missing_required_field() {
        let err = Envelope::decode(
            br#"{"schema":"hdp.v1","type":"command_result","ts":1,"device_id":"a/b","success":true}"#,
        )
        .unwrap_err();
        assert!(matches!(err, HdpError::BadEnvelope(_)));
    }
}
