//! Capability Extractor (spec §4.6): walks a vendor `exposes` tree and
//! derives typed [`Capability`]/[`DeviceInput`] lists plus a
//! refresh-properties set.
//!
//! Grounded on `duvholt-bifrost`'s `Expose`/`ExposeBase` shape for
//! which fields an exposes node can carry, but deliberately kept as a
//! generic JSON walk rather than a fully-typed enum — vendor shapes
//! vary enough by device model that the teacher's own
//! `zigbee2mqtt.rs::DeviceDefinition` treats `exposes` as loosely
//! structured too.

use serde_json::Value;

use crate::device::{Capability, DeviceInput, NumericRange, ValueType, ACCESS_READ, ACCESS_WRITE};

pub struct ExtractionResult {
    pub capabilities: Vec<Capability>,
    pub inputs: Vec<DeviceInput>,
    /// Deduplicated, insertion-order-preserving.
    pub refresh_properties: Vec<String>,
}

/// `definition.exposes`, or `exposes` at the top level.
pub fn extract(descriptor: &Value) -> ExtractionResult {
    let exposes = descriptor
        .get("definition")
        .and_then(|d| d.get("exposes"))
        .or_else(|| descriptor.get("exposes"))
        .and_then(Value::as_array);

    let mut capabilities = Vec::new();
    let mut inputs = Vec::new();
    let mut refresh_properties = Vec::new();
    let mut seen_refresh = std::collections::HashSet::new();
    let mut index = 0usize;

    if let Some(nodes) = exposes {
        for node in nodes {
            walk(
                node,
                None,
                &mut index,
                &mut capabilities,
                &mut inputs,
                &mut refresh_properties,
                &mut seen_refresh,
            );
        }
    }

    ExtractionResult {
        capabilities,
        inputs,
        refresh_properties,
    }
}

fn walk(
    node: &Value,
    parent_kind: Option<&str>,
    index: &mut usize,
    capabilities: &mut Vec<Capability>,
    inputs: &mut Vec<DeviceInput>,
    refresh_properties: &mut Vec<String>,
    seen_refresh: &mut std::collections::HashSet<String>,
) {
    let Some(obj) = node.as_object() else {
        return;
    };

    let features = obj.get("features").and_then(Value::as_array);
    let property = obj.get("property").and_then(Value::as_str);
    let has_features = features.map(|f| !f.is_empty()).unwrap_or(false);

    // A node with features contributes its own capability only if it
    // carries a property (composite parents without a property are
    // pure grouping nodes).
    if !has_features || property.is_some() {
        if let Some(capability) = build_capability(obj, parent_kind, *index) {
            *index += 1;
            if capability.can_write() {
                inputs.push(build_input(&capability));
            }
            if capability.can_read() {
                if let Some(prop) = &capability.property {
                    if seen_refresh.insert(prop.clone()) {
                        refresh_properties.push(prop.clone());
                    }
                }
            }
            capabilities.push(capability);
        }
    }

    if let Some(features) = features {
        let kind = obj.get("type").and_then(Value::as_str);
        for feature in features {
            walk(
                feature,
                kind,
                index,
                capabilities,
                inputs,
                refresh_properties,
                seen_refresh,
            );
        }
    }
}

fn build_capability(
    obj: &serde_json::Map<String, Value>,
    parent_kind: Option<&str>,
    index: usize,
) -> Option<Capability> {
    let kind = obj.get("type").and_then(Value::as_str)?.to_string();
    let property = obj.get("property").and_then(Value::as_str).map(str::to_string);
    let name = obj.get("name").and_then(Value::as_str).map(str::to_string);
    let access = obj.get("access").and_then(Value::as_u64).unwrap_or(0) as u8;
    let has_features = obj
        .get("features")
        .and_then(Value::as_array)
        .map(|f| !f.is_empty())
        .unwrap_or(false);
    let values: Option<Vec<String>> = obj.get("values").and_then(Value::as_array).map(|vs| {
        vs.iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    });

    let id = property
        .clone()
        .or_else(|| name.as_deref().map(slugify))
        .unwrap_or_else(|| format!("cap_{index}"));

    let range = {
        let min = obj.get("value_min").and_then(Value::as_f64);
        let max = obj.get("value_max").and_then(Value::as_f64);
        let step = obj.get("value_step").and_then(Value::as_f64);
        if min.is_some() || max.is_some() || step.is_some() {
            Some(NumericRange { min, max, step })
        } else {
            None
        }
    };

    let value_type = infer_value_type(&kind, property.as_deref(), &values, &range, has_features || kind == "composite");

    let (true_value, false_value) = if value_type == ValueType::Boolean {
        (
            Some(
                obj.get("value_on")
                    .cloned()
                    .unwrap_or_else(|| Value::String("ON".to_string())),
            ),
            Some(
                obj.get("value_off")
                    .cloned()
                    .unwrap_or_else(|| Value::String("OFF".to_string())),
            ),
        )
    } else {
        (None, None)
    };

    Some(Capability {
        id,
        name,
        kind,
        sub_type: parent_kind.map(str::to_string),
        property,
        value_type,
        unit: obj.get("unit").and_then(Value::as_str).map(str::to_string),
        device_class: obj
            .get("device_class")
            .and_then(Value::as_str)
            .map(str::to_string),
        measurement: obj
            .get("measurement")
            .and_then(Value::as_str)
            .map(str::to_string),
        access,
        range,
        r#enum: values,
        true_value,
        false_value,
        description: obj
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

fn infer_value_type(
    kind: &str,
    property: Option<&str>,
    values: &Option<Vec<String>>,
    range: &Option<NumericRange>,
    has_features: bool,
) -> ValueType {
    let boolean_binary_props = matches!(property, Some("state") | Some("contact") | Some("occupancy"));
    if matches!(kind, "binary" | "switch") && boolean_binary_props {
        return ValueType::Boolean;
    }
    if kind == "light" && property == Some("state") {
        return ValueType::Boolean;
    }
    if kind == "numeric" || range.is_some() {
        return ValueType::Number;
    }
    if values.as_ref().map(|v| !v.is_empty()).unwrap_or(false) {
        return ValueType::Enum;
    }
    if has_features || kind == "composite" {
        return ValueType::Object;
    }
    ValueType::String
}

fn build_input(capability: &Capability) -> DeviceInput {
    let property = capability
        .property
        .clone()
        .unwrap_or_else(|| capability.id.clone());

    let input_type = if capability.value_type == ValueType::Boolean {
        "toggle"
    } else if capability.value_type == ValueType::Number
        && (capability.range.is_some() || property == "color_temp")
    {
        "slider"
    } else if capability.value_type == ValueType::Number {
        "number"
    } else if capability.value_type == ValueType::Enum {
        "select"
    } else if property.contains("color") {
        "color"
    } else {
        "custom"
    };

    let mut metadata = serde_json::Map::new();
    if let (Some(t), Some(f)) = (&capability.true_value, &capability.false_value) {
        metadata.insert("true_value".to_string(), t.clone());
        metadata.insert("false_value".to_string(), f.clone());
    }

    DeviceInput {
        id: format!("input_{}", capability.id),
        label: capability
            .name
            .clone()
            .unwrap_or_else(|| capability.id.clone()),
        r#type: input_type.to_string(),
        capability_id: capability.id.clone(),
        property,
        range: capability.range.clone(),
        options: capability.r#enum.clone(),
        metadata,
    }
}

fn slugify(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_leaf_binary_capability_with_default_on_off() {
        let descriptor = json!({
            "exposes": [
                {"type": "binary", "property": "state", "access": 3}
            ]
        });
        let result = extract(&descriptor);
        assert_eq!(result.capabilities.len(), 1);
        let cap = &result.capabilities[0];
        assert_eq!(cap.value_type, ValueType::Boolean);
        assert_eq!(cap.true_value, Some(json!("ON")));
        assert_eq!(cap.false_value, Some(json!("OFF")));
        assert_eq!(result.inputs.len(), 1);
        assert_eq!(result.inputs[0].r#type, "toggle");
        assert_eq!(result.refresh_properties, vec!["state".to_string()]);
    }

    #[test]
    fn composite_without_property_does_not_self_contribute() {
        let descriptor = json!({
            "exposes": [
                {
                    "type": "light",
                    "features": [
                        {"type": "binary", "property": "state", "access": 7},
                        {"type": "numeric", "property": "brightness", "access": 7, "value_min": 0, "value_max": 254}
                    ]
                }
            ]
        });
        let result = extract(&descriptor);
        // light parent has no "property" so it contributes nothing itself.
        assert_eq!(result.capabilities.len(), 2);
        let state = result.capabilities.iter().find(|c| c.property.as_deref() == Some("state")).unwrap();
        assert_eq!(state.value_type, ValueType::Boolean);
        assert_eq!(state.sub_type.as_deref(), Some("light"));

        let brightness = result
            .capabilities
            .iter()
            .find(|c| c.property.as_deref() == Some("brightness"))
            .unwrap();
        assert_eq!(brightness.value_type, ValueType::Number);
        let input = result
            .inputs
            .iter()
            .find(|i| i.capability_id == brightness.id)
            .unwrap();
        assert_eq!(input.r#type, "slider");
    }

    #[test]
    fn composite_with_property_contributes_and_recurses() {
        let descriptor = json!({
            "exposes": [
                {
                    "type": "composite",
                    "property": "color",
                    "name": "Color",
                    "access": 3,
                    "features": [
                        {"type": "numeric", "property": "r", "access": 3}
                    ]
                }
            ]
        });
        let result = extract(&descriptor);
        assert_eq!(result.capabilities.len(), 2);
        let parent = result.capabilities.iter().find(|c| c.id == "color").unwrap();
        assert_eq!(parent.value_type, ValueType::Object);
        let parent_input = result.inputs.iter().find(|i| i.capability_id == "color").unwrap();
        assert_eq!(parent_input.r#type, "color");
    }

    #[test]
    fn falls_back_to_slugified_name_then_indexed_id() {
        let descriptor = json!({
            "exposes": [
                {"type": "numeric", "name": "Signal Strength", "access": 1},
                {"type": "numeric", "access": 1}
            ]
        });
        let result = extract(&descriptor);
        assert_eq!(result.capabilities[0].id, "signal_strength");
        assert_eq!(result.capabilities[1].id, "cap_1");
    }

    #[test]
    fn extraction_is_deterministic() {
        let descriptor = json!({
            "exposes": [
                {"type": "binary", "property": "state", "access": 3},
                {"type": "numeric", "property": "battery", "access": 1}
            ]
        });
        let a = extract(&descriptor);
        let b = extract(&descriptor);
        assert_eq!(
            serde_json::to_string(&a.capabilities).unwrap(),
            serde_json::to_string(&b.capabilities).unwrap()
        );
    }
}
