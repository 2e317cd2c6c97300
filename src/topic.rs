//! HDP topic namespace (spec §4.3).
//!
//! `homenavi/hdp/...` is the reserved prefix every adapter-facing topic
//! lives under. Grounded on the teacher's `mqtt.rs::topic_to_entity_id`
//! convention of small, pure string-in/string-out topic helpers.

pub const PREFIX: &str = "homenavi/hdp";

pub fn adapter_hello() -> String {
    format!("{PREFIX}/adapter/hello")
}

pub fn adapter_status(adapter_id: &str) -> String {
    format!("{PREFIX}/adapter/status/{adapter_id}")
}

pub fn device_metadata(device_id: &str) -> String {
    format!("{PREFIX}/device/metadata/{device_id}")
}

pub fn device_state(device_id: &str) -> String {
    format!("{PREFIX}/device/state/{device_id}")
}

pub fn device_event(device_id: &str) -> String {
    format!("{PREFIX}/device/event/{device_id}")
}

pub fn device_command_filter(protocol: &str) -> String {
    format!("{PREFIX}/device/command/{protocol}/#")
}

pub fn device_command_result(device_id: &str) -> String {
    format!("{PREFIX}/device/command_result/{device_id}")
}

pub fn pairing_command(protocol: &str) -> String {
    format!("{PREFIX}/pairing/command/{protocol}")
}

pub fn pairing_progress(protocol: &str) -> String {
    format!("{PREFIX}/pairing/progress/{protocol}")
}

/// Whether `topic` is the command topic for `protocol`'s adapter
/// (i.e. matches `device_command_filter(protocol)`).
pub fn is_device_command_for(topic: &str, protocol: &str) -> bool {
    topic.starts_with(&format!("{PREFIX}/device/command/{protocol}/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_use_reserved_prefix() {
        assert_eq!(adapter_hello(), "homenavi/hdp/adapter/hello");
        assert_eq!(
            device_state("zigbee/zigbee/0xabc"),
            "homenavi/hdp/device/state/zigbee/zigbee/0xabc"
        );
    }

    #[test]
    fn command_filter_matches_nested_device_id() {
        assert!(is_device_command_for(
            "homenavi/hdp/device/command/zigbee/zigbee/0xabc",
            "zigbee"
        ));
        assert!(!is_device_command_for(
            "homenavi/hdp/device/command/thread/thread/0xabc",
            "zigbee"
        ));
    }
}
