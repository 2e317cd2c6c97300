//! Identity Resolver (spec §4.7): reconciles canonical external ids,
//! friendly names, and internal UUIDs for one protocol's devices, and
//! the dual indexes that make topic/command routing possible under
//! rename.
//!
//! Grounded on the teacher's `zigbee2mqtt.rs` bridge-device handling
//! (friendly name is the vendor's primary key, external/IEEE address
//! is ours) and `discovery.rs`'s pattern of indexing entities by more
//! than one key at once.

use dashmap::DashMap;

use crate::device::Device;
use crate::store::DeviceRepository;

/// Per-protocol friendly/external dual index plus refresh-property
/// bookkeeping (spec §4.7, §5 "friendly_index").
#[derive(Default)]
pub struct IdentityIndex {
    friendly_to_external: DashMap<String, String>,
    external_to_friendly: DashMap<String, String>,
}

impl IdentityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn external_for_friendly(&self, friendly: &str) -> Option<String> {
        self.friendly_to_external.get(friendly).map(|e| e.clone())
    }

    pub fn friendly_for_external(&self, external: &str) -> Option<String> {
        self.external_to_friendly.get(external).map(|f| f.clone())
    }

    pub fn link(&self, friendly: &str, external: &str) {
        self.friendly_to_external
            .insert(friendly.to_string(), external.to_string());
        self.external_to_friendly
            .insert(external.to_string(), friendly.to_string());
    }

    pub fn remove_by_external(&self, external: &str) {
        if let Some((_, friendly)) = self.external_to_friendly.remove(external) {
            self.friendly_to_external.remove(&friendly);
        }
    }

    /// Rewrites indexes for a `device_renamed` bridge event
    /// `(from, to)` against the same external id (spec §4.7 rename
    /// handling).
    pub fn rename(&self, from: &str, to: &str) {
        if let Some((_, external)) = self.friendly_to_external.remove(from) {
            self.friendly_to_external
                .insert(to.to_string(), external.clone());
            self.external_to_friendly
                .insert(external, to.to_string());
        }
    }
}

/// `canonical_external_id` for Zigbee (spec §4.7 worked example):
/// trim+lowercase the IEEE address, prepend `0x` if missing; fall back
/// to the trimmed lowercased friendly name if no IEEE address is
/// present. Idempotent and case-insensitive (testable property 1).
pub fn canonical_external_id(raw_external: Option<&str>, friendly_name: &str) -> String {
    match raw_external.map(str::trim).filter(|s| !s.is_empty()) {
        Some(ieee) => {
            let lower = ieee.to_lowercase();
            if lower.starts_with("0x") {
                lower
            } else {
                format!("0x{lower}")
            }
        }
        None => friendly_name.trim().to_lowercase(),
    }
}

/// Outcome of [`resolve_and_upsert`], used by callers to decide what
/// downstream pruning/re-indexing is required.
pub struct ResolveOutcome {
    pub device: Device,
    pub pruned: Vec<Device>,
}

/// The upsert flow from spec §4.7, steps 1-7. `raw_external` is
/// whatever external id could be read straight off the payload (may be
/// empty); `friendly_name` is the vendor bridge label.
pub async fn resolve_and_upsert(
    repo: &dyn DeviceRepository,
    index: &IdentityIndex,
    protocol: &str,
    raw_external: Option<&str>,
    friendly_name: &str,
) -> Result<ResolveOutcome, crate::error::HdpError> {
    // Step 1: compute external, falling back through the friendly index
    // and finally the friendly name itself.
    let mut external = raw_external
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_default();
    if external.is_empty() {
        external = index
            .external_for_friendly(friendly_name)
            .unwrap_or_default();
    }
    if external.is_empty() {
        external = friendly_name.to_string();
    }
    let external = canonical_external_id(Some(&external), friendly_name);

    // Step 2: look up by (protocol, external), falling back to
    // (protocol, friendly).
    let existing = match repo.get_by_external(protocol, &external).await? {
        Some(device) => Some(device),
        None => repo.get_by_external(protocol, friendly_name).await?,
    };

    // Step 3/4: create fresh, or overwrite external on a mismatch.
    let mut device = match existing {
        Some(device) => device,
        None => Device::new(protocol, &external, friendly_name),
    };
    device.external_id = external.clone();
    device.friendly_name = friendly_name.to_string();

    // Step 5: backfill name if empty or still equal to the external id.
    if device.name.as_deref().unwrap_or("").is_empty()
        || device.name.as_deref() == Some(device.external_id.as_str())
    {
        device.name = Some(friendly_name.to_string());
    }

    // Step 6: refresh liveness.
    device.touch();

    // Step 7: upsert, then prune duplicates sharing the same external id.
    let saved = repo.upsert_device(device).await?;
    let pruned = repo
        .delete_duplicates_by_external(protocol, &external, &saved.internal_id)
        .await?;

    index.link(friendly_name, &external);

    Ok(ResolveOutcome {
        device: saved,
        pruned,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryRepository;

    #[test]
    fn canonical_external_id_is_idempotent_and_case_insensitive() {
        let a = canonical_external_id(Some("AA:BB:CC"), "lamp");
        let b = canonical_external_id(Some(&a), "lamp");
        assert_eq!(a, b);
        assert_eq!(
            canonical_external_id(Some("0xAABBCC"), "lamp"),
            canonical_external_id(Some("aabbcc"), "lamp")
        );
    }

    #[test]
    fn canonical_external_id_falls_back_to_friendly_name() {
        assert_eq!(canonical_external_id(None, "  Kitchen Lamp  "), "kitchen lamp");
    }

    #[tokio::test]
    async fn rename_preserves_internal_id_and_prunes_duplicate() {
        let repo = InMemoryRepository::new();
        let index = IdentityIndex::new();

        let first = resolve_and_upsert(&repo, &index, "zigbee", Some("0xabc"), "lamp")
            .await
            .unwrap();
        let internal_id = first.device.internal_id.clone();

        index.rename("lamp", "kitchen_lamp");

        let renamed = resolve_and_upsert(&repo, &index, "zigbee", Some("0xabc"), "kitchen_lamp")
            .await
            .unwrap();

        assert_eq!(renamed.device.internal_id, internal_id);
        assert_eq!(
            index.external_for_friendly("kitchen_lamp").as_deref(),
            Some("0xabc")
        );
    }

    #[tokio::test]
    async fn upsert_backfills_name_from_friendly_when_blank() {
        let repo = InMemoryRepository::new();
        let index = IdentityIndex::new();
        let result = resolve_and_upsert(&repo, &index, "zigbee", Some("0xabc"), "lamp")
            .await
            .unwrap();
        assert_eq!(result.device.name.as_deref(), Some("lamp"));
    }
}
