//! Device Repository and State Cache contracts (spec §4.4, §4.5), plus
//! `DashMap`-backed in-memory reference implementations.
//!
//! The durable repository driver is an external collaborator (spec
//! §1) — the trait here is the seam a real SQL/embedded-DB
//! implementation would sit behind, in the same spirit as the
//! teacher's `state.rs::StateMachine` holding everything in a
//! `DashMap` and leaving persistence to `recorder.rs`.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::device::{Device, StateBlob};
use crate::error::HdpError;

#[async_trait]
pub trait DeviceRepository: Send + Sync {
    async fn get_by_external(
        &self,
        protocol: &str,
        external_id: &str,
    ) -> Result<Option<Device>, HdpError>;
    async fn get_by_id(&self, internal_id: &str) -> Result<Option<Device>, HdpError>;
    async fn list(&self) -> Result<Vec<Device>, HdpError>;
    /// Idempotent on `(protocol, external_id)`; preserves `internal_id`
    /// and `created_at` of any existing record.
    async fn upsert_device(&self, device: Device) -> Result<Device, HdpError>;
    async fn delete_device_and_state(&self, internal_id: &str) -> Result<(), HdpError>;
    /// Deletes every other device sharing `(protocol, external_id)` and
    /// returns the pruned records.
    async fn delete_duplicates_by_external(
        &self,
        protocol: &str,
        external_id: &str,
        keep_id: &str,
    ) -> Result<Vec<Device>, HdpError>;
    async fn save_device_state(&self, internal_id: &str, blob: StateBlob) -> Result<(), HdpError>;
    async fn get_device_state(&self, internal_id: &str) -> Result<Option<StateBlob>, HdpError>;
    async fn delete_device_states_not_in(
        &self,
        keep_ids: &[String],
    ) -> Result<Vec<String>, HdpError>;
}

#[async_trait]
pub trait StateCache: Send + Sync {
    async fn get(&self, internal_id: &str) -> Option<StateBlob>;
    async fn set(&self, internal_id: &str, blob: StateBlob);
    async fn delete(&self, internal_id: &str);
    /// Evicts every entry whose key isn't in `keep_ids`; returns the
    /// evicted keys.
    async fn remove_all_except(&self, keep_ids: &[String]) -> Vec<String>;
}

#[derive(Default)]
pub struct InMemoryRepository {
    by_internal: DashMap<String, Device>,
    states: DashMap<String, StateBlob>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceRepository for InMemoryRepository {
    async fn get_by_external(
        &self,
        protocol: &str,
        external_id: &str,
    ) -> Result<Option<Device>, HdpError> {
        Ok(self
            .by_internal
            .iter()
            .find(|entry| entry.protocol == protocol && entry.external_id == external_id)
            .map(|entry| entry.value().clone()))
    }

    async fn get_by_id(&self, internal_id: &str) -> Result<Option<Device>, HdpError> {
        Ok(self.by_internal.get(internal_id).map(|d| d.clone()))
    }

    async fn list(&self) -> Result<Vec<Device>, HdpError> {
        Ok(self.by_internal.iter().map(|e| e.value().clone()).collect())
    }

    async fn upsert_device(&self, mut device: Device) -> Result<Device, HdpError> {
        if let Some(existing) = self
            .by_internal
            .iter()
            .find(|e| e.protocol == device.protocol && e.external_id == device.external_id)
            .map(|e| e.value().clone())
        {
            device.internal_id = existing.internal_id.clone();
            device.created_at = existing.created_at;
        }
        self.by_internal
            .insert(device.internal_id.clone(), device.clone());
        Ok(device)
    }

    async fn delete_device_and_state(&self, internal_id: &str) -> Result<(), HdpError> {
        self.by_internal.remove(internal_id);
        self.states.remove(internal_id);
        Ok(())
    }

    async fn delete_duplicates_by_external(
        &self,
        protocol: &str,
        external_id: &str,
        keep_id: &str,
    ) -> Result<Vec<Device>, HdpError> {
        let duplicates: Vec<Device> = self
            .by_internal
            .iter()
            .filter(|e| {
                e.protocol == protocol && e.external_id == external_id && e.internal_id != keep_id
            })
            .map(|e| e.value().clone())
            .collect();
        for duplicate in &duplicates {
            self.by_internal.remove(&duplicate.internal_id);
            self.states.remove(&duplicate.internal_id);
        }
        Ok(duplicates)
    }

    async fn save_device_state(&self, internal_id: &str, blob: StateBlob) -> Result<(), HdpError> {
        self.states.insert(internal_id.to_string(), blob);
        Ok(())
    }

    async fn get_device_state(&self, internal_id: &str) -> Result<Option<StateBlob>, HdpError> {
        Ok(self.states.get(internal_id).map(|b| b.clone()))
    }

    async fn delete_device_states_not_in(
        &self,
        keep_ids: &[String],
    ) -> Result<Vec<String>, HdpError> {
        let evicted: Vec<String> = self
            .states
            .iter()
            .map(|e| e.key().clone())
            .filter(|id| !keep_ids.contains(id))
            .collect();
        for id in &evicted {
            self.states.remove(id);
        }
        Ok(evicted)
    }
}

#[derive(Default)]
pub struct InMemoryCache {
    states: DashMap<String, StateBlob>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateCache for InMemoryCache {
    async fn get(&self, internal_id: &str) -> Option<StateBlob> {
        self.states.get(internal_id).map(|b| b.clone())
    }

    async fn set(&self, internal_id: &str, blob: StateBlob) {
        self.states.insert(internal_id.to_string(), blob);
    }

    async fn delete(&self, internal_id: &str) {
        self.states.remove(internal_id);
    }

    async fn remove_all_except(&self, keep_ids: &[String]) -> Vec<String> {
        let evicted: Vec<String> = self
            .states
            .iter()
            .map(|e| e.key().clone())
            .filter(|id| !keep_ids.contains(id))
            .collect();
        for id in &evicted {
            self.states.remove(id);
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn upsert_preserves_internal_id_and_created_at() {
        let repo = InMemoryRepository::new();
        let device = Device::new("zigbee", "0xabc", "lamp");
        let first = repo.upsert_device(device.clone()).await.unwrap();

        let mut renamed = first.clone();
        renamed.friendly_name = "kitchen_lamp".to_string();
        let second = repo.upsert_device(renamed).await.unwrap();

        assert_eq!(second.internal_id, first.internal_id);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.friendly_name, "kitchen_lamp");
    }

    #[tokio::test]
    async fn delete_duplicates_by_external_prunes_all_but_keep_id() {
        let repo = InMemoryRepository::new();
        let mut a = Device::new("zigbee", "0xabc", "lamp");
        a.internal_id = "keep".to_string();
        let mut b = Device::new("zigbee", "0xabc", "lamp_old");
        b.internal_id = "dup".to_string();
        repo.by_internal.insert(a.internal_id.clone(), a);
        repo.by_internal.insert(b.internal_id.clone(), b);

        let pruned = repo
            .delete_duplicates_by_external("zigbee", "0xabc", "keep")
            .await
            .unwrap();
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].internal_id, "dup");
        assert!(repo.get_by_id("keep").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cache_remove_all_except_evicts_others() {
        let cache = InMemoryCache::new();
        cache.set("a", json!({"state":"ON"}).as_object().unwrap().clone()).await;
        cache.set("b", json!({"state":"OFF"}).as_object().unwrap().clone()).await;

        let evicted = cache.remove_all_except(&["a".to_string()]).await;
        assert_eq!(evicted, vec!["b".to_string()]);
        assert!(cache.get("a").await.is_some());
        assert!(cache.get("b").await.is_none());
    }
}
