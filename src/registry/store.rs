//! In-memory registry tuple store (spec §3 "Registry descriptor" / §4.9).
//! Grounded on `original_source/src/registry.c` (`new_registry_entry`,
//! per-process name/topic/type uniqueness) and
//! `services/server/src/state.rs` (`Arc<Mutex<HashMap<..>>>` shared-state
//! pattern). Crate: `uuid` for canonical-form ids.

use crate::addr::NetAddr;
use crate::error::{RegistryError, ValidationCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointType {
    Datahub,
    Datalink,
    Messagehub,
    Messagelink,
    Service,
    Streamer,
    Streamerlink,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub id: String,
    pub name: String,
    pub topic: String,
    #[serde(rename = "type")]
    pub endpoint_type: EndpointType,
    pub addr: NetAddr,
}

/// `owner` is the opaque process key that registered this entry: the
/// originating messagelink's id, not part of the wire-level entry itself.
/// Used only to enforce per-process `(name,topic,type)` uniqueness (spec
/// B.1, grounded on `original_source/src/registry.c`).
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub id: Option<String>,
    pub name: Option<String>,
    pub topic: Option<String>,
    pub endpoint_type: Option<EndpointType>,
    pub addr: Option<NetAddr>,
}

impl EntryFilter {
    fn matches(&self, entry: &RegistryEntry) -> bool {
        self.id.as_ref().is_none_or(|v| v == &entry.id)
            && self.name.as_ref().is_none_or(|v| v == &entry.name)
            && self.topic.as_ref().is_none_or(|v| v == &entry.topic)
            && self.endpoint_type.is_none_or(|v| v == entry.endpoint_type)
            && self.addr.as_ref().is_none_or(|v| v == &entry.addr)
    }
}

fn is_valid_topic(topic: &str) -> bool {
    (4..256).contains(&topic.len())
        && topic.chars().next().is_some_and(|c| c.is_ascii_lowercase())
        && topic.chars().all(|c| c.is_ascii_lowercase() || c == '.' || c == '-')
}

fn is_valid_name(name: &str) -> bool {
    (4..256).contains(&name.len())
        && name.chars().next().is_some_and(|c| c.is_ascii_lowercase())
        && name.chars().all(|c| c.is_ascii_lowercase() || c == '_' || c == '-')
}

struct Owned {
    entry: RegistryEntry,
    owner: String,
}

#[derive(Default)]
pub struct RegistryStore {
    entries: Mutex<HashMap<String, Owned>>,
}

impl RegistryStore {
    pub fn new() -> RegistryStore {
        RegistryStore::default()
    }

    /// Validates and inserts a new entry for `owner` (the registering
    /// link's id), assigning a fresh canonical-form UUID. Enforces
    /// `(name,topic,type)` uniqueness within `owner` (spec §3 invariant)
    /// and `addr.port > 0` / IPv4 well-formedness.
    pub async fn insert(
        &self,
        owner: &str,
        name: String,
        topic: String,
        endpoint_type: EndpointType,
        addr: NetAddr,
    ) -> Result<RegistryEntry, RegistryError> {
        if !is_valid_name(&name) {
            return Err(RegistryError::Validation {
                code: ValidationCode::InvalidName,
                field: "name",
                message: format!("invalid name {name:?}"),
            });
        }
        if !is_valid_topic(&topic) {
            return Err(RegistryError::Validation {
                code: ValidationCode::InvalidTopic,
                field: "topic",
                message: format!("invalid topic {topic:?}"),
            });
        }
        if !addr.is_valid() {
            return Err(RegistryError::Validation {
                code: ValidationCode::InvalidAddr,
                field: "addr",
                message: format!("invalid address {addr}"),
            });
        }

        let mut entries = self.entries.lock().await;
        let duplicate = entries.values().any(|o| {
            o.owner == owner && o.entry.name == name && o.entry.topic == topic && o.entry.endpoint_type == endpoint_type
        });
        if duplicate {
            return Err(RegistryError::Validation {
                code: ValidationCode::NotUnique,
                field: "name",
                message: "(name, topic, type) already registered by this process".to_owned(),
            });
        }

        let id = Uuid::new_v4().to_string();
        let entry = RegistryEntry { id: id.clone(), name, topic, endpoint_type, addr };
        entries.insert(id, Owned { entry: entry.clone(), owner: owner.to_owned() });
        Ok(entry)
    }

    pub async fn delete(&self, id: &str) -> Result<RegistryEntry, RegistryError> {
        let mut entries = self.entries.lock().await;
        entries.remove(id).map(|o| o.entry).ok_or_else(|| RegistryError::NotFound(id.to_owned()))
    }

    /// Removes every entry registered by `owner` (used when a link that
    /// never sent explicit `unregister`s disconnects).
    pub async fn delete_owned_by(&self, owner: &str) -> Vec<RegistryEntry> {
        let mut entries = self.entries.lock().await;
        let ids: Vec<String> = entries.iter().filter(|(_, o)| o.owner == owner).map(|(id, _)| id.clone()).collect();
        ids.into_iter().filter_map(|id| entries.remove(&id).map(|o| o.entry)).collect()
    }

    pub async fn update_addr(&self, id: &str, addr: NetAddr) -> Result<RegistryEntry, RegistryError> {
        if !addr.is_valid() {
            return Err(RegistryError::Validation {
                code: ValidationCode::InvalidAddr,
                field: "addr",
                message: format!("invalid address {addr}"),
            });
        }
        let mut entries = self.entries.lock().await;
        let owned = entries.get_mut(id).ok_or_else(|| RegistryError::NotFound(id.to_owned()))?;
        owned.entry.addr = addr;
        Ok(owned.entry.clone())
    }

    pub async fn get(&self, id: &str) -> Option<RegistryEntry> {
        self.entries.lock().await.get(id).map(|o| o.entry.clone())
    }

    pub async fn select(&self, filter: &EntryFilter) -> Vec<RegistryEntry> {
        self.entries.lock().await.values().map(|o| &o.entry).filter(|e| filter.matches(e)).cloned().collect()
    }

    pub async fn select_all(&self) -> Vec<RegistryEntry> {
        self.entries.lock().await.values().map(|o| o.entry.clone()).collect()
    }

    pub async fn count(&self, filter: &EntryFilter) -> usize {
        self.entries.lock().await.values().map(|o| &o.entry).filter(|e| filter.matches(e)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> NetAddr {
        NetAddr::new("127.0.0.1", 9000)
    }

    #[tokio::test]
    async fn inserts_and_assigns_canonical_uuid() {
        let store = RegistryStore::new();
        let entry = store
            .insert("owner-a", "foo-svc".into(), "cluster.foo".into(), EndpointType::Service, addr())
            .await
            .unwrap();
        assert_eq!(entry.id.len(), 36);
        assert_eq!(entry.id.as_bytes()[8], b'-');
        assert_eq!(entry.id.as_bytes()[13], b'-');
        assert_eq!(entry.id.as_bytes()[18], b'-');
        assert_eq!(entry.id.as_bytes()[23], b'-');
    }

    #[tokio::test]
    async fn rejects_invalid_topic() {
        let store = RegistryStore::new();
        let err = store
            .insert("owner-a", "foo-svc".into(), "X".into(), EndpointType::Service, addr())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Validation { code: ValidationCode::InvalidTopic, .. }));
    }

    #[tokio::test]
    async fn rejects_duplicate_name_topic_type_within_owner() {
        let store = RegistryStore::new();
        store
            .insert("owner-a", "foo-svc".into(), "cluster.foo".into(), EndpointType::Service, addr())
            .await
            .unwrap();
        let err = store
            .insert("owner-a", "foo-svc".into(), "cluster.foo".into(), EndpointType::Service, addr())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Validation { code: ValidationCode::NotUnique, .. }));
    }

    #[tokio::test]
    async fn allows_same_name_topic_type_for_different_owner() {
        let store = RegistryStore::new();
        store
            .insert("owner-a", "foo-svc".into(), "cluster.foo".into(), EndpointType::Service, addr())
            .await
            .unwrap();
        let ok = store
            .insert("owner-b", "foo-svc".into(), "cluster.foo".into(), EndpointType::Service, addr())
            .await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn update_addr_changes_entry() {
        let store = RegistryStore::new();
        let entry = store
            .insert("owner-a", "foo-svc".into(), "cluster.foo".into(), EndpointType::Service, addr())
            .await
            .unwrap();
        let updated = store.update_addr(&entry.id, NetAddr::new("127.0.0.1", 9100)).await.unwrap();
        assert_eq!(updated.addr.port, 9100);
    }

    #[tokio::test]
    async fn delete_owned_by_removes_only_that_owner() {
        let store = RegistryStore::new();
        store
            .insert("owner-a", "foo-svc".into(), "cluster.foo".into(), EndpointType::Service, addr())
            .await
            .unwrap();
        store
            .insert("owner-b", "bar-svc".into(), "cluster.bar".into(), EndpointType::Service, addr())
            .await
            .unwrap();
        let removed = store.delete_owned_by("owner-a").await;
        assert_eq!(removed.len(), 1);
        assert_eq!(store.select_all().await.len(), 1);
    }

    #[tokio::test]
    async fn select_filters_by_topic() {
        let store = RegistryStore::new();
        store
            .insert("owner-a", "foo-svc".into(), "cluster.foo".into(), EndpointType::Service, addr())
            .await
            .unwrap();
        store
            .insert("owner-a", "bar-svc".into(), "cluster.bar".into(), EndpointType::Service, addr())
            .await
            .unwrap();
        let filter = EntryFilter { topic: Some("cluster.foo".into()), ..Default::default() };
        let results = store.select(&filter).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].topic, "cluster.foo");
    }
}
