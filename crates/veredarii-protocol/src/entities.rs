//! The master-entities map: entity name → public key.
//!
//! Grows through configuration, successful handshakes and membership
//! gossip. Nothing removes entries while the process runs.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use veredarii_transport::PublicKey;

use crate::ProtocolError;

/// Wire form of the map, sent to a freshly authenticated peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    /// Entity name → base64 public key.
    pub entities: BTreeMap<String, String>,
}

impl EntitySnapshot {
    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn from_json(data: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(data).map_err(Into::into)
    }
}

#[derive(Debug, Default)]
pub struct MasterEntities {
    entries: RwLock<HashMap<String, PublicKey>>,
}

impl MasterEntities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (String, PublicKey)>) -> Self {
        Self {
            entries: RwLock::new(entries.into_iter().collect()),
        }
    }

    pub async fn get(&self, entity: &str) -> Option<PublicKey> {
        self.entries.read().await.get(entity).copied()
    }

    /// Insert or replace. Returns `true` if the entity was new or its key changed.
    pub async fn insert(&self, entity: impl Into<String>, key: PublicKey) -> bool {
        let entity = entity.into();
        let mut entries = self.entries.write().await;
        let previous = entries.insert(entity, key);
        previous != Some(key)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> EntitySnapshot {
        let entries = self.entries.read().await;
        EntitySnapshot {
            entities: entries
                .iter()
                .map(|(name, key)| (name.clone(), key.to_base64()))
                .collect(),
        }
    }

    /// Merge a peer's snapshot. Entries with undecodable keys are skipped.
    ///
    /// Returns how many entries were added or changed.
    pub async fn merge(&self, snapshot: &EntitySnapshot) -> usize {
        let decoded: Vec<(String, PublicKey)> = snapshot
            .entities
            .iter()
            .filter_map(|(name, key)| match PublicKey::from_encoded(key) {
                Ok(key) => Some((name.clone(), key)),
                Err(e) => {
                    tracing::warn!(entity = %name, "skipping undecodable entity key: {e}");
                    None
                }
            })
            .collect();

        let mut entries = self.entries.write().await;
        let mut changed = 0;
        for (name, key) in decoded {
            if entries.insert(name, key) != Some(key) {
                changed += 1;
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veredarii_transport::Keypair;

    #[tokio::test]
    async fn insert_and_get() {
        let entities = MasterEntities::new();
        let key = Keypair::generate().public();
        assert!(entities.insert("Hospital-A", key).await);
        assert!(!entities.insert("Hospital-A", key).await);
        assert_eq!(entities.get("Hospital-A").await, Some(key));
        assert_eq!(entities.get("Hospital-B").await, None);
    }

    #[tokio::test]
    async fn snapshot_merge_roundtrip() {
        let a = Keypair::generate().public();
        let b = Keypair::generate().public();
        let source = MasterEntities::from_entries([("A".to_string(), a), ("B".to_string(), b)]);

        let json = source.snapshot().await.to_json().unwrap();
        let snapshot = EntitySnapshot::from_json(&json).unwrap();

        let target = MasterEntities::new();
        assert_eq!(target.merge(&snapshot).await, 2);
        assert_eq!(target.merge(&snapshot).await, 0);
        assert_eq!(target.get("A").await, Some(a));
        assert_eq!(target.get("B").await, Some(b));
    }

    #[tokio::test]
    async fn merge_skips_bad_keys() {
        let mut snapshot = EntitySnapshot::default();
        snapshot.entities.insert("bad".into(), "!!".into());
        snapshot
            .entities
            .insert("good".into(), Keypair::generate().public().to_base64());
        let target = MasterEntities::new();
        assert_eq!(target.merge(&snapshot).await, 1);
        assert_eq!(target.len().await, 1);
    }
}
