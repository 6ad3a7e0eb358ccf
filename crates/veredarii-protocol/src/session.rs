//! Session registry: which entity each connected peer speaks for.
//!
//! Sessions and authorization bindings live in two maps with their own
//! locks. Establishing and tearing down always takes both write locks, in
//! the same order (sessions, then bindings), and releases them together,
//! so no reader ever sees one map updated without the other.
//!
//! A session is only recorded for a peer that is still connected when the
//! locks are held. The disconnect handler tears down under the same locks,
//! so a claim that finishes verifying after its connection dropped never
//! leaves a session behind.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::RwLock;
use veredarii_transport::{Host, PeerId, TransportError};

use crate::rbac::Authorizer;
use crate::ProtocolError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub peer: PeerId,
    pub entity: String,
    pub verified: bool,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<PeerId, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a verified peer and bind it for authorization.
    ///
    /// Fails with [`TransportError::NotConnected`] if `host` no longer has a
    /// connection to `peer`.
    pub async fn establish(
        &self,
        authz: &Authorizer,
        host: &dyn Host,
        peer: PeerId,
        entity: &str,
    ) -> Result<Session, ProtocolError> {
        let session = Session {
            peer,
            entity: entity.to_string(),
            verified: true,
        };
        let mut sessions = self.sessions.write().await;
        if !host.connected_peers().await.contains(&peer) {
            return Err(TransportError::NotConnected(peer).into());
        }
        let mut bindings = authz.bindings.write().await;
        sessions.insert(peer, session.clone());
        bindings.insert(peer, entity.to_string());
        drop(bindings);
        drop(sessions);

        tracing::info!(%peer, entity, "session established");
        Ok(session)
    }

    /// Drop a peer's session and binding. Returns the removed session.
    pub async fn teardown(&self, authz: &Authorizer, peer: &PeerId) -> Option<Session> {
        let mut sessions = self.sessions.write().await;
        let mut bindings = authz.bindings.write().await;
        let removed = sessions.remove(peer);
        bindings.remove(peer);
        drop(bindings);
        drop(sessions);

        if let Some(session) = &removed {
            tracing::info!(%peer, entity = %session.entity, "session removed");
        }
        removed
    }

    pub async fn get(&self, peer: &PeerId) -> Option<Session> {
        self.sessions.read().await.get(peer).cloned()
    }

    pub async fn contains(&self, peer: &PeerId) -> bool {
        self.sessions.read().await.contains_key(peer)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn all(&self) -> Vec<Session> {
        self.sessions.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbac::PolicyTable;
    use std::sync::Arc;
    use veredarii_transport::{HostConfig, Keypair, MemoryHost, MemoryNetwork};

    fn authorizer() -> Authorizer {
        let mut table = PolicyTable::new();
        table.add_policy("Hospital-A", "net", "/proxy", "svc");
        Authorizer::new(Arc::new(table))
    }

    /// A local host connected to one remote peer.
    async fn connected() -> (Arc<MemoryHost>, Arc<MemoryHost>) {
        let network = MemoryNetwork::new();
        let local = network.host(&Keypair::generate(), HostConfig::new()).await.unwrap();
        let remote = network.host(&Keypair::generate(), HostConfig::new()).await.unwrap();
        local.connect(&remote.local_addr()).await.unwrap();
        (local, remote)
    }

    #[tokio::test]
    async fn establish_binds_for_authorization() {
        let authz = authorizer();
        let registry = SessionRegistry::new();
        let (host, remote) = connected().await;
        let peer = remote.local_peer_id();

        let session = registry
            .establish(&authz, host.as_ref(), peer, "Hospital-A")
            .await
            .unwrap();
        assert!(session.verified);
        assert_eq!(registry.get(&peer).await, Some(session));
        assert_eq!(authz.entity_of(&peer).await.as_deref(), Some("Hospital-A"));
        assert!(authz.allowed(&peer, "net", "/proxy", "svc").await);
    }

    #[tokio::test]
    async fn teardown_removes_both() {
        let authz = authorizer();
        let registry = SessionRegistry::new();
        let (host, remote) = connected().await;
        let peer = remote.local_peer_id();
        registry
            .establish(&authz, host.as_ref(), peer, "Hospital-A")
            .await
            .unwrap();

        let removed = registry.teardown(&authz, &peer).await.unwrap();
        assert_eq!(removed.entity, "Hospital-A");
        assert!(!registry.contains(&peer).await);
        assert_eq!(authz.entity_of(&peer).await, None);
        assert!(!authz.allowed(&peer, "net", "/proxy", "svc").await);

        assert!(registry.teardown(&authz, &peer).await.is_none());
    }

    #[tokio::test]
    async fn re_establish_replaces_entity() {
        let authz = authorizer();
        let registry = SessionRegistry::new();
        let (host, remote) = connected().await;
        let peer = remote.local_peer_id();
        registry.establish(&authz, host.as_ref(), peer, "Hospital-A").await.unwrap();
        registry.establish(&authz, host.as_ref(), peer, "Clinic-B").await.unwrap();
        assert_eq!(registry.len().await, 1);
        assert_eq!(authz.entity_of(&peer).await.as_deref(), Some("Clinic-B"));
    }

    #[tokio::test]
    async fn establish_refuses_disconnected_peer() {
        let authz = authorizer();
        let registry = SessionRegistry::new();
        let (host, remote) = connected().await;
        let peer = remote.local_peer_id();
        host.disconnect(peer).await.unwrap();

        let err = registry
            .establish(&authz, host.as_ref(), peer, "Hospital-A")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Transport(TransportError::NotConnected(p)) if p == peer
        ));
        assert!(registry.is_empty().await);
        assert!(!authz.allowed(&peer, "net", "/proxy", "svc").await);
    }
}
