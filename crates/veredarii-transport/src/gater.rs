//! Dial and accept gating.
//!
//! A gater is consulted before any connection is established, in both
//! directions. Running without a whitelist is an explicit [`GatePolicy`]
//! value rather than a fallback.

use std::collections::HashSet;

use crate::PeerId;

/// What a host lets through.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GatePolicy {
    /// Every peer may dial and be dialed.
    #[default]
    AllowAll,
    /// Only the listed peers may dial and be dialed.
    Whitelist(HashSet<PeerId>),
}

#[derive(Debug, Clone)]
pub struct ConnectionGater {
    policy: GatePolicy,
}

impl ConnectionGater {
    pub fn new(policy: GatePolicy) -> Self {
        match &policy {
            GatePolicy::AllowAll => tracing::info!("connection gater running in permissive mode"),
            GatePolicy::Whitelist(peers) => {
                tracing::info!(peers = peers.len(), "connection gater restricted to whitelist")
            }
        }
        Self { policy }
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    fn permits(&self, peer: &PeerId) -> bool {
        match &self.policy {
            GatePolicy::AllowAll => true,
            GatePolicy::Whitelist(peers) => peers.contains(peer),
        }
    }

    /// May this host dial `peer`?
    pub fn allow_dial(&self, peer: &PeerId) -> bool {
        let allowed = self.permits(peer);
        if !allowed {
            tracing::debug!(%peer, "dial blocked by gater");
        }
        allowed
    }

    /// May `peer` connect to this host?
    pub fn allow_accept(&self, peer: &PeerId) -> bool {
        let allowed = self.permits(peer);
        if !allowed {
            tracing::debug!(%peer, "inbound connection blocked by gater");
        }
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_all_permits_everyone() {
        let gater = ConnectionGater::new(GatePolicy::AllowAll);
        let peer = PeerId::from_bytes([1u8; 32]);
        assert!(gater.allow_dial(&peer));
        assert!(gater.allow_accept(&peer));
    }

    #[test]
    fn whitelist_blocks_unknown_peers() {
        let known = PeerId::from_bytes([1u8; 32]);
        let stranger = PeerId::from_bytes([2u8; 32]);
        let gater = ConnectionGater::new(GatePolicy::Whitelist([known].into_iter().collect()));
        assert!(gater.allow_dial(&known));
        assert!(gater.allow_accept(&known));
        assert!(!gater.allow_dial(&stranger));
        assert!(!gater.allow_accept(&stranger));
    }

    #[test]
    fn default_policy_is_allow_all() {
        assert_eq!(GatePolicy::default(), GatePolicy::AllowAll);
    }
}
