//! Node configuration, loaded from a JSON file.
//!
//! ```json
//! {
//!   "identity": { "entity": "Hospital-A", "private_key_file": "keys/node.key" },
//!   "networks": [{
//!     "name": "health-net",
//!     "network_key": "9f1c...",
//!     "pivots": ["/ip4/10.0.0.1/udp/4001/quic-v1/p2p/ab12..."],
//!     "entities": [{ "name": "Hospital-A", "key": "CAESIK..." }],
//!     "resources": { "API": [{ "name": "lab-results", "resource": "http://127.0.0.1:3000" }] },
//!     "policy_file": "policy.csv",
//!     "invitation": { "passphrase": "...", "salt": "health-net-salt" }
//!   }],
//!   "gateway": { "listen_address": "127.0.0.1:8080" }
//! }
//! ```
//!
//! Every network field except `name` and `network_key` has a default.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use veredarii_transport::{GatePolicy, HostConfig, PeerAddr, PeerId, PublicKey};

use crate::crypto::{self, KdfParams, SymmetricKey};
use crate::ratelimit::RateLimitConfig;
use crate::resources::Resources;
use crate::ProtocolError;

/// Default hard cap on a join request body.
pub const DEFAULT_JOIN_BODY_LIMIT: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub identity: IdentityConfig,
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
    /// Local HTTP gateway onto remote resources. Off when absent.
    #[serde(default)]
    pub gateway: Option<GatewayConfig>,
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, ProtocolError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ProtocolError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| ProtocolError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.identity.entity.is_empty() {
            return Err(ProtocolError::Config("identity.entity is empty".into()));
        }
        let mut names = HashSet::new();
        for network in &self.networks {
            network.validate()?;
            if !names.insert(network.name.as_str()) {
                return Err(ProtocolError::Config(format!(
                    "network {} declared twice",
                    network.name
                )));
            }
        }
        if let Some(gateway) = &self.gateway {
            gateway.socket_addr()?;
        }
        Ok(())
    }

    pub fn network(&self, name: &str) -> Option<&NetworkConfig> {
        self.networks.iter().find(|n| n.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Entity this node speaks for.
    pub entity: String,
    /// Node identity key. Created on first start when missing.
    #[serde(alias = "priv_key_file")]
    pub private_key_file: PathBuf,
    /// Entity signing key, if distinct from the node key.
    #[serde(default)]
    pub entity_key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen_address: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:8080".into(),
        }
    }
}

impl GatewayConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ProtocolError> {
        self.listen_address.parse().map_err(|e| {
            ProtocolError::Config(format!("gateway listen_address {:?}: {e}", self.listen_address))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityKeyConfig {
    pub name: String,
    /// Public key, hex or base64, raw or protobuf-wrapped.
    pub key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InvitationConfig {
    pub passphrase: String,
    pub salt: String,
    pub kdf: KdfParams,
}

impl InvitationConfig {
    /// Derive the invitation key; `None` when onboarding is not configured.
    pub fn derive_key(&self) -> Result<Option<SymmetricKey>, ProtocolError> {
        if self.passphrase.is_empty() {
            return Ok(None);
        }
        crypto::derive_passphrase_key(&self.passphrase, self.salt.as_bytes(), self.kdf).map(Some)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateMode {
    #[default]
    AllowAll,
    Whitelist,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub mode: GateMode,
    /// Peer ids admitted in whitelist mode.
    pub peers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub name: String,
    /// Hex-encoded swarm key shared by all members.
    pub network_key: String,
    /// Bootstrap peers, `<addr>/p2p/<peer-id>`.
    pub pivots: Vec<String>,
    pub entities: Vec<EntityKeyConfig>,
    pub resources: Resources,
    /// Other members' services reachable through the local gateway.
    pub remote_resources: Resources,
    pub policy_file: Option<PathBuf>,
    pub invitation: InvitationConfig,
    pub join_limit: RateLimitConfig,
    pub join_body_limit: usize,
    pub replay_ttl_secs: u64,
    pub replay_sweep_secs: u64,
    pub monitor_interval_secs: u64,
    pub pivot_timeout_secs: u64,
    /// Rows per batch when a query descriptor asks for none.
    pub default_block_size: usize,
    /// Upper bound on rows per batch, whatever the descriptor asks for.
    pub max_block_size: usize,
    pub gate: GateConfig,
    pub discovery_prefix: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            network_key: String::new(),
            pivots: Vec::new(),
            entities: Vec::new(),
            resources: Resources::default(),
            remote_resources: Resources::default(),
            policy_file: None,
            invitation: InvitationConfig::default(),
            join_limit: RateLimitConfig::default(),
            join_body_limit: DEFAULT_JOIN_BODY_LIMIT,
            replay_ttl_secs: 60,
            replay_sweep_secs: 60,
            monitor_interval_secs: 30,
            pivot_timeout_secs: 10,
            default_block_size: 1000,
            max_block_size: 10_000,
            gate: GateConfig::default(),
            discovery_prefix: veredarii_dht::DEFAULT_PROTOCOL_PREFIX.to_string(),
        }
    }
}

impl NetworkConfig {
    pub fn new(name: impl Into<String>, network_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            network_key: network_key.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.name.is_empty() {
            return Err(ProtocolError::Config("network name is empty".into()));
        }
        self.swarm_key()?;
        self.pivot_addrs()?;
        self.entity_keys()?;
        self.gate_policy()?;
        if !(self.join_limit.rate > 0.0) || self.join_limit.burst == 0 {
            return Err(ProtocolError::Config(format!(
                "network {}: join_limit needs a positive rate and burst",
                self.name
            )));
        }
        if self.default_block_size == 0 || self.default_block_size > self.max_block_size {
            return Err(ProtocolError::Config(format!(
                "network {}: default_block_size must be between 1 and max_block_size ({})",
                self.name, self.max_block_size
            )));
        }
        if !self.invitation.passphrase.is_empty() && self.invitation.salt.len() < 8 {
            return Err(ProtocolError::Config(format!(
                "network {}: invitation salt must be at least 8 bytes",
                self.name
            )));
        }
        Ok(())
    }

    /// Decode the shared swarm key.
    pub fn swarm_key(&self) -> Result<Vec<u8>, ProtocolError> {
        let key = hex::decode(self.network_key.trim()).map_err(|e| {
            ProtocolError::Config(format!("network {}: undecodable network_key: {e}", self.name))
        })?;
        if key.is_empty() {
            return Err(ProtocolError::Config(format!(
                "network {}: network_key is empty",
                self.name
            )));
        }
        Ok(key)
    }

    pub fn pivot_addrs(&self) -> Result<Vec<PeerAddr>, ProtocolError> {
        self.pivots
            .iter()
            .map(|p| {
                p.parse().map_err(|e| {
                    ProtocolError::Config(format!("network {}: pivot {p}: {e}", self.name))
                })
            })
            .collect()
    }

    pub fn entity_keys(&self) -> Result<Vec<(String, PublicKey)>, ProtocolError> {
        self.entities
            .iter()
            .map(|e| {
                PublicKey::from_encoded(&e.key)
                    .map(|key| (e.name.clone(), key))
                    .map_err(|err| {
                        ProtocolError::Config(format!(
                            "network {}: entity {}: {err}",
                            self.name, e.name
                        ))
                    })
            })
            .collect()
    }

    pub fn gate_policy(&self) -> Result<GatePolicy, ProtocolError> {
        match self.gate.mode {
            GateMode::AllowAll => Ok(GatePolicy::AllowAll),
            GateMode::Whitelist => {
                let peers = self
                    .gate
                    .peers
                    .iter()
                    .map(|p| {
                        p.parse::<PeerId>().map_err(|e| {
                            ProtocolError::Config(format!("network {}: gate peer: {e}", self.name))
                        })
                    })
                    .collect::<Result<HashSet<_>, _>>()?;
                Ok(GatePolicy::Whitelist(peers))
            }
        }
    }

    /// Host settings for this network, with the configured gate applied.
    pub fn host_config(&self) -> Result<HostConfig, ProtocolError> {
        Ok(HostConfig::new().gate(self.gate_policy()?))
    }

    pub fn replay_ttl(&self) -> Duration {
        Duration::from_secs(self.replay_ttl_secs)
    }

    pub fn replay_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.replay_sweep_secs.max(1))
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }

    pub fn pivot_timeout(&self) -> Duration {
        Duration::from_secs(self.pivot_timeout_secs.max(1))
    }
}
