//! Role-based authorization.
//!
//! Policies are `(subject, domain, object, action)` tuples where the domain
//! is a network name, the object a stream protocol id and the action a
//! service name. Subjects are always entity names: a peer only reaches the
//! engine through the entity its session resolved to.
//!
//! The policy file uses the familiar CSV layout:
//!
//! ```text
//! # subject, network, protocol, service
//! p, Hospital-A, health-net, /veredarii/api-proxy/1.0.0, lab-results
//! # entity inherits a role inside one network
//! g, Clinic-B, reader, health-net
//! p, reader, health-net, /veredarii/query/1.0.0, admissions
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use tokio::sync::RwLock;
use veredarii_transport::PeerId;

use crate::ProtocolError;

/// Capability interface over a policy store.
pub trait PolicyEngine: Send + Sync + 'static {
    /// Exact match on all four fields.
    fn is_allowed(&self, subject: &str, domain: &str, object: &str, action: &str) -> bool;

    /// Any policy for `(subject, domain, object, *)`.
    fn has_any(&self, subject: &str, domain: &str, object: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Policy {
    subject: String,
    domain: String,
    object: String,
    action: String,
}

/// In-memory policy table, optionally loaded from a CSV file.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    policies: HashSet<Policy>,
    /// (member, domain) → roles
    roles: HashMap<(String, String), Vec<String>>,
}

impl PolicyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self, ProtocolError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ProtocolError::Config(format!("cannot read policy file {}: {e}", path.display()))
        })?;
        Self::from_csv(&text)
    }

    /// Parse `p` and `g` lines. Blank lines and `#` comments are skipped.
    pub fn from_csv(text: &str) -> Result<Self, ProtocolError> {
        let mut table = Self::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            match fields.as_slice() {
                ["p", subject, domain, object, action] => {
                    table.add_policy(*subject, *domain, *object, *action);
                }
                ["g", member, role, domain] => {
                    table.add_role(*member, *role, *domain);
                }
                _ => {
                    return Err(ProtocolError::Config(format!(
                        "policy line {}: cannot parse {line:?}",
                        index + 1
                    )))
                }
            }
        }
        Ok(table)
    }

    pub fn add_policy(
        &mut self,
        subject: impl Into<String>,
        domain: impl Into<String>,
        object: impl Into<String>,
        action: impl Into<String>,
    ) -> &mut Self {
        self.policies.insert(Policy {
            subject: subject.into(),
            domain: domain.into(),
            object: object.into(),
            action: action.into(),
        });
        self
    }

    /// `member` holds `role` inside `domain`.
    pub fn add_role(
        &mut self,
        member: impl Into<String>,
        role: impl Into<String>,
        domain: impl Into<String>,
    ) -> &mut Self {
        self.roles
            .entry((member.into(), domain.into()))
            .or_default()
            .push(role.into());
        self
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// The subject itself plus every role it reaches in `domain`.
    fn subjects<'a>(&'a self, subject: &'a str, domain: &str) -> Vec<&'a str> {
        let mut seen: Vec<&str> = vec![subject];
        let mut index = 0;
        while index < seen.len() {
            let current = seen[index];
            if let Some(roles) = self.roles.get(&(current.to_string(), domain.to_string())) {
                for role in roles {
                    if !seen.contains(&role.as_str()) {
                        seen.push(role);
                    }
                }
            }
            index += 1;
        }
        seen
    }
}

impl PolicyEngine for PolicyTable {
    fn is_allowed(&self, subject: &str, domain: &str, object: &str, action: &str) -> bool {
        self.subjects(subject, domain).into_iter().any(|s| {
            self.policies.contains(&Policy {
                subject: s.to_string(),
                domain: domain.to_string(),
                object: object.to_string(),
                action: action.to_string(),
            })
        })
    }

    fn has_any(&self, subject: &str, domain: &str, object: &str) -> bool {
        let subjects = self.subjects(subject, domain);
        self.policies.iter().any(|p| {
            p.domain == domain && p.object == object && subjects.contains(&p.subject.as_str())
        })
    }
}

/// Authorization gate: resolves peers to entities, then asks the engine.
///
/// Both checks fail closed when the peer has no binding.
pub struct Authorizer {
    engine: Arc<dyn PolicyEngine>,
    pub(crate) bindings: RwLock<HashMap<PeerId, String>>,
}

impl Authorizer {
    pub fn new(engine: Arc<dyn PolicyEngine>) -> Self {
        Self {
            engine,
            bindings: RwLock::new(HashMap::new()),
        }
    }

    pub async fn entity_of(&self, peer: &PeerId) -> Option<String> {
        self.bindings.read().await.get(peer).cloned()
    }

    /// Does the peer's entity hold any policy for this protocol?
    pub async fn has_access_to_protocol(&self, peer: &PeerId, network: &str, protocol: &str) -> bool {
        let Some(entity) = self.entity_of(peer).await else {
            tracing::debug!(%peer, network, protocol, "denied: no session");
            return false;
        };
        let allowed = self.engine.has_any(&entity, network, protocol);
        if !allowed {
            tracing::debug!(%peer, entity = %entity, network, protocol, "denied: no policy for protocol");
        }
        allowed
    }

    /// Is the peer's entity allowed to call `service` over `protocol`?
    pub async fn allowed(&self, peer: &PeerId, network: &str, protocol: &str, service: &str) -> bool {
        let Some(entity) = self.entity_of(peer).await else {
            tracing::debug!(%peer, network, protocol, service, "denied: no session");
            return false;
        };
        let allowed = self.engine.is_allowed(&entity, network, protocol, service);
        if allowed {
            tracing::debug!(%peer, entity = %entity, network, protocol, service, "allowed");
        } else {
            tracing::debug!(%peer, entity = %entity, network, protocol, service, "denied");
        }
        allowed
    }

    /// [`Self::has_access_to_protocol`], failing with [`ProtocolError::Unauthorized`].
    pub async fn require_protocol(
        &self,
        peer: &PeerId,
        network: &str,
        protocol: &str,
    ) -> Result<(), ProtocolError> {
        if self.has_access_to_protocol(peer, network, protocol).await {
            Ok(())
        } else {
            Err(ProtocolError::Unauthorized)
        }
    }

    /// [`Self::allowed`], failing with [`ProtocolError::Unauthorized`].
    pub async fn require(
        &self,
        peer: &PeerId,
        network: &str,
        protocol: &str,
        service: &str,
    ) -> Result<(), ProtocolError> {
        if self.allowed(peer, network, protocol, service).await {
            Ok(())
        } else {
            Err(ProtocolError::Unauthorized)
        }
    }
}
