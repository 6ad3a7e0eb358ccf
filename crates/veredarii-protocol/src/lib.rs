//! Veredarii protocol layer.
//!
//! Runs the peer protocols of a private overlay on top of any
//! [`veredarii_transport::Host`]:
//!
//! - entity authentication with signed claims and replay protection,
//! - role-based authorization of every stream and every request,
//! - invitation-based onboarding with membership gossip,
//! - call forwarding and chunked query streaming over envelope streams,
//! - file fetch and file stat for shared files,
//! - a local HTTP gateway onto other members' services.
//!
//! A [`NetworkNode`] owns the state of one network and is the entry point.
//!
//! Wire formats: claims travel in a u32-prefixed MessagePack envelope,
//! proxy and query traffic in uvarint-prefixed MessagePack
//! [`ProtocolEnvelope`]s, join requests and snapshots as JSON.

pub mod auth;
pub mod claim;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod entities;
pub mod error;
pub mod files;
pub mod gateway;
pub mod invitation;
pub mod join;
pub mod metrics;
mod monitor;
pub mod node;
pub mod proxy;
pub mod query;
pub mod ratelimit;
pub mod rbac;
pub mod replay;
pub mod resources;
pub mod session;

pub use claim::{SealedEnvelope, SignedClaim};
pub use codec::{read_envelope, write_envelope, ProtocolEnvelope, MAX_ENVELOPE_SIZE};
pub use config::{GatewayConfig, IdentityConfig, NetworkConfig, NodeConfig};
pub use crypto::SymmetricKey;
pub use entities::{EntitySnapshot, MasterEntities};
pub use error::ProtocolError;
pub use gateway::LocalGateway;
pub use invitation::Invitation;
pub use join::{request_join, verify_join, JoinRequest, MEMBERS_TOPIC};
pub use metrics::{MetricsSnapshot, NodeMetrics};
pub use node::{NetworkNode, NetworkNodeBuilder, NodeHandle};
pub use proxy::{HttpBackend, ProxyClient, RawRequest, ServiceBackend};
pub use query::{
    QueryDescriptor, QueryEngine, QueryFormat, QueryTransfer, Row, RowCursor, VecCursor,
};
pub use rbac::{Authorizer, PolicyEngine, PolicyTable};
pub use resources::{Resources, ServiceDescriptor, ServiceKind};
pub use session::{Session, SessionRegistry};

/// Stream protocol identifiers.
///
/// The identifier strings double as the object field of RBAC policies.
pub mod protocols {
    use veredarii_transport::StreamProtocol;

    pub const AUTH_ID: &str = "/veredarii/auth/1.0.0";
    pub const JOIN_ID: &str = "/veredarii/join/1.0.0";
    pub const API_PROXY_ID: &str = "/veredarii/api-proxy/1.0.0";
    pub const QUERY_ID: &str = "/veredarii/query/1.0.0";
    pub const FILE_FETCH_ID: &str = "/veredarii/file-fetch/1.0.0";
    pub const FILE_STAT_ID: &str = "/veredarii/file-stat/1.0.0";

    pub const AUTH: StreamProtocol = StreamProtocol::new(AUTH_ID);
    pub const JOIN: StreamProtocol = StreamProtocol::new(JOIN_ID);
    pub const API_PROXY: StreamProtocol = StreamProtocol::new(API_PROXY_ID);
    pub const QUERY: StreamProtocol = StreamProtocol::new(QUERY_ID);
    pub const FILE_FETCH: StreamProtocol = StreamProtocol::new(FILE_FETCH_ID);
    pub const FILE_STAT: StreamProtocol = StreamProtocol::new(FILE_STAT_ID);

    /// Every protocol a node serves.
    pub const ALL: [StreamProtocol; 6] = [AUTH, JOIN, API_PROXY, QUERY, FILE_FETCH, FILE_STAT];
}
