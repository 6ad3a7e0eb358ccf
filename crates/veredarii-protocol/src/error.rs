/// Protocol-level errors for Veredarii.
///
/// Wraps transport and discovery errors and adds the validation,
/// authorization and configuration failures of the peer protocols.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("transport error: {0}")]
    Transport(#[from] veredarii_transport::TransportError),

    #[error("discovery error: {0}")]
    Discovery(#[from] veredarii_dht::DiscoveryError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sender key does not match connected peer {peer}")]
    IdentityMismatch { peer: String },

    #[error("claim signature already seen")]
    ReplayDetected,

    #[error("unknown entity: {entity}")]
    UnknownEntity { entity: String },

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("invitation does not match request: {field}")]
    InvitationMismatch { field: &'static str },

    #[error("invitation expired at {expired_at}")]
    InvitationExpired { expired_at: String },

    #[error("invitation could not be decrypted")]
    InvitationUndecryptable,

    #[error("malformed invitation: {0}")]
    MalformedInvitation(String),

    #[error("invalid envelope: {reason}")]
    InvalidEnvelope { reason: String },

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("access denied")]
    Unauthorized,

    #[error("rejected by peer")]
    Rejected,

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("no provider found for service {0}")]
    NoProvider(String),

    #[error("service backend failed: {0}")]
    Backend(String),

    #[error("query engine failed: {0}")]
    Engine(String),
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(e.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            ProtocolError::Serialization(e.to_string())
        } else {
            ProtocolError::Deserialization(e.to_string())
        }
    }
}
