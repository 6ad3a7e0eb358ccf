use crate::PeerId;

/// Errors returned by the Veredarii transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection to {peer} failed: {reason}")]
    Connect { peer: PeerId, reason: String },

    #[error("connection to {peer} refused by gater")]
    Gated { peer: PeerId },

    #[error("peer {0} is not connected")]
    NotConnected(PeerId),

    #[error("stream i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("length prefix overflows a u64 varint")]
    VarintOverflow,

    #[error("host is shut down")]
    Shutdown,

    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),

    #[error("invalid peer address: {0}")]
    InvalidAddress(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}
