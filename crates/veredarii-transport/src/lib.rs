//! Veredarii transport layer.
//!
//! Peer identity, stream-oriented connectivity, gossip topics and DHT
//! provider records behind the [`Host`] trait. Protocol crates only talk to
//! a `dyn Host`; [`MemoryNetwork`] provides an in-process implementation.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use veredarii_transport::{Host, HostConfig, Keypair, MemoryNetwork, StreamProtocol};
//! use tokio::io::AsyncWriteExt;
//!
//! # async fn example() -> Result<(), veredarii_transport::TransportError> {
//! const ECHO: StreamProtocol = StreamProtocol::new("/echo/1.0.0");
//!
//! let network = MemoryNetwork::new();
//! let a = network.host(&Keypair::generate(), HostConfig::new()).await?;
//! let b = network.host(&Keypair::generate(), HostConfig::new()).await?;
//!
//! a.connect(&b.local_addr()).await?;
//! let mut stream = a.open_stream(b.local_peer_id(), ECHO).await?;
//! stream.write_all(b"hello").await?;
//! # Ok(())
//! # }
//! ```

mod addr;
mod config;
mod error;
mod framing;
mod gater;
mod host;
mod identity;
mod memory;
mod stream;

pub use addr::PeerAddr;
pub use config::HostConfig;
pub use error::TransportError;
pub use framing::{read_bounded, read_delimited, read_framed, write_delimited, write_framed};
pub use gater::{ConnectionGater, GatePolicy};
pub use host::{GossipMessage, Host, HostEvent};
pub use identity::{Keypair, PublicKey};
pub use memory::{MemoryHost, MemoryNetwork};
pub use stream::{Stream, StreamProtocol};

use std::fmt;
use std::str::FromStr;

/// Peer identity: an Ed25519 public key.
///
/// Displayed and parsed as a 64-character hex string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Create from raw public key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw 32-byte public key.
    pub fn as_bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hex::encode(self.0);
        write!(f, "PeerId({}...)", &hex[..12])
    }
}

impl FromStr for PeerId {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| TransportError::InvalidPeerId(s.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| TransportError::InvalidPeerId(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl serde::Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for PeerId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_hex_roundtrip() {
        let id = PeerId::from_bytes([7u8; 32]);
        let parsed: PeerId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.to_string().len(), 64);
    }

    #[test]
    fn peer_id_rejects_wrong_length() {
        assert!("abcd".parse::<PeerId>().is_err());
        assert!("zz".repeat(32).parse::<PeerId>().is_err());
    }

    #[test]
    fn peer_id_debug_is_short() {
        let id = PeerId::from_bytes([0xab; 32]);
        assert_eq!(format!("{id:?}"), "PeerId(abababababab...)");
    }

    #[test]
    fn peer_id_serde_as_string() {
        let id = PeerId::from_bytes([1u8; 32]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
