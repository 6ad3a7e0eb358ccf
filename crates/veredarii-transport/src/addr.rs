use std::fmt;
use std::str::FromStr;

use crate::{PeerId, TransportError};

/// A dialable peer address: `<transport-address>/p2p/<peer-id>`.
///
/// ```rust
/// use veredarii_transport::PeerAddr;
///
/// let id = "11".repeat(32);
/// let addr: PeerAddr = format!("/ip4/10.0.0.1/tcp/4001/p2p/{id}").parse().unwrap();
/// assert_eq!(addr.address(), "/ip4/10.0.0.1/tcp/4001");
/// ```
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    address: String,
    peer_id: PeerId,
}

impl PeerAddr {
    pub fn new(address: impl Into<String>, peer_id: PeerId) -> Self {
        Self {
            address: address.into(),
            peer_id,
        }
    }

    /// Transport part of the address (may be empty).
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/p2p/{}", self.address, self.peer_id)
    }
}

impl fmt::Debug for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerAddr({self})")
    }
}

impl FromStr for PeerAddr {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, peer) = s
            .rsplit_once("/p2p/")
            .ok_or_else(|| TransportError::InvalidAddress(s.to_string()))?;
        let peer_id = peer
            .parse()
            .map_err(|_| TransportError::InvalidAddress(s.to_string()))?;
        Ok(Self::new(address, peer_id))
    }
}
