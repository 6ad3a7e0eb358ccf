use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{PeerAddr, PeerId, Stream, StreamProtocol, TransportError};

/// Something the host wants the application to know about.
#[derive(Debug)]
pub enum HostEvent {
    /// A remote peer opened a stream to us.
    Inbound(Stream),
    /// A connection to a peer was established.
    Connected(PeerId),
    /// The last connection to a peer closed.
    Disconnected(PeerId),
}

/// A message received on a gossip topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipMessage {
    pub topic: String,
    pub source: PeerId,
    pub data: Vec<u8>,
}

/// A peer-to-peer host: identity, connections, streams, gossip and DHT.
///
/// Protocol code depends only on this trait, so tests can run whole
/// networks in-process over [`MemoryNetwork`](crate::MemoryNetwork).
#[async_trait]
pub trait Host: Send + Sync + 'static {
    /// This host's peer identity.
    fn local_peer_id(&self) -> PeerId;

    /// Dial a peer. Succeeds immediately when already connected.
    async fn connect(&self, addr: &PeerAddr) -> Result<(), TransportError>;

    /// Close every connection to a peer.
    async fn disconnect(&self, peer: PeerId) -> Result<(), TransportError>;

    /// Peers with at least one open connection.
    async fn connected_peers(&self) -> Vec<PeerId>;

    /// Open a new stream to a connected peer.
    async fn open_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
    ) -> Result<Stream, TransportError>;

    /// Wait for the next host event. `None` once the host is shut down.
    async fn next_event(&self) -> Option<HostEvent>;

    /// Join a gossip topic.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<GossipMessage>, TransportError>;

    /// Publish to every other subscriber of a topic.
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError>;

    /// Announce this host as a provider of `key`.
    async fn provide(&self, key: &[u8]) -> Result<(), TransportError>;

    /// Look up at most `limit` providers of `key`.
    async fn find_providers(&self, key: &[u8], limit: usize) -> Result<Vec<PeerId>, TransportError>;
}
