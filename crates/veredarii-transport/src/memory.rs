//! In-process transport.
//!
//! Hosts registered on the same [`MemoryNetwork`] reach each other through
//! `tokio::io::duplex` pipes. Gossip fans out to every subscriber of a topic
//! and provider records live in one shared table, which is what a fully
//! meshed private swarm converges to.
//!
//! Closing a connection resets every stream still open on it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::stream::ResetState;
use crate::{
    ConnectionGater, GossipMessage, Host, HostConfig, HostEvent, Keypair, PeerAddr, PeerId, Stream,
    StreamProtocol, TransportError,
};

struct HostSlot {
    events: mpsc::Sender<HostEvent>,
    gater: ConnectionGater,
}

struct Subscriber {
    peer: PeerId,
    tx: mpsc::Sender<GossipMessage>,
}

#[derive(Default)]
struct Hub {
    hosts: HashMap<PeerId, HostSlot>,
    links: HashSet<(PeerId, PeerId)>,
    streams: HashMap<(PeerId, PeerId), Vec<Weak<ResetState>>>,
    providers: HashMap<Vec<u8>, Vec<PeerId>>,
    topics: HashMap<String, Vec<Subscriber>>,
}

fn link(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl Hub {
    /// Drop a link and reset the streams that ran over it.
    fn close_link(&mut self, pair: (PeerId, PeerId)) -> bool {
        let existed = self.links.remove(&pair);
        for state in self.streams.remove(&pair).unwrap_or_default() {
            if let Some(state) = state.upgrade() {
                state.trip();
            }
        }
        existed
    }

    fn track_stream(&mut self, pair: (PeerId, PeerId), state: &Arc<ResetState>) {
        let streams = self.streams.entry(pair).or_default();
        streams.retain(|s| s.strong_count() > 0);
        streams.push(Arc::downgrade(state));
    }
}

/// A shared in-process switchboard for [`MemoryHost`]s.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host for `keypair` on this network.
    pub async fn host(
        &self,
        keypair: &Keypair,
        config: HostConfig,
    ) -> Result<Arc<MemoryHost>, TransportError> {
        let peer_id = keypair.peer_id();
        let (tx, rx) = mpsc::channel(config.recv_buffer);

        let mut hub = self.hub.lock().await;
        if hub.hosts.contains_key(&peer_id) {
            return Err(TransportError::Config(format!(
                "peer {peer_id} is already registered"
            )));
        }
        hub.hosts.insert(
            peer_id,
            HostSlot {
                events: tx,
                gater: ConnectionGater::new(config.gate.clone()),
            },
        );
        tracing::debug!(peer = %peer_id, "memory host registered");

        Ok(Arc::new(MemoryHost {
            peer_id,
            config,
            hub: self.hub.clone(),
            events: Mutex::new(rx),
        }))
    }
}

/// A [`Host`] living on a [`MemoryNetwork`].
pub struct MemoryHost {
    peer_id: PeerId,
    config: HostConfig,
    hub: Arc<Mutex<Hub>>,
    events: Mutex<mpsc::Receiver<HostEvent>>,
}

impl MemoryHost {
    /// Address other hosts can dial.
    pub fn local_addr(&self) -> PeerAddr {
        PeerAddr::new(self.config.listen_address.clone(), self.peer_id)
    }

    /// Leave the network: drop every connection and close the event channel.
    pub async fn shutdown(&self) {
        let notify = {
            let mut hub = self.hub.lock().await;
            hub.hosts.remove(&self.peer_id);
            let me = self.peer_id;
            let closed: Vec<(PeerId, PeerId)> = hub
                .links
                .iter()
                .filter(|(a, b)| *a == me || *b == me)
                .copied()
                .collect();
            let mut notify = Vec::new();
            for pair in closed {
                hub.close_link(pair);
                let other = if pair.0 == me { pair.1 } else { pair.0 };
                if let Some(slot) = hub.hosts.get(&other) {
                    notify.push(slot.events.clone());
                }
            }
            for subscribers in hub.topics.values_mut() {
                subscribers.retain(|s| s.peer != me);
            }
            for providers in hub.providers.values_mut() {
                providers.retain(|p| *p != me);
            }
            notify
        };
        for events in notify {
            let _ = events.send(HostEvent::Disconnected(self.peer_id)).await;
        }
        tracing::debug!(peer = %self.peer_id, "memory host shut down");
    }

    async fn dial(&self, peer: PeerId) -> Result<(), TransportError> {
        if peer == self.peer_id {
            return Err(TransportError::Connect {
                peer,
                reason: "cannot dial self".into(),
            });
        }

        let (local_events, remote_events) = {
            let mut hub = self.hub.lock().await;
            let local = hub.hosts.get(&self.peer_id).ok_or(TransportError::Shutdown)?;
            if !local.gater.allow_dial(&peer) {
                return Err(TransportError::Gated { peer });
            }
            let local_events = local.events.clone();
            let remote = hub.hosts.get(&peer).ok_or_else(|| TransportError::Connect {
                peer,
                reason: "no route to peer".into(),
            })?;
            if !remote.gater.allow_accept(&self.peer_id) {
                return Err(TransportError::Gated { peer });
            }
            let remote_events = remote.events.clone();
            if !hub.links.insert(link(self.peer_id, peer)) {
                return Ok(());
            }
            (local_events, remote_events)
        };

        tracing::debug!(local = %self.peer_id, remote = %peer, "connection established");
        let _ = remote_events.send(HostEvent::Connected(self.peer_id)).await;
        let _ = local_events.send(HostEvent::Connected(peer)).await;
        Ok(())
    }
}

#[async_trait]
impl Host for MemoryHost {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }

    async fn connect(&self, addr: &PeerAddr) -> Result<(), TransportError> {
        self.dial(addr.peer_id()).await
    }

    async fn disconnect(&self, peer: PeerId) -> Result<(), TransportError> {
        let events = {
            let mut hub = self.hub.lock().await;
            if !hub.close_link(link(self.peer_id, peer)) {
                return Ok(());
            }
            let local = hub.hosts.get(&self.peer_id).map(|s| s.events.clone());
            let remote = hub.hosts.get(&peer).map(|s| s.events.clone());
            (local, remote)
        };

        tracing::debug!(local = %self.peer_id, remote = %peer, "connection closed");
        if let Some(local) = events.0 {
            let _ = local.send(HostEvent::Disconnected(peer)).await;
        }
        if let Some(remote) = events.1 {
            let _ = remote.send(HostEvent::Disconnected(self.peer_id)).await;
        }
        Ok(())
    }

    async fn connected_peers(&self) -> Vec<PeerId> {
        let hub = self.hub.lock().await;
        hub.links
            .iter()
            .filter_map(|(a, b)| {
                if *a == self.peer_id {
                    Some(*b)
                } else if *b == self.peer_id {
                    Some(*a)
                } else {
                    None
                }
            })
            .collect()
    }

    async fn open_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
    ) -> Result<Stream, TransportError> {
        let connected = self
            .hub
            .lock()
            .await
            .links
            .contains(&link(self.peer_id, peer));
        if !connected {
            self.dial(peer).await?;
        }

        let state = Arc::new(ResetState::default());
        let remote_events = {
            let mut hub = self.hub.lock().await;
            let pair = link(self.peer_id, peer);
            if !hub.links.contains(&pair) {
                return Err(TransportError::NotConnected(peer));
            }
            let events = hub
                .hosts
                .get(&peer)
                .map(|s| s.events.clone())
                .ok_or(TransportError::NotConnected(peer))?;
            hub.track_stream(pair, &state);
            events
        };

        let (local, remote) = tokio::io::duplex(self.config.stream_window);
        remote_events
            .send(HostEvent::Inbound(Stream::with_state(
                self.peer_id,
                protocol,
                remote,
                state.clone(),
            )))
            .await
            .map_err(|_| TransportError::NotConnected(peer))?;
        tracing::trace!(%peer, %protocol, "stream opened");
        Ok(Stream::with_state(peer, protocol, local, state))
    }

    async fn next_event(&self) -> Option<HostEvent> {
        self.events.lock().await.recv().await
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<GossipMessage>, TransportError> {
        let (tx, rx) = mpsc::channel(self.config.gossip_buffer);
        let mut hub = self.hub.lock().await;
        hub.topics.entry(topic.to_string()).or_default().push(Subscriber {
            peer: self.peer_id,
            tx,
        });
        tracing::debug!(peer = %self.peer_id, topic, "subscribed");
        Ok(rx)
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError> {
        let targets: Vec<mpsc::Sender<GossipMessage>> = {
            let mut hub = self.hub.lock().await;
            let Some(subscribers) = hub.topics.get_mut(topic) else {
                return Ok(());
            };
            subscribers.retain(|s| !s.tx.is_closed());
            subscribers
                .iter()
                .filter(|s| s.peer != self.peer_id)
                .map(|s| s.tx.clone())
                .collect()
        };

        let message = GossipMessage {
            topic: topic.to_string(),
            source: self.peer_id,
            data,
        };
        for tx in targets {
            if tx.try_send(message.clone()).is_err() {
                tracing::warn!(topic, "gossip subscriber lagging, message dropped");
            }
        }
        Ok(())
    }

    async fn provide(&self, key: &[u8]) -> Result<(), TransportError> {
        let mut hub = self.hub.lock().await;
        let providers = hub.providers.entry(key.to_vec()).or_default();
        if !providers.contains(&self.peer_id) {
            providers.push(self.peer_id);
        }
        Ok(())
    }

    async fn find_providers(&self, key: &[u8], limit: usize) -> Result<Vec<PeerId>, TransportError> {
        let hub = self.hub.lock().await;
        Ok(hub
            .providers
            .get(key)
            .map(|providers| providers.iter().take(limit).copied().collect())
            .unwrap_or_default())
    }
}
