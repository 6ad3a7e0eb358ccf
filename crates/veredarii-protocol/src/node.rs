//! The per-network node: owns every piece of shared state and wires the
//! protocol handlers to the host.
//!
//! Nothing here is global. Each [`NetworkNode`] holds its own entity map,
//! sessions, authorizer, replay cache and join limiter, and passes itself
//! to the handlers, so several nodes can live in one process (as the
//! integration tests do).

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use veredarii_dht::{DiscoveryConfig, ServiceDiscovery};
use veredarii_transport::{Host, HostEvent, Keypair, PeerAddr, PeerId, Stream};

use crate::config::NetworkConfig;
use crate::crypto::SymmetricKey;
use crate::entities::MasterEntities;
use crate::invitation::Invitation;
use crate::metrics::{MetricsSnapshot, NodeMetrics};
use crate::proxy::{HttpBackend, ProxyClient, ServiceBackend};
use crate::query::{self, QueryDescriptor, QueryEngine, QueryTransfer};
use crate::ratelimit::RateLimiter;
use crate::rbac::{Authorizer, PolicyEngine, PolicyTable};
use crate::replay::ReplayCache;
use crate::session::SessionRegistry;
use crate::{auth, files, join, monitor, protocols, ProtocolError};

pub struct NetworkNode {
    pub(crate) config: NetworkConfig,
    pub(crate) entity: String,
    pub(crate) identity: Keypair,
    pub(crate) entity_key: Keypair,
    pub(crate) host: Arc<dyn Host>,
    pub(crate) pivots: Vec<PeerAddr>,
    pub(crate) entities: MasterEntities,
    pub(crate) sessions: SessionRegistry,
    pub(crate) authz: Authorizer,
    pub(crate) replay: ReplayCache,
    pub(crate) join_limiter: RateLimiter,
    pub(crate) invitation_key: Option<SymmetricKey>,
    pub(crate) members_key: SymmetricKey,
    pub(crate) discovery: ServiceDiscovery,
    pub(crate) backend: Arc<dyn ServiceBackend>,
    pub(crate) engine: Option<Arc<dyn QueryEngine>>,
    pub(crate) metrics: NodeMetrics,
}

/// Assembles a [`NetworkNode`]. Collaborators not supplied are built from
/// the configuration.
pub struct NetworkNodeBuilder {
    config: NetworkConfig,
    entity: String,
    identity: Keypair,
    host: Arc<dyn Host>,
    entity_key: Option<Keypair>,
    policy: Option<Arc<dyn PolicyEngine>>,
    backend: Option<Arc<dyn ServiceBackend>>,
    engine: Option<Arc<dyn QueryEngine>>,
    invitation_key: Option<SymmetricKey>,
}

impl NetworkNodeBuilder {
    /// Key the node's entity signs claims with. Defaults to the node identity.
    pub fn entity_key(mut self, key: Keypair) -> Self {
        self.entity_key = Some(key);
        self
    }

    /// Policy engine. Defaults to the configured policy file, or an empty table.
    pub fn policy(mut self, engine: Arc<dyn PolicyEngine>) -> Self {
        self.policy = Some(engine);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn ServiceBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn query_engine(mut self, engine: Arc<dyn QueryEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Invitation key. Defaults to deriving it from the configured passphrase.
    pub fn invitation_key(mut self, key: SymmetricKey) -> Self {
        self.invitation_key = Some(key);
        self
    }

    pub fn build(self) -> Result<Arc<NetworkNode>, ProtocolError> {
        let config = self.config;
        config.validate()?;
        if self.entity.is_empty() {
            return Err(ProtocolError::Config("entity name is empty".into()));
        }
        if self.identity.peer_id() != self.host.local_peer_id() {
            return Err(ProtocolError::Config(
                "identity key does not belong to the host".into(),
            ));
        }

        let entity_key = self.entity_key.unwrap_or_else(|| self.identity.clone());
        let mut known = config.entity_keys()?;
        known.push((self.entity.clone(), entity_key.public()));

        let policy: Arc<dyn PolicyEngine> = match (self.policy, &config.policy_file) {
            (Some(engine), _) => engine,
            (None, Some(path)) => Arc::new(PolicyTable::load(path)?),
            (None, None) => {
                tracing::warn!(network = %config.name, "no policy configured, every request will be denied");
                Arc::new(PolicyTable::new())
            }
        };
        let invitation_key = match self.invitation_key {
            Some(key) => Some(key),
            None => config.invitation.derive_key()?,
        };
        let backend: Arc<dyn ServiceBackend> = match self.backend {
            Some(backend) => backend,
            None => Arc::new(HttpBackend::new()?),
        };
        let discovery = ServiceDiscovery::new(
            self.host.clone(),
            DiscoveryConfig {
                protocol_prefix: config.discovery_prefix.clone(),
                ..DiscoveryConfig::default()
            },
        );

        Ok(Arc::new(NetworkNode {
            pivots: config.pivot_addrs()?,
            members_key: SymmetricKey::for_members_topic(&config.swarm_key()?),
            replay: ReplayCache::new(config.replay_ttl()),
            join_limiter: RateLimiter::new(config.join_limit),
            entities: MasterEntities::from_entries(known),
            sessions: SessionRegistry::new(),
            authz: Authorizer::new(policy),
            metrics: NodeMetrics::new(),
            entity: self.entity,
            identity: self.identity,
            entity_key,
            host: self.host,
            invitation_key,
            discovery,
            backend,
            engine: self.engine,
            config,
        }))
    }
}

impl NetworkNode {
    pub fn builder(
        config: NetworkConfig,
        entity: impl Into<String>,
        identity: Keypair,
        host: Arc<dyn Host>,
    ) -> NetworkNodeBuilder {
        NetworkNodeBuilder {
            config,
            entity: entity.into(),
            identity,
            host,
            entity_key: None,
            policy: None,
            backend: None,
            engine: None,
            invitation_key: None,
        }
    }

    pub fn network(&self) -> &str {
        &self.config.name
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn peer_id(&self) -> PeerId {
        self.host.local_peer_id()
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    pub fn entities(&self) -> &MasterEntities {
        &self.entities
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn authorizer(&self) -> &Authorizer {
        &self.authz
    }

    pub fn discovery(&self) -> &ServiceDiscovery {
        &self.discovery
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    // ── Inbound ───────────────────────────────────────────────────────

    /// Route an inbound stream to its protocol handler.
    pub async fn handle_stream(&self, stream: Stream) {
        let protocol = stream.protocol();
        match protocol.as_str() {
            protocols::AUTH_ID => auth::handle_inbound(self, stream).await,
            protocols::JOIN_ID => join::handle_inbound(self, stream).await,
            protocols::API_PROXY_ID => crate::proxy::handle_inbound(self, stream).await,
            protocols::QUERY_ID => query::handle_inbound(self, stream).await,
            protocols::FILE_FETCH_ID => files::handle_fetch(self, stream).await,
            protocols::FILE_STAT_ID => files::handle_stat(self, stream).await,
            other => {
                tracing::debug!(peer = %stream.remote_peer(), protocol = other, "no handler for protocol");
                stream.reset();
            }
        }
    }

    /// React to a host event. Inbound streams are handled inline.
    pub async fn handle_event(&self, event: HostEvent) {
        match event {
            HostEvent::Inbound(stream) => self.handle_stream(stream).await,
            HostEvent::Connected(peer) => tracing::debug!(%peer, "peer connected"),
            HostEvent::Disconnected(peer) => {
                self.sessions.teardown(&self.authz, &peer).await;
            }
        }
    }

    // ── Outbound ──────────────────────────────────────────────────────

    /// Run the authentication handshake against a connected peer.
    ///
    /// Returns how many entities the peer's snapshot taught us.
    pub async fn authenticate(&self, peer: PeerId) -> Result<usize, ProtocolError> {
        auth::authenticate(self, peer).await
    }

    /// Dial `addr`, then authenticate.
    pub async fn connect(&self, addr: &PeerAddr) -> Result<usize, ProtocolError> {
        self.host.connect(addr).await?;
        self.authenticate(addr.peer_id()).await
    }

    /// Resolve the peer providing `service`.
    pub async fn find_provider(&self, service: &str) -> Result<PeerId, ProtocolError> {
        self.discovery
            .find_provider(service)
            .await?
            .ok_or_else(|| ProtocolError::NoProvider(service.to_string()))
    }

    /// Forward one raw request to whichever peer provides `service`.
    pub async fn call_service(&self, service: &str, request: Vec<u8>) -> Result<Vec<u8>, ProtocolError> {
        let provider = self.find_provider(service).await?;
        let mut client = ProxyClient::open(self.host.as_ref(), provider).await?;
        client.call(service, request).await
    }

    /// Run a query on the provider of `service`, writing the result to `output`.
    pub async fn query(
        &self,
        service: &str,
        descriptor: &QueryDescriptor,
        output: &Path,
    ) -> Result<QueryTransfer, ProtocolError> {
        let provider = self.find_provider(service).await?;
        let mut stream = self.host.open_stream(provider, protocols::QUERY).await?;
        let transfer = query::fetch_results(&mut stream, service, descriptor, output).await?;
        tracing::debug!(service, %provider, envelopes = transfer.envelopes, bytes = transfer.bytes, "query complete");
        Ok(transfer)
    }

    /// Download a FILE resource from its provider.
    pub async fn fetch_file(&self, name: &str, output: &Path) -> Result<u64, ProtocolError> {
        let provider = self.find_provider(name).await?;
        files::fetch_file(self.host.as_ref(), provider, name, output).await
    }

    /// Size of a FILE resource on its provider.
    pub async fn remote_stat(&self, name: &str) -> Result<Option<u64>, ProtocolError> {
        let provider = self.find_provider(name).await?;
        files::remote_stat(self.host.as_ref(), provider, name).await
    }

    /// Mint an invitation token for `guest`, valid for `validity`.
    pub fn invite(&self, guest: &str, validity: chrono::Duration) -> Result<String, ProtocolError> {
        let key = self
            .invitation_key
            .as_ref()
            .ok_or_else(|| ProtocolError::Config("onboarding is not configured".into()))?;
        Invitation::new(self.entity.as_str(), guest, self.config.name.as_str(), Utc::now() + validity)
            .seal(key)
    }

    // ── Runtime ───────────────────────────────────────────────────────

    /// Spawn the event loop and background tasks.
    pub async fn start(self: &Arc<Self>) -> Result<NodeHandle, ProtocolError> {
        let members = self.host.subscribe(join::MEMBERS_TOPIC).await?;
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        tasks.spawn(run_events(self.clone(), cancel.clone()));
        tasks.spawn(join::run_member_listener(self.clone(), members, cancel.clone()));
        tasks.spawn(sweep_replay_cache(self.clone(), cancel.clone()));
        tasks.spawn(monitor::run(self.clone(), cancel.clone()));
        for service in self.config.resources.names() {
            let discovery = self.discovery.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { discovery.advertise(service, cancel).await });
        }

        tracing::info!(
            network = %self.config.name,
            entity = %self.entity,
            peer = %self.peer_id(),
            pivots = self.pivots.len(),
            "node started"
        );
        Ok(NodeHandle {
            node: self.clone(),
            cancel,
            tasks,
        })
    }
}

async fn run_events(node: Arc<NetworkNode>, cancel: CancellationToken) {
    let mut streams = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(finished) = streams.join_next(), if !streams.is_empty() => {
                if let Err(e) = finished {
                    if e.is_panic() {
                        tracing::warn!("stream handler panicked: {e}");
                    }
                }
            }
            event = node.host.next_event() => match event {
                Some(HostEvent::Inbound(stream)) => {
                    let node = node.clone();
                    streams.spawn(async move { node.handle_stream(stream).await });
                }
                Some(event) => node.handle_event(event).await,
                None => break,
            },
        }
    }
    streams.shutdown().await;
    tracing::debug!(network = %node.config.name, "event loop stopped");
}

async fn sweep_replay_cache(node: Arc<NetworkNode>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(node.config.replay_sweep_interval());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let evicted = node.replay.evict_expired().await;
                if evicted > 0 {
                    tracing::debug!(evicted, "replay cache swept");
                }
            }
        }
    }
}

/// Running node. Dropping it aborts the background tasks;
/// [`shutdown`](Self::shutdown) stops them cleanly.
pub struct NodeHandle {
    node: Arc<NetworkNode>,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl NodeHandle {
    pub fn node(&self) -> &Arc<NetworkNode> {
        &self.node
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        while let Some(finished) = self.tasks.join_next().await {
            if let Err(e) = finished {
                if e.is_panic() {
                    tracing::warn!("node task panicked: {e}");
                }
            }
        }
        tracing::info!(network = %self.node.config.name, "node stopped");
    }
}
