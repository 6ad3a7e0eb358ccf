//! DHT-based service discovery for Veredarii networks.
//!
//! Every node announces itself as a provider for the services it hosts and
//! looks up providers by service name. Records are keyed by the SHA1 of the
//! protocol prefix and the service name, so unrelated applications sharing a
//! DHT never collide.

use std::sync::Arc;
use std::time::Duration;

use sha1::{Digest, Sha1};
use tokio_util::sync::CancellationToken;
use veredarii_transport::{Host, PeerId, TransportError};

/// Default namespace for provider records.
pub const DEFAULT_PROTOCOL_PREFIX: &str = "/veredarii-services";

/// Errors returned by discovery.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("dht operation failed: {0}")]
    Transport(#[from] TransportError),

    #[error("invalid service name: {0:?}")]
    InvalidServiceName(String),
}

/// Discovery tunables.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub protocol_prefix: String,
    /// How often provider records are re-announced.
    pub reprovide_interval: Duration,
    /// Upper bound on providers fetched per lookup.
    pub lookup_limit: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            protocol_prefix: DEFAULT_PROTOCOL_PREFIX.to_string(),
            reprovide_interval: Duration::from_secs(60 * 60),
            lookup_limit: 10,
        }
    }
}

/// Hash a service name into its 20-byte DHT key (SHA1).
pub fn service_key(prefix: &str, service: &str) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(prefix.as_bytes());
    hasher.update(b"/");
    hasher.update(service.as_bytes());
    hasher.finalize().into()
}

/// Advertises and resolves named services through the host's DHT.
#[derive(Clone)]
pub struct ServiceDiscovery {
    host: Arc<dyn Host>,
    config: DiscoveryConfig,
}

impl ServiceDiscovery {
    pub fn new(host: Arc<dyn Host>, config: DiscoveryConfig) -> Self {
        Self { host, config }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    fn key(&self, service: &str) -> Result<[u8; 20], DiscoveryError> {
        if service.is_empty() {
            return Err(DiscoveryError::InvalidServiceName(service.to_string()));
        }
        Ok(service_key(&self.config.protocol_prefix, service))
    }

    /// Announce once.
    pub async fn provide(&self, service: &str) -> Result<(), DiscoveryError> {
        let key = self.key(service)?;
        self.host.provide(&key).await?;
        tracing::debug!(service, "provider record announced");
        Ok(())
    }

    /// Announce now and then every `reprovide_interval` until cancelled.
    ///
    /// Failed announcements are logged and retried at the next tick.
    pub async fn advertise(&self, service: String, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.reprovide_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.provide(&service).await {
                        tracing::warn!(service = %service, "advertisement failed: {e}");
                    }
                }
            }
        }
        tracing::debug!(service = %service, "advertisement stopped");
    }

    /// Find a peer other than ourselves that provides `service`.
    ///
    /// No ranking is attempted: the first non-self provider wins.
    pub async fn find_provider(&self, service: &str) -> Result<Option<PeerId>, DiscoveryError> {
        let key = self.key(service)?;
        let local = self.host.local_peer_id();
        let providers = self
            .host
            .find_providers(&key, self.config.lookup_limit)
            .await?;
        let found = providers.into_iter().find(|p| *p != local);
        match found {
            Some(peer) => tracing::debug!(service, %peer, "provider found"),
            None => tracing::debug!(service, "no provider found"),
        }
        Ok(found)
    }
}
