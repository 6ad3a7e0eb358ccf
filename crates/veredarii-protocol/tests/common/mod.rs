#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use veredarii_protocol::{
    NetworkConfig, NetworkNode, NetworkNodeBuilder, NodeHandle, ProtocolError, QueryEngine,
    RowCursor, ServiceBackend, ServiceDescriptor, SymmetricKey, VecCursor,
};
use veredarii_transport::{Keypair, MemoryHost, MemoryNetwork, PeerId};

pub const NETWORK: &str = "health-net";
pub const SWARM_KEY: &str = "00112233445566778899aabbccddeeff";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
}

pub fn invitation_key() -> SymmetricKey {
    SymmetricKey::new(&[42u8; 32]).unwrap()
}

pub fn network_config() -> NetworkConfig {
    NetworkConfig::new(NETWORK, SWARM_KEY)
}

pub struct TestNode {
    pub node: Arc<NetworkNode>,
    pub host: Arc<MemoryHost>,
    pub keypair: Keypair,
    handle: NodeHandle,
}

impl TestNode {
    pub fn peer(&self) -> PeerId {
        self.keypair.peer_id()
    }

    pub async fn shutdown(self) {
        self.handle.shutdown().await;
        self.host.shutdown().await;
    }
}

/// Build and start a node with an echo backend; `customize` may override anything.
pub async fn start_node(
    net: &MemoryNetwork,
    entity: &str,
    config: NetworkConfig,
    customize: impl FnOnce(NetworkNodeBuilder) -> NetworkNodeBuilder,
) -> TestNode {
    let keypair = Keypair::generate();
    let host = net.host(&keypair, config.host_config().unwrap()).await.unwrap();
    let builder = NetworkNode::builder(config, entity, keypair.clone(), host.clone())
        .backend(Arc::new(EchoBackend));
    let node = customize(builder).build().unwrap();
    let handle = node.start().await.unwrap();
    TestNode {
        node,
        host,
        keypair,
        handle,
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Wait until `node` can see a provider for `service`.
pub async fn wait_for_provider(node: &NetworkNode, service: &str) -> PeerId {
    for _ in 0..200 {
        if let Ok(peer) = node.find_provider(service).await {
            return peer;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no provider for {service}");
}

/// Answers `<service>:<request>`.
pub struct EchoBackend;

#[async_trait]
impl ServiceBackend for EchoBackend {
    async fn forward(
        &self,
        service: &ServiceDescriptor,
        request: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        let mut reply = format!("{}:", service.name).into_bytes();
        reply.extend_from_slice(request);
        Ok(reply)
    }
}

/// A fixed table of patients; remembers the last query text.
#[derive(Default)]
pub struct PatientsEngine {
    pub rows: usize,
    pub last_sql: Mutex<Option<String>>,
}

impl PatientsEngine {
    pub fn with_rows(rows: usize) -> Self {
        Self {
            rows,
            last_sql: Mutex::new(None),
        }
    }

    pub fn last_sql(&self) -> Option<String> {
        self.last_sql.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueryEngine for PatientsEngine {
    async fn query(&self, sql: &str) -> Result<Box<dyn RowCursor>, ProtocolError> {
        *self.last_sql.lock().unwrap() = Some(sql.to_string());
        let rows = (1..=self.rows).map(|i| vec![json!(i), json!(format!("patient-{i}"))]);
        Ok(Box::new(VecCursor::new(
            vec!["id".to_string(), "name".to_string()],
            rows,
        )))
    }

    async fn export_parquet(&self, sql: &str, destination: &Path) -> Result<(), ProtocolError> {
        *self.last_sql.lock().unwrap() = Some(sql.to_string());
        tokio::fs::write(destination, vec![0x50; 150 * 1024]).await?;
        Ok(())
    }
}
