mod common;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use common::{init_tracing, network_config, start_node, wait_for_provider, PatientsEngine, TestNode, NETWORK};
use serde_json::json;
use veredarii_protocol::config::NetworkConfig;
use veredarii_protocol::protocols::QUERY_ID;
use veredarii_protocol::query::{QueryEngine, Row, RowCursor, PARQUET_CHUNK_SIZE};
use veredarii_protocol::resources::ResourceEntry;
use veredarii_protocol::{PolicyTable, ProtocolError, QueryDescriptor, QueryFormat};
use veredarii_transport::MemoryNetwork;

/// Provider A hosts `admissions` (5 rows) and `staff`; only `admissions`
/// is granted to Clinic-B.
async fn setup(net: &MemoryNetwork, engine: Arc<dyn QueryEngine>) -> (TestNode, TestNode) {
    setup_with(net, engine, network_config()).await
}

async fn setup_with(
    net: &MemoryNetwork,
    engine: Arc<dyn QueryEngine>,
    mut config: NetworkConfig,
) -> (TestNode, TestNode) {
    config.resources.data_source = vec![
        ResourceEntry {
            name: "admissions".into(),
            resource: "/data/admissions.csv".into(),
        },
        ResourceEntry {
            name: "staff".into(),
            resource: "/data/staff.csv".into(),
        },
    ];
    let mut policy = PolicyTable::new();
    policy.add_policy("Clinic-B", NETWORK, QUERY_ID, "admissions");

    let a = start_node(net, "Hospital-A", config, |b| {
        b.policy(Arc::new(policy)).query_engine(engine)
    })
    .await;
    let b = start_node(net, "Clinic-B", network_config(), |b| b).await;
    a.node.entities().insert("Clinic-B", b.keypair.public()).await;
    b.node.connect(&a.host.local_addr()).await.unwrap();
    (a, b)
}

/// Yields `rows` rows, then fails.
struct BrokenEngine {
    rows: usize,
}

struct BrokenCursor {
    columns: Vec<String>,
    left: usize,
}

#[async_trait]
impl RowCursor for BrokenCursor {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<Row>, ProtocolError> {
        if self.left == 0 {
            return Err(ProtocolError::Engine("source file vanished".into()));
        }
        self.left -= 1;
        Ok(Some(vec![json!(self.left), json!("partial")]))
    }
}

#[async_trait]
impl QueryEngine for BrokenEngine {
    async fn query(&self, _sql: &str) -> Result<Box<dyn RowCursor>, ProtocolError> {
        Ok(Box::new(BrokenCursor {
            columns: vec!["id".into(), "name".into()],
            left: self.rows,
        }))
    }

    async fn export_parquet(&self, _sql: &str, _destination: &Path) -> Result<(), ProtocolError> {
        Err(ProtocolError::Engine("export unavailable".into()))
    }
}

#[tokio::test]
async fn csv_result_arrives_as_header_and_three_batches() {
    init_tracing();
    let net = MemoryNetwork::new();
    let engine = Arc::new(PatientsEngine::with_rows(5));
    let (a, b) = setup(&net, engine.clone()).await;
    assert_eq!(wait_for_provider(&b.node, "admissions").await, a.peer());

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("admissions.csv");
    let descriptor = QueryDescriptor::new("SELECT * FROM {{ORIGIN}}", QueryFormat::Csv, 2);
    let transfer = b.node.query("admissions", &descriptor, &out).await.unwrap();

    assert_eq!(transfer.envelopes, 1 + 3);
    assert_eq!(engine.last_sql().as_deref(), Some("SELECT * FROM /data/admissions.csv"));
    let body = std::fs::read_to_string(&out).unwrap();
    assert_eq!(body.lines().count(), 6);
    assert!(body.starts_with("id,name\n1,patient-1\n"));
    assert!(body.ends_with("5,patient-5\n"));
    assert_eq!(transfer.bytes, body.len() as u64);
    assert_eq!(a.node.metrics().query_envelopes, 4);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn json_batches_concatenate_into_arrays() {
    init_tracing();
    let net = MemoryNetwork::new();
    let (a, b) = setup(&net, Arc::new(PatientsEngine::with_rows(5))).await;
    wait_for_provider(&b.node, "admissions").await;

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("admissions.json");
    let descriptor = QueryDescriptor::new("SELECT * FROM {{ORIGIN}}", QueryFormat::Json, 4);
    let transfer = b.node.query("admissions", &descriptor, &out).await.unwrap();
    assert_eq!(transfer.envelopes, 2);

    let body = std::fs::read(&out).unwrap();
    let batches: Vec<serde_json::Value> = serde_json::Deserializer::from_slice(&body)
        .into_iter::<serde_json::Value>()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].as_array().unwrap().len(), 4);
    assert_eq!(batches[1][0]["name"], "patient-5");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn parquet_export_is_streamed_in_chunks() {
    init_tracing();
    let net = MemoryNetwork::new();
    let (a, b) = setup(&net, Arc::new(PatientsEngine::with_rows(5))).await;
    wait_for_provider(&b.node, "admissions").await;

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("admissions.parquet");
    let descriptor = QueryDescriptor::new("SELECT * FROM {{ORIGIN}}", QueryFormat::Parquet, 0);
    let transfer = b.node.query("admissions", &descriptor, &out).await.unwrap();

    let size = std::fs::metadata(&out).unwrap().len();
    assert_eq!(size, 150 * 1024);
    assert_eq!(transfer.bytes, size);
    assert_eq!(transfer.envelopes, size.div_ceil(PARQUET_CHUNK_SIZE as u64));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn ungranted_source_is_an_error() {
    init_tracing();
    let net = MemoryNetwork::new();
    let engine = Arc::new(PatientsEngine::with_rows(5));
    let (a, b) = setup(&net, engine.clone()).await;
    wait_for_provider(&b.node, "staff").await;

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("staff.csv");
    let descriptor = QueryDescriptor::new("SELECT * FROM {{ORIGIN}}", QueryFormat::Csv, 2);
    let result = b.node.query("staff", &descriptor, &out).await;

    assert!(result.is_err());
    assert_eq!(engine.last_sql(), None, "engine must not run for a denied query");
    assert_eq!(a.node.metrics().query_denied, 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn unauthenticated_peer_is_refused_at_open() {
    init_tracing();
    let net = MemoryNetwork::new();
    let engine = Arc::new(PatientsEngine::with_rows(5));
    let (a, b) = setup(&net, engine.clone()).await;
    let c = start_node(&net, "Clinic-C", network_config(), |b| b).await;
    wait_for_provider(&c.node, "admissions").await;

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("admissions.csv");
    let descriptor = QueryDescriptor::new("SELECT 1", QueryFormat::Csv, 2);
    let result = c.node.query("admissions", &descriptor, &out).await;
    assert!(result.is_err());
    assert_eq!(engine.last_sql(), None);

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

#[tokio::test]
async fn failure_mid_stream_is_an_error_not_a_short_result() {
    init_tracing();
    let net = MemoryNetwork::new();
    let (a, b) = setup(&net, Arc::new(BrokenEngine { rows: 2 })).await;
    wait_for_provider(&b.node, "admissions").await;

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("admissions.csv");
    let descriptor = QueryDescriptor::new("SELECT * FROM {{ORIGIN}}", QueryFormat::Csv, 1);
    let result = b.node.query("admissions", &descriptor, &out).await;

    assert!(result.is_err(), "truncated result reported as success: {result:?}");
    assert_eq!(a.node.metrics().query_envelopes, 0);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn oversized_block_size_is_capped() {
    init_tracing();
    let net = MemoryNetwork::new();
    let mut config = network_config();
    config.default_block_size = 2;
    config.max_block_size = 2;
    let (a, b) = setup_with(&net, Arc::new(PatientsEngine::with_rows(5)), config).await;
    wait_for_provider(&b.node, "admissions").await;

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("admissions.csv");
    let descriptor = QueryDescriptor::new("SELECT * FROM {{ORIGIN}}", QueryFormat::Csv, usize::MAX);
    let transfer = b.node.query("admissions", &descriptor, &out).await.unwrap();

    assert_eq!(transfer.envelopes, 1 + 3);
    assert_eq!(std::fs::read_to_string(&out).unwrap().lines().count(), 6);

    a.shutdown().await;
    b.shutdown().await;
}
