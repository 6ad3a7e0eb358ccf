mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use common::{init_tracing, network_config, start_node, wait_for_provider, PatientsEngine, TestNode, NETWORK};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use veredarii_protocol::protocols::{API_PROXY_ID, QUERY_ID};
use veredarii_protocol::resources::ResourceEntry;
use veredarii_protocol::{LocalGateway, PolicyTable};
use veredarii_transport::MemoryNetwork;

fn entry(name: &str, resource: &str) -> ResourceEntry {
    ResourceEntry {
        name: name.into(),
        resource: resource.into(),
    }
}

struct Setup {
    provider: TestNode,
    client: TestNode,
    addr: SocketAddr,
    cancel: CancellationToken,
}

impl Setup {
    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        self.provider.shutdown().await;
        self.client.shutdown().await;
    }
}

/// Hospital-A provides `lab-results`, `imaging` and `admissions`; Clinic-B
/// may use `lab-results` and `admissions` and exposes all three, plus
/// `billing`, through its gateway.
async fn setup(net: &MemoryNetwork) -> Setup {
    let mut config = network_config();
    config.resources.api = vec![
        entry("lab-results", "http://127.0.0.1:3000"),
        entry("imaging", "http://127.0.0.1:3001"),
    ];
    config.resources.data_source = vec![entry("admissions", "/data/admissions.csv")];
    let mut policy = PolicyTable::new();
    policy
        .add_policy("Clinic-B", NETWORK, API_PROXY_ID, "lab-results")
        .add_policy("Clinic-B", NETWORK, QUERY_ID, "admissions");
    let provider = start_node(net, "Hospital-A", config, |b| {
        b.policy(Arc::new(policy))
            .query_engine(Arc::new(PatientsEngine::with_rows(3)))
    })
    .await;

    let mut config = network_config();
    config.remote_resources.api = vec![
        entry("lab-results", ""),
        entry("imaging", ""),
        entry("billing", ""),
    ];
    config.remote_resources.data_source = vec![entry("admissions", "")];
    let client = start_node(net, "Clinic-B", config, |b| b).await;
    provider.node.entities().insert("Clinic-B", client.keypair.public()).await;
    client.node.connect(&provider.host.local_addr()).await.unwrap();
    wait_for_provider(&client.node, "lab-results").await;
    wait_for_provider(&client.node, "imaging").await;
    wait_for_provider(&client.node, "admissions").await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let gateway = Arc::new(LocalGateway::new().mount(client.node.clone()));
    tokio::spawn(gateway.serve(listener, cancel.clone()));

    Setup {
        provider,
        client,
        addr,
        cancel,
    }
}

#[tokio::test]
async fn api_call_is_forwarded_through_the_network() {
    init_tracing();
    let net = MemoryNetwork::new();
    let s = setup(&net).await;

    let response = reqwest::get(s.url("/health-net/lab-results/orders?id=7")).await.unwrap();
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(
        body.starts_with("lab-results:GET /orders?id=7 HTTP/1.1\r\n"),
        "unexpected body {body:?}"
    );
    assert_eq!(s.provider.node.metrics().proxy_calls, 1);

    s.shutdown().await;
}

#[tokio::test]
async fn data_source_query_returns_the_result() {
    init_tracing();
    let net = MemoryNetwork::new();
    let s = setup(&net).await;

    let response = reqwest::Client::new()
        .post(s.url("/health-net/ds/admissions"))
        .body(r#"{"query":"SELECT * FROM {{ORIGIN}}","format":"csv","block_size":2}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "text/csv");
    let body = response.text().await.unwrap();
    assert_eq!(body, "id,name\n1,patient-1\n2,patient-2\n3,patient-3\n");

    s.shutdown().await;
}

#[tokio::test]
async fn bad_query_bodies_are_client_errors() {
    init_tracing();
    let net = MemoryNetwork::new();
    let s = setup(&net).await;
    let client = reqwest::Client::new();

    let response = client.post(s.url("/health-net/ds/admissions")).body("{").send().await.unwrap();
    assert_eq!(response.status(), 400);
    let response = client
        .post(s.url("/health-net/ds/admissions"))
        .body(r#"{"query":"  "}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let response = client.get(s.url("/health-net/ds/admissions")).send().await.unwrap();
    assert_eq!(response.status(), 405);

    s.shutdown().await;
}

#[tokio::test]
async fn unlisted_and_unreachable_services() {
    init_tracing();
    let net = MemoryNetwork::new();
    let s = setup(&net).await;

    // Not in remote_resources: never leaves the node.
    let response = reqwest::get(s.url("/health-net/radiology")).await.unwrap();
    assert_eq!(response.status(), 404);
    let response = reqwest::get(s.url("/other-net/lab-results")).await.unwrap();
    assert_eq!(response.status(), 404);
    // Listed, but nobody provides it.
    let response = reqwest::get(s.url("/health-net/billing")).await.unwrap();
    assert_eq!(response.status(), 404);
    // Provided, but not granted to Clinic-B: the provider resets the stream.
    let response = reqwest::get(s.url("/health-net/imaging")).await.unwrap();
    assert_eq!(response.status(), 502);
    assert_eq!(s.provider.node.metrics().proxy_calls, 0);
    assert_eq!(s.provider.node.metrics().proxy_denied, 1);

    s.shutdown().await;
}
