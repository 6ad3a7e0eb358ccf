mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, init_tracing, network_config, start_node, NETWORK};
use veredarii_protocol::auth::read_reply;
use veredarii_protocol::config::{GateConfig, GateMode};
use veredarii_protocol::protocols::{self, API_PROXY_ID};
use veredarii_protocol::{PolicyTable, ProtocolError, SealedEnvelope, SignedClaim};
use veredarii_transport::{write_framed, Host, Keypair, MemoryNetwork};

fn lab_policy() -> Arc<PolicyTable> {
    let mut table = PolicyTable::new();
    table.add_policy("Clinic-B", NETWORK, API_PROXY_ID, "lab-results");
    Arc::new(table)
}

#[tokio::test]
async fn verified_session_is_revoked_on_disconnect() {
    init_tracing();
    let net = MemoryNetwork::new();
    let a = start_node(&net, "Hospital-A", network_config(), |b| b.policy(lab_policy())).await;
    let b = start_node(&net, "Clinic-B", network_config(), |b| b).await;
    a.node.entities().insert("Clinic-B", b.keypair.public()).await;

    let learned = tokio::time::timeout(Duration::from_secs(5), b.node.connect(&a.host.local_addr()))
        .await
        .expect("handshake timed out")
        .unwrap();
    assert_eq!(learned, 1, "B learns Hospital-A from the snapshot");
    assert_eq!(b.node.entities().get("Hospital-A").await, Some(a.keypair.public()));

    let session = a.node.sessions().get(&b.peer()).await.unwrap();
    assert_eq!(session.entity, "Clinic-B");
    assert!(session.verified);
    let authz = a.node.authorizer();
    assert!(authz.allowed(&b.peer(), NETWORK, API_PROXY_ID, "lab-results").await);
    assert_eq!(a.node.metrics().auth_verified, 1);

    b.host.disconnect(a.peer()).await.unwrap();
    let (sessions, peer) = (a.node.sessions(), b.peer());
    assert!(eventually(move || async move { !sessions.contains(&peer).await }).await);
    assert!(!authz.allowed(&b.peer(), NETWORK, API_PROXY_ID, "lab-results").await);
    assert_eq!(authz.entity_of(&b.peer()).await, None);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn unknown_entity_is_rejected() {
    init_tracing();
    let net = MemoryNetwork::new();
    let a = start_node(&net, "Hospital-A", network_config(), |b| b).await;
    let b = start_node(&net, "Clinic-B", network_config(), |b| b).await;

    let result = b.node.connect(&a.host.local_addr()).await;
    assert!(matches!(result, Err(ProtocolError::Rejected)));
    assert!(a.node.sessions().is_empty().await);
    assert_eq!(a.node.metrics().auth_rejected, 1);
    assert_eq!(b.node.entities().get("Hospital-A").await, None);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn envelope_from_another_identity_is_rejected() {
    init_tracing();
    let net = MemoryNetwork::new();
    let a = start_node(&net, "Hospital-A", network_config(), |b| b).await;
    let b = start_node(&net, "Clinic-B", network_config(), |b| b).await;
    a.node.entities().insert("Clinic-B", b.keypair.public()).await;

    // Sealed by a node key that is not the one on the connection.
    let impostor = Keypair::generate();
    let claim = SignedClaim::create("Clinic-B", &b.keypair, impostor.peer_id());
    let sealed = SealedEnvelope::seal(&impostor, &claim).unwrap().to_bytes().unwrap();

    let mut stream = b.host.open_stream(a.peer(), protocols::AUTH).await.unwrap();
    write_framed(&mut stream, &sealed).await.unwrap();
    assert!(read_reply(&mut stream).await.unwrap().is_none());
    assert!(!a.node.sessions().contains(&b.peer()).await);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn claim_signed_with_wrong_entity_key_is_rejected() {
    init_tracing();
    let net = MemoryNetwork::new();
    let a = start_node(&net, "Hospital-A", network_config(), |b| b).await;
    let b = start_node(&net, "Clinic-B", network_config(), |b| b).await;
    a.node.entities().insert("Clinic-B", b.keypair.public()).await;

    let forged = SignedClaim::create("Clinic-B", &Keypair::generate(), b.peer());
    let sealed = SealedEnvelope::seal(&b.keypair, &forged).unwrap().to_bytes().unwrap();

    let mut stream = b.host.open_stream(a.peer(), protocols::AUTH).await.unwrap();
    write_framed(&mut stream, &sealed).await.unwrap();
    assert!(read_reply(&mut stream).await.unwrap().is_none());
    assert!(a.node.sessions().is_empty().await);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn replayed_claim_is_rejected() {
    init_tracing();
    let net = MemoryNetwork::new();
    let a = start_node(&net, "Hospital-A", network_config(), |b| b).await;
    let b = start_node(&net, "Clinic-B", network_config(), |b| b).await;
    a.node.entities().insert("Clinic-B", b.keypair.public()).await;

    let claim = SignedClaim::create("Clinic-B", &b.keypair, b.peer());
    let sealed = SealedEnvelope::seal(&b.keypair, &claim).unwrap().to_bytes().unwrap();

    let mut first = b.host.open_stream(a.peer(), protocols::AUTH).await.unwrap();
    write_framed(&mut first, &sealed).await.unwrap();
    let snapshot = read_reply(&mut first).await.unwrap().unwrap();
    assert!(snapshot.entities.contains_key("Hospital-A"));

    let mut second = b.host.open_stream(a.peer(), protocols::AUTH).await.unwrap();
    write_framed(&mut second, &sealed).await.unwrap();
    assert!(read_reply(&mut second).await.unwrap().is_none());

    let metrics = a.node.metrics();
    assert_eq!(metrics.auth_verified, 1);
    assert_eq!(metrics.auth_rejected, 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn claim_sent_after_disconnect_leaves_no_session() {
    init_tracing();
    let net = MemoryNetwork::new();
    let a = start_node(&net, "Hospital-A", network_config(), |b| b.policy(lab_policy())).await;
    let b = start_node(&net, "Clinic-B", network_config(), |b| b).await;
    a.node.entities().insert("Clinic-B", b.keypair.public()).await;

    let claim = SignedClaim::create("Clinic-B", &b.keypair, b.peer());
    let sealed = SealedEnvelope::seal(&b.keypair, &claim).unwrap().to_bytes().unwrap();

    let mut stream = b.host.open_stream(a.peer(), protocols::AUTH).await.unwrap();
    b.host.disconnect(a.peer()).await.unwrap();
    assert!(write_framed(&mut stream, &sealed).await.is_err());

    let node = a.node.clone();
    assert!(eventually(move || {
        let node = node.clone();
        async move { node.metrics().auth_rejected == 1 }
    })
    .await);
    assert!(!a.node.sessions().contains(&b.peer()).await);
    let authz = a.node.authorizer();
    assert!(!authz.allowed(&b.peer(), NETWORK, API_PROXY_ID, "lab-results").await);
    assert_eq!(a.node.metrics().auth_verified, 0);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn isolated_node_reconnects_to_pivot() {
    init_tracing();
    let net = MemoryNetwork::new();
    let a = start_node(&net, "Hospital-A", network_config(), |b| b).await;

    let mut config = network_config();
    config.pivots = vec![a.host.local_addr().to_string()];
    let b_key = Keypair::generate();
    a.node.entities().insert("Clinic-B", b_key.public()).await;

    // The monitor's first tick runs as soon as the node starts.
    let b = start_node(&net, "Clinic-B", config, |builder| builder.entity_key(b_key)).await;

    let (sessions, peer) = (a.node.sessions(), b.peer());
    assert!(eventually(move || async move { sessions.contains(&peer).await }).await);
    let entities = b.node.entities();
    assert!(eventually(move || async move { entities.get("Hospital-A").await.is_some() }).await);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn whitelist_gate_refuses_unlisted_peers() {
    init_tracing();
    let net = MemoryNetwork::new();
    let b = start_node(&net, "Clinic-B", network_config(), |b| b).await;

    let mut config = network_config();
    config.gate = GateConfig {
        mode: GateMode::Whitelist,
        peers: vec![b.peer().to_string()],
    };
    let a = start_node(&net, "Hospital-A", config, |b| b).await;
    a.node.entities().insert("Clinic-B", b.keypair.public()).await;
    let c = start_node(&net, "Clinic-C", network_config(), |b| b).await;

    assert!(b.node.connect(&a.host.local_addr()).await.is_ok());
    assert!(matches!(
        c.node.connect(&a.host.local_addr()).await,
        Err(ProtocolError::Transport(_))
    ));

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}
