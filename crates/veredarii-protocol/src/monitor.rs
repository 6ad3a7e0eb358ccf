//! Reconnects an isolated node to its pivots.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::auth;
use crate::node::NetworkNode;

/// If the node has no connected peers, dial and authenticate with each
/// pivot in turn. Returns how many pivots accepted the handshake.
pub(crate) async fn reconnect_if_isolated(node: &NetworkNode) -> usize {
    if node.pivots.is_empty() || !node.host.connected_peers().await.is_empty() {
        return 0;
    }
    tracing::info!(network = %node.config.name, pivots = node.pivots.len(), "isolated, contacting pivots");

    let timeout = node.config.pivot_timeout();
    let mut reached = 0;
    for pivot in &node.pivots {
        let peer = pivot.peer_id();
        let attempt = async {
            node.host.connect(pivot).await?;
            auth::authenticate(node, peer).await
        };
        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(_)) => reached += 1,
            Ok(Err(e)) => tracing::warn!(pivot = %peer, "pivot handshake failed: {e}"),
            Err(_) => tracing::warn!(pivot = %peer, ?timeout, "pivot handshake timed out"),
        }
    }
    reached
}

pub(crate) async fn run(node: Arc<NetworkNode>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(node.config.monitor_interval());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                reconnect_if_isolated(&node).await;
            }
        }
    }
    tracing::debug!(network = %node.config.name, "connection monitor stopped");
}
