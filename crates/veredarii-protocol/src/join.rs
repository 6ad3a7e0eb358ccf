//! Invitation-based onboarding.
//!
//! A guest holding an invitation token sends a [`JoinRequest`] to any
//! member. The member verifies the token, registers the guest's key and
//! re-publishes the request, encrypted under the members key, on the
//! [`MEMBERS_TOPIC`] gossip topic so every other member learns the guest
//! without repeating the verification.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use veredarii_transport::{read_bounded, GossipMessage, Host, PeerAddr, PublicKey, Stream};

use crate::crypto::{self, SymmetricKey};
use crate::invitation::Invitation;
use crate::node::NetworkNode;
use crate::protocols;
use crate::ProtocolError;

/// Gossip topic carrying accepted join requests.
pub const MEMBERS_TOPIC: &str = "members";

/// Single byte written back when a join is accepted.
pub const JOIN_ACCEPTED: u8 = 0x01;

/// Body of a join request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Entity asking to join.
    pub entity: String,
    pub inviter: String,
    pub network: String,
    /// Guest public key, base64.
    pub pubkey: String,
    /// Hex invitation token.
    pub invitation: String,
}

impl JoinRequest {
    pub fn new(
        entity: impl Into<String>,
        inviter: impl Into<String>,
        network: impl Into<String>,
        key: &PublicKey,
        invitation: impl Into<String>,
    ) -> Self {
        Self {
            entity: entity.into(),
            inviter: inviter.into(),
            network: network.into(),
            pubkey: key.to_base64(),
            invitation: invitation.into(),
        }
    }

    pub fn public_key(&self) -> Result<PublicKey, ProtocolError> {
        PublicKey::from_base64(&self.pubkey)
            .map_err(|e| ProtocolError::Deserialization(format!("join request key: {e}")))
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn from_json(data: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(data).map_err(Into::into)
    }
}

/// Check a join request against the invitation key at time `now`.
///
/// Returns the guest's public key when the token decrypts under the
/// claimed inviter, every token field matches the request, and the token
/// has not expired.
pub fn verify_join(
    request: &JoinRequest,
    key: &SymmetricKey,
    now: DateTime<Utc>,
) -> Result<PublicKey, ProtocolError> {
    let invitation = Invitation::open(&request.invitation, &request.inviter, key)?;
    invitation.check_request(&request.inviter, &request.entity, &request.network)?;
    invitation.check_expiry(now)?;
    request.public_key()
}

pub(crate) async fn handle_inbound(node: &NetworkNode, mut stream: Stream) {
    let remote = stream.remote_peer();
    if let Err(e) = node.join_limiter.acquire().await {
        node.metrics.join_rate_limited.inc();
        tracing::warn!(peer = %remote, "join attempt refused: {e}");
        stream.reset();
        return;
    }

    match accept(node, &mut stream).await {
        Ok(entity) => {
            node.metrics.join_accepted.inc();
            tracing::info!(peer = %remote, entity = %entity, "join accepted");
            let _ = stream.write_all(&[JOIN_ACCEPTED]).await;
            let _ = stream.shutdown().await;
        }
        Err(e) => {
            node.metrics.join_rejected.inc();
            tracing::warn!(peer = %remote, "join rejected: {e}");
            stream.reset();
        }
    }
}

async fn accept(node: &NetworkNode, stream: &mut Stream) -> Result<String, ProtocolError> {
    let Some(key) = node.invitation_key.as_ref() else {
        return Err(ProtocolError::Config("onboarding is not configured".into()));
    };
    let body = read_bounded(stream, node.config.join_body_limit).await?;
    let request = JoinRequest::from_json(&body)?;

    node.metrics.join_decrypt_attempts.inc();
    let public_key = verify_join(&request, key, Utc::now())?;

    node.entities.insert(request.entity.clone(), public_key).await;
    let announcement = crypto::encrypt(&node.members_key, &body)?;
    node.host.publish(MEMBERS_TOPIC, announcement).await?;
    Ok(request.entity)
}

/// Send a join request to `pivot` and wait for the acceptance byte.
///
/// A reset, an early end of stream or any other answer is [`ProtocolError::Rejected`].
pub async fn request_join(
    host: &dyn Host,
    pivot: &PeerAddr,
    request: &JoinRequest,
) -> Result<(), ProtocolError> {
    host.connect(pivot).await?;
    let mut stream = host.open_stream(pivot.peer_id(), protocols::JOIN).await?;
    let body = request.to_json()?;

    let exchange = async {
        stream.write_all(&body).await?;
        stream.shutdown().await?;
        let mut ack = [0u8; 1];
        let n = stream.read(&mut ack).await?;
        Ok::<_, std::io::Error>(n == 1 && ack[0] == JOIN_ACCEPTED)
    };
    match exchange.await {
        Ok(true) => {
            tracing::info!(pivot = %pivot.peer_id(), network = %request.network, "joined network");
            Ok(())
        }
        Ok(false) => Err(ProtocolError::Rejected),
        Err(e) => {
            tracing::debug!(pivot = %pivot.peer_id(), "join stream failed: {e}");
            Err(ProtocolError::Rejected)
        }
    }
}

/// Decrypt a members announcement and register the entity it carries.
///
/// Returns `true` when the map changed.
pub(crate) async fn learn_member(node: &NetworkNode, sealed: &[u8]) -> Result<bool, ProtocolError> {
    let body = crypto::decrypt(&node.members_key, sealed)?;
    let request = JoinRequest::from_json(&body)?;
    if request.network != node.config.name {
        return Err(ProtocolError::InvitationMismatch { field: "network" });
    }
    let key = request.public_key()?;
    let changed = node.entities.insert(request.entity.clone(), key).await;
    if changed {
        node.metrics.members_learned.inc();
        tracing::info!(entity = %request.entity, inviter = %request.inviter, "member learned from gossip");
    }
    Ok(changed)
}

pub(crate) async fn run_member_listener(
    node: Arc<NetworkNode>,
    mut messages: mpsc::Receiver<GossipMessage>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = messages.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        if let Err(e) = learn_member(&node, &message.data).await {
            tracing::warn!(source = %message.source, "skipping members announcement: {e}");
        }
    }
    tracing::debug!(network = %node.config.name, "member listener stopped");
}
