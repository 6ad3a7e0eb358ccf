//! Entity authentication handshake.
//!
//! The dialing node sends one length-prefixed [`SealedEnvelope`] carrying a
//! [`SignedClaim`]. The listener checks, in order:
//!
//! 1. the envelope signature and that its key belongs to the connected peer,
//! 2. the claim signature has not been seen within the replay TTL,
//! 3. the claimed entity is known,
//! 4. the claim signature verifies against that entity's key.
//!
//! On success the listener registers a session and answers with its
//! entity snapshot. Any failure is answered with a single
//! [`REJECTION_MARKER`] byte and a reset.

use tokio::io::AsyncWriteExt;
use veredarii_transport::{
    read_bounded, read_framed, write_framed, PeerId, Stream, TransportError,
};

use crate::claim::{SealedEnvelope, SignedClaim};
use crate::entities::EntitySnapshot;
use crate::node::NetworkNode;
use crate::protocols;
use crate::session::Session;
use crate::ProtocolError;

/// Largest sealed envelope accepted.
pub const MAX_CLAIM_SIZE: usize = 64 * 1024;

/// Largest entity snapshot a client accepts in reply.
pub const MAX_SNAPSHOT_SIZE: usize = 4 * 1024 * 1024;

/// Sent in place of a snapshot when the claim is refused.
pub const REJECTION_MARKER: u8 = 0;

pub(crate) async fn handle_inbound(node: &NetworkNode, mut stream: Stream) {
    let remote = stream.remote_peer();
    match verify_inbound(node, &mut stream).await {
        Ok(session) => {
            node.metrics.auth_verified.inc();
            if let Err(e) = send_snapshot(node, &mut stream).await {
                tracing::warn!(peer = %remote, entity = %session.entity, "failed to send entity snapshot: {e}");
                stream.reset();
            }
        }
        Err(e) => {
            node.metrics.auth_rejected.inc();
            tracing::warn!(peer = %remote, "authentication rejected: {e}");
            // Best effort: the peer may already be gone.
            let _ = stream.write_all(&[REJECTION_MARKER]).await;
            let _ = stream.flush().await;
            stream.reset();
        }
    }
}

async fn verify_inbound(node: &NetworkNode, stream: &mut Stream) -> Result<Session, ProtocolError> {
    let remote = stream.remote_peer();
    let frame = read_framed(stream, MAX_CLAIM_SIZE).await?;
    let (sender, claim) = SealedEnvelope::from_bytes(&frame)?.open()?;

    if sender.peer_id() != remote || claim.peer != remote {
        return Err(ProtocolError::IdentityMismatch {
            peer: remote.to_string(),
        });
    }
    if !node.replay.check_and_record(&claim.signature).await {
        return Err(ProtocolError::ReplayDetected);
    }
    let key = node
        .entities
        .get(&claim.entity)
        .await
        .ok_or_else(|| ProtocolError::UnknownEntity {
            entity: claim.entity.clone(),
        })?;
    claim.verify(&key)?;

    node.sessions
        .establish(&node.authz, node.host.as_ref(), remote, &claim.entity)
        .await
}

async fn send_snapshot(node: &NetworkNode, stream: &mut Stream) -> Result<(), ProtocolError> {
    let reply = node.entities.snapshot().await.to_json()?;
    stream.write_all(&reply).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Run the dialing side against `peer`.
///
/// Returns how many entities the peer's snapshot added or changed.
pub(crate) async fn authenticate(node: &NetworkNode, peer: PeerId) -> Result<usize, ProtocolError> {
    let claim = SignedClaim::create(&node.entity, &node.entity_key, node.host.local_peer_id());
    let sealed = SealedEnvelope::seal(&node.identity, &claim)?.to_bytes()?;

    let mut stream = node.host.open_stream(peer, protocols::AUTH).await?;
    write_framed(&mut stream, &sealed).await?;
    stream.flush().await?;

    let Some(snapshot) = read_reply(&mut stream).await? else {
        tracing::warn!(%peer, "authentication refused by peer");
        return Err(ProtocolError::Rejected);
    };
    let learned = node.entities.merge(&snapshot).await;
    tracing::info!(%peer, learned, "authenticated with peer");
    Ok(learned)
}

/// Read the listener's answer to a claim. `None` means it was refused.
pub async fn read_reply(stream: &mut Stream) -> Result<Option<EntitySnapshot>, ProtocolError> {
    let reply = match read_bounded(stream, MAX_SNAPSHOT_SIZE).await {
        Ok(reply) => reply,
        // Refusals end in a reset, which may overtake the marker byte.
        Err(TransportError::Io(e)) if e.kind() == std::io::ErrorKind::ConnectionReset => {
            return Ok(None)
        }
        Err(e) => return Err(e.into()),
    };
    if reply.is_empty() || reply == [REJECTION_MARKER] {
        return Ok(None);
    }
    EntitySnapshot::from_json(&reply).map(Some)
}
