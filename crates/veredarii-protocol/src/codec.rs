//! Wire codec for the proxy and query streams.
//!
//! Each [`ProtocolEnvelope`] is MessagePack on the wire behind a uvarint
//! length prefix, so one stream carries any number of envelopes. A clean
//! end of stream between envelopes ends the sequence.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use veredarii_transport::{read_delimited, write_delimited};

use crate::ProtocolError;

/// Largest envelope accepted from the wire.
pub const MAX_ENVELOPE_SIZE: usize = 16 * 1024 * 1024;

/// The message unit of the proxy and query streams.
///
/// Serialized as MessagePack and framed with a uvarint length prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolEnvelope {
    /// Correlation identifier (UUID v4).
    pub id: String,
    /// Target service name.
    pub service: String,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl ProtocolEnvelope {
    /// New envelope with a fresh correlation id.
    pub fn new(service: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            service: service.into(),
            payload,
        }
    }

    /// An empty payload marks the end of a result stream.
    pub fn is_end_marker(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec(self).map_err(Into::into)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        rmp_serde::from_slice(data).map_err(|e| ProtocolError::InvalidEnvelope {
            reason: e.to_string(),
        })
    }
}

/// Write one length-delimited envelope.
pub async fn write_envelope<W>(writer: &mut W, envelope: &ProtocolEnvelope) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_delimited(writer, &envelope.to_bytes()?).await?;
    Ok(())
}

/// Read one length-delimited envelope; `None` on a clean end of stream.
pub async fn read_envelope<R>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<ProtocolEnvelope>, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match read_delimited(reader, max_size).await? {
        Some(frame) => ProtocolEnvelope::from_bytes(&frame).map(Some),
        None => Ok(None),
    }
}
