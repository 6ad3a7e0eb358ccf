//! Length-prefixed framing shared by every stream protocol.
//!
//! Two prefixes are in use: a fixed u32 big-endian length for one-shot
//! messages, and an unsigned LEB128 varint for message sequences on
//! long-lived streams.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::TransportError;

/// Longest encoding of a u64 varint.
const MAX_VARINT_LEN: usize = 10;

/// Write a u32 big-endian length-prefixed message.
pub async fn write_framed<W>(writer: &mut W, data: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let len = u32::try_from(data.len()).map_err(|_| TransportError::MessageTooLarge {
        size: data.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a u32 big-endian length-prefixed message of at most `max_size` bytes.
pub async fn read_framed<R>(reader: &mut R, max_size: usize) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(TransportError::MessageTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

pub(crate) fn encode_uvarint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Write a uvarint length-prefixed message.
pub async fn write_delimited<W>(writer: &mut W, data: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut frame = Vec::with_capacity(data.len() + MAX_VARINT_LEN);
    encode_uvarint(data.len() as u64, &mut frame);
    frame.extend_from_slice(data);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a uvarint length-prefixed message.
///
/// Returns `Ok(None)` when the stream ends cleanly before the first prefix
/// byte. An end of stream anywhere inside a frame is an error.
pub async fn read_delimited<R>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<Vec<u8>>, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for index in 0..MAX_VARINT_LEN {
        let mut byte = [0u8; 1];
        if reader.read(&mut byte).await? == 0 {
            if index == 0 {
                return Ok(None);
            }
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        let byte = byte[0];
        if index == MAX_VARINT_LEN - 1 && byte > 1 {
            return Err(TransportError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            let len = usize::try_from(value).map_err(|_| TransportError::VarintOverflow)?;
            if len > max_size {
                return Err(TransportError::MessageTooLarge {
                    size: len,
                    max: max_size,
                });
            }
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf).await?;
            return Ok(Some(buf));
        }
        shift += 7;
    }
    Err(TransportError::VarintOverflow)
}

/// Read until end of stream, stopping after `limit` bytes.
///
/// Bytes beyond the limit are left unread.
pub async fn read_bounded<R>(reader: &mut R, limit: usize) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    reader.take(limit as u64).read_to_end(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn framed_roundtrip() {
        let mut wire = Vec::new();
        write_framed(&mut wire, b"claim").await.unwrap();
        assert_eq!(&wire[..4], &[0, 0, 0, 5]);

        let mut reader = &wire[..];
        assert_eq!(read_framed(&mut reader, 64).await.unwrap(), b"claim");
    }

    #[tokio::test]
    async fn framed_rejects_oversized() {
        let mut wire = Vec::new();
        write_framed(&mut wire, &[0u8; 100]).await.unwrap();
        let mut reader = &wire[..];
        let err = read_framed(&mut reader, 10).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::MessageTooLarge { size: 100, max: 10 }
        ));
    }

    #[test]
    fn uvarint_encoding_matches_leb128() {
        let mut out = Vec::new();
        encode_uvarint(300, &mut out);
        assert_eq!(out, vec![0xac, 0x02]);

        out.clear();
        encode_uvarint(0, &mut out);
        assert_eq!(out, vec![0x00]);
    }

    #[tokio::test]
    async fn delimited_sequence_then_clean_eof() {
        let mut wire = Vec::new();
        write_delimited(&mut wire, b"one").await.unwrap();
        write_delimited(&mut wire, b"").await.unwrap();
        write_delimited(&mut wire, &[7u8; 200]).await.unwrap();

        let mut reader = &wire[..];
        assert_eq!(read_delimited(&mut reader, 1024).await.unwrap().unwrap(), b"one");
        assert_eq!(read_delimited(&mut reader, 1024).await.unwrap().unwrap(), b"");
        assert_eq!(read_delimited(&mut reader, 1024).await.unwrap().unwrap().len(), 200);
        assert!(read_delimited(&mut reader, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delimited_truncated_frame_is_error() {
        let mut wire = Vec::new();
        write_delimited(&mut wire, b"truncated").await.unwrap();
        wire.truncate(4);
        let mut reader = &wire[..];
        assert!(read_delimited(&mut reader, 1024).await.is_err());
    }

    #[tokio::test]
    async fn delimited_overlong_varint_is_rejected() {
        let wire = [0xffu8; 11];
        let mut reader = &wire[..];
        assert!(matches!(
            read_delimited(&mut reader, usize::MAX).await,
            Err(TransportError::VarintOverflow)
        ));
    }

    #[tokio::test]
    async fn bounded_read_stops_at_limit() {
        let data = vec![1u8; 5000];
        let mut reader = &data[..];
        let got = read_bounded(&mut reader, 4096).await.unwrap();
        assert_eq!(got.len(), 4096);
    }
}
