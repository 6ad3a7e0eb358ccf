//! File fetch and file stat protocols for FILE resources.
//!
//! Both are line oriented. The client writes `<name>\n`.
//! Fetch answers `OK\n` followed by the file bytes, `ERR: <reason>\n` when
//! the file cannot be read, or `-1\n` for an unknown name. Stat answers
//! `<size>\n` or `-1\n`.

use std::path::Path;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use veredarii_transport::{Host, PeerId, Stream};

use crate::node::NetworkNode;
use crate::protocols;
use crate::resources::{ServiceDescriptor, ServiceKind};
use crate::ProtocolError;

/// Answer for an unknown name.
pub const NOT_FOUND: &str = "-1";

const MAX_LINE: usize = 1024;

/// Read one `\n`-terminated line without buffering past it.
async fn read_line<R>(reader: &mut R) -> Result<Option<String>, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut line = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        if reader.read(&mut byte).await? == 0 {
            if line.is_empty() {
                return Ok(None);
            }
            break;
        }
        if byte[0] == b'\n' {
            break;
        }
        if line.len() >= MAX_LINE {
            return Err(ProtocolError::InvalidEnvelope {
                reason: format!("line longer than {MAX_LINE} bytes"),
            });
        }
        line.push(byte[0]);
    }
    let line = String::from_utf8(line).map_err(|_| ProtocolError::InvalidEnvelope {
        reason: "line is not utf-8".into(),
    })?;
    Ok(Some(line.trim_end_matches('\r').to_string()))
}

/// Authorize the stream and read the requested name.
///
/// `None` means the stream was reset or ended.
async fn authorized_name(node: &NetworkNode, stream: &mut Stream) -> Option<String> {
    let peer = stream.remote_peer();
    let protocol = stream.protocol().as_str();
    let network = node.config.name.as_str();

    if let Err(e) = node.authz.require_protocol(&peer, network, protocol).await {
        tracing::debug!(%peer, protocol, "file request refused: {e}");
        return None;
    }
    let name = match read_line(stream).await {
        Ok(Some(name)) => name,
        Ok(None) => return None,
        Err(e) => {
            tracing::warn!(%peer, "bad file request: {e}");
            return None;
        }
    };
    if let Err(e) = node.authz.require(&peer, network, protocol, &name).await {
        tracing::debug!(%peer, file = %name, "file request refused: {e}");
        return None;
    }
    node.metrics.file_requests.inc();
    Some(name)
}

fn local_file(node: &NetworkNode, name: &str) -> Option<ServiceDescriptor> {
    node.config.resources.find(ServiceKind::File, name)
}

pub(crate) async fn handle_fetch(node: &NetworkNode, mut stream: Stream) {
    let Some(name) = authorized_name(node, &mut stream).await else {
        stream.reset();
        return;
    };
    if let Err(e) = serve_fetch(node, &name, &mut stream).await {
        tracing::warn!(peer = %stream.remote_peer(), file = %name, "file fetch aborted: {e}");
        stream.reset();
        return;
    }
    let _ = stream.shutdown().await;
}

async fn serve_fetch(node: &NetworkNode, name: &str, stream: &mut Stream) -> Result<(), ProtocolError> {
    let Some(resource) = local_file(node, name) else {
        stream.write_all(format!("{NOT_FOUND}\n").as_bytes()).await?;
        return Ok(());
    };
    let mut file = match tokio::fs::File::open(&resource.locator).await {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!(file = %name, "cannot open file resource: {e}");
            stream.write_all(format!("ERR: {e}\n").as_bytes()).await?;
            return Ok(());
        }
    };
    stream.write_all(b"OK\n").await?;
    let sent = tokio::io::copy(&mut file, stream).await?;
    tracing::debug!(file = %name, bytes = sent, "file served");
    Ok(())
}

pub(crate) async fn handle_stat(node: &NetworkNode, mut stream: Stream) {
    let Some(name) = authorized_name(node, &mut stream).await else {
        stream.reset();
        return;
    };
    let size = match local_file(node, &name) {
        Some(resource) => tokio::fs::metadata(&resource.locator)
            .await
            .ok()
            .map(|m| m.len()),
        None => None,
    };
    let answer = match size {
        Some(size) => format!("{size}\n"),
        None => format!("{NOT_FOUND}\n"),
    };
    if stream.write_all(answer.as_bytes()).await.is_err() {
        stream.reset();
        return;
    }
    let _ = stream.shutdown().await;
}

// ── Client ────────────────────────────────────────────────────────────

/// Download `name` from `peer` into `output`. Returns the bytes written.
pub async fn fetch_file(
    host: &dyn Host,
    peer: PeerId,
    name: &str,
    output: &Path,
) -> Result<u64, ProtocolError> {
    let mut stream = host.open_stream(peer, protocols::FILE_FETCH).await?;
    stream.write_all(format!("{name}\n").as_bytes()).await?;
    stream.flush().await?;

    let status = read_line(&mut stream).await?.ok_or(ProtocolError::Rejected)?;
    if status == NOT_FOUND {
        return Err(ProtocolError::UnknownService(name.to_string()));
    }
    if let Some(reason) = status.strip_prefix("ERR:") {
        return Err(ProtocolError::Backend(reason.trim().to_string()));
    }
    if status != "OK" {
        return Err(ProtocolError::InvalidEnvelope {
            reason: format!("unexpected fetch status {status:?}"),
        });
    }
    let mut file = tokio::fs::File::create(output).await?;
    let written = tokio::io::copy(&mut stream, &mut file).await?;
    file.flush().await?;
    Ok(written)
}

/// Size of `name` on `peer`, `None` when the peer has no such file.
pub async fn remote_stat(host: &dyn Host, peer: PeerId, name: &str) -> Result<Option<u64>, ProtocolError> {
    let mut stream = host.open_stream(peer, protocols::FILE_STAT).await?;
    stream.write_all(format!("{name}\n").as_bytes()).await?;
    stream.flush().await?;

    let answer = read_line(&mut stream).await?.ok_or(ProtocolError::Rejected)?;
    if answer == NOT_FOUND {
        return Ok(None);
    }
    answer
        .parse::<u64>()
        .map(Some)
        .map_err(|_| ProtocolError::InvalidEnvelope {
            reason: format!("unexpected stat answer {answer:?}"),
        })
}
