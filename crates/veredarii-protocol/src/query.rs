//! Chunked query-result streaming.
//!
//! The client sends one envelope holding a [`QueryDescriptor`]. The
//! listener resolves the data source named by the envelope's service,
//! runs the query on its [`QueryEngine`] and streams the result back as a
//! sequence of envelopes:
//!
//! - `csv`: a header envelope, then one envelope per batch of rows.
//! - `json`: one JSON array of row objects per batch.
//! - `parquet`: the exported file in 64 KiB chunks.
//!
//! The last partial batch is always sent. The stream closing marks the end;
//! readers also stop at an envelope with an empty payload. A query that
//! fails part way resets the stream so the reader never mistakes a
//! truncated result for a complete one.

use std::collections::VecDeque;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use veredarii_transport::Stream;

use crate::codec::{read_envelope, write_envelope, ProtocolEnvelope, MAX_ENVELOPE_SIZE};
use crate::node::NetworkNode;
use crate::resources::ServiceKind;
use crate::ProtocolError;

/// Replaced by the data source locator before execution.
pub const ORIGIN_PLACEHOLDER: &str = "{{ORIGIN}}";

/// Size of each parquet chunk.
pub const PARQUET_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryFormat {
    #[default]
    Csv,
    Json,
    Parquet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    pub query: String,
    #[serde(default)]
    pub format: QueryFormat,
    /// Rows per envelope. Zero means the listener's default.
    #[serde(default)]
    pub block_size: usize,
}

impl QueryDescriptor {
    pub fn new(query: impl Into<String>, format: QueryFormat, block_size: usize) -> Self {
        Self {
            query: query.into(),
            format,
            block_size,
        }
    }

    /// The query text with the placeholder replaced by `origin`.
    pub fn resolve(&self, origin: &str) -> String {
        self.query.replace(ORIGIN_PLACEHOLDER, origin)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn from_json(data: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(data).map_err(Into::into)
    }
}

/// One result row, column values in order.
pub type Row = Vec<serde_json::Value>;

/// Incremental access to a query result.
#[async_trait]
pub trait RowCursor: Send {
    fn columns(&self) -> &[String];

    /// Next row, `None` when the result is exhausted.
    async fn next_row(&mut self) -> Result<Option<Row>, ProtocolError>;
}

/// The analytical engine a data-source node runs queries on.
#[async_trait]
pub trait QueryEngine: Send + Sync + 'static {
    async fn query(&self, sql: &str) -> Result<Box<dyn RowCursor>, ProtocolError>;

    /// Write the full result of `sql` as a parquet file at `destination`.
    async fn export_parquet(&self, sql: &str, destination: &Path) -> Result<(), ProtocolError>;
}

/// A cursor over rows already in memory.
#[derive(Debug, Clone, Default)]
pub struct VecCursor {
    columns: Vec<String>,
    rows: VecDeque<Row>,
}

impl VecCursor {
    pub fn new(columns: Vec<String>, rows: impl IntoIterator<Item = Row>) -> Self {
        Self {
            columns,
            rows: rows.into_iter().collect(),
        }
    }
}

#[async_trait]
impl RowCursor for VecCursor {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<Row>, ProtocolError> {
        Ok(self.rows.pop_front())
    }
}

/// What a client received for one query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueryTransfer {
    pub envelopes: u64,
    pub bytes: u64,
}

// ── Result encoding ───────────────────────────────────────────────────

fn csv_field(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn encode_csv<I, R, F>(records: I) -> Result<Vec<u8>, ProtocolError>
where
    I: IntoIterator<Item = R>,
    R: IntoIterator<Item = F>,
    F: AsRef<[u8]>,
{
    let mut writer = csv::Writer::from_writer(Vec::new());
    for record in records {
        writer
            .write_record(record)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    }
    writer
        .into_inner()
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn encode_batch(format: QueryFormat, columns: &[String], batch: &[Row]) -> Result<Vec<u8>, ProtocolError> {
    match format {
        QueryFormat::Json => {
            let objects: Vec<serde_json::Map<String, serde_json::Value>> = batch
                .iter()
                .map(|row| columns.iter().cloned().zip(row.iter().cloned()).collect())
                .collect();
            serde_json::to_vec(&objects).map_err(|e| ProtocolError::Serialization(e.to_string()))
        }
        _ => encode_csv(batch.iter().map(|row| row.iter().map(csv_field))),
    }
}

struct EnvelopeSink<'a, W: ?Sized> {
    writer: &'a mut W,
    service: &'a str,
    sent: u64,
}

impl<W> EnvelopeSink<'_, W>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    async fn send(&mut self, payload: Vec<u8>) -> Result<(), ProtocolError> {
        write_envelope(&mut *self.writer, &ProtocolEnvelope::new(self.service, payload)).await?;
        self.sent += 1;
        Ok(())
    }
}

/// Run `sql` and write the result to `writer` as envelopes for `service`.
///
/// Returns the number of envelopes written.
pub async fn stream_results<W>(
    engine: &dyn QueryEngine,
    sql: &str,
    format: QueryFormat,
    block_size: usize,
    service: &str,
    writer: &mut W,
) -> Result<u64, ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut sink = EnvelopeSink {
        writer,
        service,
        sent: 0,
    };
    match format {
        QueryFormat::Parquet => stream_parquet(engine, sql, &mut sink).await?,
        QueryFormat::Csv | QueryFormat::Json => {
            let cursor = engine.query(sql).await?;
            stream_rows(cursor, format, block_size.max(1), &mut sink).await?
        }
    }
    sink.writer.flush().await?;
    Ok(sink.sent)
}

async fn stream_rows<W>(
    mut cursor: Box<dyn RowCursor>,
    format: QueryFormat,
    block_size: usize,
    sink: &mut EnvelopeSink<'_, W>,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let columns = cursor.columns().to_vec();
    if format == QueryFormat::Csv {
        sink.send(encode_csv([&columns])?).await?;
    }

    let mut batch = Vec::with_capacity(block_size.min(1024));
    while let Some(row) = cursor.next_row().await? {
        batch.push(row);
        if batch.len() >= block_size {
            sink.send(encode_batch(format, &columns, &batch)?).await?;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        sink.send(encode_batch(format, &columns, &batch)?).await?;
    }
    Ok(())
}

async fn stream_parquet<W>(
    engine: &dyn QueryEngine,
    sql: &str,
    sink: &mut EnvelopeSink<'_, W>,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("result.parquet");
    engine.export_parquet(sql, &path).await?;

    let mut file = tokio::fs::File::open(&path).await?;
    let mut chunk = vec![0u8; PARQUET_CHUNK_SIZE];
    loop {
        let n = read_chunk(&mut file, &mut chunk).await?;
        if n == 0 {
            break;
        }
        sink.send(chunk[..n].to_vec()).await?;
    }
    drop(file);
    dir.close()?;
    Ok(())
}

/// Fill `buf` unless the reader ends first. Returns the bytes read.
async fn read_chunk<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize, std::io::Error>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

// ── Server ────────────────────────────────────────────────────────────

pub(crate) async fn handle_inbound(node: &NetworkNode, mut stream: Stream) {
    let peer = stream.remote_peer();
    let protocol = stream.protocol().as_str();
    let network = node.config.name.as_str();

    if let Err(e) = node.authz.require_protocol(&peer, network, protocol).await {
        node.metrics.query_denied.inc();
        tracing::debug!(%peer, "query stream refused: {e}");
        stream.reset();
        return;
    }
    let request = match read_envelope(&mut stream, MAX_ENVELOPE_SIZE).await {
        Ok(Some(request)) => request,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!(%peer, "bad query request: {e}");
            stream.reset();
            return;
        }
    };
    if let Err(e) = node.authz.require(&peer, network, protocol, &request.service).await {
        node.metrics.query_denied.inc();
        tracing::debug!(%peer, service = %request.service, "query refused: {e}");
        stream.reset();
        return;
    }

    match serve(node, &request, &mut stream).await {
        Ok(sent) => {
            node.metrics.query_envelopes.inc_by(sent);
            tracing::debug!(%peer, service = %request.service, envelopes = sent, "query streamed");
            let _ = stream.shutdown().await;
        }
        Err(e) => {
            tracing::warn!(%peer, service = %request.service, "query failed: {e}");
            stream.reset();
        }
    }
}

/// Rows per envelope for a requested block size: zero picks `default`,
/// anything above `max` is capped.
pub fn effective_block_size(requested: usize, default: usize, max: usize) -> usize {
    let size = if requested == 0 { default } else { requested };
    size.clamp(1, max.max(1))
}

async fn serve(
    node: &NetworkNode,
    request: &ProtocolEnvelope,
    stream: &mut Stream,
) -> Result<u64, ProtocolError> {
    let source = node
        .config
        .resources
        .find(ServiceKind::DataSource, &request.service)
        .ok_or_else(|| ProtocolError::UnknownService(request.service.clone()))?;
    let engine = node
        .engine
        .as_deref()
        .ok_or_else(|| ProtocolError::Engine("no query engine configured".into()))?;
    let descriptor = QueryDescriptor::from_json(&request.payload)?;
    let block_size = effective_block_size(
        descriptor.block_size,
        node.config.default_block_size,
        node.config.max_block_size,
    );
    if block_size != descriptor.block_size && descriptor.block_size != 0 {
        tracing::debug!(requested = descriptor.block_size, block_size, "block size capped");
    }
    let sql = descriptor.resolve(&source.locator);
    tracing::debug!(service = %request.service, format = ?descriptor.format, block_size, "running query");

    stream_results(engine, &sql, descriptor.format, block_size, &request.service, stream).await
}

// ── Client ────────────────────────────────────────────────────────────

/// Send `descriptor` for `service` and append every result payload to `output`.
///
/// A refused or failed query is an error: the listener resets the stream,
/// and any envelopes still in flight are discarded with it.
pub async fn fetch_results<S>(
    stream: &mut S,
    service: &str,
    descriptor: &QueryDescriptor,
    output: &Path,
) -> Result<QueryTransfer, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    write_envelope(stream, &ProtocolEnvelope::new(service, descriptor.to_json()?)).await?;
    stream.flush().await?;

    let mut file = tokio::fs::File::create(output).await?;
    let mut transfer = QueryTransfer::default();
    while let Some(envelope) = read_envelope(stream, MAX_ENVELOPE_SIZE).await? {
        if envelope.is_end_marker() {
            break;
        }
        file.write_all(&envelope.payload).await?;
        transfer.envelopes += 1;
        transfer.bytes += envelope.payload.len() as u64;
    }
    file.flush().await?;
    Ok(transfer)
}
