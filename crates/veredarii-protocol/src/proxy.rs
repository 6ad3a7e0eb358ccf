//! Call forwarding over a long-lived envelope stream.
//!
//! Each inbound [`ProtocolEnvelope`] carries a raw request for one API
//! service. The listener authorizes the service, hands the payload to a
//! [`ServiceBackend`] and answers with the response body in a new envelope.
//! A denial resets the stream: no further envelopes are read from it.

use async_trait::async_trait;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::Method;
use tokio::io::AsyncWriteExt;
use veredarii_transport::{Host, PeerId, Stream};

use crate::codec::{read_envelope, write_envelope, ProtocolEnvelope, MAX_ENVELOPE_SIZE};
use crate::node::NetworkNode;
use crate::protocols;
use crate::resources::{ServiceDescriptor, ServiceKind};
use crate::ProtocolError;

/// Executes a forwarded request against a locally hosted service.
#[async_trait]
pub trait ServiceBackend: Send + Sync + 'static {
    /// Forward `request` to `service` and return the response body.
    async fn forward(
        &self,
        service: &ServiceDescriptor,
        request: &[u8],
    ) -> Result<Vec<u8>, ProtocolError>;
}

// ── HTTP backend ──────────────────────────────────────────────────────

/// A parsed HTTP/1.x request dump.
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub method: Method,
    /// Path and query of the request target.
    pub target: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Headers that describe the original hop and must not be replayed.
const HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
];

impl RawRequest {
    /// Parse `METHOD target HTTP/1.x`, headers, blank line, body.
    pub fn parse(raw: &[u8]) -> Result<Self, ProtocolError> {
        let (head, body) = split_head(raw)
            .ok_or_else(|| ProtocolError::Backend("request has no header terminator".into()))?;
        let head = std::str::from_utf8(head)
            .map_err(|_| ProtocolError::Backend("request head is not utf-8".into()))?;
        let mut lines = head.lines();

        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
            return Err(ProtocolError::Backend(format!(
                "malformed request line {request_line:?}"
            )));
        };
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|e| ProtocolError::Backend(format!("bad method: {e}")))?;
        let target = request_target(target)?;

        let mut headers = HeaderMap::new();
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim().to_ascii_lowercase();
            if HOP_HEADERS.contains(&name.as_str()) {
                continue;
            }
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ProtocolError::Backend(format!("bad header name: {e}")))?;
            let value = HeaderValue::from_str(value.trim())
                .map_err(|e| ProtocolError::Backend(format!("bad header value: {e}")))?;
            headers.append(name, value);
        }

        Ok(Self {
            method,
            target,
            headers,
            body: body.to_vec(),
        })
    }

    /// The target rebased onto a service locator such as `http://127.0.0.1:3000`.
    ///
    /// A bare `/` target, with or without a query, addresses the locator itself.
    pub fn url_for(&self, locator: &str) -> String {
        let base = locator.trim_end_matches('/');
        match self.target.strip_prefix('/') {
            Some(rest) if rest.is_empty() || rest.starts_with('?') => format!("{base}{rest}"),
            _ => format!("{base}{}", self.target),
        }
    }
}

fn split_head(raw: &[u8]) -> Option<(&[u8], &[u8])> {
    if let Some(at) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some((&raw[..at], &raw[at + 4..]));
    }
    raw.windows(2)
        .position(|w| w == b"\n\n")
        .map(|at| (&raw[..at], &raw[at + 2..]))
}

fn request_target(target: &str) -> Result<String, ProtocolError> {
    if target.starts_with('/') {
        return Ok(target.to_string());
    }
    let uri: http::Uri = target
        .parse()
        .map_err(|e| ProtocolError::Backend(format!("bad request target: {e}")))?;
    Ok(uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string()))
}

/// Replays request dumps against HTTP services with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new() -> Result<Self, ProtocolError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ProtocolError::Config(format!("http client: {e}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ServiceBackend for HttpBackend {
    async fn forward(
        &self,
        service: &ServiceDescriptor,
        request: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        let raw = RawRequest::parse(request)?;
        let url = raw.url_for(&service.locator);
        tracing::debug!(service = %service.name, method = %raw.method, %url, "forwarding request");

        let response = self
            .client
            .request(raw.method, url)
            .headers(raw.headers)
            .body(raw.body)
            .send()
            .await
            .map_err(|e| ProtocolError::Backend(e.to_string()))?;
        let body = response
            .bytes()
            .await
            .map_err(|e| ProtocolError::Backend(e.to_string()))?;
        Ok(body.to_vec())
    }
}

// ── Server ────────────────────────────────────────────────────────────

pub(crate) async fn handle_inbound(node: &NetworkNode, mut stream: Stream) {
    let peer = stream.remote_peer();
    let protocol = stream.protocol().as_str();
    let network = node.config.name.as_str();

    loop {
        // Re-checked before every frame: the session may have gone away.
        if let Err(e) = node.authz.require_protocol(&peer, network, protocol).await {
            node.metrics.proxy_denied.inc();
            tracing::debug!(%peer, "proxy stream refused: {e}");
            stream.reset();
            return;
        }
        let request = match read_envelope(&mut stream, MAX_ENVELOPE_SIZE).await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(%peer, "proxy stream ended: {e}");
                stream.reset();
                return;
            }
        };
        if let Err(e) = node.authz.require(&peer, network, protocol, &request.service).await {
            node.metrics.proxy_denied.inc();
            tracing::debug!(%peer, service = %request.service, "proxy call refused: {e}");
            stream.reset();
            return;
        }

        node.metrics.proxy_calls.inc();
        let reply = match serve(node, &request).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(%peer, service = %request.service, "proxied call failed: {e}");
                stream.reset();
                return;
            }
        };
        if let Err(e) = send(&mut stream, &reply).await {
            tracing::warn!(%peer, service = %request.service, "proxy reply not delivered: {e}");
            stream.reset();
            return;
        }
    }
    let _ = stream.shutdown().await;
}

async fn serve(node: &NetworkNode, request: &ProtocolEnvelope) -> Result<ProtocolEnvelope, ProtocolError> {
    let service = node
        .config
        .resources
        .find(ServiceKind::Api, &request.service)
        .ok_or_else(|| ProtocolError::UnknownService(request.service.clone()))?;
    let body = node.backend.forward(&service, &request.payload).await?;
    Ok(ProtocolEnvelope::new(request.service.clone(), body))
}

async fn send(stream: &mut Stream, envelope: &ProtocolEnvelope) -> Result<(), ProtocolError> {
    write_envelope(stream, envelope).await?;
    stream.flush().await?;
    Ok(())
}

// ── Client ────────────────────────────────────────────────────────────

/// One proxy stream to a provider, used for sequential calls.
pub struct ProxyClient {
    stream: Stream,
}

impl ProxyClient {
    pub async fn open(host: &dyn Host, peer: PeerId) -> Result<Self, ProtocolError> {
        let stream = host.open_stream(peer, protocols::API_PROXY).await?;
        Ok(Self { stream })
    }

    pub fn remote_peer(&self) -> PeerId {
        self.stream.remote_peer()
    }

    /// Send one request and wait for its response body.
    ///
    /// A closed stream means the provider refused the call.
    pub async fn call(&mut self, service: &str, request: Vec<u8>) -> Result<Vec<u8>, ProtocolError> {
        let envelope = ProtocolEnvelope::new(service, request);
        send(&mut self.stream, &envelope).await?;
        match read_envelope(&mut self.stream, MAX_ENVELOPE_SIZE).await? {
            Some(reply) => Ok(reply.payload),
            None => Err(ProtocolError::Rejected),
        }
    }
}
