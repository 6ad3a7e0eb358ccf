//! Local HTTP gateway onto other members' services.
//!
//! Applications on the node's machine reach the private network through
//! plain HTTP. For every mounted network:
//!
//! - `<METHOD> /<network>/<service>[/<path>]` is dumped as a raw request
//!   and forwarded over the proxy protocol to the provider of `service`.
//!   The provider's response body is returned as is.
//! - `POST /<network>/ds/<name>` takes a [`QueryDescriptor`] as JSON, runs
//!   it on the provider of data source `name` and returns the result.
//!
//! Only services listed in the network's `remote_resources` are routed.
//! Anything else is a 404 without touching the network.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use http::request::Parts;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::node::NetworkNode;
use crate::query::{QueryDescriptor, QueryFormat};
use crate::resources::ServiceKind;
use crate::ProtocolError;

/// Largest request body the gateway reads.
pub const MAX_GATEWAY_BODY: usize = 8 * 1024 * 1024;

/// Path segment that introduces a data source.
const DATA_SOURCE_SEGMENT: &str = "ds";

#[derive(Debug, PartialEq, Eq)]
enum Route<'a> {
    Api {
        network: &'a str,
        service: &'a str,
        /// Remainder of the path after the service name, possibly empty.
        rest: &'a str,
    },
    DataSource {
        network: &'a str,
        name: &'a str,
    },
}

/// Serves the gateway routes for a set of networks.
#[derive(Default)]
pub struct LocalGateway {
    networks: HashMap<String, Arc<NetworkNode>>,
}

impl LocalGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `/<name>/...` to `node`, where `name` is the node's network.
    pub fn mount(mut self, node: Arc<NetworkNode>) -> Self {
        self.networks.insert(node.config.name.clone(), node);
        self
    }

    /// Bind the configured listen address.
    pub async fn bind(config: &GatewayConfig) -> Result<TcpListener, ProtocolError> {
        Ok(TcpListener::bind(config.socket_addr()?).await?)
    }

    /// Accept connections on `listener` until `cancel` fires.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), ProtocolError> {
        let local = listener.local_addr()?;
        tracing::info!(%local, networks = self.networks.len(), "local gateway listening");

        loop {
            let (tcp, remote) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("gateway accept failed: {e}");
                        continue;
                    }
                },
            };
            let gateway = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let service = service_fn(move |request| {
                    let gateway = gateway.clone();
                    async move { Ok::<_, Infallible>(gateway.handle(request).await) }
                });
                let connection = http1::Builder::new().serve_connection(TokioIo::new(tcp), service);
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    result = connection => {
                        if let Err(e) = result {
                            tracing::debug!(%remote, "gateway connection ended: {e}");
                        }
                    }
                }
            });
        }
        tracing::debug!(%local, "local gateway stopped");
        Ok(())
    }

    async fn handle(&self, request: Request<Incoming>) -> Response<Full<Bytes>> {
        let (parts, body) = request.into_parts();
        let path = parts.uri.path().to_string();
        let route = match self.route(&parts.method, &path) {
            Ok(route) => route,
            Err(status) => return text(status, status.canonical_reason().unwrap_or_default()),
        };
        let body = match Limited::new(body, MAX_GATEWAY_BODY).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => return text(StatusCode::PAYLOAD_TOO_LARGE, &format!("unreadable body: {e}")),
        };

        match route {
            Route::Api {
                network,
                service,
                rest,
            } => self.forward(network, service, &dump_request(&parts, rest, &body)).await,
            Route::DataSource { network, name } => self.query(network, name, &body).await,
        }
    }

    fn route<'a>(&self, method: &Method, path: &'a str) -> Result<Route<'a>, StatusCode> {
        let path = path.strip_prefix('/').unwrap_or(path);
        let (network, tail) = path.split_once('/').ok_or(StatusCode::NOT_FOUND)?;
        let node = self.networks.get(network).ok_or(StatusCode::NOT_FOUND)?;
        let remote = &node.config.remote_resources;

        if let Some(name) = tail.strip_prefix(DATA_SOURCE_SEGMENT).and_then(|t| t.strip_prefix('/')) {
            if remote.find(ServiceKind::DataSource, name).is_some() {
                if method != Method::POST {
                    return Err(StatusCode::METHOD_NOT_ALLOWED);
                }
                return Ok(Route::DataSource { network, name });
            }
        }

        let (service, rest) = match tail.find('/') {
            Some(at) => tail.split_at(at),
            None => (tail, ""),
        };
        if remote.find(ServiceKind::Api, service).is_none() {
            return Err(StatusCode::NOT_FOUND);
        }
        Ok(Route::Api {
            network,
            service,
            rest,
        })
    }

    async fn forward(&self, network: &str, service: &str, request: &[u8]) -> Response<Full<Bytes>> {
        let Some(node) = self.networks.get(network) else {
            return text(StatusCode::NOT_FOUND, "unknown network");
        };
        match node.call_service(service, request.to_vec()).await {
            Ok(body) => Response::new(Full::new(Bytes::from(body))),
            Err(e) => {
                tracing::warn!(network, service, "gateway call failed: {e}");
                text(status_for(&e), &e.to_string())
            }
        }
    }

    async fn query(&self, network: &str, name: &str, body: &[u8]) -> Response<Full<Bytes>> {
        let Some(node) = self.networks.get(network) else {
            return text(StatusCode::NOT_FOUND, "unknown network");
        };
        let descriptor = match QueryDescriptor::from_json(body) {
            Ok(descriptor) => descriptor,
            Err(e) => return text(StatusCode::BAD_REQUEST, &format!("invalid JSON: {e}")),
        };
        if descriptor.query.trim().is_empty() {
            return text(StatusCode::BAD_REQUEST, "query is required");
        }

        match run_query(node, name, &descriptor).await {
            Ok(result) => {
                let content_type = match descriptor.format {
                    QueryFormat::Csv => "text/csv",
                    QueryFormat::Json => "application/json",
                    QueryFormat::Parquet => "application/vnd.apache.parquet",
                };
                let mut response = Response::new(Full::new(Bytes::from(result)));
                response
                    .headers_mut()
                    .insert(header::CONTENT_TYPE, header::HeaderValue::from_static(content_type));
                response
            }
            Err(e) => {
                tracing::warn!(network, source = name, "gateway query failed: {e}");
                text(status_for(&e), &e.to_string())
            }
        }
    }
}

async fn run_query(
    node: &NetworkNode,
    name: &str,
    descriptor: &QueryDescriptor,
) -> Result<Vec<u8>, ProtocolError> {
    let dir = tempfile::tempdir()?;
    let output = dir.path().join("result");
    node.query(name, descriptor, &output).await?;
    Ok(tokio::fs::read(&output).await?)
}

/// Rebuild an HTTP/1.1 request dump whose target is the path below the service.
fn dump_request(parts: &Parts, rest: &str, body: &[u8]) -> Vec<u8> {
    let mut target = if rest.is_empty() { "/".to_string() } else { rest.to_string() };
    if let Some(query) = parts.uri.query() {
        target.push('?');
        target.push_str(query);
    }

    let mut dump = format!("{} {target} HTTP/1.1\r\n", parts.method).into_bytes();
    for (name, value) in &parts.headers {
        dump.extend_from_slice(name.as_str().as_bytes());
        dump.extend_from_slice(b": ");
        dump.extend_from_slice(value.as_bytes());
        dump.extend_from_slice(b"\r\n");
    }
    dump.extend_from_slice(b"\r\n");
    dump.extend_from_slice(body);
    dump
}

fn status_for(error: &ProtocolError) -> StatusCode {
    match error {
        ProtocolError::NoProvider(_) | ProtocolError::UnknownService(_) => StatusCode::NOT_FOUND,
        ProtocolError::Unauthorized | ProtocolError::Rejected => StatusCode::FORBIDDEN,
        _ => StatusCode::BAD_GATEWAY,
    }
}

fn text(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, header::HeaderValue::from_static("text/plain"));
    response
}
