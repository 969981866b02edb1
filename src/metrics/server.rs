//! HTTP monitoring endpoint
//!
//! Serves Prometheus metrics and JSON introspection of a running server:
//! `/metrics`, `/varz`, `/connz`, `/routez`, `/subsz` and `/healthz`.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::SystemTime;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, TextEncoder, TEXT_FORMAT};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::broker::Server;

const JSON: &str = "application/json";

/// HTTP server exposing metrics and introspection for one [`Server`]
pub struct MonitorServer {
    server: Arc<Server>,
}

impl MonitorServer {
    pub fn new(server: Arc<Server>) -> Self {
        Self { server }
    }

    /// Serve requests on `listener` until `shutdown` fires
    pub async fn run(self, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = listener.accept() => result,
            };
            let stream = match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    error!("Failed to accept monitoring connection: {}", e);
                    continue;
                }
            };

            let io = TokioIo::new(stream);
            let server = self.server.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { handle_request(req, server).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Error serving monitoring connection: {:?}", err);
                }
            });
        }
        debug!("Monitoring endpoint stopped");
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn respond_json(value: &Value) -> Response<Full<Bytes>> {
    match serde_json::to_vec_pretty(value) {
        Ok(body) => respond(StatusCode::OK, JSON, Bytes::from(body)),
        Err(e) => {
            error!("Failed to encode monitoring response: {}", e);
            respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                Bytes::from_static(b"Failed to encode response"),
            )
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    server: Arc<Server>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/metrics" => metrics(&server),
        "/varz" => respond_json(&varz(&server)),
        "/connz" => respond_json(&connz(&server)),
        "/routez" => respond_json(&routez(&server)),
        "/subsz" => respond_json(&subsz(&server)),
        "/health" | "/healthz" => {
            respond(StatusCode::OK, "text/plain", Bytes::from_static(b"OK"))
        }
        _ => respond(
            StatusCode::NOT_FOUND,
            "text/plain",
            Bytes::from_static(b"Not Found"),
        ),
    };
    Ok(response)
}

fn metrics(server: &Server) -> Response<Full<Bytes>> {
    let metrics = server.metrics();
    metrics
        .subscriptions_current
        .set(server.subscription_count() as i64);

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&metrics.registry.gather(), &mut buffer) {
        Ok(()) => respond(StatusCode::OK, TEXT_FORMAT, Bytes::from(buffer)),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                Bytes::from_static(b"Failed to encode metrics"),
            )
        }
    }
}

fn varz(server: &Server) -> Value {
    let config = server.config();
    let metrics = server.metrics();
    let uptime = SystemTime::now()
        .duration_since(server.started_at())
        .unwrap_or_default();
    json!({
        "server_id": server.server_id().as_str(),
        "server_name": server.name(),
        "version": env!("CARGO_PKG_VERSION"),
        "start": server.started_at(),
        "uptime_secs": uptime.as_secs(),
        "client_addr": server.client_addr(),
        "cluster_addr": server.cluster_addr(),
        "max_payload": config.limits.max_payload,
        "max_connections": config.limits.max_connections,
        "connections": server.clients().len(),
        "total_connections": metrics.connections_total.get(),
        "routes": server.routes_snapshot().len(),
        "subscriptions": server.subscription_count(),
        "in_msgs": metrics.messages_received.get(),
        "out_msgs": metrics.messages_sent.get(),
        "in_bytes": metrics.bytes_received.get(),
        "out_bytes": metrics.bytes_sent.get(),
        "slow_consumers": metrics.slow_consumers_total.get(),
        "cid": server.current_cid(),
    })
}

fn connz(server: &Server) -> Value {
    let registry = server.registry();
    let connections: Vec<_> = server
        .clients()
        .snapshot()
        .iter()
        .map(|client| client.info(registry.owner_count(client.id())))
        .collect();
    json!({
        "num_connections": connections.len(),
        "connections": connections,
    })
}

fn routez(server: &Server) -> Value {
    let routes = server.routes_snapshot();
    let dialers: Vec<Value> = server
        .coordinator()
        .map(|coordinator| coordinator.dialer_states())
        .unwrap_or_default()
        .into_iter()
        .map(|(url, state)| json!({ "url": url.to_string(), "state": state }))
        .collect();
    json!({
        "server_id": server.server_id().as_str(),
        "num_routes": routes.len(),
        "routes": routes,
        "configured": dialers,
    })
}

fn subsz(server: &Server) -> Value {
    let registry = server.registry();
    json!({
        "num_subscriptions": registry.count(),
        "num_local": registry.local_count(),
        "num_interest_keys": registry.interest_count(),
        "num_queue_groups": registry.queue_group_count(),
    })
}
