//! HTTP front end
//!
//! Serves the relay over HTTP/1.1:
//!
//! - `GET|HEAD /stream/{id}`: audio bytes, honouring `Range`
//! - `GET /health`: liveness check
//! - `GET /metrics`: Prometheus text format

use crate::error::{RelayError, Result};
use crate::relay::{RangeRelay, RelayBody, RelayResponse};
use bytes::Bytes;
use http::header::{HeaderValue, ACCEPT_RANGES, ALLOW, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use http::{Method, StatusCode};
use hyper::body::{Body, Frame, SizeHint};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

const STREAM_PREFIX: &str = "/stream/";

/// Response body fed either from memory or from a relay channel
#[derive(Debug, Default)]
pub struct ChannelBody {
    full: Option<Bytes>,
    rx: Option<mpsc::Receiver<Bytes>>,
}

impl ChannelBody {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn full(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        ChannelBody {
            full: if bytes.is_empty() { None } else { Some(bytes) },
            rx: None,
        }
    }

    pub fn channel(rx: mpsc::Receiver<Bytes>) -> Self {
        ChannelBody {
            full: None,
            rx: Some(rx),
        }
    }
}

impl From<RelayBody> for ChannelBody {
    fn from(body: RelayBody) -> Self {
        match body {
            RelayBody::Full(bytes) => ChannelBody::full(bytes),
            RelayBody::Stream(rx) => ChannelBody::channel(rx),
        }
    }
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, Infallible>>> {
        let this = self.get_mut();
        if let Some(bytes) = this.full.take() {
            return Poll::Ready(Some(Ok(Frame::data(bytes))));
        }

        let Some(rx) = this.rx.as_mut() else {
            return Poll::Ready(None);
        };
        match rx.poll_recv(cx) {
            Poll::Ready(Some(bytes)) => Poll::Ready(Some(Ok(Frame::data(bytes)))),
            Poll::Ready(None) => {
                this.rx = None;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.full.is_none() && self.rx.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        match (&self.full, &self.rx) {
            (Some(bytes), None) => SizeHint::with_exact(bytes.len() as u64),
            (None, None) => SizeHint::with_exact(0),
            _ => SizeHint::default(),
        }
    }
}

/// HTTP server bound to a listening socket
pub struct RelayServer {
    listener: TcpListener,
    relay: RangeRelay,
    local_addr: SocketAddr,
}

impl RelayServer {
    /// Bind the listening socket; port 0 picks a free port
    pub async fn bind(addr: SocketAddr, relay: RangeRelay) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(RelayServer {
            listener,
            relay,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `shutdown` flips to true or its sender is dropped
    ///
    /// Open connections are asked to finish their current response and close.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if *shutdown.borrow() {
            return Ok(());
        }
        info!("Relay listening on http://{}", self.local_addr);
        info!("Streams available at http://{}/stream/{{id}}", self.local_addr);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    let io = TokioIo::new(stream);
                    let relay = self.relay.clone();
                    let mut conn_shutdown = shutdown.clone();

                    tokio::task::spawn(async move {
                        let service = service_fn(move |req| {
                            let relay = relay.clone();
                            async move { handle_request(req, relay).await }
                        });

                        let conn = http1::Builder::new().serve_connection(io, service);
                        tokio::pin!(conn);
                        let mut draining = false;
                        loop {
                            tokio::select! {
                                result = conn.as_mut() => {
                                    if let Err(err) = result {
                                        debug!("Error serving connection from {}: {:?}", peer, err);
                                    }
                                    break;
                                }
                                _ = conn_shutdown.changed(), if !draining => {
                                    draining = true;
                                    conn.as_mut().graceful_shutdown();
                                }
                            }
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Relay server stopping");
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Route one request
pub async fn handle_request<B>(
    req: Request<B>,
    relay: RangeRelay,
) -> std::result::Result<Response<ChannelBody>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let range = req
        .headers()
        .get(RANGE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    drop(req);

    if let Some(id) = path.strip_prefix(STREAM_PREFIX) {
        let result = match method {
            Method::GET => relay.serve(id, range.as_deref()).await,
            Method::HEAD => relay.head(id, range.as_deref()).await,
            _ => return Ok(method_not_allowed()),
        };
        return Ok(match result {
            Ok(response) => stream_response(response),
            Err(e) => error_response(&e),
        });
    }

    Ok(match (&method, path.as_str()) {
        (&Method::GET, "/health") => json_response(
            StatusCode::OK,
            serde_json::json!({ "status": "ok" }),
        ),
        (&Method::GET, "/metrics") => metrics_response(&relay),
        _ => json_response(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": "Not found" }),
        ),
    })
}

fn stream_response(relay_response: RelayResponse) -> Response<ChannelBody> {
    let RelayResponse {
        status,
        content_type,
        content_range,
        content_length,
        body,
    } = relay_response;

    let mut response = Response::new(ChannelBody::from(body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(content_length));
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        headers.insert(CONTENT_TYPE, value);
    }
    if let Some(content_range) = content_range {
        if let Ok(value) = HeaderValue::from_str(&content_range) {
            headers.insert(CONTENT_RANGE, value);
        }
    }
    response
}

fn error_response(error: &RelayError) -> Response<ChannelBody> {
    let status =
        StatusCode::from_u16(error.to_http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() && !matches!(status, StatusCode::BAD_GATEWAY) {
        error!("Internal failure: {}", error);
    }
    json_response(status, serde_json::json!({ "error": error.client_message() }))
}

fn method_not_allowed() -> Response<ChannelBody> {
    let mut response = json_response(
        StatusCode::METHOD_NOT_ALLOWED,
        serde_json::json!({ "error": "Method not allowed" }),
    );
    response
        .headers_mut()
        .insert(ALLOW, HeaderValue::from_static("GET, HEAD"));
    response
}

fn metrics_response(relay: &RangeRelay) -> Response<ChannelBody> {
    let body = relay.metrics().get_stats().to_prometheus();
    let mut response = Response::new(ChannelBody::full(body));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
    );
    response
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<ChannelBody> {
    let body = value.to_string();
    let mut response = Response::new(ChannelBody::full(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
