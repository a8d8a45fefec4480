use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use peerd_core::{Asn, PeerError, PeerManager, PeerRecord};

use crate::auth::{AuthDecision, BearerAuth};

/// Largest request body accepted
const MAX_BODY_BYTES: usize = 64 * 1024;

const TEXT: &str = "text/plain; charset=utf-8";
const JSON: &str = "application/json; charset=utf-8";

/// Body of `/get` and `/del`; other peer fields are ignored
#[derive(Debug, Deserialize)]
struct AsnQuery {
    asn: Asn,
}

/// HTTP API accepting peer add/get/delete requests
pub struct ApiPlane {
    manager: Arc<PeerManager>,
    auth: BearerAuth,
    /// Optional TLS acceptor for HTTPS mode
    tls_acceptor: Option<TlsAcceptor>,
}

impl ApiPlane {
    pub fn new(
        manager: Arc<PeerManager>,
        auth: BearerAuth,
        tls_acceptor: Option<TlsAcceptor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            auth,
            tls_acceptor,
        })
    }

    /// Serve an HTTP connection on any AsyncRead + AsyncWrite stream
    async fn serve_connection<S>(self: Arc<Self>, stream: S, peer_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req| {
            let this = self.clone();
            async move { this.handle_request(req).await }
        });

        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
            tracing::debug!("API connection error from {}: {}", peer_addr, e);
        }
    }

    /// Bind `addr` and serve until the listener fails
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already bound listener
    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        if self.tls_acceptor.is_some() {
            tracing::info!("API listening on https://{}", addr);
        } else {
            tracing::info!("API listening on http://{}", addr);
        }

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            tracing::debug!("API connection from {}", peer_addr);
            let this = self.clone();

            tokio::spawn(async move {
                if let Some(ref acceptor) = this.tls_acceptor {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            this.serve_connection(tls_stream, peer_addr).await;
                        }
                        Err(e) => {
                            tracing::warn!("TLS handshake failed from {}: {}", peer_addr, e);
                        }
                    }
                } else {
                    this.serve_connection(stream, peer_addr).await;
                }
            });
        }
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        tracing::debug!("API request: {} {}", req.method(), req.uri().path());

        if self.auth.validate(&req) == AuthDecision::Unauthorized {
            tracing::warn!("Unauthorized {} {}", req.method(), req.uri().path());
            return Ok(text(StatusCode::UNAUTHORIZED, "Unauthorized\n"));
        }

        let route = match (req.method(), req.uri().path()) {
            (&Method::POST, "/add") => Route::Add,
            (&Method::POST, "/get") => Route::Get,
            (&Method::POST, "/del") => Route::Delete,
            _ => return Ok(text(StatusCode::NOT_FOUND, "Not Found\n")),
        };

        let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::debug!("Failed to read request body: {}", e);
                return Ok(text(
                    StatusCode::BAD_REQUEST,
                    format!("Failed to read request body: {}", e),
                ));
            }
        };

        Ok(match route {
            Route::Add => self.add(&body).await,
            Route::Get => self.get(&body).await,
            Route::Delete => self.delete(&body).await,
        })
    }

    async fn add(&self, body: &[u8]) -> Response<Full<Bytes>> {
        let peer: PeerRecord = match serde_json::from_slice(body) {
            Ok(peer) => peer,
            Err(e) => return invalid_json(e),
        };
        let asn = peer.asn;

        let manager = self.manager.clone();
        match run_detached(async move { manager.add_peer(peer).await }).await {
            Ok(Ok(())) => text(StatusCode::OK, format!("Peer added: {}", asn)),
            Ok(Err(e)) => peer_error(&e),
            Err(response) => response,
        }
    }

    async fn get(&self, body: &[u8]) -> Response<Full<Bytes>> {
        let query: AsnQuery = match serde_json::from_slice(body) {
            Ok(query) => query,
            Err(e) => return invalid_json(e),
        };

        let manager = self.manager.clone();
        match run_detached(async move { manager.get_peer(query.asn).await }).await {
            Ok(Ok(peer)) => match serde_json::to_vec(&peer) {
                Ok(json) => respond(StatusCode::OK, JSON, json),
                Err(e) => text(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Failed to serialize peer: {}", e),
                ),
            },
            Ok(Err(e)) => peer_error(&e),
            Err(response) => response,
        }
    }

    async fn delete(&self, body: &[u8]) -> Response<Full<Bytes>> {
        let query: AsnQuery = match serde_json::from_slice(body) {
            Ok(query) => query,
            Err(e) => return invalid_json(e),
        };
        let asn = query.asn;

        let manager = self.manager.clone();
        match run_detached(async move { manager.delete_peer(asn).await }).await {
            Ok(Ok(_)) => text(StatusCode::OK, format!("Peer deleted: {}", asn)),
            Ok(Err(e)) => peer_error(&e),
            Err(response) => response,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Route {
    Add,
    Get,
    Delete,
}

/// Run a manager operation on its own task so a dropped connection cannot
/// cancel it halfway through. A panic becomes a 500 response.
async fn run_detached<F, T>(op: F) -> Result<T, Response<Full<Bytes>>>
where
    F: std::future::Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(op).await.map_err(|e| {
        tracing::error!("Peer operation aborted: {}", e);
        text(StatusCode::INTERNAL_SERVER_ERROR, "Internal error\n")
    })
}

fn status_for(err: &PeerError) -> StatusCode {
    match err {
        PeerError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
        PeerError::NotFound(_) => StatusCode::NOT_FOUND,
        PeerError::AlreadyExists(_) | PeerError::ListenPortInUse { .. } => StatusCode::CONFLICT,
        PeerError::Render(_)
        | PeerError::ApplyFailed(_)
        | PeerError::RetractFailed(_)
        | PeerError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn peer_error(err: &PeerError) -> Response<Full<Bytes>> {
    text(status_for(err), err.to_string())
}

fn invalid_json(err: serde_json::Error) -> Response<Full<Bytes>> {
    text(StatusCode::BAD_REQUEST, format!("Invalid JSON: {}", err))
}

fn text(status: StatusCode, body: impl Into<String>) -> Response<Full<Bytes>> {
    respond(status, TEXT, body.into())
}

fn respond(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .body(Full::new(body.into()))
        .unwrap_or_else(|e| {
            tracing::error!("Failed to build response: {}", e);
            let mut fallback = Response::new(Full::new(Bytes::from_static(
                b"Internal Server Error\n",
            )));
            *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            fallback
        })
}
