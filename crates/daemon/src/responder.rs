//! Plain HTTP challenge responder
//!
//! Serves HTTP-01 responses out of the [`ChallengeResponder`] bridge, the
//! prometheus exposition at `/metrics`, and redirects `/` to the admin
//! interface for operators who forgot the `https`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{header, Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::bridge::ChallengeResponder;
use crate::metrics::Metrics;

/// Upper bound on a single client connection
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

const METRICS_PATH: &str = "/metrics";

/// HTTP server answering CA validation requests
#[derive(Debug, Clone)]
pub struct ChallengeServer {
    bridge: ChallengeResponder,
    metrics: Metrics,
    admin_url: String,
}

impl ChallengeServer {
    pub fn new(bridge: ChallengeResponder, metrics: Metrics, admin_url: impl Into<String>) -> Self {
        Self {
            bridge,
            metrics,
            admin_url: admin_url.into(),
        }
    }

    /// Build the response for a request to `path`
    pub fn respond(&self, method: &Method, path: &str) -> Response<Full<Bytes>> {
        if method != Method::GET && method != Method::HEAD {
            return simple(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n");
        }

        if path == "/" {
            return Response::builder()
                .status(StatusCode::MOVED_PERMANENTLY)
                .header(header::LOCATION, self.admin_url.as_str())
                .body(Full::new(Bytes::new()))
                .unwrap_or_else(|_| simple(StatusCode::INTERNAL_SERVER_ERROR, "bad redirect\n"));
        }

        if path == METRICS_PATH {
            return match self.metrics.export() {
                Ok(body) => Response::builder()
                    .header(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)
                    .body(Full::new(Bytes::from(body)))
                    .unwrap_or_else(|_| simple(StatusCode::INTERNAL_SERVER_ERROR, "\n")),
                Err(e) => {
                    warn!(error = %e, "Failed to export metrics");
                    simple(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable\n")
                }
            };
        }

        match self.bridge.get(path) {
            Some(value) => {
                debug!(path = %path, "Serving challenge response");
                Response::new(Full::new(Bytes::from(value)))
            }
            None => {
                info!(path = %path, "404");
                simple(StatusCode::NOT_FOUND, "404 page not found\n")
            }
        }
    }

    /// Bind `addr` and serve until the task is dropped
    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %addr, "Challenge responder listening");
        self.serve_listener(listener).await
    }

    /// Serve connections accepted on `listener`
    pub async fn serve_listener(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Accept error");
                    continue;
                }
            };

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let response = server.respond(req.method(), req.uri().path());
                    async move { Ok::<_, Infallible>(response) }
                });

                let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
                match tokio::time::timeout(CONNECTION_TIMEOUT, conn).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(remote = %remote, error = %e, "Connection error"),
                    Err(_) => debug!(remote = %remote, "Connection timed out"),
                }
            });
        }
    }
}

fn simple(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}
