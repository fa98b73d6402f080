//! HTTP server for the decision API.

use std::net::SocketAddr;

use axum::extract::Request;
use axum::middleware::from_fn;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, info_span};
use uuid::Uuid;

use super::middleware::track_requests;
use super::service::router;
use super::AppState;
use crate::error::{GatewayError, Result};

/// HTTP server exposing the decision API.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Shared route state
    state: AppState,
}

impl HttpServer {
    /// Create a new server.
    pub fn new(addr: SocketAddr, state: AppState) -> Self {
        Self { addr, state }
    }

    /// The full application: decision routes plus request metrics and tracing.
    pub fn app(&self) -> Router {
        router(self.state.clone())
            .layer(from_fn(track_requests))
            .layer(TraceLayer::new_for_http().make_span_with(|request: &Request| {
                info_span!(
                    "request",
                    id = %Uuid::new_v4(),
                    method = %request.method(),
                    path = %request.uri().path(),
                )
            }))
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            GatewayError::Io(e)
        })?;

        info!(
            addr = %self.addr,
            caller_header = %self.state.caller_header(),
            "Starting HTTP server for admission decisions"
        );

        axum::serve(listener, self.app())
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                GatewayError::Io(e)
            })
    }
}
