//! HTTP gateway
//!
//! Serves the producer/consumer HTTP surface: the `/events` SSE endpoint,
//! the `/store` mutation and query routes, and the health/metrics probes.
//! One hyper HTTP/1.1 connection task per client; SSE responses stream from
//! the subscriber's delivery channel.

pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{GalenaError, Result};
use crate::sse::Hub;
use crate::store::Store;

/// Shared state handed to every request handler.
pub struct AppState {
    /// The document store
    pub store: Arc<dyn Store>,
    /// The broadcast hub
    pub hub: Arc<Hub>,
    /// Maximum accepted request body size in bytes
    pub max_body_size: usize,
    /// Process start time, for the metrics endpoint
    pub started_at: Instant,
}

/// HTTP gateway server.
pub struct Gateway {
    bind: String,
    port: u16,
    state: Arc<AppState>,
}

impl Gateway {
    /// Create a gateway over the given store and hub.
    pub fn new(config: &Config, store: Arc<dyn Store>, hub: Arc<Hub>) -> Self {
        Self {
            bind: config.bind.clone(),
            port: config.port,
            state: Arc::new(AppState {
                store,
                hub,
                max_body_size: config.max_body_bytes(),
                started_at: Instant::now(),
            }),
        }
    }

    /// Bind the listener and serve requests until the shutdown signal fires.
    pub async fn start(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|e| GalenaError::Config(format!("invalid bind address: {e}")))?;

        let listener = TcpListener::bind(addr).await?;
        info!("HTTP gateway listening on {addr}");

        loop {
            let accepted = tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("stopping accept loop");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            let (stream, remote_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };

            let io = TokioIo::new(stream);
            let state = Arc::clone(&self.state);

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let state = Arc::clone(&state);
                    async move {
                        Ok::<_, std::convert::Infallible>(
                            handlers::handle_request(req, state).await,
                        )
                    }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("HTTP connection error from {remote_addr}: {e}");
                }
            });
        }
    }
}
