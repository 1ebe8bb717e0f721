//! HTTP server implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::protect;
use crate::error::{Result, TurnstileError};
use crate::ratelimit::RateLimiter;

/// Build the application router with every route behind the admission check.
pub fn router(limiter: Arc<RateLimiter>) -> Router {
    protect(Router::new().route("/", get(welcome)), limiter)
}

async fn welcome() -> &'static str {
    "Welcome!"
}

/// HTTP server fronted by the admission gateway.
pub struct GatewayServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiter instance
    limiter: Arc<RateLimiter>,
}

impl GatewayServer {
    /// Create a new server.
    pub fn new(addr: SocketAddr, limiter: Arc<RateLimiter>) -> Self {
        Self { addr, limiter }
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        run(listener, self.limiter, signal).await
    }
}

/// Serve on an already bound listener until `signal` resolves.
pub async fn run<F>(listener: TcpListener, limiter: Arc<RateLimiter>, signal: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(
        addr = %listener.local_addr()?,
        "Starting HTTP admission gateway"
    );

    let app = router(limiter).into_make_service_with_connect_info::<SocketAddr>();

    axum::serve(listener, app)
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TurnstileError::Io(e)
        })
}
