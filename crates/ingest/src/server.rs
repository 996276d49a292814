use std::future::Future;
use std::net::SocketAddr;

use axum::Router;
use spanproxy_core::{Result, SpanProxyError};
use tokio::net::TcpListener;
use tracing::info;

/// Binds `addr` and serves the ingest router until `shutdown` resolves.
pub async fn run_ingest_server<F>(addr: SocketAddr, router: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| SpanProxyError::Ingest(format!("failed to bind {addr}: {e}")))?;
    serve_ingest(listener, router, shutdown).await
}

pub async fn serve_ingest<F>(listener: TcpListener, router: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let local = listener
        .local_addr()
        .map_err(|e| SpanProxyError::Ingest(format!("listener has no local address: {e}")))?;
    info!(addr = %local, "listening for zipkin spans");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| SpanProxyError::Ingest(format!("HTTP server failed: {e}")))
}
