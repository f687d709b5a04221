use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::{AppContext, router};

pub async fn start_listener(app: AppContext) -> Result<()> {
    let bind_addr = app.settings.listen();
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", bind_addr))?;
    let local_addr = listener.local_addr().unwrap_or(bind_addr);
    info!(address = %local_addr, "image proxy listener started");

    serve(listener, app).await
}

/// Serves on an already bound listener until ctrl-c.
pub async fn serve(listener: TcpListener, app: AppContext) -> Result<()> {
    let service = router(app).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("image proxy server failed")
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received ctrl-c; shutting down"),
        Err(err) => {
            warn!(error = %err, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    }
}
