//! Liveness endpoint polled by the service directory.
//!
//! `GET /health` answers 200 for as long as the process runs, whatever its
//! role in the cluster.

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

fn router() -> Router {
    Router::new().route("/health", get(|| async { StatusCode::OK }))
}

/// Serve until `shutdown` flips to true.
pub fn serve(listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Health endpoint listening on {}", addr);
    }
    tokio::spawn(async move {
        let stop = async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        };
        if let Err(e) = axum::serve(listener, router())
            .with_graceful_shutdown(stop)
            .await
        {
            error!("Health endpoint error: {}", e);
        }
    })
}
