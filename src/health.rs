//! Health-check HTTP endpoint: exposes the orchestrator's `ready` flag to
//! the pod's readiness/liveness probes.

use std::sync::{atomic::AtomicBool, Arc};

use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, routing::get, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Clone)]
struct HealthState {
    ready: Arc<AtomicBool>,
}

/// Bind and serve `/readyz` and `/livez` until `cancel` fires.
pub async fn serve(addr: String, ready: Arc<AtomicBool>, cancel: CancellationToken) -> Result<()> {
    let app = Router::new()
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
        .layer(TraceLayer::new_for_http())
        .with_state(HealthState { ready });

    let bind_addr = normalize_addr(&addr);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("bind health check endpoint on {addr}"))?;
    info!(addr, "health check endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("health check endpoint server error")
}

/// Go's `net/http` accepts `:7623` as shorthand for `0.0.0.0:7623`; Rust's
/// `TcpListener` does not, so translate it.
fn normalize_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_owned()
    }
}

async fn readyz(State(state): State<HealthState>) -> StatusCode {
    if state.ready.load(std::sync::atomic::Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn livez() -> StatusCode {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn normalize_addr_expands_bare_port() {
        assert_eq!(normalize_addr(":7623"), "0.0.0.0:7623");
        assert_eq!(normalize_addr("127.0.0.1:7623"), "127.0.0.1:7623");
    }

    #[tokio::test]
    async fn readyz_reflects_the_shared_flag() {
        let ready = Arc::new(AtomicBool::new(false));
        let state = HealthState { ready: ready.clone() };
        assert_eq!(readyz(State(state.clone())).await, StatusCode::SERVICE_UNAVAILABLE);
        ready.store(true, Ordering::SeqCst);
        assert_eq!(readyz(State(state)).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn livez_is_always_ok() {
        assert_eq!(livez().await, StatusCode::OK);
    }
}
