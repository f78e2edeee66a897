//! Proxy server setup and lifecycle

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{routing::any, Router};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::task::TaskTracker;

use super::handlers::proxy_handler;
use super::state::{ProxySettings, ProxyState};
use crate::startup;
use crate::storage::Persistence;

/// Upstream calls may stream for a long time
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(300);

/// How long in-flight requests get once shutdown starts
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Upper bound on draining background logging and persistence
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) fn build_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(UPSTREAM_TIMEOUT)
        .pool_max_idle_per_host(10)
        .build()
        .context("Failed to create HTTP client")
}

/// Every method and path goes through the proxy handler
pub(crate) fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/", any(proxy_handler))
        .route("/*path", any(proxy_handler))
        .with_state(state)
}

/// Start the proxy server and run until SIGINT/SIGTERM
///
/// After the signal, in-flight requests get a short grace period; then
/// background logging and persistence are drained before returning.
pub async fn start_proxy(
    settings: ProxySettings,
    port: u16,
    store: Arc<dyn Persistence>,
) -> Result<()> {
    let client = build_client()?;
    let tracker = TaskTracker::new();

    if let Some(repeat) = &settings.detect_repeat {
        tracing::info!(
            "Repeat detection enabled (threshold {}, min length {})",
            repeat.threshold,
            repeat.min_length
        );
    }
    if settings.force_stream {
        tracing::info!("Force stream enabled");
    }
    if let Some(cache) = &settings.auto_cache {
        tracing::info!(
            "Auto cache enabled (min {} bytes, ttl {}s)",
            cache.min_bytes,
            cache.ttl.as_secs()
        );
    }
    tracing::debug!("Forwarding to {}", settings.endpoint);

    let bind_addr = format!("127.0.0.1:{}", port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;

    startup::print_startup(port, &settings);
    tracing::info!("Proxy listening on {}", bind_addr);

    let state = ProxyState::new(client, settings, store, tracker);
    serve(listener, state, shutdown_signal(), SHUTDOWN_GRACE).await
}

/// Serve until `signal` resolves, then shut down in bounded time
///
/// In-flight requests get `grace` to finish. After that, streams still being
/// relayed are cancelled and the server task is aborted. Background logging
/// and persistence are drained last, for at most [`DRAIN_TIMEOUT`].
pub(crate) async fn serve(
    listener: TcpListener,
    state: ProxyState,
    signal: impl Future<Output = ()>,
    grace: Duration,
) -> Result<()> {
    let tracker = state.tracker.clone();
    let cancel = state.shutdown.clone();
    let app = router(state);

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            })
            .await
    });
    let abort = server.abort_handle();

    signal.await;
    tracing::info!("Shutting down, waiting for in-flight requests");
    let _ = shutdown_tx.send(true);

    let result = match tokio::time::timeout(grace, server).await {
        Ok(Ok(result)) => result.context("Proxy server error"),
        Ok(Err(e)) => {
            tracing::error!("Proxy server task failed: {}", e);
            Ok(())
        }
        Err(_) => {
            tracing::warn!(
                "In-flight requests still running after {}ms, closing them",
                grace.as_millis()
            );
            abort.abort();
            Ok(())
        }
    };
    cancel.cancel();

    tracker.close();
    if tokio::time::timeout(DRAIN_TIMEOUT, tracker.wait()).await.is_err() {
        tracing::warn!(
            "Background work still pending after {}s, exiting anyway",
            DRAIN_TIMEOUT.as_secs()
        );
    } else {
        tracing::info!("Proxy server shut down gracefully");
    }
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
