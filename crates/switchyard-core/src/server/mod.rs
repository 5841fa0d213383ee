//! HTTP server for Switchyard.
//!
//! Builds the axum router over a shared [`Orchestrator`] and runs it with
//! graceful shutdown.

pub mod logging;
pub mod response;
pub mod routes;

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use switchyard_orchestrator::Orchestrator;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{info, warn};

use crate::config::{Config, ServerConfig};
use crate::error::Result;
use logging::RequestLoggerLayer;

/// State shared by every handler.
#[derive(Debug)]
pub struct AppState {
    /// The control plane.
    pub orchestrator: Arc<Orchestrator>,
}

/// Build the API router.
#[must_use]
pub fn router(orchestrator: Arc<Orchestrator>, config: &ServerConfig) -> Router {
    let state = Arc::new(AppState { orchestrator });

    let app = Router::new()
        .merge(routes::route_routes())
        .merge(routes::service_routes())
        .merge(routes::context_routes())
        .merge(routes::agent_routes())
        .merge(routes::task_routes())
        .merge(routes::workflow_routes())
        .merge(routes::health_routes())
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(RequestLoggerLayer)
                .layer(TimeoutLayer::new(config.request_timeout())),
        );

    if config.cors { app.layer(CorsLayer::permissive()) } else { app }
}

/// Start the Switchyard HTTP server and run until interrupted.
///
/// # Errors
///
/// Returns an error if the orchestrator cannot be built or the server fails
/// to bind to the configured address.
pub async fn run(config: &Config) -> Result<()> {
    let orchestrator = Arc::new(Orchestrator::new(config.orchestrator.clone())?);
    let listener = TcpListener::bind(config.server.address).await?;
    serve(listener, orchestrator, &config.server, shutdown_signal()).await
}

/// Serve on `listener` until `shutdown` resolves.
///
/// Background jobs start before the first request is accepted and stop after
/// in-flight requests drain.
///
/// # Errors
///
/// Returns an error if the background jobs are already running or the
/// server fails.
pub async fn serve<F>(
    listener: TcpListener,
    orchestrator: Arc<Orchestrator>,
    config: &ServerConfig,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    orchestrator.start().await?;
    let app = router(Arc::clone(&orchestrator), config);

    info!(address = %listener.local_addr()?, "Switchyard server listening");
    let served = axum::serve(listener, app).with_graceful_shutdown(shutdown).await;

    orchestrator.shutdown().await;
    served?;
    info!("Switchyard server stopped");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl-C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
