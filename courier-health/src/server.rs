//! Health check HTTP server

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use courier_common::{Signal, internal};
use tokio::{net::TcpListener, sync::broadcast};
use tower_http::timeout::TimeoutLayer;

use crate::{HealthChecker, HealthConfig, HealthError};

/// Probes have to answer within this
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// The `/health/live` and `/health/ready` routes
pub fn router(checker: Arc<HealthChecker>) -> Router {
    Router::new()
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .with_state(checker)
        .layer(TimeoutLayer::new(PROBE_TIMEOUT))
}

/// Health check HTTP server
pub struct HealthServer {
    listener: TcpListener,
    router: Router,
}

impl HealthServer {
    /// Bind the listener
    ///
    /// # Errors
    ///
    /// Binding to `listen_address` failed.
    pub async fn new(config: &HealthConfig, checker: Arc<HealthChecker>) -> Result<Self, HealthError> {
        let listener = TcpListener::bind(&config.listen_address)
            .await
            .map_err(|source| HealthError::Bind {
                address: config.listen_address.clone(),
                source,
            })?;

        internal!(
            level = INFO,
            address = %config.listen_address,
            "Health check server bound"
        );

        Ok(Self {
            listener,
            router: router(checker),
        })
    }

    /// The address actually bound, useful when the configured port was `0`
    ///
    /// # Errors
    ///
    /// The socket could not report its address.
    pub fn local_addr(&self) -> Result<SocketAddr, HealthError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until a shutdown signal is received
    ///
    /// # Errors
    ///
    /// The server hit an I/O error.
    pub async fn serve(self, mut shutdown: broadcast::Receiver<Signal>) -> Result<(), HealthError> {
        internal!("Health check server starting");

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                internal!("Health check server received shutdown signal");
            })
            .await?;

        internal!(level = INFO, "Health check server stopped");
        Ok(())
    }
}

async fn liveness_handler(State(checker): State<Arc<HealthChecker>>) -> Response {
    if checker.is_alive() {
        (StatusCode::OK, "OK").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable").into_response()
    }
}

async fn readiness_handler(State(checker): State<Arc<HealthChecker>>) -> Response {
    let status = checker.status();

    if status.ready {
        (StatusCode::OK, "OK").into_response()
    } else {
        internal!(level = WARN, probes = ?status.probes, "Readiness probe failed");
        (StatusCode::SERVICE_UNAVAILABLE, Json(status)).into_response()
    }
}
