//! Health check endpoints for courier
//!
//! An HTTP listener that runs independently of the queue consumer, for
//! Kubernetes liveness and readiness probes.
//!
//! # Endpoints
//!
//! - **`/health/live`** - Liveness probe: 200 while the process can answer at all
//! - **`/health/ready`** - Readiness probe: 200 when every registered probe is
//!   ready, otherwise 503 with a JSON body naming the probes
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use courier_health::{HealthChecker, HealthConfig, HealthServer};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut checker = HealthChecker::new();
//! checker.register("broker", || true);
//!
//! let server = HealthServer::new(&HealthConfig::default(), Arc::new(checker)).await?;
//!
//! // server.serve(shutdown_receiver).await?;
//! # Ok(())
//! # }
//! ```

mod checker;
mod config;
mod error;
mod server;

pub use checker::{HealthChecker, HealthStatus, Probe};
pub use config::HealthConfig;
pub use error::HealthError;
pub use server::{HealthServer, router};
