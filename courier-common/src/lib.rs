//! Shared building blocks for the courier workspace
//!
//! - [`Signal`]: the lifecycle signal broadcast to every long-running task
//! - [`logging`]: subscriber initialisation and the direction-tagged log macros
//! - [`message`]: the JSON work item carried over the broker

pub mod error;
pub mod logging;
pub mod message;

pub use error::EnvelopeError;
pub use message::{Mail, MailRequest};
pub use tracing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
