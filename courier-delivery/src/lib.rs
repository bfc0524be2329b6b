//! Consuming mail requests from a queue
//!
//! [`Consumer`] runs the delivery loop: each delivery is rendered and sent
//! through a [`Mailer`](courier_mailer::Mailer), then acknowledged, delayed
//! for another attempt, or dropped according to its [`RetryPolicy`].
//! [`MailPublisher`] is the producing side.

mod consumer;
mod error;
mod publisher;
pub mod retry;

pub use consumer::{Consumer, Done};
pub use error::DeliveryError;
pub use publisher::MailPublisher;
pub use retry::{Decision, Outcome, RetryPolicy};
