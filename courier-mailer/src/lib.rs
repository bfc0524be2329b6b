//! Turning a [`MailRequest`](courier_common::MailRequest) into an email
//!
//! [`Mailer`] is the whole pipeline: parse the queued bytes, validate them,
//! render the body and subject with a [`Renderer`], convert MJML bodies to
//! HTML when an [`MjmlConverter`] is configured, then hand the result to a
//! [`Sender`].

pub mod error;
mod mailer;
pub mod mjml;
pub mod render;
pub mod smtp;

pub use error::{MailerError, ProcessError, RenderError, SendError};
pub use mailer::{Mailer, MailerConfig};
pub use mjml::{MjmlConfig, MjmlConverter};
pub use render::{Renderer, TemplateRenderer};
pub use smtp::{Sender, SmtpConfig, SmtpSender};
