//! The work item exchanged between producers and the consumer
//!
//! On the wire this is a JSON object with `PascalCase` keys:
//!
//! ```json
//! {
//!   "Tpl": "hello",
//!   "FromEmail": "noreply@example.com",
//!   "Sender": "Example",
//!   "Subject": "Hello {{name}}",
//!   "Recipients": ["someone@example.com"],
//!   "Payload": { "name": "World" }
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::EnvelopeError;

/// A request to render `tpl` against `payload` and mail the result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MailRequest {
    pub tpl: String,
    pub from_email: String,
    #[serde(default)]
    pub sender: String,
    /// May itself be a template, evaluated against `payload`
    #[serde(default)]
    pub subject: String,
    pub recipients: Vec<String>,
    #[serde(default)]
    pub payload: Value,
}

impl MailRequest {
    #[must_use]
    pub fn new(tpl: impl Into<String>) -> Self {
        Self {
            tpl: tpl.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn from(mut self, from_email: impl Into<String>) -> Self {
        self.from_email = from_email.into();
        self
    }

    #[must_use]
    pub fn as_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    #[must_use]
    pub fn to<I, S>(mut self, recipients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.recipients.extend(recipients.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Validate the fields every delivery backend relies on
    ///
    /// # Errors
    ///
    /// The first missing or blank field found.
    pub fn check(&self) -> Result<(), EnvelopeError> {
        if self.tpl.trim().is_empty() {
            return Err(EnvelopeError::EmptyTemplate);
        }

        if self.from_email.trim().is_empty() {
            return Err(EnvelopeError::EmptyFrom);
        }

        if self.recipients.is_empty() {
            return Err(EnvelopeError::EmptyRecipients);
        }

        if let Some(index) = self.recipients.iter().position(|to| to.trim().is_empty()) {
            return Err(EnvelopeError::BlankRecipient(index));
        }

        Ok(())
    }

    /// Build the delivery envelope once the subject has been rendered
    #[must_use]
    pub fn to_mail(&self, subject: String) -> Mail {
        Mail {
            from: self.from_email.trim().to_string(),
            sender: self.sender.trim().to_string(),
            subject,
            to: self
                .recipients
                .iter()
                .map(|to| to.trim().to_string())
                .collect(),
        }
    }
}

/// Envelope of an outgoing email, handed to a delivery backend with the
/// rendered body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mail {
    pub from: String,
    /// Display name for `from`, may be empty
    pub sender: String,
    pub subject: String,
    pub to: Vec<String>,
}
