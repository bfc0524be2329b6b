//! Error types shared across crates

use thiserror::Error;

/// A work item that parsed but cannot be delivered as-is.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("\"Tpl\" is empty")]
    EmptyTemplate,

    #[error("\"FromEmail\" is empty")]
    EmptyFrom,

    #[error("\"Recipients\" is empty")]
    EmptyRecipients,

    #[error("\"Recipients\" item {0} is blank")]
    BlankRecipient(usize),
}
