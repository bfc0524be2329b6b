use std::path::PathBuf;

use courier_common::EnvelopeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Template {0:?} not found")]
    NotFound(String),

    #[error("Unable to read templates from {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to compile template {name:?}: {source}")]
    Compile {
        name: String,
        #[source]
        source: Box<handlebars::TemplateError>,
    },

    #[error("Unable to render: {0}")]
    Render(#[from] handlebars::RenderError),

    #[error("Unable to convert MJML: {0}")]
    Mjml(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("Invalid address {address:?}: {source}")]
    Address {
        address: String,
        #[source]
        source: lettre::address::AddressError,
    },

    #[error("Unable to build message: {0}")]
    Build(#[from] lettre::error::Error),

    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

/// Why a single work item could not be mailed
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Unable to parse mail request: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid mail request: {0}")]
    Invalid(#[from] EnvelopeError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Send(#[from] SendError),
}

impl ProcessError {
    /// Whether trying the same bytes again can never succeed
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Parse(_) | Self::Invalid(_))
    }
}

#[derive(Debug, Error)]
pub enum MailerError {
    #[error(transparent)]
    Templates(#[from] RenderError),

    #[error(transparent)]
    Smtp(#[from] SendError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_classification() {
        let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();

        assert!(ProcessError::from(parse).is_permanent());
        assert!(ProcessError::from(EnvelopeError::EmptyRecipients).is_permanent());
        assert!(!ProcessError::from(RenderError::NotFound("hello".to_string())).is_permanent());
    }
}
