use async_trait::async_trait;
use courier_common::{Mail, outgoing};
use lettre::{
    Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use serde::Deserialize;

use crate::SendError;

/// Hands a rendered email to whatever delivers it
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, mail: &Mail, html: String) -> Result<(), SendError>;
}

mod defaults {
    pub fn host() -> String {
        String::from("127.0.0.1")
    }

    pub const fn port() -> u16 {
        25
    }
}

/// The relay outgoing mail is submitted to
///
/// Credentials are only used when both `username` and `password` are set.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "defaults::host")]
    pub host: String,

    #[serde(default = "defaults::port")]
    pub port: u16,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Upgrade with STARTTLS before authenticating
    #[serde(default)]
    pub tls: bool,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: defaults::host(),
            port: defaults::port(),
            username: None,
            password: None,
            tls: false,
        }
    }
}

pub struct SmtpSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpSender {
    /// # Errors
    ///
    /// STARTTLS was requested but the TLS parameters could not be built.
    pub fn new(config: &SmtpConfig) -> Result<Self, SendError> {
        let mut builder = if config.tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        }
        .port(config.port);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            transport: builder.build(),
        })
    }
}

fn address(address: &str) -> Result<Address, SendError> {
    address.parse().map_err(|source| SendError::Address {
        address: address.to_string(),
        source,
    })
}

/// Build the HTML message for `mail`
///
/// # Errors
///
/// An address does not parse, or the message could not be assembled.
pub fn message(mail: &Mail, html: String) -> Result<Message, SendError> {
    let sender = (!mail.sender.is_empty()).then(|| mail.sender.clone());

    let mut builder = Message::builder()
        .from(Mailbox::new(sender, address(&mail.from)?))
        .subject(mail.subject.as_str())
        .header(ContentType::TEXT_HTML);

    for to in &mail.to {
        builder = builder.to(Mailbox::new(None, address(to)?));
    }

    Ok(builder.body(html)?)
}

#[async_trait]
impl Sender for SmtpSender {
    async fn send(&self, mail: &Mail, html: String) -> Result<(), SendError> {
        let response = self.transport.send(message(mail, html)?).await?;

        outgoing!(
            from = %mail.from,
            recipients = mail.to.len(),
            code = %response.code(),
            "Submitted message"
        );

        Ok(())
    }
}
