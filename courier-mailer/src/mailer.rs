use std::{path::PathBuf, sync::Arc};

use courier_common::MailRequest;
use courier_metrics::Metrics;
use serde::Deserialize;

use crate::{
    MailerError, ProcessError, RenderError, Renderer, Sender,
    mjml::{MjmlConfig, MjmlConverter},
    render::TemplateRenderer,
    smtp::{SmtpConfig, SmtpSender},
};

fn default_templates_dir() -> PathBuf {
    PathBuf::from("./templates/")
}

/// # Example
///
/// ```ron
/// mailer: (
///     templates_dir: "/etc/courier/templates",
///     smtp: (host: "smtp.example.com", port: 587, tls: true),
///     mjml: (user: "application-id", pass: "secret-key"),
/// ),
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct MailerConfig {
    #[serde(default = "default_templates_dir")]
    pub templates_dir: PathBuf,

    #[serde(default)]
    pub smtp: SmtpConfig,

    /// Leaving this out disables MJML conversion
    #[serde(default)]
    pub mjml: Option<MjmlConfig>,
}

impl Default for MailerConfig {
    fn default() -> Self {
        Self {
            templates_dir: default_templates_dir(),
            smtp: SmtpConfig::default(),
            mjml: None,
        }
    }
}

impl MailerConfig {
    /// Load the templates and set up the SMTP transport and MJML client
    ///
    /// # Errors
    ///
    /// A template failed to load, or a client could not be built.
    pub fn build(&self, metrics: Arc<Metrics>) -> Result<Mailer, MailerError> {
        let mailer = Mailer::new(
            Arc::new(TemplateRenderer::load(&self.templates_dir)?),
            Arc::new(SmtpSender::new(&self.smtp)?),
            metrics,
        );

        match &self.mjml {
            Some(mjml) if mjml.is_enabled() => Ok(mailer.with_mjml(MjmlConverter::new(mjml)?)),
            _ => Ok(mailer),
        }
    }
}

/// Parse, render and send a single work item
pub struct Mailer {
    renderer: Arc<dyn Renderer>,
    sender: Arc<dyn Sender>,
    mjml: Option<MjmlConverter>,
    metrics: Arc<Metrics>,
}

impl Mailer {
    pub fn new(renderer: Arc<dyn Renderer>, sender: Arc<dyn Sender>, metrics: Arc<Metrics>) -> Self {
        Self {
            renderer,
            sender,
            mjml: None,
            metrics,
        }
    }

    /// Convert MJML bodies to HTML before sending them
    #[must_use]
    pub fn with_mjml(mut self, mjml: MjmlConverter) -> Self {
        self.mjml = Some(mjml);
        self
    }

    pub const fn converts_mjml(&self) -> bool {
        self.mjml.is_some()
    }

    /// Handle the raw body of a queued message
    ///
    /// # Errors
    ///
    /// See [`ProcessError`]; only [`ProcessError::is_permanent`] failures are
    /// pointless to retry.
    pub async fn process(&self, body: &[u8]) -> Result<(), ProcessError> {
        let request: MailRequest = serde_json::from_slice(body)?;
        request.check()?;

        self.deliver(&request).await
    }

    /// Render and send an already validated request
    ///
    /// # Errors
    ///
    /// Rendering or sending failed.
    pub async fn deliver(&self, request: &MailRequest) -> Result<(), ProcessError> {
        let rendered = self.render(request).await;
        self.metrics.mailer.record_render(rendered.is_ok());
        let (html, subject) = rendered?;

        let sent = self.sender.send(&request.to_mail(subject), html).await;
        self.metrics.mailer.record_send(sent.is_ok());

        Ok(sent?)
    }

    async fn render(&self, request: &MailRequest) -> Result<(String, String), RenderError> {
        let html = self.renderer.render(&request.tpl, &request.payload)?;
        let subject = self
            .renderer
            .render_subject(&request.subject, &request.payload)?;

        let html = match &self.mjml {
            Some(mjml) => mjml.convert(html).await?,
            None => html,
        };

        Ok((html, subject))
    }
}
