//! Converting rendered MJML into HTML through an MJML render API
//!
//! Only content that starts with `<mjml>` is sent; anything else is already
//! HTML and passes through untouched.

use courier_common::outgoing;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::RenderError;

const MJML_PREFIX: &str = "<mjml>";

fn default_url() -> String {
    String::from("https://api.mjml.io/v1/render")
}

/// Where MJML gets converted
///
/// Basic authentication is only used when both `user` and `pass` are set.
///
/// # Example
///
/// ```ron
/// mjml: (
///     url: "https://api.mjml.io/v1/render",
///     user: "application-id",
///     pass: "secret-key",
/// ),
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct MjmlConfig {
    /// An empty URL disables conversion
    #[serde(default = "default_url")]
    pub url: String,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub pass: Option<String>,
}

impl Default for MjmlConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            user: None,
            pass: None,
        }
    }
}

impl MjmlConfig {
    pub fn is_enabled(&self) -> bool {
        !self.url.trim().is_empty()
    }
}

/// Whether `content` is MJML rather than HTML
pub fn is_mjml(content: &str) -> bool {
    content.starts_with(MJML_PREFIX)
}

#[derive(Serialize)]
struct RenderRequest<'a> {
    mjml: &'a str,
}

#[derive(Deserialize)]
struct RenderResponse {
    html: String,
}

pub struct MjmlConverter {
    client: Client,
    url: String,
    credentials: Option<(String, String)>,
}

impl MjmlConverter {
    /// # Errors
    ///
    /// The HTTP client could not be built.
    pub fn new(config: &MjmlConfig) -> Result<Self, RenderError> {
        let credentials = match (&config.user, &config.pass) {
            (Some(user), Some(pass)) if !user.trim().is_empty() && !pass.trim().is_empty() => {
                Some((user.clone(), pass.clone()))
            }
            _ => None,
        };

        Ok(Self {
            client: Client::builder().build()?,
            url: config.url.clone(),
            credentials,
        })
    }

    /// Turn MJML `content` into HTML, or hand back anything else as it is
    ///
    /// # Errors
    ///
    /// The render API could not be reached, refused the request, or answered
    /// with something other than rendered HTML.
    pub async fn convert(&self, content: String) -> Result<String, RenderError> {
        if !is_mjml(&content) {
            return Ok(content);
        }

        outgoing!(url = %self.url, "Converting MJML");

        let mut request = self.client.post(&self.url).json(&RenderRequest { mjml: &content });
        if let Some((user, pass)) = &self.credentials {
            request = request.basic_auth(user, Some(pass));
        }

        let response: RenderResponse = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(response.html)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_is_mjml() {
        assert!(is_mjml("<mjml><mj-body></mj-body></mjml>"));
        assert!(!is_mjml("<p>Hello</p>"));
        assert!(!is_mjml(" <mjml></mjml>"));
        assert!(!is_mjml(""));
    }

    #[test]
    fn test_config() {
        let config: MjmlConfig = ron::from_str("()").unwrap();
        assert!(config.is_enabled());
        assert_eq!(config.url, "https://api.mjml.io/v1/render");

        let config: MjmlConfig = ron::from_str(r#"(url: "")"#).unwrap();
        assert!(!config.is_enabled());
    }

    #[test]
    fn test_credentials_need_both_halves() {
        let config = MjmlConfig {
            user: Some("user".to_string()),
            ..MjmlConfig::default()
        };
        assert!(MjmlConverter::new(&config).unwrap().credentials.is_none());

        let config = MjmlConfig {
            user: Some("user".to_string()),
            pass: Some(" ".to_string()),
            ..MjmlConfig::default()
        };
        assert!(MjmlConverter::new(&config).unwrap().credentials.is_none());

        let config = MjmlConfig {
            user: Some("user".to_string()),
            pass: Some("pass".to_string()),
            ..MjmlConfig::default()
        };
        assert_eq!(
            MjmlConverter::new(&config).unwrap().credentials,
            Some(("user".to_string(), "pass".to_string()))
        );
    }
}
