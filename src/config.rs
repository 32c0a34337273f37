use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;

const DEFAULT_CHAT_MODEL: &str = "gpt-3.5-turbo";

/// Image generation can take minutes; the client timeout is the only bound
/// the pipeline enforces.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(300);

/// Provider credentials and endpoints, read from the environment once and
/// passed explicitly to the clients that need them.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub openai_api_key: Option<String>,
    pub chat_model: String,
    pub image_service_url: Option<String>,
    pub image_service_user: Option<String>,
    pub image_service_password: Option<String>,
    pub audit_log: Option<PathBuf>,
}

impl ProviderConfig {
    pub fn from_env() -> Self {
        Self {
            openai_api_key: env::var("OPENAI_API_KEY").ok(),
            chat_model: env::var("STORIESY_CHAT_MODEL").unwrap_or_else(|_| {
                DEFAULT_CHAT_MODEL.to_owned()
            }),
            image_service_url: env::var("STORIESY_IMAGE_SERVICE_URL").ok(),
            image_service_user: env::var("STORIESY_IMAGE_SERVICE_USER").ok(),
            image_service_password: env::var("STORIESY_IMAGE_SERVICE_PASSWORD").ok(),
            audit_log: env::var("STORIESY_AUDIT_LOG").ok().map(PathBuf::from),
        }
    }

    pub fn require_openai_key(&self) -> Result<&str> {
        self.openai_api_key
            .as_deref()
            .context("OPENAI_API_KEY is not set")
    }

    pub fn require_image_service(&self) -> Result<(&str, &str, &str)> {
        let url = self
            .image_service_url
            .as_deref()
            .context("STORIESY_IMAGE_SERVICE_URL is not set")?;
        let user = self
            .image_service_user
            .as_deref()
            .context("STORIESY_IMAGE_SERVICE_USER is not set")?;
        let password = self
            .image_service_password
            .as_deref()
            .context("STORIESY_IMAGE_SERVICE_PASSWORD is not set")?;
        Ok((url, user, password))
    }
}

/// Shared HTTP client. The cookie store carries the self-hosted image
/// service's session between its login and generate calls.
pub fn http_client() -> Result<Client> {
    Client::builder()
        .timeout(HTTP_TIMEOUT)
        .cookie_store(true)
        .build()
        .context("failed to build HTTP client")
}
