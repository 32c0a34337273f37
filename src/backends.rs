use std::future::Future;

use clap::ValueEnum;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::GenerateError;

const OPENAI_IMAGE_API: &str = "https://api.openai.com/v1/images/generations";
const SESSION_COOKIE: &str = "session";

/// Which image-generation backend serves a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ImageModel {
    Dalle,
    #[value(name = "stablediffusion")]
    StableDiffusion,
}

/// Image-generation collaborator: prompt in, base64 image out.
pub trait GenerateImage: Send + Sync {
    fn generate(&self, prompt: &str)
        -> impl Future<Output = Result<String, GenerateError>> + Send;
}

/// Hosted image API authenticated with a bearer key; responds with base64
/// directly.
#[derive(Debug, Clone)]
pub struct DalleClient {
    http: Client,
    api_key: String,
}

impl DalleClient {
    pub fn new(http: Client, api_key: String) -> Self {
        Self { http, api_key }
    }
}

#[derive(Debug, Deserialize)]
struct DalleResponse {
    data: Vec<DalleImage>,
}

#[derive(Debug, Deserialize)]
struct DalleImage {
    b64_json: String,
}

impl GenerateImage for DalleClient {
    async fn generate(&self, prompt: &str) -> Result<String, GenerateError> {
        let response = self
            .http
            .post(OPENAI_IMAGE_API)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "prompt": prompt,
                "n": 1,
                "size": "1024x1024",
                "response_format": "b64_json",
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerateError::Provider(format!(
                "image API returned {status}: {body}"
            )));
        }

        let parsed: DalleResponse = response.json().await?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|image| image.b64_json)
            .ok_or_else(|| GenerateError::Provider("image API returned no images".to_owned()))
    }
}

/// Self-hosted image service with a two-step flow: log in for a session
/// cookie, then generate. A login response that sets no session cookie is a
/// fatal auth failure.
#[derive(Debug, Clone)]
pub struct StableDiffusionClient {
    http: Client,
    base_url: String,
    username: String,
    password: String,
}

impl StableDiffusionClient {
    /// `http` must be built with a cookie store so the session survives into
    /// the generate call.
    pub fn new(http: Client, base_url: String, username: String, password: String) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            username,
            password,
        }
    }

    async fn login(&self) -> Result<(), GenerateError> {
        let response = self
            .http
            .post(format!("{}/login", self.base_url))
            .json(&json!({
                "username": self.username,
                "password": self.password,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerateError::Provider(format!(
                "image service login returned {status}: {body}"
            )));
        }

        let has_session = response
            .cookies()
            .any(|cookie| cookie.name() == SESSION_COOKIE);
        if !has_session {
            return Err(GenerateError::Auth(
                "login response did not set a session cookie".to_owned(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct StableDiffusionResponse {
    images: Vec<String>,
}

impl GenerateImage for StableDiffusionClient {
    async fn generate(&self, prompt: &str) -> Result<String, GenerateError> {
        self.login().await?;

        let response = self
            .http
            .post(format!("{}/generate", self.base_url))
            .json(&json!({ "prompt": prompt }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerateError::Provider(format!(
                "image service returned {status}: {body}"
            )));
        }

        let parsed: StableDiffusionResponse = response.json().await?;
        parsed
            .images
            .into_iter()
            .next()
            .ok_or_else(|| GenerateError::Provider("image service returned no images".to_owned()))
    }
}

/// Configured backend strategy, dispatched by variant rather than by string
/// tag.
pub enum ImageBackend {
    Dalle(DalleClient),
    StableDiffusion(StableDiffusionClient),
}

impl GenerateImage for ImageBackend {
    async fn generate(&self, prompt: &str) -> Result<String, GenerateError> {
        match self {
            ImageBackend::Dalle(client) => client.generate(prompt).await,
            ImageBackend::StableDiffusion(client) => client.generate(prompt).await,
        }
    }
}
