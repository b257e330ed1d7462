use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::LedgerError;
use crate::config::{IdeogramConfig, Secret};
use crate::generation::{
    AspectRatio, GeneratedItem, GenerationProvider, GenerationRequest, ImageModel, MagicPrompt,
    Style, UpstreamError,
};

#[derive(Serialize)]
struct GenerateBody<'a> {
    image_request: ImageRequestBody<'a>,
}

#[derive(Serialize)]
struct ImageRequestBody<'a> {
    model: ImageModel,
    magic_prompt_option: MagicPrompt,
    aspect_ratio: AspectRatio,
    prompt: &'a str,
    style: Style,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    data: Vec<GeneratedImage>,
}

#[derive(Deserialize)]
struct GeneratedImage {
    #[serde(default)]
    url: Option<String>,
}

/// Image generation over the Ideogram HTTP API.
#[derive(Clone)]
pub struct IdeogramClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<Secret>,
}

impl std::fmt::Debug for IdeogramClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdeogramClient")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl IdeogramClient {
    pub fn new(api_key: Option<Secret>, timeout: Duration) -> Result<Self, LedgerError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| LedgerError::Config(format!("ideogram http client error: {err}")))?;
        Ok(Self {
            http,
            base_url: crate::config::DEFAULT_IDEOGRAM_BASE_URL.to_string(),
            api_key,
        })
    }

    pub fn from_config(
        config: &IdeogramConfig,
        api_key: Option<Secret>,
        timeout: Duration,
    ) -> Result<Self, LedgerError> {
        let mut client = Self::new(api_key, timeout)?;
        if !config.base_url.trim().is_empty() {
            client = client.with_base_url(config.base_url.clone());
        }
        Ok(client)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn generate_url(&self) -> String {
        format!("{}/generate", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl GenerationProvider for IdeogramClient {
    fn name(&self) -> &str {
        "ideogram"
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<Vec<GeneratedItem>, UpstreamError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| UpstreamError::new(None, "ideogram api key is not configured"))?;

        let body = GenerateBody {
            image_request: ImageRequestBody {
                model: request.model,
                magic_prompt_option: request.magic_prompt,
                aspect_ratio: request.aspect_ratio,
                prompt: &request.prompt,
                style: request.style,
            },
        };

        let response = self
            .http
            .post(self.generate_url())
            .header("Accept", "application/json")
            .header("Api-Key", api_key.expose())
            .json(&body)
            .send()
            .await
            .map_err(|err| UpstreamError::new(None, format!("ideogram request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let excerpt = crate::utils::http::error_excerpt(response).await;
            return Err(UpstreamError::new(
                Some(status.as_u16()),
                format!("ideogram status {status}: {excerpt}"),
            ));
        }

        let parsed = response.json::<GenerateResponse>().await.map_err(|err| {
            UpstreamError::new(None, format!("ideogram response decode error: {err}"))
        })?;

        Ok(parsed
            .data
            .into_iter()
            .filter_map(|image| image.url)
            .filter(|url| !url.trim().is_empty())
            .map(|uri| GeneratedItem { uri })
            .collect())
    }
}
