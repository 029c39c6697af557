//! Pexels photo search (portrait orientation).

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{ImageError, ImageRef, ImageSource};

const DEFAULT_API_BASE: &str = "https://api.pexels.com/v1";

pub struct PexelsSource {
    api_key: Option<String>,
    api_base: String,
    client: reqwest::Client,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    photos: Vec<Photo>,
}

#[derive(Debug, Deserialize)]
struct Photo {
    id: u64,
    width: u32,
    height: u32,
    src: PhotoSources,
}

#[derive(Debug, Deserialize)]
struct PhotoSources {
    #[serde(default)]
    portrait: Option<String>,
    #[serde(default)]
    large2x: Option<String>,
    original: String,
}

impl PexelsSource {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key,
            api_base: DEFAULT_API_BASE.to_string(),
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn map_send_error(err: reqwest::Error) -> ImageError {
        ImageError::Unavailable(err.to_string())
    }

    fn map_status(status: reqwest::StatusCode) -> ImageError {
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            ImageError::Unavailable(format!("Pexels returned {}", status))
        } else {
            ImageError::Rejected(format!("Pexels returned {}", status))
        }
    }
}

impl Photo {
    fn into_ref(self) -> ImageRef {
        let url = self
            .src
            .portrait
            .or(self.src.large2x)
            .unwrap_or(self.src.original);
        ImageRef {
            id: format!("pexels-{}", self.id),
            url,
            width: self.width,
            height: self.height,
        }
    }
}

#[async_trait]
impl ImageSource for PexelsSource {
    fn name(&self) -> &str {
        "pexels"
    }

    async fn search(&self, query: &str, count: usize) -> Result<Vec<ImageRef>, ImageError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ImageError::Rejected("no Pexels API key configured".to_string()))?;

        let per_page = count.clamp(1, 80).to_string();
        let response = self
            .client
            .get(format!("{}/search", self.api_base))
            .header("Authorization", api_key)
            .query(&[
                ("query", query),
                ("per_page", per_page.as_str()),
                ("orientation", "portrait"),
            ])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(Self::map_send_error)?;

        if !response.status().is_success() {
            return Err(Self::map_status(response.status()));
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| ImageError::Unavailable(format!("invalid Pexels response: {}", e)))?;

        debug!(query, results = parsed.photos.len(), "Pexels search");
        Ok(parsed.photos.into_iter().map(Photo::into_ref).collect())
    }

    async fn fetch(&self, image: &ImageRef) -> Result<Vec<u8>, ImageError> {
        let response = self
            .client
            .get(&image.url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(Self::map_send_error)?;

        if !response.status().is_success() {
            return Err(Self::map_status(response.status()));
        }

        let bytes = response.bytes().await.map_err(Self::map_send_error)?;
        Ok(bytes.to_vec())
    }
}
