//! YouTube Data API v3 publisher and OAuth refresh-token credentials.
//!
//! Uploads use the resumable protocol: one JSON request creates the upload
//! session, a second request sends the file. The idempotency key is part
//! of the description, so `find_existing` can locate an earlier upload of
//! the same job through a channel search.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{CredentialProvider, Credentials, PublishError, PublishTarget, RemoteVideo, UploadRequest};

const API_BASE: &str = "https://www.googleapis.com";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

pub struct YouTubePublisher {
    api_base: String,
    client: reqwest::Client,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct VideoResource {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    id: SearchItemId,
}

#[derive(Debug, Deserialize)]
struct SearchItemId {
    #[serde(rename = "videoId")]
    video_id: Option<String>,
}

impl Default for YouTubePublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl YouTubePublisher {
    pub fn new() -> Self {
        Self {
            api_base: API_BASE.to_string(),
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(600),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn watch_url(video_id: &str) -> String {
        format!("https://youtube.com/shorts/{}", video_id)
    }

    fn upload_snippet(request: &UploadRequest) -> serde_json::Value {
        let meta = &request.metadata;
        serde_json::json!({
            "snippet": {
                "title": meta.title,
                "description": meta.description,
                "tags": meta.tags,
                "categoryId": meta.category_id,
                "defaultLanguage": meta.language,
                "defaultAudioLanguage": meta.language,
            },
            "status": {
                "privacyStatus": meta.visibility.as_str(),
                "selfDeclaredMadeForKids": false,
            }
        })
    }
}

/// Turn an HTTP status into the publish taxonomy
fn classify(status: StatusCode, body: &str) -> PublishError {
    let detail = format!("{}: {}", status, super::truncate(body, 300));
    match status {
        StatusCode::UNAUTHORIZED => PublishError::AuthExpired(detail),
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => PublishError::Network(detail),
        _ => PublishError::Rejected(detail),
    }
}

fn network(err: reqwest::Error) -> PublishError {
    PublishError::Network(err.to_string())
}

#[async_trait]
impl PublishTarget for YouTubePublisher {
    fn name(&self) -> &str {
        "youtube"
    }

    async fn find_existing(
        &self,
        idempotency_key: &str,
        credentials: &Credentials,
    ) -> Result<Option<RemoteVideo>, PublishError> {
        let response = self
            .client
            .get(format!("{}/youtube/v3/search", self.api_base))
            .bearer_auth(&credentials.access_token)
            .query(&[
                ("part", "id"),
                ("forMine", "true"),
                ("type", "video"),
                ("maxResults", "1"),
                ("q", idempotency_key),
            ])
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(network)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify(status, &body));
        }

        let parsed: SearchResponse = response.json().await.map_err(network)?;
        Ok(parsed
            .items
            .into_iter()
            .find_map(|item| item.id.video_id)
            .map(|id| RemoteVideo {
                url: Self::watch_url(&id),
                remote_id: id,
            }))
    }

    async fn upload(
        &self,
        request: &UploadRequest,
        credentials: &Credentials,
    ) -> Result<RemoteVideo, PublishError> {
        let video = tokio::fs::read(&request.video)
            .await
            .map_err(|e| PublishError::Rejected(format!("cannot read video file: {}", e)))?;

        // 1. Open a resumable session
        let session = self
            .client
            .post(format!("{}/upload/youtube/v3/videos", self.api_base))
            .bearer_auth(&credentials.access_token)
            .query(&[("uploadType", "resumable"), ("part", "snippet,status")])
            .header("X-Upload-Content-Type", "video/mp4")
            .header("X-Upload-Content-Length", video.len().to_string())
            .json(&Self::upload_snippet(request))
            .timeout(Duration::from_secs(60))
            .send()
            .await
            .map_err(network)?;

        let status = session.status();
        if !status.is_success() {
            let body = session.text().await.unwrap_or_default();
            return Err(classify(status, &body));
        }

        let location = session
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| PublishError::Network("upload session has no Location header".to_string()))?;

        debug!(bytes = video.len(), "Upload session opened");

        // 2. Send the file
        let response = self
            .client
            .put(&location)
            .bearer_auth(&credentials.access_token)
            .header(reqwest::header::CONTENT_TYPE, "video/mp4")
            .body(video)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(network)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify(status, &body));
        }

        let resource: VideoResource = response.json().await.map_err(network)?;
        info!(remote_id = %resource.id, "Video uploaded");

        Ok(RemoteVideo {
            url: Self::watch_url(&resource.id),
            remote_id: resource.id,
        })
    }

    async fn upload_thumbnail(
        &self,
        remote_id: &str,
        thumbnail: &Path,
        credentials: &Credentials,
    ) -> Result<(), PublishError> {
        let image = tokio::fs::read(thumbnail)
            .await
            .map_err(|e| PublishError::Rejected(format!("cannot read thumbnail: {}", e)))?;

        let response = self
            .client
            .post(format!("{}/upload/youtube/v3/thumbnails/set", self.api_base))
            .bearer_auth(&credentials.access_token)
            .query(&[("videoId", remote_id)])
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(image)
            .timeout(Duration::from_secs(60))
            .send()
            .await
            .map_err(network)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify(status, &body));
        }
        Ok(())
    }
}

/// OAuth 2.0 refresh-token grant with an in-memory access token cache
pub struct OAuthCredentials {
    client_id: Option<String>,
    client_secret: Option<String>,
    refresh_token: Option<String>,
    token_url: String,
    client: reqwest::Client,
    cached: Mutex<Option<Credentials>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

impl OAuthCredentials {
    pub fn new(
        client_id: Option<String>,
        client_secret: Option<String>,
        refresh_token: Option<String>,
    ) -> Self {
        Self {
            client_id,
            client_secret,
            refresh_token,
            token_url: TOKEN_URL.to_string(),
            client: reqwest::Client::new(),
            cached: Mutex::new(None),
        }
    }

    pub fn with_token_url(mut self, token_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self
    }

    async fn exchange(&self) -> Result<Credentials, PublishError> {
        let (Some(client_id), Some(client_secret), Some(refresh_token)) = (
            self.client_id.as_deref(),
            self.client_secret.as_deref(),
            self.refresh_token.as_deref(),
        ) else {
            return Err(PublishError::AuthExpired(
                "YouTube client id, client secret and refresh token must be configured".to_string(),
            ));
        };

        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("refresh_token", refresh_token),
            ])
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(network)?;

        let status = response.status();
        if !status.is_success() {
            // invalid_grant means the refresh token itself is dead
            return Err(if status.is_server_error() {
                PublishError::Network(format!("token endpoint returned {}", status))
            } else {
                PublishError::AuthExpired(format!("token refresh refused with {}", status))
            });
        }

        let token: TokenResponse = response.json().await.map_err(network)?;
        Ok(Credentials {
            access_token: token.access_token,
        })
    }
}

#[async_trait]
impl CredentialProvider for OAuthCredentials {
    async fn current(&self) -> Result<Credentials, PublishError> {
        let mut cached = self.cached.lock().await;
        if let Some(creds) = cached.as_ref() {
            return Ok(creds.clone());
        }
        let fresh = self.exchange().await?;
        *cached = Some(fresh.clone());
        Ok(fresh)
    }

    async fn refresh(&self) -> Result<Credentials, PublishError> {
        let mut cached = self.cached.lock().await;
        let fresh = self.exchange().await?;
        *cached = Some(fresh.clone());
        info!("Publish credentials refreshed");
        Ok(fresh)
    }
}
