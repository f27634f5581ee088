//! YouTube publishing.
//!
//! Uses the resumable upload protocol: one POST opens an upload session
//! with the video metadata, and one PUT to the returned session URL sends
//! the file.

use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::core::error::CollaboratorError;
use crate::domain::{PublishedRef, VideoRef};

use super::{send_checked, Publisher, VideoMetadata};

const VIDEO_MIME: &str = "video/mp4";

pub struct YouTubePublisher {
    client: reqwest::Client,
    upload_url: String,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct UploadedVideo {
    id: String,
}

impl YouTubePublisher {
    pub fn new(client: reqwest::Client, upload_url: String, access_token: String) -> Self {
        Self {
            client,
            upload_url,
            access_token,
        }
    }

    async fn open_session(
        &self,
        metadata: &VideoMetadata,
        content_length: u64,
    ) -> Result<String, CollaboratorError> {
        let request = self
            .client
            .post(session_url(&self.upload_url))
            .bearer_auth(&self.access_token)
            .header("X-Upload-Content-Type", VIDEO_MIME)
            .header("X-Upload-Content-Length", content_length)
            .json(&upload_body(metadata));

        let response = send_checked(request).await?;
        response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| CollaboratorError::Unavailable("upload session has no Location".into()))
    }
}

#[async_trait]
impl Publisher for YouTubePublisher {
    async fn upload(
        &self,
        video: &VideoRef,
        metadata: &VideoMetadata,
    ) -> Result<PublishedRef, CollaboratorError> {
        if self.access_token.trim().is_empty() {
            return Err(CollaboratorError::Auth("no YouTube access token configured".into()));
        }

        let file = tokio::fs::File::open(&video.0).await.map_err(|e| {
            CollaboratorError::InvalidInput(format!("cannot open {}: {}", video, e))
        })?;
        let length = file
            .metadata()
            .await
            .map_err(|e| CollaboratorError::InvalidInput(format!("cannot stat {}: {}", video, e)))?
            .len();

        let session = self.open_session(metadata, length).await?;

        let request = self
            .client
            .put(&session)
            .bearer_auth(&self.access_token)
            .header(CONTENT_TYPE, VIDEO_MIME)
            .header(CONTENT_LENGTH, length)
            .body(reqwest::Body::from(file));

        let uploaded: UploadedVideo = send_checked(request)
            .await?
            .json()
            .await
            .map_err(|e| CollaboratorError::InvalidInput(format!("unexpected upload response: {}", e)))?;

        info!(video_id = %uploaded.id, title = %metadata.title, "Uploaded video");
        let url = format!("https://www.youtube.com/watch?v={}", uploaded.id);
        Ok(PublishedRef::new(uploaded.id, Some(url)))
    }
}

fn session_url(upload_url: &str) -> String {
    format!("{}?uploadType=resumable&part=snippet,status", upload_url)
}

fn upload_body(metadata: &VideoMetadata) -> Value {
    json!({
        "snippet": {
            "title": metadata.title,
            "description": metadata.description,
            "tags": metadata.tags,
            "categoryId": metadata.category_id,
        },
        "status": {
            "privacyStatus": metadata.privacy,
            "selfDeclaredMadeForKids": false,
        }
    })
}

/// Publisher for dry runs: checks the video exists and uploads nothing
#[derive(Debug, Default)]
pub struct DryRunPublisher;

impl DryRunPublisher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Publisher for DryRunPublisher {
    async fn upload(
        &self,
        video: &VideoRef,
        metadata: &VideoMetadata,
    ) -> Result<PublishedRef, CollaboratorError> {
        if !tokio::fs::try_exists(&video.0).await.unwrap_or(false) {
            return Err(CollaboratorError::InvalidInput(format!("no video at {}", video)));
        }

        let id = format!("dry-run-{}", Uuid::new_v4());
        info!(%id, title = %metadata.title, video = %video, "[DRY RUN] Would upload video");
        Ok(PublishedRef::dry_run(id))
    }
}
