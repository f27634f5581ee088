//! Video archiving in object storage.
//!
//! Objects are named `<specialty>/<paper_id>/<file name>`, so re-running a
//! paper overwrites its earlier copy instead of adding another one.
//!
//! Backends:
//!   local: copies into a directory, returns a `file://` URL
//!   gcs:   Cloud Storage JSON API media upload, returns the public URL

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use serde::Deserialize;
use tracing::info;

use crate::config::CloudStorageConfig;
use crate::core::error::CollaboratorError;
use crate::domain::{PaperRecord, VideoRef};

use super::{send_checked, ObjectStore};

const VIDEO_MIME: &str = "video/mp4";

/// Object name for a paper's video
pub fn object_name(paper: &PaperRecord, video: &VideoRef) -> String {
    let file = video
        .0
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video.mp4".to_string());
    let specialty = match paper.specialty.trim() {
        "" => "general",
        specialty => specialty,
    };
    format!("{}/{}/{}", sanitize(specialty), sanitize(&paper.id), file)
}

/// Keep object names to one path segment per component
fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Build the configured backend; `None` when archiving is disabled
pub fn object_store_from_config(
    config: &CloudStorageConfig,
    archive_root: PathBuf,
    access_token: Option<String>,
    client: reqwest::Client,
) -> Option<Arc<dyn ObjectStore>> {
    if !config.enabled {
        return None;
    }
    match config.backend.as_str() {
        "gcs" => Some(Arc::new(GcsObjectStore::new(
            client,
            config.base_url.clone(),
            config.bucket.clone(),
            access_token.unwrap_or_default(),
        ))),
        _ => Some(Arc::new(LocalObjectStore::new(archive_root))),
    }
}

/// Copies videos under a local directory
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn store(&self, paper: &PaperRecord, video: &VideoRef) -> Result<String, CollaboratorError> {
        let target = self.root.join(object_name(paper, video));
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                CollaboratorError::Unavailable(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        tokio::fs::copy(&video.0, &target).await.map_err(|e| {
            CollaboratorError::InvalidInput(format!("cannot archive {}: {}", video, e))
        })?;

        info!(paper_id = %paper.id, path = %target.display(), "Archived video");
        Ok(format!("file://{}", target.display()))
    }
}

/// Google Cloud Storage, authenticated with an OAuth access token
pub struct GcsObjectStore {
    client: reqwest::Client,
    base_url: String,
    bucket: String,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct StoredObject {
    name: String,
}

impl GcsObjectStore {
    pub fn new(client: reqwest::Client, base_url: String, bucket: String, access_token: String) -> Self {
        Self {
            client,
            base_url,
            bucket,
            access_token,
        }
    }

    fn upload_url(&self) -> String {
        format!(
            "{}/upload/storage/v1/b/{}/o",
            self.base_url.trim_end_matches('/'),
            self.bucket
        )
    }

    fn public_url(&self, name: &str) -> String {
        format!("{}/{}/{}", self.base_url.trim_end_matches('/'), self.bucket, name)
    }
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    fn name(&self) -> &str {
        "gcs"
    }

    async fn store(&self, paper: &PaperRecord, video: &VideoRef) -> Result<String, CollaboratorError> {
        if self.access_token.trim().is_empty() {
            return Err(CollaboratorError::Auth("no Cloud Storage access token configured".into()));
        }
        if self.bucket.trim().is_empty() {
            return Err(CollaboratorError::permanent("cloud_storage.bucket is not set"));
        }

        let file = tokio::fs::File::open(&video.0).await.map_err(|e| {
            CollaboratorError::InvalidInput(format!("cannot open {}: {}", video, e))
        })?;
        let length = file
            .metadata()
            .await
            .map_err(|e| CollaboratorError::InvalidInput(format!("cannot stat {}: {}", video, e)))?
            .len();

        let name = object_name(paper, video);
        let request = self
            .client
            .post(self.upload_url())
            .query(&[
                ("uploadType", "media"),
                ("name", name.as_str()),
                ("predefinedAcl", "publicRead"),
            ])
            .bearer_auth(&self.access_token)
            .header(CONTENT_TYPE, VIDEO_MIME)
            .header(CONTENT_LENGTH, length)
            .body(reqwest::Body::from(file));

        let stored: StoredObject = send_checked(request).await?.json().await.map_err(|e| {
            CollaboratorError::InvalidInput(format!("unexpected storage response: {}", e))
        })?;

        let url = self.public_url(&stored.name);
        info!(paper_id = %paper.id, bucket = %self.bucket, %url, "Archived video");
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn paper() -> PaperRecord {
        PaperRecord::new("38000001", "Statins").with_specialty("cardiology")
    }

    #[test]
    fn test_object_name() {
        let video = VideoRef(PathBuf::from("/runs/x/papers/38000001/video.mp4"));
        assert_eq!(object_name(&paper(), &video), "cardiology/38000001/video.mp4");

        let odd = PaperRecord::new("../42", "Odd").with_specialty("heart failure");
        assert_eq!(object_name(&odd, &video), "heart_failure/.._42/video.mp4");

        let bare = PaperRecord::new("7", "No specialty");
        assert_eq!(object_name(&bare, &video), "general/7/video.mp4");
    }

    #[tokio::test]
    async fn test_local_store_copies_video() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("video.mp4");
        std::fs::write(&source, b"mp4").unwrap();

        let store = LocalObjectStore::new(temp.path().join("archive"));
        let url = store.store(&paper(), &VideoRef(source)).await.unwrap();

        let archived = temp.path().join("archive/cardiology/38000001/video.mp4");
        assert_eq!(std::fs::read(&archived).unwrap(), b"mp4");
        assert_eq!(url, format!("file://{}", archived.display()));
    }

    #[tokio::test]
    async fn test_local_store_missing_video_is_permanent() {
        let temp = TempDir::new().unwrap();
        let store = LocalObjectStore::new(temp.path().to_path_buf());

        let err = store
            .store(&paper(), &VideoRef(temp.path().join("missing.mp4")))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_gcs_without_token_is_auth_error() {
        let store = GcsObjectStore::new(
            reqwest::Client::new(),
            "https://storage.googleapis.com".into(),
            "medibrief-videos".into(),
            String::new(),
        );
        let err = store
            .store(&paper(), &VideoRef(PathBuf::from("/nowhere.mp4")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "auth_error");
    }

    #[test]
    fn test_gcs_urls() {
        let store = GcsObjectStore::new(
            reqwest::Client::new(),
            "https://storage.googleapis.com/".into(),
            "medibrief-videos".into(),
            "token".into(),
        );
        assert_eq!(
            store.upload_url(),
            "https://storage.googleapis.com/upload/storage/v1/b/medibrief-videos/o"
        );
        assert_eq!(
            store.public_url("cardiology/1/video.mp4"),
            "https://storage.googleapis.com/medibrief-videos/cardiology/1/video.mp4"
        );
    }

    #[test]
    fn test_disabled_config_builds_nothing() {
        let config = CloudStorageConfig::default();
        assert!(object_store_from_config(&config, PathBuf::from("/tmp"), None, reqwest::Client::new()).is_none());

        let enabled = CloudStorageConfig {
            enabled: true,
            backend: "gcs".into(),
            ..CloudStorageConfig::default()
        };
        let store = object_store_from_config(&enabled, PathBuf::from("/tmp"), None, reqwest::Client::new()).unwrap();
        assert_eq!(store.name(), "gcs");
    }
}
