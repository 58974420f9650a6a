use std::{io::SeekFrom, path::Path, sync::Arc};

use async_trait::async_trait;
use reqwest::{
    header::{CONTENT_LENGTH, CONTENT_RANGE, LOCATION, RANGE},
    StatusCode,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::{
    auth::{AuthError, Authenticator},
    config::{DriveConfig, Param},
    constants::{DEFAULT_UPLOAD_CHUNK_SIZE, DEFAULT_VIDEO_NAME, DRIVE_UPLOAD_BASE, VIDEO_MIME},
};

#[derive(Debug, thiserror::Error)]
pub enum DriveError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("drive request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("local file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("drive returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("drive did not return a resumable session uri")]
    MissingSession,
    #[error("drive stopped accepting data at offset {offset}")]
    Stalled { offset: u64 },
    #[error("drive reported offset {offset} beyond the file size {size}")]
    InvalidRange { offset: u64, size: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub name: String,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
}

impl FileMetadata {
    pub fn video(file_name: Option<&str>) -> Self {
        Self {
            name: file_name
                .filter(|name| !name.is_empty())
                .unwrap_or(DEFAULT_VIDEO_NAME)
                .to_string(),
            mime_type: VIDEO_MIME.to_string(),
            parents: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteFile {
    pub id: String,
}

/// Destination for relayed videos.
#[async_trait]
pub trait VideoStorage: Send + Sync {
    /// Upload the file at `path`, reporting `(sent, total)` bytes.
    async fn upload(
        &self,
        path: &Path,
        metadata: &FileMetadata,
        progress: &(dyn Fn(u64, u64) + Send + Sync),
    ) -> Result<RemoteFile, DriveError>;
}

pub struct DriveClient {
    http: reqwest::Client,
    auth: Arc<Authenticator>,
    upload_base: String,
    folder_id: Option<String>,
    chunk_size: usize,
}

impl DriveClient {
    pub fn new<C: Param<DriveConfig>>(cfg: &C, auth: Arc<Authenticator>) -> anyhow::Result<Self> {
        let drive_config = cfg.param();
        // Resumable uploads answer 308 without a location, never follow it.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            http,
            auth,
            upload_base: DRIVE_UPLOAD_BASE.to_string(),
            folder_id: drive_config.folder_id,
            chunk_size: drive_config.chunk_size.unwrap_or(DEFAULT_UPLOAD_CHUNK_SIZE),
        })
    }

    #[cfg(test)]
    fn with_upload_base(mut self, upload_base: String, chunk_size: usize) -> Self {
        self.upload_base = upload_base;
        self.chunk_size = chunk_size;
        self
    }

    async fn create_session(
        &self,
        metadata: &FileMetadata,
        size: u64,
    ) -> Result<String, DriveError> {
        let token = self.auth.access_token().await?;
        let mut metadata = metadata.clone();
        if let Some(folder_id) = &self.folder_id {
            metadata.parents.push(folder_id.clone());
        }
        let resp = self
            .http
            .post(format!("{}/upload/drive/v3/files", self.upload_base))
            .query(&[("uploadType", "resumable"), ("fields", "id")])
            .bearer_auth(token)
            .header("X-Upload-Content-Type", metadata.mime_type.as_str())
            .header("X-Upload-Content-Length", size)
            .json(&metadata)
            .send()
            .await?;
        let resp = error_for_status(resp).await?;
        resp.headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or(DriveError::MissingSession)
    }
}

#[async_trait]
impl VideoStorage for DriveClient {
    async fn upload(
        &self,
        path: &Path,
        metadata: &FileMetadata,
        progress: &(dyn Fn(u64, u64) + Send + Sync),
    ) -> Result<RemoteFile, DriveError> {
        let mut file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let session = self.create_session(metadata, size).await?;
        tracing::debug!("Drive upload session created for {} ({size} bytes)", metadata.name);

        let mut buf = vec![0u8; self.chunk_size.min(size as usize)];
        let mut offset = 0u64;
        loop {
            let resp = if offset < size {
                let len = (size - offset).min(self.chunk_size as u64) as usize;
                file.read_exact(&mut buf[..len]).await?;
                let end = offset + len as u64 - 1;
                self.http
                    .put(&session)
                    .header(CONTENT_RANGE, format!("bytes {offset}-{end}/{size}"))
                    .body(buf[..len].to_vec())
                    .send()
                    .await?
            } else {
                // Every byte is persisted (or the file is empty), ask the
                // session to finish.
                self.http
                    .put(&session)
                    .header(CONTENT_RANGE, format!("bytes */{size}"))
                    .header(CONTENT_LENGTH, 0)
                    .send()
                    .await?
            };

            if resp.status() == StatusCode::PERMANENT_REDIRECT {
                // No range header means nothing was persisted yet.
                let next = resp
                    .headers()
                    .get(RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_range_end)
                    .map_or(0, |last| last + 1);
                if next > size {
                    return Err(DriveError::InvalidRange { offset: next, size });
                }
                if next <= offset {
                    return Err(DriveError::Stalled { offset });
                }
                file.seek(SeekFrom::Start(next)).await?;
                offset = next;
                progress(offset, size);
                continue;
            }

            let remote: RemoteFile = error_for_status(resp).await?.json().await?;
            progress(size, size);
            return Ok(remote);
        }
    }
}

async fn error_for_status(resp: reqwest::Response) -> Result<reqwest::Response, DriveError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(DriveError::Status { status, body })
}

/// Parse the last persisted byte from a `Range: bytes=0-N` header.
fn parse_range_end(range: &str) -> Option<u64> {
    let (_, end) = range.strip_prefix("bytes=")?.split_once('-')?;
    end.trim().parse().ok()
}
