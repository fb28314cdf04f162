//! Push recorded audio segments to the ingestion HTTP endpoint.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

pub struct SegmentUploader {
    client: reqwest::Client,
    url: String,
}

impl SegmentUploader {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Post one segment. `timestamp` is milliseconds since the Unix epoch.
    pub async fn upload(&self, filename: &str, timestamp: f64, body: impl Into<Bytes>) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .header("filename", filename)
            .header("timestamp", timestamp.to_string())
            .body(body.into())
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Upload of {} failed with {}: {}", filename, status, body));
        }
        Ok(())
    }

    /// Post a file, stamped with its modification time.
    pub async fn upload_file(&self, path: &Path) -> Result<()> {
        let body = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let modified: DateTime<Utc> = tokio::fs::metadata(path).await?.modified()?.into();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        self.upload(&filename, modified.timestamp_millis() as f64, body).await
    }

    /// Upload every file in `dir` in name order, stopping at the first failure.
    ///
    /// With `delete`, each file is removed once the server accepted it.
    pub async fn upload_dir(&self, dir: &Path, delete: bool) -> Result<usize> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("Failed to read {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();

        let mut uploaded = 0;
        for path in &files {
            self.upload_file(path).await?;
            uploaded += 1;
            if delete {
                if let Err(e) = tokio::fs::remove_file(path).await {
                    warn!("Uploaded {} but could not remove it: {}", path.display(), e);
                }
            }
        }
        info!("Uploaded {} segments to {}", uploaded, self.url);
        Ok(uploaded)
    }
}
