//! HTTP client for the central analysis-sync service

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Request timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connect timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from the central service
#[derive(Debug, Error)]
pub enum SyncClientError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unauthorized (check the sync API key)")]
    Unauthorized,

    #[error("central service returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl SyncClientError {
    /// Whether this error should abort the whole cycle instead of being
    /// retried on the next tick
    pub fn is_fatal_for_cycle(&self) -> bool {
        matches!(self, SyncClientError::Unauthorized)
    }
}

/// One file the central service already holds
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteFileEntry {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub mtime: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RemoteFileList {
    files: Vec<RemoteFileEntry>,
}

/// Client for the central analysis-sync API
pub struct CentralClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl CentralClient {
    /// Create a client against the given service URL
    pub fn new(service_url: &str, api_key: &str) -> Result<Self, SyncClientError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url: service_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn check_auth(status: StatusCode) -> Result<(), SyncClientError> {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SyncClientError::Unauthorized);
        }
        Ok(())
    }

    /// List files the central service already holds for a run subdir.
    ///
    /// A 404 means the run is not registered there yet and reads as an
    /// empty list.
    pub async fn list_remote(
        &self,
        run_id: &str,
        subdir: &str,
    ) -> Result<Vec<RemoteFileEntry>, SyncClientError> {
        let url = format!(
            "{}/api/sync/analysis/{}/list?subdir={}",
            self.base_url, run_id, subdir
        );

        let response = self
            .client
            .get(&url)
            .header("X-Sync-API-Key", &self.api_key)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        Self::check_auth(status)?;
        if !status.is_success() {
            return Err(SyncClientError::Status {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let list: RemoteFileList = response.json().await?;
        debug!(
            "Central holds {} files for {}/{}",
            list.files.len(),
            run_id,
            subdir
        );
        Ok(list.files)
    }

    /// Upload one analysis file as multipart form data
    pub async fn upload(
        &self,
        run_id: &str,
        subdir: &str,
        file_name: &str,
        path: &Path,
    ) -> Result<(), SyncClientError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| SyncClientError::Io {
                path: path.display().to_string(),
                source,
            })?;

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str("application/gzip")?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("subdir", subdir.to_string());

        let url = format!("{}/api/sync/analysis/{}", self.base_url, run_id);
        let response = self
            .client
            .post(&url)
            .header("X-Sync-API-Key", &self.api_key)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        Self::check_auth(status)?;
        if !status.is_success() {
            return Err(SyncClientError::Status {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Advisory registration of a run with the central service
    pub async fn register(
        &self,
        run_id: &str,
        template_name: &str,
        ecosystem_variant: Option<&str>,
        started_at: DateTime<Utc>,
    ) -> Result<(), SyncClientError> {
        let url = format!("{}/api/sync/register/{}", self.base_url, run_id);
        let response = self
            .client
            .post(&url)
            .header("X-Sync-API-Key", &self.api_key)
            .json(&serde_json::json!({
                "templateName": template_name,
                "ecosystemVariant": ecosystem_variant,
                "startedAt": started_at,
            }))
            .send()
            .await?;

        let status = response.status();
        Self::check_auth(status)?;
        if !status.is_success() {
            return Err(SyncClientError::Status {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalized() {
        let client = CentralClient::new("https://central.example/", "key").unwrap();
        assert_eq!(client.base_url, "https://central.example");
    }

    #[test]
    fn test_unauthorized_is_fatal_for_cycle() {
        assert!(SyncClientError::Unauthorized.is_fatal_for_cycle());
        assert!(!SyncClientError::Status {
            status: 500,
            message: String::new()
        }
        .is_fatal_for_cycle());
    }
}
