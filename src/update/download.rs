//! Resumable release package downloads.
//!
//! Artifacts are named `<prefix>_v<version>.<ext>` inside the artifact
//! directory. A transfer writes to `<artifact>.part` first; a later attempt
//! resumes that file with an HTTP `Range` request when the server supports
//! it. Before each download, retention cleanup removes older artifacts so
//! that at most `retention_count` remain once the new one lands.

use crate::channel::{Channel, ChannelSpec};
use crate::config::UpdateConfig;
use crate::error::{Result, UpdateError};
use crate::retry::{RetryError, RetryPolicy, Transient, retry_with_backoff};
use crate::version::Version;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, RANGE};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of a single download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
}

/// Observable record of one download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadTask {
    pub source_url: String,
    pub destination_path: PathBuf,
    /// Whole percent, 0..=100. Stays 0 when the size is unknown.
    pub progress_percent: u8,
    pub status: DownloadStatus,
    pub attempts_used: u32,
}

impl DownloadTask {
    fn new(source_url: String, destination_path: PathBuf) -> Self {
        Self {
            source_url,
            destination_path,
            progress_percent: 0,
            status: DownloadStatus::Pending,
            attempts_used: 0,
        }
    }
}

/// Receives a fresh [`DownloadTask`] snapshot whenever it changes.
pub type ProgressCallback = Arc<dyn Fn(&DownloadTask) + Send + Sync>;

/// Why one transfer attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// Network failure or timeout.
    #[error("network error: {0}")]
    Network(String),
    /// Server answered with a non-success status.
    #[error("HTTP {0}")]
    Status(u16),
    /// Body ended before the advertised length.
    #[error("transfer ended at {received} of {expected} bytes")]
    Incomplete { received: u64, expected: u64 },
    /// The artifact could not be written.
    #[error("cannot write artifact: {0}")]
    Io(#[from] std::io::Error),
    /// The transfer was cancelled.
    #[error("cancelled")]
    Cancelled,
}

impl Transient for TransferError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Incomplete { .. } => true,
            Self::Status(code) => *code == 416 || *code == 429 || *code >= 500,
            Self::Io(_) | Self::Cancelled => false,
        }
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

/// Why a download did not produce an artifact.
///
/// A partial file may be left behind; callers must not treat it as valid.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// No download locator exists for the channel.
    #[error("channel `{0}` is not configured")]
    UnknownChannel(Channel),
    /// The artifact directory could not be created.
    #[error("cannot prepare artifact directory {}: {source}", .path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Cancelled before completion.
    #[error("download cancelled")]
    Cancelled { partial: PathBuf },
    /// Retries exhausted or a permanent failure occurred.
    #[error("download failed after {attempts} attempt(s): {source}")]
    Failed {
        attempts: u32,
        #[source]
        source: TransferError,
        partial: PathBuf,
    },
}

impl DownloadError {
    /// Partial file left on disk, if any.
    pub fn partial_path(&self) -> Option<&Path> {
        match self {
            Self::Cancelled { partial } | Self::Failed { partial, .. } => Some(partial),
            Self::UnknownChannel(_) | Self::Storage { .. } => None,
        }
    }
}

/// Something that can fetch a release package to local storage.
#[async_trait]
pub trait ArtifactFetch: Send + Sync {
    /// Download `version` from `channel`, reporting progress to `on_progress`.
    async fn download(
        &self,
        version: &Version,
        channel: &Channel,
        on_progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> std::result::Result<PathBuf, DownloadError>;
}

/// A downloaded artifact found on disk.
#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub path: PathBuf,
    pub version: Version,
    pub modified: SystemTime,
}

/// HTTP downloader with resume, retry and retention cleanup.
pub struct Downloader {
    client: reqwest::Client,
    channels: Vec<ChannelSpec>,
    artifact_dir: PathBuf,
    prefix: String,
    extension: String,
    retention_count: usize,
    retry: RetryPolicy,
    timeout: Duration,
}

impl Downloader {
    /// Build a downloader from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &UpdateConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("channel-updater/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| UpdateError::Client(e.to_string()))?;
        Ok(Self {
            client,
            channels: config.channels.clone(),
            artifact_dir: config.artifact_dir(),
            prefix: config.artifact_prefix.clone(),
            extension: config.artifact_extension.clone(),
            retention_count: config.retention_count.max(1),
            retry: config.download_retry(),
            timeout: Duration::from_millis(config.download_timeout_ms),
        })
    }

    /// Directory holding artifacts.
    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    /// Final path of the artifact for `version`.
    pub fn artifact_path(&self, version: &Version) -> PathBuf {
        self.artifact_dir.join(format!(
            "{}_v{}.{}",
            self.prefix,
            version.normalized(),
            self.extension
        ))
    }

    /// Resolve the download URL of `version` on `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::UnknownChannel`] if the channel is not configured.
    pub fn source_url(
        &self,
        version: &Version,
        channel: &Channel,
    ) -> std::result::Result<String, DownloadError> {
        self.channels
            .iter()
            .find(|c| &c.name == channel)
            .map(|spec| spec.download_url.resolve(version))
            .ok_or_else(|| DownloadError::UnknownChannel(channel.clone()))
    }

    /// Artifacts currently on disk, newest first (by version, then mtime).
    ///
    /// # Errors
    ///
    /// Returns an error if the artifact directory cannot be listed.
    pub async fn stored_artifacts(&self) -> std::io::Result<Vec<StoredArtifact>> {
        let mut artifacts = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.artifact_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(version) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| self.version_from_name(n))
            else {
                continue;
            };
            let modified = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            artifacts.push(StoredArtifact {
                path,
                version,
                modified,
            });
        }
        artifacts.sort_by(|a, b| {
            b.version
                .cmp(&a.version)
                .then_with(|| b.modified.cmp(&a.modified))
        });
        Ok(artifacts)
    }

    /// Delete old artifacts, keeping the newest `retention_count - 1` so the
    /// upcoming download brings the total back to `retention_count`. Stale
    /// partial files other than `keep_partial` are removed too.
    ///
    /// Returns the number of files deleted. Failures are logged, never fatal.
    pub async fn cleanup(&self, keep_partial: &Path) -> usize {
        let mut deleted = 0;
        let keep = self.retention_count.saturating_sub(1);

        match self.stored_artifacts().await {
            Ok(artifacts) => {
                for stale in artifacts.iter().skip(keep) {
                    match tokio::fs::remove_file(&stale.path).await {
                        Ok(()) => {
                            debug!(path = %stale.path.display(), "deleted old artifact");
                            deleted += 1;
                        }
                        Err(e) => warn!(path = %stale.path.display(), "cannot delete old artifact: {e}"),
                    }
                }
            }
            Err(e) => warn!(dir = %self.artifact_dir.display(), "artifact cleanup skipped: {e}"),
        }

        if let Ok(mut entries) = tokio::fs::read_dir(&self.artifact_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                let is_stale_partial = path.extension().is_some_and(|e| e == "part")
                    && path != keep_partial
                    && path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with(&format!("{}_v", self.prefix)));
                if is_stale_partial && tokio::fs::remove_file(&path).await.is_ok() {
                    debug!(path = %path.display(), "deleted stale partial download");
                    deleted += 1;
                }
            }
        }

        deleted
    }

    fn version_from_name(&self, name: &str) -> Option<Version> {
        let stem = name
            .strip_prefix(&self.prefix)?
            .strip_prefix("_v")?
            .strip_suffix(&self.extension)?
            .strip_suffix('.')?;
        stem.chars()
            .next()
            .filter(char::is_ascii_digit)
            .map(|_| Version::parse(stem))
    }

    async fn transfer(
        &self,
        url: &str,
        partial: &Path,
        task: &Mutex<DownloadTask>,
        on_progress: &ProgressCallback,
    ) -> std::result::Result<(), TransferError> {
        let offset = tokio::fs::metadata(partial)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        let mut request = self.client.get(url).timeout(self.timeout);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        let response = request.send().await?;
        let status = response.status();

        let (mut file, mut received, total) = if offset > 0 && status == StatusCode::PARTIAL_CONTENT {
            debug!(offset, "resuming partial download");
            let total = content_range_total(&response)
                .or_else(|| response.content_length().map(|len| len + offset));
            let file = tokio::fs::OpenOptions::new()
                .append(true)
                .open(partial)
                .await?;
            (file, offset, total)
        } else if status == StatusCode::RANGE_NOT_SATISFIABLE {
            // Partial file is unusable; start over on the next attempt.
            tokio::fs::remove_file(partial).await?;
            return Err(TransferError::Status(status.as_u16()));
        } else if status.is_success() {
            let file = tokio::fs::File::create(partial).await?;
            (file, 0, response.content_length())
        } else {
            return Err(TransferError::Status(status.as_u16()));
        };

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;

            if let Some(total) = total.filter(|t| *t > 0) {
                let percent = (received.saturating_mul(100) / total).min(100) as u8;
                let snapshot = {
                    let mut task = task.lock().unwrap_or_else(|e| e.into_inner());
                    if task.progress_percent == percent {
                        None
                    } else {
                        task.progress_percent = percent;
                        Some(task.clone())
                    }
                };
                if let Some(snapshot) = snapshot {
                    on_progress(&snapshot);
                }
            }
        }
        file.flush().await?;

        match total {
            Some(expected) if received < expected => Err(TransferError::Incomplete { received, expected }),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ArtifactFetch for Downloader {
    async fn download(
        &self,
        version: &Version,
        channel: &Channel,
        on_progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> std::result::Result<PathBuf, DownloadError> {
        let url = self.source_url(version, channel)?;
        let destination = self.artifact_path(version);
        let partial = partial_path(&destination);

        tokio::fs::create_dir_all(&self.artifact_dir)
            .await
            .map_err(|source| DownloadError::Storage {
                path: self.artifact_dir.clone(),
                source,
            })?;
        let deleted = self.cleanup(&partial).await;
        if deleted > 0 {
            info!(deleted, "retention cleanup removed old artifacts");
        }

        let task = Mutex::new(DownloadTask::new(url.clone(), destination.clone()));
        on_progress(&snapshot(&task));
        info!(%url, %version, %channel, "starting download");

        let transfer = retry_with_backoff(self.retry, "download", |attempt| {
            {
                let mut t = task.lock().unwrap_or_else(|e| e.into_inner());
                t.attempts_used = attempt;
                t.status = DownloadStatus::Downloading;
            }
            on_progress(&snapshot(&task));
            self.transfer(&url, &partial, &task, &on_progress)
        });

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RetryError { attempts: snapshot(&task).attempts_used, error: TransferError::Cancelled }),
            r = transfer => r,
        };

        let outcome = match result {
            Ok(()) => match tokio::fs::rename(&partial, &destination).await {
                Ok(()) => Ok(()),
                Err(e) => Err(RetryError {
                    attempts: snapshot(&task).attempts_used,
                    error: TransferError::Io(e),
                }),
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                {
                    let mut t = task.lock().unwrap_or_else(|e| e.into_inner());
                    t.status = DownloadStatus::Completed;
                    t.progress_percent = 100;
                }
                on_progress(&snapshot(&task));
                info!(path = %destination.display(), "download complete");
                Ok(destination)
            }
            Err(RetryError {
                error: TransferError::Cancelled,
                ..
            }) => {
                task.lock().unwrap_or_else(|e| e.into_inner()).status = DownloadStatus::Failed;
                on_progress(&snapshot(&task));
                info!(%url, "download cancelled");
                Err(DownloadError::Cancelled { partial })
            }
            Err(RetryError { attempts, error }) => {
                task.lock().unwrap_or_else(|e| e.into_inner()).status = DownloadStatus::Failed;
                on_progress(&snapshot(&task));
                warn!(%url, attempts, "download failed: {error}");
                Err(DownloadError::Failed {
                    attempts,
                    source: error,
                    partial,
                })
            }
        }
    }
}

fn snapshot(task: &Mutex<DownloadTask>) -> DownloadTask {
    task.lock().unwrap_or_else(|e| e.into_inner()).clone()
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Total size from a `Content-Range: bytes a-b/total` header.
fn content_range_total(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_RANGE)?
        .to_str()
        .ok()?
        .rsplit_once('/')?
        .1
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn downloader(dir: &Path, retention: usize) -> Downloader {
        let config = UpdateConfig {
            artifact_dir: Some(dir.to_path_buf()),
            artifact_prefix: "App".to_owned(),
            retention_count: retention,
            ..Default::default()
        };
        Downloader::new(&config).unwrap()
    }

    #[test]
    fn artifact_path_uses_numeric_version() {
        let dir = tempfile::tempdir().unwrap();
        let d = downloader(dir.path(), 2);
        let path = d.artifact_path(&Version::parse("1.3.11.001-tag"));
        assert_eq!(path, dir.path().join("App_v1.3.11.001.apk"));
        assert_eq!(partial_path(&path), dir.path().join("App_v1.3.11.001.apk.part"));
    }

    #[test]
    fn source_url_resolves_channel_template() {
        let dir = tempfile::tempdir().unwrap();
        let d = downloader(dir.path(), 2);
        let url = d.source_url(&Version::parse("1.3.11.001"), &Channel::tag()).unwrap();
        assert!(url.ends_with("/releases/download/v1.3.11.001/1.3.11.001.apk"));
        assert!(matches!(
            d.source_url(&Version::parse("1.0"), &Channel::from("nope")),
            Err(DownloadError::UnknownChannel(_))
        ));
    }

    #[test]
    fn version_is_read_back_from_filename() {
        let dir = tempfile::tempdir().unwrap();
        let d = downloader(dir.path(), 2);
        assert_eq!(d.version_from_name("App_v1.3.11.002.apk").unwrap().as_str(), "1.3.11.002");
        assert!(d.version_from_name("App_v1.3.11.002.apk.part").is_none());
        assert!(d.version_from_name("Other_v1.0.apk").is_none());
        assert!(d.version_from_name("App_vlatest.apk").is_none());
    }

    #[tokio::test]
    async fn cleanup_keeps_newest_minus_one() {
        let dir = tempfile::tempdir().unwrap();
        let d = downloader(dir.path(), 2);
        for v in ["1.3.9.000", "1.3.11.001", "1.3.10.000"] {
            std::fs::write(dir.path().join(format!("App_v{v}.apk")), b"x").unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), b"keep me").unwrap();
        std::fs::write(dir.path().join("App_v1.3.8.000.apk.part"), b"x").unwrap();

        let deleted = d.cleanup(&dir.path().join("App_v1.4.0.000.apk.part")).await;
        assert_eq!(deleted, 3);

        let remaining: Vec<String> = d
            .stored_artifacts()
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.version.to_string())
            .collect();
        assert_eq!(remaining, ["1.3.11.001"]);
        assert!(dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn cleanup_keeps_current_partial() {
        let dir = tempfile::tempdir().unwrap();
        let d = downloader(dir.path(), 2);
        let keep = dir.path().join("App_v1.4.0.000.apk.part");
        std::fs::write(&keep, b"half").unwrap();
        assert_eq!(d.cleanup(&keep).await, 0);
        assert!(keep.exists());
    }

    #[tokio::test]
    async fn cleanup_on_missing_dir_is_non_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let d = downloader(&dir.path().join("missing"), 2);
        assert_eq!(d.cleanup(Path::new("/nonexistent.part")).await, 0);
    }

    #[test]
    fn transfer_error_classification() {
        assert!(TransferError::Network("reset".to_owned()).is_transient());
        assert!(TransferError::Status(502).is_transient());
        assert!(!TransferError::Status(404).is_transient());
        assert!(!TransferError::Cancelled.is_transient());
        assert!(!TransferError::Io(std::io::Error::other("disk full")).is_transient());
    }
}
