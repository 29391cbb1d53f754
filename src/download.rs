use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, error, info};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_stream::StreamExt;

use crate::clip::{ClipFileName, ClipRecord};
use crate::config::DownloadConfig;
use crate::retry::{RetryHint, RetryPolicy, Retryable};

const PREVIEW_MARKER: &str = "-preview-";
const PARTIAL_EXTENSION: &str = "part";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    Downloaded,
    /// A file for this clip id was already in the destination.
    AlreadyPresent,
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("media request failed with status {0}")]
    Status(StatusCode),

    #[error("cannot derive a media url for clip {0}")]
    NoMediaUrl(String),

    #[error("{program} exited with {status}: {stderr}")]
    Helper {
        program: String,
        status: String,
        stderr: String,
    },
}

impl Retryable for DownloadError {
    fn retry_hint(&self) -> RetryHint {
        match self {
            DownloadError::NoMediaUrl(_) => RetryHint::Stop,
            DownloadError::Status(status)
                if status.is_client_error() && *status != StatusCode::TOO_MANY_REQUESTS =>
            {
                RetryHint::Stop
            }
            _ => RetryHint::Retry,
        }
    }
}

/// Fetches one clip's media into a directory.
///
/// Implementations must be idempotent: when a file for the same clip id is
/// already present they report [`DownloadOutcome::AlreadyPresent`].
#[async_trait]
pub trait ClipDownloader: Send + Sync {
    async fn download(
        &self,
        clip: &ClipRecord,
        dest_dir: &Path,
    ) -> Result<DownloadOutcome, DownloadError>;
}

/// Picks the downloader the config asks for, retrying transient failures
/// under `retry`.
pub fn from_config(
    config: &DownloadConfig,
    retry: RetryPolicy,
) -> Result<Box<dyn ClipDownloader>, DownloadError> {
    let downloader: Box<dyn ClipDownloader> = match &config.helper {
        Some(program) => Box::new(Retrying::new(
            HelperDownloader::new(program, config.helper_args.clone()),
            retry,
        )),
        None => Box::new(Retrying::new(HttpDownloader::new()?, retry)),
    };
    Ok(downloader)
}

/// Retries another downloader's transient failures.
pub struct Retrying<D> {
    inner: D,
    policy: RetryPolicy,
}

impl<D: ClipDownloader> Retrying<D> {
    pub fn new(inner: D, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<D: ClipDownloader> ClipDownloader for Retrying<D> {
    async fn download(
        &self,
        clip: &ClipRecord,
        dest_dir: &Path,
    ) -> Result<DownloadOutcome, DownloadError> {
        let label = format!("download {}", clip.id);
        self.policy
            .attempt(&label, || self.inner.download(clip, dest_dir))
            .await
    }
}

/// Finds a file in `dir` whose name records `clip_id`, whatever its view
/// count or date fields say.
pub async fn find_existing(dir: &Path, clip_id: &str) -> std::io::Result<Option<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Ok(parsed) = name.parse::<ClipFileName>() {
            if parsed.id == clip_id {
                return Ok(Some(entry.path()));
            }
        }
    }
    Ok(None)
}

/// The mp4 next to a clip's preview thumbnail.
pub fn media_url(thumbnail_url: &str) -> Option<String> {
    let cut = thumbnail_url.find(PREVIEW_MARKER)?;
    Some(format!("{}.mp4", &thumbnail_url[..cut]))
}

/// Streams the mp4 over HTTP.
pub struct HttpDownloader {
    http: Client,
}

impl HttpDownloader {
    pub fn new() -> Result<Self, DownloadError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ClipDownloader for HttpDownloader {
    async fn download(
        &self,
        clip: &ClipRecord,
        dest_dir: &Path,
    ) -> Result<DownloadOutcome, DownloadError> {
        if let Some(existing) = find_existing(dest_dir, &clip.id).await? {
            debug!("{} already present, skipping", existing.display());
            return Ok(DownloadOutcome::AlreadyPresent);
        }

        let url = media_url(&clip.thumbnail_url)
            .ok_or_else(|| DownloadError::NoMediaUrl(clip.id.clone()))?;
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(DownloadError::Status(response.status()));
        }

        let target = dest_dir.join(clip.file_name().to_string());
        let partial = target.with_extension(PARTIAL_EXTENSION);
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut body = response.bytes_stream();

        let written = async {
            while let Some(chunk) = body.next().await {
                let chunk: Bytes = chunk?;
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            Ok::<(), DownloadError>(())
        }
        .await;

        if let Err(err) = written {
            drop(file);
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(err);
        }

        tokio::fs::rename(&partial, &target).await?;
        info!("Downloaded {}", target.display());
        Ok(DownloadOutcome::Downloaded)
    }
}

/// Shells out to an external downloader such as `twitch-dl` or `yt-dlp`.
pub struct HelperDownloader {
    program: String,
    args: Vec<String>,
}

impl HelperDownloader {
    pub fn new(program: &str, args: Vec<String>) -> Self {
        Self {
            program: program.to_string(),
            args,
        }
    }

    fn render_args(&self, clip_url: &str, output: &Path) -> Vec<String> {
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace("{url}", clip_url).replace("{output}", &output))
            .collect()
    }
}

#[async_trait]
impl ClipDownloader for HelperDownloader {
    async fn download(
        &self,
        clip: &ClipRecord,
        dest_dir: &Path,
    ) -> Result<DownloadOutcome, DownloadError> {
        if let Some(existing) = find_existing(dest_dir, &clip.id).await? {
            debug!("{} already present, skipping", existing.display());
            return Ok(DownloadOutcome::AlreadyPresent);
        }

        let target = dest_dir.join(clip.file_name().to_string());
        let args = self.render_args(&clip.url, &target);
        let output = tokio::process::Command::new(&self.program)
            .args(&args)
            .output()
            .await?;

        debug!(
            "{} stdout: {}",
            self.program,
            String::from_utf8_lossy(&output.stdout)
        );

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!("{} stderr: {}", self.program, stderr);
            let _ = tokio::fs::remove_file(&target).await;
            return Err(DownloadError::Helper {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr,
            });
        }

        info!("Downloaded {}", target.display());
        Ok(DownloadOutcome::Downloaded)
    }
}
