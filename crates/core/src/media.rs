//! Media resolution for publish attempts.
//!
//! A resolver turns logical [`MediaRef`]s into local files and hands back a
//! [`ResolvedMedia`] guard. Temporary files live exactly as long as the guard:
//! cleanup runs once, either on [`ResolvedMedia::release`] or on drop.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use cadence_common::{AppError, AppResult, IdGenerator, MediaConfig};
use reqwest::Client;
use tracing::{debug, warn};
use url::Url;

use crate::model::MediaRef;

/// Turns media references into fetchable local files.
#[async_trait]
pub trait MediaResolver: Send + Sync {
    /// Materialize `media` for `owner_id`.
    async fn resolve(&self, media: &[MediaRef], owner_id: &str) -> AppResult<ResolvedMedia>;
}

type CleanupFn = Box<dyn FnOnce() + Send + Sync>;

/// Resolved media files plus the cleanup for anything created on the way.
pub struct ResolvedMedia {
    paths: Vec<PathBuf>,
    cleanup: Option<CleanupFn>,
}

impl ResolvedMedia {
    /// Resolved paths with a cleanup callback.
    #[must_use]
    pub fn new(paths: Vec<PathBuf>, cleanup: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            paths,
            cleanup: Some(Box::new(cleanup)),
        }
    }

    /// Resolved paths that need no cleanup.
    #[must_use]
    pub fn borrowed(paths: Vec<PathBuf>) -> Self {
        Self {
            paths,
            cleanup: None,
        }
    }

    /// Local paths, in the order of the original references.
    #[must_use]
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Run cleanup now.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ResolvedMedia {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

impl std::fmt::Debug for ResolvedMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedMedia")
            .field("paths", &self.paths)
            .field("pending_cleanup", &self.cleanup.is_some())
            .finish()
    }
}

/// Files created during resolution; removed on drop unless handed off.
#[derive(Default)]
struct TempFiles(Vec<PathBuf>);

impl TempFiles {
    fn push(&mut self, path: PathBuf) {
        self.0.push(path);
    }

    fn into_inner(mut self) -> Vec<PathBuf> {
        std::mem::take(&mut self.0)
    }
}

impl Drop for TempFiles {
    fn drop(&mut self) {
        remove_files(&self.0);
    }
}

fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "Removed temporary media file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temporary media file"),
        }
    }
}

fn sanitize_segment(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() { "_".to_string() } else { cleaned }
}

fn extension_of(url: &Url) -> String {
    Path::new(url.path())
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default()
}

/// Resolver that passes local paths through and downloads URLs over HTTP.
#[derive(Clone)]
pub struct HttpMediaResolver {
    client: Client,
    temp_dir: PathBuf,
    id_gen: IdGenerator,
}

impl HttpMediaResolver {
    /// Create a resolver from configuration.
    pub fn new(config: &MediaConfig) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .user_agent(format!("cadence/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self::with_client(client, config.temp_dir.clone()))
    }

    /// Create a resolver with an existing HTTP client.
    #[must_use]
    pub const fn with_client(client: Client, temp_dir: PathBuf) -> Self {
        Self {
            client,
            temp_dir,
            id_gen: IdGenerator::new(),
        }
    }

    async fn download(&self, url: &Url, dir: &Path) -> AppResult<PathBuf> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| AppError::ExternalService(format!("Failed to fetch media {url}: {e}")))?;

        let body = response
            .bytes()
            .await
            .map_err(|e| AppError::ExternalService(format!("Failed to read media {url}: {e}")))?;

        let path = dir.join(format!("{}{}", self.id_gen.generate(), extension_of(url)));
        tokio::fs::write(&path, &body)
            .await
            .with_context(|| format!("writing media to {}", path.display()))?;

        debug!(url = %url, path = %path.display(), bytes = body.len(), "Downloaded media");
        Ok(path)
    }
}

#[async_trait]
impl MediaResolver for HttpMediaResolver {
    async fn resolve(&self, media: &[MediaRef], owner_id: &str) -> AppResult<ResolvedMedia> {
        let dir = self.temp_dir.join(sanitize_segment(owner_id));
        let mut created = TempFiles::default();
        let mut paths = Vec::with_capacity(media.len());
        let mut dir_ready = false;

        for reference in media {
            match reference {
                MediaRef::Path(path) => {
                    let exists = tokio::fs::try_exists(path)
                        .await
                        .with_context(|| format!("checking {}", path.display()))?;
                    if !exists {
                        return Err(AppError::NotFound(format!(
                            "media file {}",
                            path.display()
                        )));
                    }
                    paths.push(path.clone());
                }
                MediaRef::Url(raw) => {
                    let url = Url::parse(raw)
                        .map_err(|e| AppError::Validation(format!("invalid media URL {raw}: {e}")))?;
                    if !matches!(url.scheme(), "http" | "https") {
                        return Err(AppError::Validation(format!(
                            "unsupported media URL scheme: {}",
                            url.scheme()
                        )));
                    }
                    if !dir_ready {
                        tokio::fs::create_dir_all(&dir)
                            .await
                            .with_context(|| format!("creating {}", dir.display()))?;
                        dir_ready = true;
                    }
                    let path = self.download(&url, &dir).await?;
                    created.push(path.clone());
                    paths.push(path);
                }
            }
        }

        let files = created.into_inner();
        if files.is_empty() {
            return Ok(ResolvedMedia::borrowed(paths));
        }
        Ok(ResolvedMedia::new(paths, move || remove_files(&files)))
    }
}
