use std::path::{Path, PathBuf};

use futures::StreamExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::session::error::{SessionError, SessionResult};

/// Stages publish media under one directory. Remote sources are streamed to
/// disk; local sources are copied, so the pipeline can delete its staging
/// copy without touching operator files.
#[derive(Debug, Clone)]
pub struct MediaFetcher {
    client: reqwest::Client,
    media_root: PathBuf,
}

impl MediaFetcher {
    pub fn new<P: AsRef<Path>>(media_root: P) -> Self {
        Self {
            client: reqwest::Client::new(),
            media_root: media_root.as_ref().to_path_buf(),
        }
    }

    pub async fn stage(&self, source: &str) -> SessionResult<PathBuf> {
        fs::create_dir_all(&self.media_root)
            .await
            .map_err(|err| self.fetch_error(source, format!("media dir: {err}")))?;
        let target = self.media_root.join(staged_file_name(source));

        if let Ok(parsed) = Url::parse(source) {
            match parsed.scheme() {
                "http" | "https" => {
                    self.download(source, &target).await?;
                    return Ok(target);
                }
                "file" => {
                    let path = parsed
                        .to_file_path()
                        .map_err(|()| self.fetch_error(source, "invalid file url".to_string()))?;
                    self.copy_local(source, &path, &target).await?;
                    return Ok(target);
                }
                _ => {}
            }
        }

        self.copy_local(source, Path::new(source), &target).await?;
        Ok(target)
    }

    async fn download(&self, source: &str, target: &Path) -> SessionResult<()> {
        let response = self
            .client
            .get(source)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| self.fetch_error(source, err.to_string()))?;
        let mut stream = response.bytes_stream();
        let mut file = fs::File::create(target)
            .await
            .map_err(|err| self.fetch_error(source, format!("{}: {err}", target.display())))?;
        while let Some(chunk) = stream.next().await {
            let data = chunk.map_err(|err| self.fetch_error(source, err.to_string()))?;
            file.write_all(&data)
                .await
                .map_err(|err| self.fetch_error(source, format!("{}: {err}", target.display())))?;
        }
        debug!(source, target = %target.display(), "media downloaded");
        Ok(())
    }

    async fn copy_local(&self, source: &str, from: &Path, target: &Path) -> SessionResult<()> {
        fs::copy(from, target)
            .await
            .map_err(|err| self.fetch_error(source, format!("{}: {err}", from.display())))?;
        debug!(source, target = %target.display(), "media staged from local file");
        Ok(())
    }

    fn fetch_error(&self, url: &str, message: String) -> SessionError {
        SessionError::MediaFetch {
            url: url.to_string(),
            message,
        }
    }
}

/// Staging copies for one publish run. `cleanup` deletes them once the
/// pipeline has reported; `Drop` covers flows that are cancelled mid-await.
#[derive(Debug, Default)]
pub struct StagedMedia {
    files: Vec<PathBuf>,
}

impl StagedMedia {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_paths(files: Vec<PathBuf>) -> Self {
        Self { files }
    }

    pub fn push(&mut self, path: PathBuf) {
        self.files.push(path);
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.files
    }

    /// Delete the staged copies now rather than on drop.
    pub fn cleanup(mut self) {
        self.remove_all();
    }

    /// Forget the staged copies without deleting them.
    pub fn disarm(mut self) {
        self.files.clear();
    }

    fn remove_all(&mut self) {
        for file in self.files.drain(..) {
            match std::fs::remove_file(&file) {
                Ok(()) => debug!(path = %file.display(), "removed staged media"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(path = %file.display(), error = %err, "failed to remove staged media")
                }
            }
        }
    }
}

impl Drop for StagedMedia {
    fn drop(&mut self) {
        self.remove_all();
    }
}

/// Unique staging name keeping the source extension when it has one.
fn staged_file_name(source: &str) -> String {
    let id = Uuid::new_v4();
    match source_extension(source) {
        Some(ext) => format!("{id}.{ext}"),
        None => format!("{id}.bin"),
    }
}

fn source_extension(source: &str) -> Option<String> {
    let path_part = Url::parse(source)
        .ok()
        .map(|url| url.path().to_string())
        .unwrap_or_else(|| source.to_string());
    let ext = Path::new(&path_part)
        .extension()?
        .to_string_lossy()
        .to_ascii_lowercase();
    (!ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .then_some(ext)
}
