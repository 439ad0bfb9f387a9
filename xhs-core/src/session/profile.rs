use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::session::driver::CookieSet;
use crate::session::error::{SessionError, SessionResult};

const COOKIE_CACHE_FILE: &str = "cookie_cache.json";
const LAST_USED_MARKER: &str = ".last_used";

/// Durable per-user credential cache. Survives profile resets so a synced
/// login outlives the browser directory it was captured in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieCache {
    pub user_agent: Option<String>,
    pub synced_at: DateTime<Utc>,
    pub cookies: CookieSet,
}

impl CookieCache {
    pub fn new(cookies: CookieSet, user_agent: Option<String>) -> Self {
        Self {
            user_agent,
            synced_at: Utc::now(),
            cookies,
        }
    }
}

/// One user's isolated on-disk browser storage.
#[derive(Debug, Clone)]
pub struct UserProfile {
    user_id: String,
    dir: PathBuf,
}

impl UserProfile {
    pub fn new<P: AsRef<Path>>(users_root: P, user_id: &str) -> Self {
        let dir = users_root.as_ref().join(sanitize_user_id(user_id));
        Self {
            user_id: user_id.to_string(),
            dir,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cookie_cache_path(&self) -> PathBuf {
        self.dir.join(COOKIE_CACHE_FILE)
    }

    pub fn ensure(&self) -> SessionResult<()> {
        std::fs::create_dir_all(&self.dir).map_err(|err| SessionError::profile_io(&self.dir, err))
    }

    /// Delete and recreate the directory. With `preserve_cache` the cookie
    /// cache file is staged outside the directory and restored afterwards.
    pub fn reset(&self, preserve_cache: bool) -> SessionResult<()> {
        let cache_path = self.cookie_cache_path();
        let staged = if preserve_cache && cache_path.exists() {
            let parent = self
                .dir
                .parent()
                .ok_or_else(|| SessionError::Profile("profile dir has no parent".to_string()))?;
            let staging = tempfile::tempdir_in(parent)
                .map_err(|err| SessionError::profile_io(parent, err))?;
            let staged_path = staging.path().join(COOKIE_CACHE_FILE);
            std::fs::copy(&cache_path, &staged_path)
                .map_err(|err| SessionError::profile_io(&cache_path, err))?;
            Some((staging, staged_path))
        } else {
            None
        };

        self.wipe()?;
        self.ensure()?;

        if let Some((_staging, staged_path)) = staged {
            std::fs::copy(&staged_path, &cache_path)
                .map_err(|err| SessionError::profile_io(&cache_path, err))?;
        }
        Ok(())
    }

    /// Remove the directory and everything in it, cache included.
    pub fn wipe(&self) -> SessionResult<()> {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SessionError::profile_io(&self.dir, err)),
        }
    }

    pub async fn touch(&self) -> SessionResult<()> {
        if self.dir.exists() {
            let marker = self.dir.join(LAST_USED_MARKER);
            let mut file = fs::File::create(&marker)
                .await
                .map_err(|err| SessionError::profile_io(&marker, err))?;
            file.write_all(Utc::now().to_rfc3339().as_bytes())
                .await
                .map_err(|err| SessionError::profile_io(&marker, err))?;
        }
        Ok(())
    }

    pub fn save_cookie_cache(&self, cache: &CookieCache) -> SessionResult<()> {
        self.ensure()?;
        let path = self.cookie_cache_path();
        let payload = serde_json::to_vec_pretty(cache)
            .map_err(|err| SessionError::Profile(format!("cookie cache encode: {err}")))?;
        std::fs::write(&path, payload).map_err(|err| SessionError::profile_io(&path, err))
    }

    /// Cached credentials, or `None` when absent. A cache that no longer
    /// parses is treated as absent rather than fatal.
    pub fn load_cookie_cache(&self) -> Option<CookieCache> {
        let path = self.cookie_cache_path();
        let raw = std::fs::read(&path).ok()?;
        match serde_json::from_slice(&raw) {
            Ok(cache) => Some(cache),
            Err(err) => {
                tracing::warn!(
                    user = %self.user_id,
                    path = %path.display(),
                    error = %err,
                    "discarding unreadable cookie cache"
                );
                None
            }
        }
    }

    pub fn clear_cookie_cache(&self) -> SessionResult<()> {
        let path = self.cookie_cache_path();
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SessionError::profile_io(&path, err)),
        }
    }
}

/// Allocates per-user profiles under one root and sweeps stale ones.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    root: PathBuf,
}

impl ProfileStore {
    pub fn new<P: AsRef<Path>>(root: P) -> SessionResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|err| SessionError::profile_io(&root, err))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn profile(&self, user_id: &str) -> UserProfile {
        UserProfile::new(&self.root, user_id)
    }

    /// Remove profile directories idle for longer than `ttl`. Uses the
    /// last-used marker when present, directory mtime otherwise.
    pub fn cleanup_expired(&self, ttl: Duration) -> SessionResult<()> {
        let now = SystemTime::now();
        let entries = std::fs::read_dir(&self.root)
            .map_err(|err| SessionError::profile_io(&self.root, err))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let reference = path.join(LAST_USED_MARKER);
            let modified = std::fs::metadata(&reference)
                .or_else(|_| entry.metadata())
                .and_then(|meta| meta.modified());
            let modified = match modified {
                Ok(modified) => modified,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "failed to read profile metadata");
                    continue;
                }
            };
            if now.duration_since(modified).unwrap_or(Duration::ZERO) > ttl {
                if let Err(err) = std::fs::remove_dir_all(&path) {
                    tracing::warn!(path = %path.display(), error = %err, "failed to remove stale profile");
                } else {
                    tracing::info!(path = %path.display(), "removed stale profile");
                }
            }
        }
        Ok(())
    }
}

pub(crate) fn sanitize_user_id(user_id: &str) -> String {
    let mut cleaned: String = user_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    cleaned.truncate(64);
    if cleaned.is_empty() {
        cleaned.push_str("anonymous");
    }
    cleaned
}
