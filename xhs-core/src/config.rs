use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WorkerConfig {
    pub paths: PathsSection,
    pub chromium: ChromiumSection,
    pub display: DisplaySection,
    pub pool: PoolSection,
    pub login: LoginSection,
    pub publish: PublishSection,
    pub user_agents: UserAgentSection,
    pub observability: ObservabilitySection,
}

impl WorkerConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.data_dir).join(path)
        }
    }

    pub fn users_root(&self) -> PathBuf {
        self.resolve_path(&self.paths.users_dir)
    }

    pub fn media_root(&self) -> PathBuf {
        self.resolve_path(&self.paths.media_dir)
    }

    pub fn screenshots_root(&self) -> PathBuf {
        self.resolve_path(&self.paths.screenshots_dir)
    }

    pub fn failure_log_path(&self) -> PathBuf {
        self.resolve_path(&self.observability.failure_log)
    }

    pub fn runs_db_path(&self) -> PathBuf {
        self.resolve_path(&self.observability.runs_db)
    }

    fn validate(&self, path: &Path) -> Result<()> {
        let invalid = |message: String| ConfigError::Invalid {
            message,
            path: path.to_path_buf(),
        };
        if self.pool.max_size == 0 {
            return Err(invalid("pool.max_size must be at least 1".to_string()));
        }
        if self.pool.max_concurrent_publishes == 0 {
            return Err(invalid(
                "pool.max_concurrent_publishes must be at least 1".to_string(),
            ));
        }
        if self.login.qr_ttl_seconds == 0 {
            return Err(invalid("login.qr_ttl_seconds must be positive".to_string()));
        }
        if self.login.container_min_px >= self.login.container_max_px {
            return Err(invalid(
                "login.container_min_px must be below container_max_px".to_string(),
            ));
        }
        if self.login.icon_min_px >= self.login.icon_max_px {
            return Err(invalid(
                "login.icon_min_px must be below icon_max_px".to_string(),
            ));
        }
        if self.user_agents.pool.is_empty() {
            return Err(invalid("user_agents.pool must not be empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub data_dir: String,
    pub users_dir: String,
    pub media_dir: String,
    pub screenshots_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChromiumSection {
    pub executable_path: Option<String>,
    pub headless: bool,
    pub sandbox: bool,
    pub disable_gpu: bool,
    pub window_width: u32,
    pub window_height: u32,
    pub launch_timeout_seconds: u64,
    pub request_timeout_seconds: u64,
}

impl ChromiumSection {
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DisplaySection {
    pub enabled: bool,
    pub width: u32,
    pub height: u32,
    pub color_depth: u32,
    pub base_number: u32,
    pub probe_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolSection {
    pub max_size: usize,
    pub idle_timeout_seconds: u64,
    pub max_concurrent_publishes: usize,
    pub keep_alive_after_publish: bool,
}

impl PoolSection {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginSection {
    pub login_url: String,
    pub home_url_fragment: String,
    pub login_url_fragment: String,
    pub qr_ttl_seconds: u64,
    pub flow_timeout_seconds: u64,
    pub min_qr_pixels: u32,
    pub settle_ms: u64,
    pub settle_attempts: usize,
    pub strategy_attempts: usize,
    pub sms_anchor_texts: Vec<String>,
    pub qr_marker_texts: Vec<String>,
    pub refresh_control_text: String,
    pub container_min_px: f64,
    pub container_max_px: f64,
    pub corner_inset_px: f64,
    pub icon_min_px: f64,
    pub icon_max_px: f64,
    pub session_cookie_markers: Vec<String>,
}

impl LoginSection {
    pub fn qr_ttl(&self) -> Duration {
        Duration::from_secs(self.qr_ttl_seconds)
    }

    pub fn flow_timeout(&self) -> Duration {
        Duration::from_secs(self.flow_timeout_seconds)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishSection {
    pub base_url: String,
    pub publish_url: String,
    pub image_tab_text: String,
    pub tab_item_selector: String,
    pub tab_fallback_index: usize,
    pub file_input_wait_seconds: u64,
    pub video_complete_text: String,
    pub video_upload_timeout_seconds: u64,
    pub image_settle_seconds: u64,
    pub title_placeholder: String,
    pub description_selector: String,
    pub submit_text: String,
    pub flow_timeout_seconds: u64,
}

impl PublishSection {
    pub fn file_input_wait(&self) -> Duration {
        Duration::from_secs(self.file_input_wait_seconds)
    }

    pub fn video_upload_timeout(&self) -> Duration {
        Duration::from_secs(self.video_upload_timeout_seconds)
    }

    pub fn image_settle(&self) -> Duration {
        Duration::from_secs(self.image_settle_seconds)
    }

    pub fn flow_timeout(&self) -> Duration {
        Duration::from_secs(self.flow_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserAgentSection {
    pub pool: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilitySection {
    pub failure_log: String,
    pub runs_db: String,
}

pub fn load_worker_config<P: AsRef<Path>>(path: P) -> Result<WorkerConfig> {
    let path = path.as_ref();
    let config: WorkerConfig = load_toml(path)?;
    config.validate(path)?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/worker.toml");
        let config = load_worker_config(path).expect("fixture should parse");
        assert_eq!(config.pool.max_size, 3);
        assert_eq!(config.login.qr_ttl_seconds, 90);
        assert!(config.login.login_url.contains("xiaohongshu"));
        assert!(config.user_agents.pool.len() >= 2);
        assert_eq!(config.publish.tab_fallback_index, 1);
    }

    #[test]
    fn rejects_zero_pool() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/worker.toml");
        let mut config = load_worker_config(&path).expect("fixture should parse");
        config.pool.max_size = 0;
        let err = config.validate(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn resolves_relative_paths_against_data_dir() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/worker.toml");
        let config = load_worker_config(path).expect("fixture should parse");
        assert!(config.users_root().starts_with(&config.paths.data_dir));
        assert!(config.failure_log_path().starts_with(&config.paths.data_dir));
    }
}
