use std::fs::{create_dir_all, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;

use crate::session::error::{SessionError, SessionResult};
use crate::session::profile::sanitize_user_id;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SessionErrorCategory {
    BrowserLaunch,
    NetworkTimeout,
    QrCapture,
    ModeSwitch,
    LoginExpired,
    SessionExpired,
    UploadFailed,
    SubmitFailed,
    PoolSaturated,
    BotDetection,
    Profile,
    DisplayUnavailable,
    MediaFetch,
    Unexpected,
}

pub struct ErrorCategorizer;

impl ErrorCategorizer {
    pub fn categorize(error: &SessionError) -> SessionErrorCategory {
        match error {
            SessionError::BrowserInit(_) => SessionErrorCategory::BrowserLaunch,
            SessionError::Timeout(what) => {
                let what = what.to_lowercase();
                if what.contains("qr") || what.contains("login container") {
                    SessionErrorCategory::QrCapture
                } else if what.contains("mode") {
                    SessionErrorCategory::ModeSwitch
                } else if what.contains("upload") {
                    SessionErrorCategory::UploadFailed
                } else {
                    SessionErrorCategory::NetworkTimeout
                }
            }
            SessionError::LoginExpired => SessionErrorCategory::LoginExpired,
            SessionError::SessionExpired => SessionErrorCategory::SessionExpired,
            SessionError::PoolExhausted { .. } => SessionErrorCategory::PoolSaturated,
            SessionError::Detection(message) => {
                let message = message.to_lowercase();
                if message.contains("switch") || message.contains("tab") {
                    SessionErrorCategory::ModeSwitch
                } else {
                    SessionErrorCategory::QrCapture
                }
            }
            SessionError::UploadInputMissing | SessionError::Upload(_) => {
                SessionErrorCategory::UploadFailed
            }
            SessionError::SubmitMissing => SessionErrorCategory::SubmitFailed,
            SessionError::Display(_) => SessionErrorCategory::DisplayUnavailable,
            SessionError::Profile(_) => SessionErrorCategory::Profile,
            SessionError::MediaFetch { .. } => SessionErrorCategory::MediaFetch,
            SessionError::Cdp(err) => {
                let text = err.to_string().to_lowercase();
                if text.contains("timeout") {
                    SessionErrorCategory::NetworkTimeout
                } else if text.contains("captcha") {
                    SessionErrorCategory::BotDetection
                } else {
                    SessionErrorCategory::Unexpected
                }
            }
            SessionError::Unexpected(message) => {
                if message.to_lowercase().contains("captcha") {
                    SessionErrorCategory::BotDetection
                } else {
                    SessionErrorCategory::Unexpected
                }
            }
            SessionError::Io(_)
            | SessionError::Diagnostics(_)
            | SessionError::Configuration(_) => SessionErrorCategory::Unexpected,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub stage: String,
    pub category: SessionErrorCategory,
    pub error_message: String,
    pub attempt: usize,
    pub screenshot_path: Option<PathBuf>,
}

impl FailureRecord {
    pub fn from_error(
        user_id: &str,
        stage: &str,
        error: &SessionError,
        attempt: usize,
        screenshot_path: Option<PathBuf>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            user_id: user_id.to_string(),
            stage: stage.to_string(),
            category: ErrorCategorizer::categorize(error),
            error_message: error.to_string(),
            attempt,
            screenshot_path,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub operation: String,
    pub success: bool,
    pub duration_ms: i64,
    pub message: Option<String>,
    pub screenshot_path: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum DiagnosticsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<DiagnosticsError> for SessionError {
    fn from(error: DiagnosticsError) -> Self {
        SessionError::Diagnostics(error.to_string())
    }
}

/// Failure journal for the session engines. Appends JSONL for log shipping
/// and mirrors into sqlite for ad-hoc queries from the operator CLI.
#[derive(Debug)]
pub struct Diagnostics {
    log: Mutex<File>,
    db_path: PathBuf,
    flags: OpenFlags,
    screenshots_root: PathBuf,
}

impl Diagnostics {
    pub fn new(
        log_path: impl AsRef<Path>,
        db_path: impl AsRef<Path>,
        screenshots_root: impl AsRef<Path>,
    ) -> Result<Self, DiagnosticsError> {
        let log_path = log_path.as_ref().to_path_buf();
        if let Some(parent) = log_path.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            create_dir_all(parent)?;
        }
        let screenshots_root = screenshots_root.as_ref().to_path_buf();
        create_dir_all(&screenshots_root)?;
        let diagnostics = Self {
            log: Mutex::new(file),
            db_path,
            flags: OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
            screenshots_root,
        };
        diagnostics.initialize_db()?;
        Ok(diagnostics)
    }

    fn initialize_db(&self) -> Result<(), DiagnosticsError> {
        let conn = self.open_db()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS session_failures (
                ts DATETIME DEFAULT CURRENT_TIMESTAMP,
                user_id TEXT,
                stage TEXT,
                category TEXT,
                error_message TEXT,
                attempt INTEGER,
                screenshot_path TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_session_failures_ts ON session_failures(ts DESC);
            CREATE TABLE IF NOT EXISTS session_runs (
                ts DATETIME DEFAULT CURRENT_TIMESTAMP,
                user_id TEXT,
                operation TEXT,
                success INTEGER,
                duration_ms INTEGER,
                message TEXT,
                screenshot_path TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_session_runs_ts ON session_runs(ts DESC);",
        )?;
        Ok(())
    }

    fn open_db(&self) -> Result<Connection, DiagnosticsError> {
        Ok(Connection::open_with_flags(&self.db_path, self.flags)?)
    }

    pub fn record_failure(&self, failure: &FailureRecord) -> Result<(), DiagnosticsError> {
        let json = serde_json::to_string(failure)?;
        if let Ok(mut guard) = self.log.lock() {
            writeln!(guard, "{json}")?;
            guard.flush()?;
        }
        let conn = self.open_db()?;
        conn.execute(
            "INSERT INTO session_failures (user_id, stage, category, error_message, attempt, screenshot_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                failure.user_id,
                failure.stage,
                format!("{:?}", failure.category),
                failure.error_message,
                failure.attempt as i64,
                failure
                    .screenshot_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_default(),
            ],
        )?;
        Ok(())
    }

    pub fn record_run(&self, run: &RunRecord) -> Result<(), DiagnosticsError> {
        let conn = self.open_db()?;
        conn.execute(
            "INSERT INTO session_runs (
                user_id, operation, success, duration_ms, message, screenshot_path
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run.user_id,
                run.operation,
                if run.success { 1 } else { 0 },
                run.duration_ms,
                run.message.clone().unwrap_or_default(),
                run.screenshot_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_default(),
            ],
        )?;
        Ok(())
    }

    /// Write PNG bytes under the per-user screenshot directory and return
    /// the stored path. The user segment is sanitized the same way profile
    /// directories are.
    pub fn save_screenshot(
        &self,
        user_id: &str,
        label: &str,
        bytes: &[u8],
    ) -> SessionResult<PathBuf> {
        let dir = self.screenshots_root.join(sanitize_user_id(user_id));
        create_dir_all(&dir).map_err(|err| SessionError::profile_io(&dir, err))?;
        let stamp = Utc::now().format("%Y%m%d_%H%M%S%3f");
        let path = dir.join(format!("{label}_{stamp}.png"));
        std::fs::write(&path, bytes).map_err(|err| SessionError::profile_io(&path, err))?;
        Ok(path)
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }
}
