use std::path::Path;

use thiserror::Error;

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("browser could not be started: {0}")]
    BrowserInit(String),
    #[error("cdp error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timeout waiting for {0}")]
    Timeout(String),
    #[error("login attempt expired")]
    LoginExpired,
    #[error("Cookie expired or not logged in")]
    SessionExpired,
    #[error("browser pool exhausted ({in_use} of {capacity} sessions in use)")]
    PoolExhausted { in_use: usize, capacity: usize },
    #[error("detection failed: {0}")]
    Detection(String),
    #[error("Upload input not found")]
    UploadInputMissing,
    #[error("upload failed: {0}")]
    Upload(String),
    #[error("Publish button not found")]
    SubmitMissing,
    #[error("virtual display error: {0}")]
    Display(String),
    #[error("diagnostics error: {0}")]
    Diagnostics(String),
    #[error("profile error: {0}")]
    Profile(String),
    #[error("media fetch failed for {url}: {message}")]
    MediaFetch { url: String, message: String },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl SessionError {
    /// Message shown to callers in structured results. Terminal publish
    /// failures keep the exact wording clients already match on.
    pub fn caller_message(&self) -> String {
        match self {
            SessionError::SessionExpired => "Cookie expired or not logged in".to_string(),
            SessionError::UploadInputMissing => "Upload input not found".to_string(),
            SessionError::SubmitMissing => "Publish button not found".to_string(),
            SessionError::LoginExpired => "Login attempt expired".to_string(),
            other => other.to_string(),
        }
    }

    pub fn profile_io(path: &Path, err: std::io::Error) -> Self {
        SessionError::Profile(format!("{}: {}", path.display(), err))
    }
}

impl From<tokio::task::JoinError> for SessionError {
    fn from(err: tokio::task::JoinError) -> Self {
        SessionError::Unexpected(err.to_string())
    }
}
