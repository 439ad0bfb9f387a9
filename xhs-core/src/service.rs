use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::WorkerConfig;
use crate::session::{
    CookieSet, Diagnostics, LoginPoll, PoolSnapshot, ProfileStore, PublishRequest, QrLoginStart,
    QrSource, SessionError, SessionMetrics, SessionOverrides, SessionPool, SessionResult,
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const PROFILE_RETENTION: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// Outcome of a QR login request.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QrLoginResponse {
    /// The stored profile already carries a valid session.
    AlreadyLoggedIn,
    QrReady {
        image_base64: String,
        source: String,
        degraded: bool,
        expires_in_seconds: u64,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoginStatusResponse {
    LoggedIn { cookies: CookieSet },
    Waiting,
    Expired,
    NotFound,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishResponse {
    pub success: bool,
    pub message: String,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SyncResponse {
    pub active: bool,
    pub synced: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyResponse {
    pub verified: bool,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CloseResponse {
    pub closed: bool,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct WipeResponse {
    pub wiped: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub pool: PoolSnapshot,
    pub publish_slots_free: usize,
    pub metrics: SessionMetrics,
}

/// Front door for everything a caller does with sessions. Owns the pool, the
/// publish admission gate and the shared diagnostics sinks.
pub struct SessionService {
    config: Arc<WorkerConfig>,
    pool: Arc<SessionPool>,
    profiles: ProfileStore,
    admission: Arc<Semaphore>,
    metrics: Arc<StdMutex<SessionMetrics>>,
}

impl SessionService {
    pub fn new(config: WorkerConfig) -> SessionResult<Self> {
        let config = Arc::new(config);
        let diagnostics = Arc::new(Diagnostics::new(
            config.failure_log_path(),
            config.runs_db_path(),
            config.screenshots_root(),
        )?);
        let metrics = Arc::new(StdMutex::new(SessionMetrics::default()));
        let pool = Arc::new(SessionPool::new(
            Arc::clone(&config),
            Arc::clone(&diagnostics),
            Arc::clone(&metrics),
        ));
        let profiles = ProfileStore::new(config.users_root())?;
        let admission = Arc::new(Semaphore::new(config.pool.max_concurrent_publishes));
        Ok(Self {
            config,
            pool,
            profiles,
            admission,
            metrics,
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Check out the user's session and bring up a login QR. The session
    /// stays checked out while a scan is pending; it is parked warm when the
    /// profile turns out to be logged in already.
    pub async fn request_qr_login(
        &self,
        user_id: &str,
        overrides: SessionOverrides,
        reset_profile: bool,
    ) -> SessionResult<QrLoginResponse> {
        let engine = self.pool.acquire(user_id).await?;
        let flow = self.config.login.flow_timeout();
        let login = async {
            engine.start_session(overrides, reset_profile).await?;
            engine.request_qr_login().await
        };
        match tokio::time::timeout(flow, login).await {
            Err(_) => {
                self.pool.release(user_id, false).await;
                Err(SessionError::Timeout("qr login flow".to_string()))
            }
            Ok(Err(err)) => {
                self.pool.release(user_id, false).await;
                Err(err)
            }
            Ok(Ok(QrLoginStart::AlreadyAuthenticated)) => {
                self.pool.release(user_id, true).await;
                Ok(QrLoginResponse::AlreadyLoggedIn)
            }
            Ok(Ok(QrLoginStart::WaitingScan {
                qr_png,
                source,
                degraded,
                attempt,
            })) => Ok(QrLoginResponse::QrReady {
                image_base64: BASE64.encode(qr_png),
                source: source_label(source).to_string(),
                degraded,
                expires_in_seconds: attempt.remaining().as_secs(),
            }),
        }
    }

    /// One status poll of a pending QR login. Terminal outcomes release the
    /// session: confirmed logins park it warm with a fresh cookie cache,
    /// expiry shuts it down.
    pub async fn poll_login_status(&self, user_id: &str) -> SessionResult<LoginStatusResponse> {
        let Some(engine) = self.pool.find(user_id) else {
            return Ok(LoginStatusResponse::NotFound);
        };
        let poll = match engine.poll_login_status().await {
            Ok(poll) => poll,
            Err(err) => {
                self.pool.release(user_id, false).await;
                return Err(err);
            }
        };
        match poll {
            None => Ok(LoginStatusResponse::NotFound),
            Some(LoginPoll::Waiting) => Ok(LoginStatusResponse::Waiting),
            Some(LoginPoll::Expired) => {
                self.pool.release(user_id, false).await;
                Ok(LoginStatusResponse::Expired)
            }
            Some(LoginPoll::LoggedIn) => match engine.sync_cookies().await {
                Ok(cookies) => {
                    self.pool.release(user_id, true).await;
                    Ok(LoginStatusResponse::LoggedIn { cookies })
                }
                Err(err) => {
                    self.pool.release(user_id, false).await;
                    Err(err)
                }
            },
        }
    }

    /// Run one publish through the admission gate. Waits for a free slot,
    /// then drives the pipeline under the configured flow timeout. Pipeline
    /// failures come back as a structured response, not an error. Hitting the
    /// hard cap abandons the flow, journals it as a failed run and closes the
    /// session.
    pub async fn publish(
        &self,
        user_id: &str,
        request: PublishRequest,
    ) -> SessionResult<PublishResponse> {
        let _permit = self
            .admission
            .acquire()
            .await
            .map_err(|_| SessionError::Unexpected("admission gate closed".to_string()))?;
        let engine = self.pool.acquire(user_id).await?;
        let flow = self.config.publish.flow_timeout();
        let started = std::time::Instant::now();
        let report = match tokio::time::timeout(flow, engine.publish(&request)).await {
            Ok(report) => report,
            Err(_) => {
                let err = SessionError::Timeout("publish flow".to_string());
                engine.journal_aborted_publish(&err, started.elapsed());
                self.pool.release(user_id, false).await;
                return Err(err);
            }
        };
        let keep = self.config.pool.keep_alive_after_publish && report.success();
        self.pool.release(user_id, keep).await;
        Ok(PublishResponse {
            success: report.success(),
            message: match &report.result {
                Ok(()) => "published".to_string(),
                Err(err) => err.caller_message(),
            },
            duration_ms: report.duration.as_millis() as u64,
            screenshot: report.screenshot,
        })
    }

    /// Replay a cookie bundle captured out of band (a desktop login, an
    /// extension export) and cache it for this user when the platform accepts
    /// it. The session is parked warm on acceptance and closed on rejection.
    pub async fn verify_cookies(
        &self,
        user_id: &str,
        cookies: CookieSet,
        user_agent: Option<String>,
    ) -> SessionResult<VerifyResponse> {
        let engine = self.pool.acquire(user_id).await?;
        let flow = self.config.login.flow_timeout();
        let verified =
            match tokio::time::timeout(flow, engine.verify_cookies(cookies, user_agent)).await {
                Err(_) => {
                    self.pool.release(user_id, false).await;
                    return Err(SessionError::Timeout("cookie verification".to_string()));
                }
                Ok(Err(err)) => {
                    self.pool.release(user_id, false).await;
                    return Err(err);
                }
                Ok(Ok(verified)) => verified,
            };
        self.pool.release(user_id, verified).await;
        Ok(VerifyResponse {
            verified,
            message: if verified {
                "cookies accepted".to_string()
            } else {
                "platform rejected the cookie bundle".to_string()
            },
        })
    }

    /// Refresh the on-disk cookie cache from the user's live browser, if one
    /// is up.
    pub async fn sync_cookies(&self, user_id: &str) -> SessionResult<SyncResponse> {
        let Some(engine) = self.pool.find(user_id) else {
            return Ok(SyncResponse {
                active: false,
                synced: 0,
            });
        };
        if !engine.has_live_browser().await {
            return Ok(SyncResponse {
                active: false,
                synced: 0,
            });
        }
        let cookies = engine.sync_cookies().await?;
        Ok(SyncResponse {
            active: true,
            synced: cookies.len(),
        })
    }

    /// Shut down the user's session if one exists. Safe to repeat.
    pub async fn close_session(&self, user_id: &str) -> CloseResponse {
        match self.pool.take(user_id) {
            Some(engine) => {
                engine.close().await;
                CloseResponse { closed: true }
            }
            None => CloseResponse { closed: false },
        }
    }

    /// Close the session and delete every trace of the user on disk. Safe to
    /// repeat; wiping an unknown user succeeds.
    pub async fn wipe_user_data(&self, user_id: &str) -> SessionResult<WipeResponse> {
        if let Some(engine) = self.pool.take(user_id) {
            engine.wipe().await?;
        } else {
            self.profiles.profile(user_id).wipe()?;
        }
        Ok(WipeResponse { wiped: true })
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            pool: self.pool.snapshot(),
            publish_slots_free: self.admission.available_permits(),
            metrics: self.metrics.lock().unwrap().clone(),
        }
    }

    /// Periodic maintenance: evict idle engines and sweep stale profile
    /// directories.
    pub fn spawn_idle_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let evicted = service.pool.evict_idle().await;
                if evicted > 0 {
                    info!(evicted, "idle sweep closed sessions");
                }
                if let Err(err) = service.profiles.cleanup_expired(PROFILE_RETENTION) {
                    warn!(error = %err, "profile cleanup failed");
                }
            }
        })
    }

    pub async fn shutdown(&self) {
        self.admission.close();
        self.pool.close_all().await;
    }
}

fn source_label(source: QrSource) -> &'static str {
    match source {
        QrSource::Canvas => "canvas",
        QrSource::EmbeddedImage => "embedded_image",
        QrSource::Container => "container",
        QrSource::Viewport => "viewport",
    }
}
