use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::handler::viewport::Viewport as ChromiumViewport;
use chromiumoxide::page::Page;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::session::cdp::CdpDriver;
use crate::session::diagnostics::{Diagnostics, FailureRecord, RunRecord};
use crate::session::display::VirtualDisplay;
use crate::session::driver::{CookieSet, PageDriver};
use crate::session::error::{SessionError, SessionResult};
use crate::session::login::{
    begin_qr_login, home_url, poll_login, LoginAttempt, LoginPoll, QrLoginStart,
};
use crate::session::media::{MediaFetcher, StagedMedia};
use crate::session::metrics::SessionMetrics;
use crate::session::profile::{CookieCache, UserProfile};
use crate::session::publish::{run_publish, PublishKind, PublishTask};

const FALLBACK_USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Per-request launch flags. They take effect at the next browser launch; a
/// live browser keeps the identity it started with until it is torn down.
#[derive(Debug, Clone, Default)]
pub struct SessionOverrides {
    pub proxy: Option<String>,
    pub user_agent: Option<String>,
}

impl SessionOverrides {
    pub fn is_empty(&self) -> bool {
        self.proxy.is_none() && self.user_agent.is_none()
    }
}

/// A publish submission before media staging. Sources may be http(s) URLs,
/// `file://` URLs or plain paths.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub kind: PublishKind,
    pub sources: Vec<String>,
    pub title: String,
    pub description: String,
}

/// Result of one publish run, with the persisted failure screenshot when the
/// flow died on-page.
#[derive(Debug)]
pub struct PublishReport {
    pub result: SessionResult<()>,
    pub screenshot: Option<PathBuf>,
    pub duration: Duration,
}

impl PublishReport {
    pub fn success(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug)]
struct Binding {
    user_id: String,
    profile: UserProfile,
    token: Uuid,
}

#[derive(Debug, Default)]
struct EngineState {
    browser: Option<Browser>,
    handler_task: Option<JoinHandle<()>>,
    display: Option<VirtualDisplay>,
    page: Option<Page>,
    user_agent: Option<String>,
    overrides: SessionOverrides,
    attempt: Option<LoginAttempt>,
}

/// One user's isolated browser session. The Chromium process is launched
/// lazily on the first page operation; acquire, rebind and release stay
/// process-free so the pool can shuffle engines around cheaply.
#[derive(Debug)]
pub struct SessionEngine {
    config: Arc<WorkerConfig>,
    diagnostics: Arc<Diagnostics>,
    metrics: Arc<StdMutex<SessionMetrics>>,
    binding: StdMutex<Binding>,
    state: AsyncMutex<EngineState>,
}

impl SessionEngine {
    pub fn new(
        user_id: &str,
        config: Arc<WorkerConfig>,
        diagnostics: Arc<Diagnostics>,
        metrics: Arc<StdMutex<SessionMetrics>>,
    ) -> SessionResult<Self> {
        let profile = UserProfile::new(config.users_root(), user_id);
        profile.ensure()?;
        Ok(Self {
            config,
            diagnostics,
            metrics,
            binding: StdMutex::new(Binding {
                user_id: user_id.to_string(),
                profile,
                token: Uuid::new_v4(),
            }),
            state: AsyncMutex::new(EngineState::default()),
        })
    }

    pub fn user_id(&self) -> String {
        self.binding.lock().unwrap().user_id.clone()
    }

    /// Opaque identity of this session instance. Stable across warm reuse,
    /// regenerated when the engine is rebound to another user.
    pub fn token(&self) -> Uuid {
        self.binding.lock().unwrap().token
    }

    fn profile(&self) -> UserProfile {
        self.binding.lock().unwrap().profile.clone()
    }

    fn with_metrics<F: FnOnce(&mut SessionMetrics)>(&self, f: F) {
        let mut guard = self.metrics.lock().unwrap();
        f(&mut guard);
    }

    fn journal_failure(&self, stage: &str, error: &SessionError, screenshot: Option<PathBuf>) {
        let user = self.profile().user_id().to_string();
        let record = FailureRecord::from_error(&user, stage, error, 1, screenshot);
        if let Err(err) = self.diagnostics.record_failure(&record) {
            warn!(error = %err, stage, "failed to journal failure");
        }
    }

    /// Point this engine at another user's profile. Any live browser belongs
    /// to the previous user and is shut down first.
    pub async fn rebind(&self, user_id: &str) -> SessionResult<()> {
        {
            let binding = self.binding.lock().unwrap();
            if binding.user_id == user_id {
                return Ok(());
            }
        }
        let mut state = self.state.lock().await;
        self.teardown(&mut state).await;
        state.overrides = SessionOverrides::default();
        let profile = UserProfile::new(self.config.users_root(), user_id);
        profile.ensure()?;
        let mut binding = self.binding.lock().unwrap();
        info!(from = %binding.user_id, to = %user_id, "rebinding session engine");
        binding.user_id = user_id.to_string();
        binding.profile = profile;
        binding.token = Uuid::new_v4();
        Ok(())
    }

    pub async fn touch_profile(&self) {
        let profile = self.profile();
        if let Err(err) = profile.touch().await {
            warn!(error = %err, "failed to touch profile marker");
        }
    }

    /// Bring a live page up under the requested network identity. A healthy
    /// browser is reused as-is; `reset_profile` shuts it down first and
    /// recreates the profile directory, keeping only the durable cookie
    /// cache.
    pub async fn start_session(
        &self,
        overrides: SessionOverrides,
        reset_profile: bool,
    ) -> SessionResult<()> {
        let mut state = self.state.lock().await;
        if reset_profile {
            self.teardown(&mut state).await;
            self.profile().reset(true)?;
        }
        state.overrides = overrides;
        self.ensure_page(&mut state).await?;
        Ok(())
    }

    /// Bring the page to the QR login screen and capture the code. When the
    /// stored profile still holds a valid session the page lands on the
    /// creator home instead and no scan is needed.
    pub async fn request_qr_login(&self) -> SessionResult<QrLoginStart> {
        let mut state = self.state.lock().await;
        self.with_metrics(|m| m.record_qr_request());
        let page = self.ensure_page(&mut state).await?;
        let mut driver = CdpDriver::new(page, self.config.publish.base_url.clone());
        match begin_qr_login(&mut driver, &self.config.login).await {
            Ok(start) => {
                match &start {
                    QrLoginStart::AlreadyAuthenticated => {
                        state.attempt = None;
                    }
                    QrLoginStart::WaitingScan {
                        degraded, attempt, ..
                    } => {
                        state.attempt = Some(attempt.clone());
                        self.with_metrics(|m| m.record_qr_capture(*degraded));
                    }
                }
                Ok(start)
            }
            Err(err) => {
                self.journal_failure("qr_login", &err, None);
                Err(err)
            }
        }
    }

    /// One poll of the pending QR scan. `None` means no login is pending on
    /// this engine. Terminal outcomes clear the attempt, so a finished or
    /// expired login reports once and later polls see `None`.
    pub async fn poll_login_status(&self) -> SessionResult<Option<LoginPoll>> {
        let mut state = self.state.lock().await;
        let attempt = match &state.attempt {
            Some(attempt) => attempt.clone(),
            None => return Ok(None),
        };
        // Expiry is decidable without the browser; skip the launch for it.
        if attempt.expired() {
            state.attempt = None;
            self.with_metrics(|m| m.record_login_expired());
            return Ok(Some(LoginPoll::Expired));
        }
        let page = self.ensure_page(&mut state).await?;
        let mut driver = CdpDriver::new(page, self.config.publish.base_url.clone());
        let poll = poll_login(&mut driver, &attempt, &self.config.login).await?;
        match poll {
            LoginPoll::LoggedIn => {
                state.attempt = None;
                self.with_metrics(|m| m.record_login_confirmed());
            }
            LoginPoll::Expired => {
                state.attempt = None;
                self.with_metrics(|m| m.record_login_expired());
            }
            LoginPoll::Waiting => {}
        }
        Ok(Some(poll))
    }

    /// Export the live browser cookies and refresh the on-disk cache from
    /// them. Returns what was exported.
    pub async fn sync_cookies(&self) -> SessionResult<CookieSet> {
        let mut state = self.state.lock().await;
        let page = self.ensure_page(&mut state).await?;
        let mut driver = CdpDriver::new(page, self.config.publish.base_url.clone());
        let cookies = driver.export_cookies().await?;
        let user_agent = state.user_agent.clone();
        drop(state);
        let cache = CookieCache::new(cookies.clone(), user_agent);
        self.profile().save_cookie_cache(&cache)?;
        Ok(cookies)
    }

    /// Persist a cookie bundle captured out of band, replay it in the browser
    /// and check the platform accepts it. A rejected bundle clears the cache
    /// again so later publishes fail fast instead of replaying dead cookies.
    pub async fn verify_cookies(
        &self,
        cookies: CookieSet,
        user_agent: Option<String>,
    ) -> SessionResult<bool> {
        if cookies.is_empty() {
            return Err(SessionError::SessionExpired);
        }
        let started = std::time::Instant::now();
        let user = self.profile().user_id().to_string();
        self.profile()
            .save_cookie_cache(&CookieCache::new(cookies.clone(), user_agent.clone()))?;

        let mut state = self.state.lock().await;
        if user_agent.is_some() {
            state.overrides.user_agent = user_agent;
        }
        let outcome = self.verify_inner(&mut state, &cookies).await;
        drop(state);

        let verified = match outcome {
            Ok(verified) => verified,
            Err(err) => {
                self.journal_failure("cookie_verify", &err, None);
                return Err(err);
            }
        };
        if !verified {
            self.profile().clear_cookie_cache()?;
        }
        let run = RunRecord {
            timestamp: Utc::now(),
            user_id: user,
            operation: "cookie_verify".to_string(),
            success: verified,
            duration_ms: started.elapsed().as_millis() as i64,
            message: (!verified).then(|| "platform rejected the cookie bundle".to_string()),
            screenshot_path: None,
        };
        if let Err(err) = self.diagnostics.record_run(&run) {
            warn!(error = %err, "failed to record verify run");
        }
        Ok(verified)
    }

    async fn verify_inner(
        &self,
        state: &mut EngineState,
        cookies: &CookieSet,
    ) -> SessionResult<bool> {
        let page = self.ensure_page(state).await?;
        let mut driver = CdpDriver::new(page, self.config.publish.base_url.clone());
        // Origin first so the injected cookies stick.
        driver.navigate(&self.config.publish.base_url).await?;
        if driver.inject_cookies(cookies).await? == 0 {
            return Ok(false);
        }
        driver.navigate(&home_url(&self.config.login)?).await?;
        let landed = driver.current_url().await?;
        Ok(landed.contains(&self.config.login.home_url_fragment))
    }

    /// Run the full publish pipeline and journal the outcome. The cookie
    /// cache is checked before anything is staged or launched, so an engine
    /// that never logged in fails fast without a browser.
    pub async fn publish(&self, request: &PublishRequest) -> PublishReport {
        let started = std::time::Instant::now();
        let user = self.profile().user_id().to_string();
        let (result, error_screenshot) = self.publish_inner(request).await;

        let screenshot = error_screenshot.and_then(|bytes| {
            match self
                .diagnostics
                .save_screenshot(&user, "publish_failure", &bytes)
            {
                Ok(path) => Some(path),
                Err(err) => {
                    warn!(error = %err, "could not persist failure screenshot");
                    None
                }
            }
        });
        let success = result.is_ok();
        if let Err(err) = &result {
            let record = FailureRecord::from_error(&user, "publish", err, 1, screenshot.clone());
            if let Err(diag_err) = self.diagnostics.record_failure(&record) {
                warn!(error = %diag_err, "failed to journal publish failure");
            }
        }
        let run = RunRecord {
            timestamp: Utc::now(),
            user_id: user,
            operation: "publish".to_string(),
            success,
            duration_ms: started.elapsed().as_millis() as i64,
            message: result.as_ref().err().map(|err| err.caller_message()),
            screenshot_path: screenshot.clone(),
        };
        if let Err(err) = self.diagnostics.record_run(&run) {
            warn!(error = %err, "failed to record publish run");
        }
        self.with_metrics(|m| m.record_publish(success));
        PublishReport {
            result,
            screenshot,
            duration: started.elapsed(),
        }
    }

    /// Journal a publish run that was abandoned by its caller before the
    /// pipeline could report. Counts as a failed publish.
    pub fn journal_aborted_publish(&self, err: &SessionError, elapsed: Duration) {
        let user = self.profile().user_id().to_string();
        let record = FailureRecord::from_error(&user, "publish", err, 1, None);
        if let Err(diag_err) = self.diagnostics.record_failure(&record) {
            warn!(error = %diag_err, "failed to journal publish failure");
        }
        let run = RunRecord {
            timestamp: Utc::now(),
            user_id: user,
            operation: "publish".to_string(),
            success: false,
            duration_ms: elapsed.as_millis() as i64,
            message: Some(err.caller_message()),
            screenshot_path: None,
        };
        if let Err(diag_err) = self.diagnostics.record_run(&run) {
            warn!(error = %diag_err, "failed to record publish run");
        }
        self.with_metrics(|m| m.record_publish(false));
    }

    async fn publish_inner(
        &self,
        request: &PublishRequest,
    ) -> (SessionResult<()>, Option<Vec<u8>>) {
        let cookies: CookieSet = self
            .profile()
            .load_cookie_cache()
            .map(|cache| cache.cookies)
            .unwrap_or_default();
        if cookies.is_empty() {
            return (Err(SessionError::SessionExpired), None);
        }

        let mut state = self.state.lock().await;
        let page = match self.ensure_page(&mut state).await {
            Ok(page) => page,
            Err(err) => return (Err(err), None),
        };

        let fetcher = MediaFetcher::new(self.config.media_root());
        let mut staged = StagedMedia::new();
        for source in &request.sources {
            match fetcher.stage(source).await {
                Ok(path) => staged.push(path),
                Err(err) => return (Err(err), None),
            }
        }

        let task = PublishTask {
            kind: request.kind,
            files: staged.paths().to_vec(),
            title: request.title.clone(),
            description: request.description.clone(),
        };
        let mut driver = CdpDriver::new(page, self.config.publish.base_url.clone());
        let outcome = run_publish(
            &mut driver,
            &self.config.publish,
            &self.config.login.login_url_fragment,
            &cookies,
            &task,
        )
        .await;
        staged.disarm();
        (outcome.result, outcome.error_screenshot)
    }

    /// Whether a Chromium process is currently attached and answering.
    pub async fn has_live_browser(&self) -> bool {
        let state = self.state.lock().await;
        match &state.page {
            Some(page) => page.url().await.is_ok(),
            None => false,
        }
    }

    /// Shut down the browser and any virtual display. Safe to call twice.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if state.browser.is_some() {
            info!(user = %self.user_id(), "closing session engine");
        }
        self.teardown(&mut state).await;
    }

    /// Close the browser and delete the whole profile directory, cookie
    /// cache included.
    pub async fn wipe(&self) -> SessionResult<()> {
        self.close().await;
        self.profile().wipe()
    }

    async fn teardown(&self, state: &mut EngineState) {
        state.attempt = None;
        state.page = None;
        state.user_agent = None;
        if let Some(mut browser) = state.browser.take() {
            if let Err(err) = browser.close().await {
                warn!(error = %err, "failed to close browser gracefully");
            }
        }
        if let Some(handle) = state.handler_task.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "browser handler join error");
            }
        }
        if let Some(mut display) = state.display.take() {
            display.stop().await;
        }
    }

    async fn ensure_page(&self, state: &mut EngineState) -> SessionResult<Page> {
        if let Some(page) = &state.page {
            match page.url().await {
                Ok(_) => return Ok(page.clone()),
                Err(err) => {
                    warn!(error = %err, "existing page unresponsive, relaunching browser");
                    self.teardown(state).await;
                }
            }
        }
        if state.browser.is_none() {
            self.launch_browser(state).await?;
        }
        match &state.page {
            Some(page) => Ok(page.clone()),
            None => Err(SessionError::BrowserInit(
                "no page after browser launch".to_string(),
            )),
        }
    }

    /// Launch in the configured mode first, then the opposite one. Headless
    /// hosts fall forward to a windowed run under Xvfb when the QR page
    /// refuses headless mode, and vice versa.
    async fn launch_browser(&self, state: &mut EngineState) -> SessionResult<()> {
        let primary = self.config.chromium.headless;
        match self.launch_once(state, primary).await {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(
                    error = %first,
                    headless = primary,
                    "browser launch failed, retrying in the opposite mode"
                );
                self.with_metrics(|m| m.record_launch_fallback());
                match self.launch_once(state, !primary).await {
                    Ok(()) => Ok(()),
                    Err(second) => Err(SessionError::BrowserInit(format!(
                        "both launch modes failed: {first}; then: {second}"
                    ))),
                }
            }
        }
    }

    async fn launch_once(&self, state: &mut EngineState, headless: bool) -> SessionResult<()> {
        let (profile_dir, user_id, cached_agent) = {
            let binding = self.binding.lock().unwrap();
            binding.profile.ensure()?;
            (
                binding.profile.dir().to_path_buf(),
                binding.profile.user_id().to_string(),
                binding
                    .profile
                    .load_cookie_cache()
                    .and_then(|cache| cache.user_agent),
            )
        };

        if !headless && state.display.is_none() && VirtualDisplay::should_use(&self.config.display)
        {
            match VirtualDisplay::launch(&self.config.display).await {
                Ok(display) => state.display = Some(display),
                Err(err) => {
                    warn!(error = %err, "virtual display unavailable, launching without it")
                }
            }
        }

        let user_agent = resolve_user_agent(
            &self.config,
            &user_id,
            state.overrides.user_agent.as_deref(),
            cached_agent.as_deref(),
        );
        let chromium_config = self.build_chromium_config(
            &profile_dir,
            &user_agent,
            state.overrides.proxy.as_deref(),
            headless,
            state.display.as_ref(),
        )?;
        info!(
            user = %user_id,
            headless,
            ua = %user_agent,
            proxied = state.overrides.proxy.is_some(),
            "launching chromium"
        );

        let (browser, mut handler) = tokio::time::timeout(
            self.config.chromium.launch_timeout(),
            Browser::launch(chromium_config),
        )
        .await
        .map_err(|_| SessionError::BrowserInit("chromium launch timed out".to_string()))?
        .map_err(|err| SessionError::BrowserInit(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "chromium handler reported error");
                }
            }
        });

        match self.prepare_page(&browser, &user_agent).await {
            Ok(page) => {
                state.browser = Some(browser);
                state.handler_task = Some(handler_task);
                state.page = Some(page);
                state.user_agent = Some(user_agent);
                Ok(())
            }
            Err(err) => {
                let mut browser = browser;
                if let Err(close_err) = browser.close().await {
                    warn!(error = %close_err, "failed to close browser after setup error");
                }
                drop(browser);
                if let Err(join_err) = handler_task.await {
                    warn!(error = %join_err, "browser handler join error");
                }
                if let Some(mut display) = state.display.take() {
                    display.stop().await;
                }
                Err(err)
            }
        }
    }

    async fn prepare_page(&self, browser: &Browser, user_agent: &str) -> SessionResult<Page> {
        let page = browser
            .new_page(CreateTargetParams::new("about:blank"))
            .await?;
        page.enable_stealth_mode_with_agent(user_agent).await?;
        let params = SetUserAgentOverrideParams::builder()
            .user_agent(user_agent.to_string())
            .build()
            .map_err(SessionError::Configuration)?;
        page.set_user_agent(params).await?;
        Ok(page)
    }

    fn build_chromium_config(
        &self,
        profile_dir: &Path,
        user_agent: &str,
        proxy: Option<&str>,
        headless: bool,
        display: Option<&VirtualDisplay>,
    ) -> SessionResult<ChromiumConfig> {
        let chromium = &self.config.chromium;
        let mut builder = ChromiumConfig::builder()
            .user_data_dir(profile_dir)
            .viewport(ChromiumViewport {
                width: chromium.window_width,
                height: chromium.window_height,
                device_scale_factor: None,
                emulating_mobile: false,
                is_landscape: chromium.window_width >= chromium.window_height,
                has_touch: false,
            });

        if let Some(path) = &chromium.executable_path {
            builder = builder.chrome_executable(path);
        }
        if !headless {
            builder = builder.with_head();
        }
        if !chromium.sandbox {
            builder = builder.no_sandbox();
        }
        builder = builder.request_timeout(chromium.request_timeout());

        let mut args = vec![
            format!("--user-agent={user_agent}"),
            format!(
                "--window-size={},{}",
                chromium.window_width, chromium.window_height
            ),
        ];
        if let Some(proxy) = proxy {
            args.push(format!("--proxy-server={proxy}"));
        }
        if chromium.disable_gpu {
            args.push("--disable-gpu".into());
        }
        if let Some(display) = display {
            args.push(display.chromium_arg());
        }
        args.push("--no-first-run".into());
        args.push("--disable-features=AutomationControlled".into());
        args.push("--disable-background-timer-throttling".into());
        args.push("--password-store=basic".into());
        builder = builder.args(args);

        builder.build().map_err(SessionError::Configuration)
    }
}

impl Drop for SessionEngine {
    fn drop(&mut self) {
        if let Ok(state) = self.state.try_lock() {
            if let Some(handle) = &state.handler_task {
                if !handle.is_finished() {
                    warn!("session engine dropped without explicit close");
                }
            }
        }
    }
}

/// Launch agent priority: explicit override, then the agent the cached
/// cookies were captured with, then a stable pick from the configured pool.
fn resolve_user_agent(
    config: &WorkerConfig,
    user_id: &str,
    requested: Option<&str>,
    cached: Option<&str>,
) -> String {
    requested
        .or(cached)
        .map(str::to_string)
        .unwrap_or_else(|| select_user_agent(config, user_id))
}

/// Same user, same fingerprint: the agent is picked by hashing the user id
/// into the configured pool so relaunches do not shuffle it.
fn select_user_agent(config: &WorkerConfig, user_id: &str) -> String {
    let pool = &config.user_agents.pool;
    if pool.is_empty() {
        return FALLBACK_USER_AGENT.to_string();
    }
    let mut hasher = DefaultHasher::new();
    user_id.hash(&mut hasher);
    pool[(hasher.finish() % pool.len() as u64) as usize].clone()
}
