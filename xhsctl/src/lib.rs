use std::fmt;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;
use xhs_core::{
    load_worker_config, CookieSet, LoginStatusResponse, PublishKind, PublishRequest,
    QrLoginResponse, SessionOverrides, SessionService, WorkerConfig,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] xhs_core::ConfigError),
    #[error("session error: {0}")]
    Session(#[from] xhs_core::SessionError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("qr image decode failed: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("authentication failed")]
    Authentication,
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Creator session worker control interface", long_about = None)]
pub struct Cli {
    /// Path to the main worker.toml
    #[arg(long, default_value = "configs/worker.toml")]
    pub config: PathBuf,
    /// Override for paths.data_dir
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Token for local authentication (when XHSCTL_TOKEN is set)
    #[arg(long)]
    pub token: Option<String>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a QR login and wait for the scan
    Login(LoginArgs),
    /// Verify an exported cookie file and cache it for publishing
    Sync(SyncArgs),
    /// Publish media through a stored login
    Publish(PublishArgs),
    /// Delete every trace of a user on disk
    Wipe(UserArgs),
    /// Run deployment integrity checks
    Health,
    /// List recorded session runs
    Runs(RunsArgs),
    /// List recorded session failures
    Failures(FailuresArgs),
    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct LoginArgs {
    /// Creator account identifier
    pub user: String,
    /// Where to write the login QR image
    #[arg(long, default_value = "qr.png")]
    pub qr_out: PathBuf,
    /// POST the captured cookies to this endpoint after login
    #[arg(long)]
    pub sync_url: Option<String>,
    /// Bearer token for the sync endpoint
    #[arg(long)]
    pub sync_token: Option<String>,
    /// Seconds between login status polls
    #[arg(long, default_value_t = 2)]
    pub poll_seconds: u64,
    /// Route the browser through this proxy (e.g. http://host:port)
    #[arg(long)]
    pub proxy: Option<String>,
    /// Pin the browser user agent instead of the per-user default
    #[arg(long)]
    pub user_agent: Option<String>,
    /// Recreate the browser profile first, keeping only cached cookies
    #[arg(long)]
    pub fresh_profile: bool,
}

#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Creator account identifier
    pub user: String,
    /// JSON file holding the exported cookie array
    pub cookies: PathBuf,
    /// User agent the cookies were captured under
    #[arg(long)]
    pub user_agent: Option<String>,
}

#[derive(Args, Debug)]
pub struct PublishArgs {
    /// Creator account identifier
    pub user: String,
    /// Media files or URLs to attach
    #[arg(required = true)]
    pub files: Vec<String>,
    /// Post type
    #[arg(long, value_enum, default_value_t = MediaKind::Images)]
    pub kind: MediaKind,
    /// Note title
    #[arg(long)]
    pub title: String,
    /// Note body text
    #[arg(long, default_value = "")]
    pub description: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum MediaKind {
    Images,
    Video,
}

impl MediaKind {
    fn to_publish_kind(self) -> PublishKind {
        match self {
            MediaKind::Images => PublishKind::Images,
            MediaKind::Video => PublishKind::Video,
        }
    }
}

#[derive(Args, Debug)]
pub struct UserArgs {
    /// Creator account identifier
    pub user: String,
}

#[derive(Args, Debug)]
pub struct RunsArgs {
    /// Filter by user
    #[arg(long)]
    pub user: Option<String>,
    /// Limit of returned records
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct FailuresArgs {
    /// Filter by user
    #[arg(long)]
    pub user: Option<String>,
    /// Limit of returned records
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: clap_complete::Shell,
}

pub fn run(cli: Cli) -> Result<()> {
    init_tracing();
    enforce_token(&cli)?;

    if let Commands::Completions(args) = &cli.command {
        let mut command = Cli::command();
        clap_complete::generate(args.shell, &mut command, "xhsctl", &mut std::io::stdout());
        return Ok(());
    }

    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Login(args) => {
            let report = block_on(context.login(args))?;
            render(&report, cli.format)?;
        }
        Commands::Sync(args) => {
            let report = block_on(context.sync(args))?;
            render(&report, cli.format)?;
        }
        Commands::Publish(args) => {
            let report = block_on(context.publish(args))?;
            render(&report, cli.format)?;
        }
        Commands::Wipe(args) => {
            let report = block_on(context.wipe(&args.user))?;
            render(&report, cli.format)?;
        }
        Commands::Health => {
            let report = context.health_check();
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::MissingResource(
                    "one or more health checks failed".to_string(),
                ));
            }
        }
        Commands::Runs(args) => {
            let list = context.runs_list(args)?;
            render(&list, cli.format)?;
        }
        Commands::Failures(args) => {
            let list = context.failures_list(args)?;
            render(&list, cli.format)?;
        }
        Commands::Completions(_) => {}
    }

    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}

fn enforce_token(cli: &Cli) -> Result<()> {
    if let Ok(expected) = std::env::var("XHSCTL_TOKEN") {
        match &cli.token {
            Some(provided) if provided == &expected => Ok(()),
            _ => Err(AppError::Authentication),
        }
    } else {
        Ok(())
    }
}

fn block_on<T>(future: impl Future<Output = Result<T>>) -> Result<T> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(future)
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config_path: PathBuf,
    config: WorkerConfig,
    runs_db: PathBuf,
    failure_log: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone();
        let mut config = load_worker_config(&config_path)?;
        if let Some(dir) = &cli.data_dir {
            config.paths.data_dir = dir.to_string_lossy().into_owned();
        }
        let runs_db = config.runs_db_path();
        let failure_log = config.failure_log_path();
        Ok(Self {
            config_path,
            config,
            runs_db,
            failure_log,
        })
    }

    fn service(&self) -> Result<SessionService> {
        Ok(SessionService::new(self.config.clone())?)
    }

    async fn login(&self, args: &LoginArgs) -> Result<LoginReport> {
        let service = self.service()?;
        let outcome = self.login_flow(&service, args).await;
        service.shutdown().await;
        outcome
    }

    async fn login_flow(&self, service: &SessionService, args: &LoginArgs) -> Result<LoginReport> {
        let started = Instant::now();
        let overrides = SessionOverrides {
            proxy: args.proxy.clone(),
            user_agent: args.user_agent.clone(),
        };
        match service
            .request_qr_login(&args.user, overrides, args.fresh_profile)
            .await?
        {
            QrLoginResponse::AlreadyLoggedIn => {
                let sync = service.sync_cookies(&args.user).await?;
                Ok(LoginReport {
                    user_id: args.user.clone(),
                    status: "already_logged_in".to_string(),
                    finished_at: Utc::now(),
                    waited_seconds: 0,
                    qr_path: None,
                    cookies_synced: Some(sync.synced),
                    delivered: None,
                })
            }
            QrLoginResponse::QrReady {
                image_base64,
                source,
                degraded,
                expires_in_seconds,
            } => {
                let png = BASE64.decode(image_base64.as_bytes())?;
                fs::write(&args.qr_out, &png)?;
                eprintln!(
                    "QR code written to {} (source: {source}), scan it within {expires_in_seconds}s",
                    args.qr_out.display()
                );
                if degraded {
                    eprintln!("warning: QR element was not isolated, the image is a page screenshot");
                }
                self.wait_for_scan(service, args, started).await
            }
        }
    }

    async fn wait_for_scan(
        &self,
        service: &SessionService,
        args: &LoginArgs,
        started: Instant,
    ) -> Result<LoginReport> {
        let poll = Duration::from_secs(args.poll_seconds.max(1));
        let report = |status: &str, cookies_synced, delivered| LoginReport {
            user_id: args.user.clone(),
            status: status.to_string(),
            finished_at: Utc::now(),
            waited_seconds: started.elapsed().as_secs(),
            qr_path: Some(args.qr_out.clone()),
            cookies_synced,
            delivered,
        };
        loop {
            tokio::time::sleep(poll).await;
            match service.poll_login_status(&args.user).await? {
                LoginStatusResponse::Waiting => continue,
                LoginStatusResponse::LoggedIn { cookies } => {
                    let delivered = match &args.sync_url {
                        Some(url) => Some(
                            deliver_cookies(url, args.sync_token.as_deref(), &args.user, &cookies)
                                .await,
                        ),
                        None => None,
                    };
                    return Ok(report("logged_in", Some(cookies.len()), delivered));
                }
                LoginStatusResponse::Expired => return Ok(report("expired", None, None)),
                LoginStatusResponse::NotFound => return Ok(report("not_found", None, None)),
            }
        }
    }

    async fn sync(&self, args: &SyncArgs) -> Result<SyncReport> {
        let cookies = load_cookie_file(&args.cookies)?;
        let service = self.service()?;
        let outcome = service
            .verify_cookies(&args.user, cookies, args.user_agent.clone())
            .await;
        service.shutdown().await;
        let response = outcome?;
        Ok(SyncReport {
            user_id: args.user.clone(),
            verified: response.verified,
            message: response.message,
        })
    }

    async fn publish(&self, args: &PublishArgs) -> Result<PublishReport> {
        let service = self.service()?;
        let request = PublishRequest {
            kind: args.kind.to_publish_kind(),
            sources: args.files.clone(),
            title: args.title.clone(),
            description: args.description.clone(),
        };
        let outcome = service.publish(&args.user, request).await;
        service.shutdown().await;
        let response = outcome?;
        Ok(PublishReport {
            user_id: args.user.clone(),
            success: response.success,
            message: response.message,
            duration_ms: response.duration_ms,
            screenshot: response.screenshot,
        })
    }

    async fn wipe(&self, user: &str) -> Result<WipeReport> {
        let service = self.service()?;
        let outcome = service.wipe_user_data(user).await;
        service.shutdown().await;
        let response = outcome?;
        Ok(WipeReport {
            user_id: user.to_string(),
            wiped: response.wiped,
        })
    }

    fn health_check(&self) -> Vec<HealthEntry> {
        let mut results = Vec::new();
        results.push(check_path("worker.toml", &self.config_path));
        match &self.config.chromium.executable_path {
            Some(path) => results.push(check_path("chromium", Path::new(path))),
            None => results.push(HealthEntry::ok("chromium", "resolved from PATH")),
        }
        results.push(check_directory(
            "data dir",
            Path::new(&self.config.paths.data_dir),
        ));
        results.push(check_directory("user profiles", &self.config.users_root()));
        results.push(check_directory("media staging", &self.config.media_root()));
        results.push(check_directory(
            "screenshots",
            &self.config.screenshots_root(),
        ));
        results.push(check_database("runs database", &self.runs_db));
        results.push(check_optional_file("failure log", &self.failure_log));
        results
    }

    fn runs_list(&self, args: &RunsArgs) -> Result<RunList> {
        let conn = open_database(&self.runs_db)?;
        let mut stmt = conn.prepare(
            "SELECT ts, user_id, operation, success, duration_ms, message, screenshot_path \
             FROM session_runs \
             WHERE (?1 IS NULL OR user_id = ?1) \
             ORDER BY ts DESC \
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map((args.user.as_ref(), args.limit as i64), |row| {
                Ok(RunRow {
                    ts: row.get(0)?,
                    user_id: row.get(1)?,
                    operation: row.get(2)?,
                    success: row.get::<_, i64>(3)? != 0,
                    duration_ms: row.get(4)?,
                    message: row.get(5)?,
                    screenshot_path: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(RunList { rows })
    }

    fn failures_list(&self, args: &FailuresArgs) -> Result<FailureList> {
        let conn = open_database(&self.runs_db)?;
        let mut stmt = conn.prepare(
            "SELECT ts, user_id, stage, category, error_message, attempt, screenshot_path \
             FROM session_failures \
             WHERE (?1 IS NULL OR user_id = ?1) \
             ORDER BY ts DESC \
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map((args.user.as_ref(), args.limit as i64), |row| {
                Ok(FailureRow {
                    ts: row.get(0)?,
                    user_id: row.get(1)?,
                    stage: row.get(2)?,
                    category: row.get(3)?,
                    error_message: row.get(4)?,
                    attempt: row.get(5)?,
                    screenshot_path: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(FailureList { rows })
    }
}

async fn deliver_cookies(
    url: &str,
    token: Option<&str>,
    user_id: &str,
    cookies: &CookieSet,
) -> bool {
    let payload = serde_json::json!({ "user_id": user_id, "cookies": cookies });
    let mut request = reqwest::Client::new().post(url).json(&payload);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    match request.send().await {
        Ok(response) if response.status().is_success() => true,
        Ok(response) => {
            eprintln!(
                "warning: cookie delivery rejected with status {}",
                response.status()
            );
            false
        }
        Err(err) => {
            eprintln!("warning: cookie delivery failed: {err}");
            false
        }
    }
}

fn load_cookie_file(path: &Path) -> Result<CookieSet> {
    let raw = fs::read(path).map_err(|err| {
        AppError::MissingResource(format!("cookie file {}: {err}", path.display()))
    })?;
    Ok(serde_json::from_slice(&raw)?)
}

fn open_database(path: &Path) -> Result<Connection> {
    if !path.exists() {
        return Err(AppError::MissingResource(format!(
            "database missing: {}",
            path.display()
        )));
    }
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    Ok(conn)
}

fn check_path(name: &str, path: &Path) -> HealthEntry {
    if path.exists() {
        HealthEntry::ok(name, format!("{}", path.display()))
    } else {
        HealthEntry::error(name, format!("{} missing", path.display()))
    }
}

fn check_optional_file(name: &str, path: &Path) -> HealthEntry {
    if path.exists() {
        HealthEntry::ok(name, format!("{}", path.display()))
    } else {
        HealthEntry::warn(name, format!("{} not written yet", path.display()))
    }
}

fn check_directory(name: &str, path: &Path) -> HealthEntry {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => HealthEntry::ok(name, format!("{}", path.display())),
        Ok(_) => HealthEntry::warn(name, format!("{} is not a directory", path.display())),
        Err(_) => HealthEntry::warn(name, format!("{} not found", path.display())),
    }
}

fn check_database(name: &str, path: &Path) -> HealthEntry {
    if !path.exists() {
        return HealthEntry::warn(name, format!("{} not found", path.display()));
    }
    match open_database(path) {
        Ok(conn) => {
            let pragma: rusqlite::Result<String> =
                conn.query_row("PRAGMA integrity_check;", [], |row| row.get(0));
            match pragma {
                Ok(result) if result.to_lowercase() == "ok" => {
                    HealthEntry::ok(name, "integrity ok".to_string())
                }
                Ok(result) => HealthEntry::warn(name, format!("integrity_check: {result}")),
                Err(err) => HealthEntry::warn(name, format!("error: {err}")),
            }
        }
        Err(err) => HealthEntry::error(name, format!("open failed: {err}")),
    }
}

#[derive(Debug, Serialize)]
pub struct LoginReport {
    pub user_id: String,
    pub status: String,
    pub finished_at: DateTime<Utc>,
    pub waited_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookies_synced: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered: Option<bool>,
}

impl DisplayFallback for LoginReport {
    fn display(&self) -> String {
        let mut lines = match self.status.as_str() {
            "already_logged_in" => vec![format!(
                "{} is already logged in ({} cookies active)",
                self.user_id,
                self.cookies_synced.unwrap_or(0)
            )],
            "logged_in" => vec![format!(
                "Login confirmed for {} after {}s ({} cookies cached)",
                self.user_id,
                self.waited_seconds,
                self.cookies_synced.unwrap_or(0)
            )],
            "expired" => vec![format!(
                "Login attempt for {} expired before a scan",
                self.user_id
            )],
            _ => vec![format!("Login session for {} was dropped", self.user_id)],
        };
        match self.delivered {
            Some(true) => lines.push("Cookies delivered to the sync endpoint".to_string()),
            Some(false) => lines.push("Cookie delivery failed, cache kept locally".to_string()),
            None => {}
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct SyncReport {
    pub user_id: String,
    pub verified: bool,
    pub message: String,
}

impl DisplayFallback for SyncReport {
    fn display(&self) -> String {
        if self.verified {
            format!("Cookies verified and cached for {}", self.user_id)
        } else {
            format!("Cookie sync failed for {}: {}", self.user_id, self.message)
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PublishReport {
    pub user_id: String,
    pub success: bool,
    pub message: String,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<PathBuf>,
}

impl DisplayFallback for PublishReport {
    fn display(&self) -> String {
        let mut lines = if self.success {
            vec![format!(
                "Published for {} in {}ms",
                self.user_id, self.duration_ms
            )]
        } else {
            vec![format!(
                "Publish failed for {}: {}",
                self.user_id, self.message
            )]
        };
        if let Some(path) = &self.screenshot {
            lines.push(format!("Failure screenshot: {}", path.display()));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct WipeReport {
    pub user_id: String,
    pub wiped: bool,
}

impl DisplayFallback for WipeReport {
    fn display(&self) -> String {
        format!("User data removed for {}", self.user_id)
    }
}

#[derive(Debug, Serialize)]
pub struct RunList {
    pub rows: Vec<RunRow>,
}

#[derive(Debug, Serialize)]
pub struct RunRow {
    pub ts: String,
    pub user_id: String,
    pub operation: String,
    pub success: bool,
    pub duration_ms: i64,
    pub message: String,
    pub screenshot_path: String,
}

impl DisplayFallback for RunList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No runs recorded".to_string();
        }
        let mut lines = Vec::new();
        for entry in &self.rows {
            let outcome = if entry.success { "ok" } else { "FAILED" };
            let message = if entry.message.is_empty() {
                "-"
            } else {
                entry.message.as_str()
            };
            lines.push(format!(
                "{} | {} | {} | {} | {}ms | {}",
                entry.ts, entry.user_id, entry.operation, outcome, entry.duration_ms, message
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct FailureList {
    pub rows: Vec<FailureRow>,
}

#[derive(Debug, Serialize)]
pub struct FailureRow {
    pub ts: String,
    pub user_id: String,
    pub stage: String,
    pub category: String,
    pub error_message: String,
    pub attempt: i64,
    pub screenshot_path: String,
}

impl DisplayFallback for FailureList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No failures recorded".to_string();
        }
        let mut lines = Vec::new();
        for entry in &self.rows {
            lines.push(format!(
                "{} | {} | {} | {} | attempt {} | {}",
                entry.ts,
                entry.user_id,
                entry.stage,
                entry.category,
                entry.attempt,
                entry.error_message
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        for entry in self {
            lines.push(format!(
                "[{status}] {name}: {detail}",
                status = entry.status,
                name = entry.name,
                detail = entry.detail
            ));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;
    use tempfile::TempDir;

    fn prepare_test_context() -> (TempDir, AppContext) {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let configs_dir = root.join("configs");
        fs::create_dir_all(&configs_dir).unwrap();
        fs::copy("../configs/worker.toml", configs_dir.join("worker.toml")).unwrap();

        let data_dir = root.join("data");
        fs::create_dir_all(&data_dir).unwrap();

        let cli = Cli {
            config: configs_dir.join("worker.toml"),
            data_dir: Some(data_dir),
            token: None,
            format: OutputFormat::Json,
            command: Commands::Health,
        };
        let context = AppContext::new(&cli).unwrap();
        (temp, context)
    }

    fn seed_diagnostics_db(context: &AppContext) {
        fs::create_dir_all(context.runs_db.parent().unwrap()).unwrap();
        let conn = Connection::open(&context.runs_db).unwrap();
        conn.execute_batch(
            "CREATE TABLE session_runs (
                ts DATETIME DEFAULT CURRENT_TIMESTAMP,
                user_id TEXT,
                operation TEXT,
                success INTEGER,
                duration_ms INTEGER,
                message TEXT,
                screenshot_path TEXT
            );
            CREATE TABLE session_failures (
                ts DATETIME DEFAULT CURRENT_TIMESTAMP,
                user_id TEXT,
                stage TEXT,
                category TEXT,
                error_message TEXT,
                attempt INTEGER,
                screenshot_path TEXT
            );",
        )
        .unwrap();
        conn.execute(
            "INSERT INTO session_runs (user_id, operation, success, duration_ms, message, screenshot_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params!["creator-1", "publish", 1, 900, "published", ""],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO session_runs (user_id, operation, success, duration_ms, message, screenshot_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params!["creator-2", "publish", 0, 1500, "Upload input not found", ""],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO session_failures (user_id, stage, category, error_message, attempt, screenshot_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                "creator-2",
                "publish",
                "UploadFailed",
                "upload input not found",
                1,
                ""
            ],
        )
        .unwrap();
    }

    #[test]
    fn data_dir_override_lands_in_derived_paths() {
        let (temp, context) = prepare_test_context();
        assert!(context.runs_db.starts_with(temp.path().join("data")));
        assert!(context.failure_log.starts_with(temp.path().join("data")));
    }

    #[test]
    fn runs_listing_filters_by_user() {
        let (_temp, context) = prepare_test_context();
        seed_diagnostics_db(&context);

        let all = context
            .runs_list(&RunsArgs {
                user: None,
                limit: 10,
            })
            .unwrap();
        assert_eq!(all.rows.len(), 2);

        let filtered = context
            .runs_list(&RunsArgs {
                user: Some("creator-1".to_string()),
                limit: 10,
            })
            .unwrap();
        assert_eq!(filtered.rows.len(), 1);
        assert!(filtered.rows[0].success);
        assert_eq!(filtered.rows[0].operation, "publish");
    }

    #[test]
    fn failures_listing_returns_categorized_entries() {
        let (_temp, context) = prepare_test_context();
        seed_diagnostics_db(&context);

        let list = context
            .failures_list(&FailuresArgs {
                user: None,
                limit: 5,
            })
            .unwrap();
        assert_eq!(list.rows.len(), 1);
        assert_eq!(list.rows[0].category, "UploadFailed");
        assert_eq!(list.rows[0].attempt, 1);
    }

    #[test]
    fn cookie_files_parse_with_lenient_attributes() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cookies.json");
        fs::write(
            &path,
            r#"[{"name":"web_session","value":"abc","domain":".xiaohongshu.com"}]"#,
        )
        .unwrap();

        let cookies = load_cookie_file(&path).unwrap();
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].name, "web_session");
        assert!(!cookies[0].secure);

        let missing = load_cookie_file(&temp.path().join("absent.json"));
        assert!(matches!(missing, Err(AppError::MissingResource(_))));
    }

    #[test]
    fn runs_listing_requires_the_database() {
        let (_temp, context) = prepare_test_context();
        let result = context.runs_list(&RunsArgs {
            user: None,
            limit: 5,
        });
        assert!(matches!(result, Err(AppError::MissingResource(_))));
    }

    #[test]
    fn health_check_warns_on_missing_database() {
        let (_temp, context) = prepare_test_context();
        let report = context.health_check();

        let config_entry = report.iter().find(|entry| entry.name == "worker.toml");
        assert!(matches!(config_entry.unwrap().status, CheckStatus::Ok));

        let db_entry = report.iter().find(|entry| entry.name == "runs database");
        assert!(matches!(db_entry.unwrap().status, CheckStatus::Warn));
    }
}
