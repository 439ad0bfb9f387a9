pub mod config;
pub mod error;
pub mod service;
pub mod session;

pub use config::{load_worker_config, WorkerConfig};
pub use error::{ConfigError, Result};
pub use service::{
    CloseResponse, HealthReport, LoginStatusResponse, PublishResponse, QrLoginResponse,
    SessionService, SyncResponse, VerifyResponse, WipeResponse,
};
pub use session::{
    CookieCache, CookieSet, LoginPoll, PageDriver, PoolSnapshot, PublishKind, PublishRequest,
    QrLoginStart, QrSource, SessionCookie, SessionEngine, SessionError, SessionMetrics,
    SessionOverrides, SessionPool, SessionResult, UserProfile,
};
