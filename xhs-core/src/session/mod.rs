mod cdp;
mod diagnostics;
mod display;
mod driver;
mod engine;
mod error;
mod login;
mod media;
mod metrics;
mod pool;
mod profile;
mod publish;
mod retry;
mod strategies;

pub use cdp::CdpDriver;
pub use diagnostics::{
    Diagnostics, DiagnosticsError, ErrorCategorizer, FailureRecord, RunRecord,
    SessionErrorCategory,
};
pub use display::VirtualDisplay;
pub use driver::{
    CookieSet, ElementHook, Located, PageDriver, QrIndicator, QrSource, Rect, SessionCookie,
};
pub use engine::{PublishReport, PublishRequest, SessionEngine, SessionOverrides};
pub use error::{SessionError, SessionResult};
pub use login::{begin_qr_login, home_url, poll_login, LoginAttempt, LoginPoll, QrLoginStart};
pub use media::{MediaFetcher, StagedMedia};
pub use metrics::SessionMetrics;
pub use pool::{PoolSnapshot, SessionPool};
pub use profile::{CookieCache, ProfileStore, UserProfile};
pub use publish::{run_publish, PublishKind, PublishOutcome, PublishTask};
pub use retry::PollPolicy;
pub use strategies::{
    capture_qr, capture_strategies, qr_mode_visible, switch_strategies, switch_to_qr,
    CaptureStrategy, QrCapture, SwitchStrategy,
};
