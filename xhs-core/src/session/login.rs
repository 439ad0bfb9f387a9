use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::LoginSection;
use crate::session::driver::{PageDriver, QrSource};
use crate::session::error::{SessionError, SessionResult};
use crate::session::strategies::{capture_qr, switch_to_qr};

/// A pending QR scan with its validity window. The code the page renders is
/// only honored for a fixed TTL; polls after that report expiry no matter
/// what the page says.
#[derive(Debug, Clone)]
pub struct LoginAttempt {
    started: Instant,
    ttl: Duration,
}

impl LoginAttempt {
    pub fn new(ttl: Duration) -> Self {
        Self {
            started: Instant::now(),
            ttl,
        }
    }

    pub fn expired(&self) -> bool {
        self.started.elapsed() >= self.ttl
    }

    pub fn remaining(&self) -> Duration {
        self.ttl.saturating_sub(self.started.elapsed())
    }
}

/// Result of asking a session for a fresh login QR.
#[derive(Debug)]
pub enum QrLoginStart {
    /// The page went straight to the creator home, no scan needed.
    AlreadyAuthenticated,
    WaitingScan {
        qr_png: Vec<u8>,
        source: QrSource,
        degraded: bool,
        attempt: LoginAttempt,
    },
}

/// One poll of a pending QR scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginPoll {
    LoggedIn,
    Waiting,
    Expired,
}

/// Bring the page to the login screen, flip it into QR mode and capture the
/// code. Re-entry on an already-open login page refreshes the code in place
/// instead of reloading the whole app shell.
pub async fn begin_qr_login(
    page: &mut dyn PageDriver,
    cfg: &LoginSection,
) -> SessionResult<QrLoginStart> {
    let url = page.current_url().await?;
    if url.contains(&cfg.home_url_fragment) {
        debug!(%url, "session already authenticated");
        return Ok(QrLoginStart::AlreadyAuthenticated);
    }

    if url.contains(&cfg.login_url_fragment) {
        if page.click_text(&cfg.refresh_control_text).await? {
            debug!("refreshed qr code in place");
        } else {
            page.reload().await?;
        }
    } else {
        page.navigate(&cfg.login_url).await?;
        let landed = page.current_url().await?;
        if landed.contains(&cfg.home_url_fragment) {
            debug!(%landed, "login url redirected to home");
            return Ok(QrLoginStart::AlreadyAuthenticated);
        }
    }

    if !switch_to_qr(page, cfg).await? {
        warn!("mode switch strategies exhausted, capturing current layout");
    }

    let capture = capture_qr(page, cfg).await?;
    info!(
        source = ?capture.source,
        degraded = capture.degraded,
        bytes = capture.png.len(),
        "qr code captured"
    );
    Ok(QrLoginStart::WaitingScan {
        qr_png: capture.png,
        source: capture.source,
        degraded: capture.degraded,
        attempt: LoginAttempt::new(cfg.qr_ttl()),
    })
}

/// Check whether the pending scan completed. The TTL gate comes before any
/// page inspection so a stale attempt expires even when marker cookies have
/// already landed.
pub async fn poll_login(
    page: &mut dyn PageDriver,
    attempt: &LoginAttempt,
    cfg: &LoginSection,
) -> SessionResult<LoginPoll> {
    if attempt.expired() {
        return Ok(LoginPoll::Expired);
    }

    let cookies = page.export_cookies().await?;
    let marker_present = cookies
        .iter()
        .any(|cookie| cfg.session_cookie_markers.iter().any(|m| m == &cookie.name));
    if !marker_present {
        return Ok(LoginPoll::Waiting);
    }

    let url = page.current_url().await?;
    if url.contains(&cfg.home_url_fragment) {
        return Ok(LoginPoll::LoggedIn);
    }

    // Marker cookie alone can be a leftover; only a navigation that sticks
    // on the creator home confirms the session.
    page.navigate(&home_url(cfg)?).await?;
    let landed = page.current_url().await?;
    if landed.contains(&cfg.home_url_fragment) {
        Ok(LoginPoll::LoggedIn)
    } else {
        debug!(%landed, "confirmation navigation bounced back");
        Ok(LoginPoll::Waiting)
    }
}

/// Creator home URL on the same origin as the configured login URL.
pub fn home_url(cfg: &LoginSection) -> SessionResult<String> {
    let parsed = url::Url::parse(&cfg.login_url)
        .map_err(|err| SessionError::Configuration(format!("login_url: {err}")))?;
    let origin = parsed.origin().ascii_serialization();
    Ok(format!("{}/{}", origin, cfg.home_url_fragment))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section() -> LoginSection {
        LoginSection {
            login_url: "https://creator.xiaohongshu.com/login".into(),
            home_url_fragment: "creator/home".into(),
            login_url_fragment: "login".into(),
            qr_ttl_seconds: 90,
            flow_timeout_seconds: 120,
            min_qr_pixels: 100,
            settle_ms: 500,
            settle_attempts: 4,
            strategy_attempts: 2,
            sms_anchor_texts: vec!["短信登录".into()],
            qr_marker_texts: vec!["扫码登录".into()],
            refresh_control_text: "点击刷新".into(),
            container_min_px: 300.0,
            container_max_px: 700.0,
            corner_inset_px: 20.0,
            icon_min_px: 10.0,
            icon_max_px: 80.0,
            session_cookie_markers: vec!["web_session".into()],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_expires_exactly_at_the_ttl() {
        let attempt = LoginAttempt::new(Duration::from_secs(90));
        assert!(!attempt.expired());
        tokio::time::advance(Duration::from_secs(89)).await;
        assert!(!attempt.expired());
        assert!(attempt.remaining() <= Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(attempt.expired());
        assert_eq!(attempt.remaining(), Duration::ZERO);
    }

    #[test]
    fn home_url_shares_the_login_origin() {
        assert_eq!(
            home_url(&section()).unwrap(),
            "https://creator.xiaohongshu.com/creator/home"
        );
    }
}
