use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};

use xhs_core::config::LoginSection;
use xhs_core::load_worker_config;
use xhs_core::session::{
    begin_qr_login, home_url, poll_login, CookieSet, ElementHook, Located, LoginAttempt,
    LoginPoll, PageDriver, QrIndicator, QrLoginStart, QrSource, Rect, SessionCookie,
    SessionResult,
};

const LOGIN_URL: &str = "https://creator.xiaohongshu.com/login";
const HOME_URL: &str = "https://creator.xiaohongshu.com/creator/home";

fn login_config() -> LoginSection {
    let fixture = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/worker.toml");
    load_worker_config(fixture)
        .expect("fixture should parse")
        .login
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let buffer = ImageBuffer::<Rgb<u8>, Vec<u8>>::new(width, height);
    let mut bytes = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(buffer)
        .write_to(&mut bytes, ImageFormat::Png)
        .expect("png encode");
    bytes.into_inner()
}

fn marker_cookie() -> SessionCookie {
    SessionCookie {
        name: "web_session".to_string(),
        value: "0123abcd".to_string(),
        domain: ".xiaohongshu.com".to_string(),
        path: Some("/".to_string()),
        secure: true,
        http_only: true,
    }
}

/// Scripted login page. Field toggles decide which probes see what; clicks on
/// the corner ornament can flip the page into QR mode like the real layout.
#[derive(Default)]
struct MockPage {
    url: String,
    redirect_to: Option<String>,
    qr_visible: bool,
    click_reveals_qr: bool,
    container: Option<Rect>,
    corner: Option<Rect>,
    canvas: Option<Vec<u8>>,
    viewport: Vec<u8>,
    cookies: CookieSet,
    navigations: Vec<String>,
    clicks: Vec<String>,
    reloads: usize,
}

#[async_trait(?Send)]
impl PageDriver for MockPage {
    async fn navigate(&mut self, url: &str) -> SessionResult<()> {
        self.navigations.push(url.to_string());
        self.url = self
            .redirect_to
            .clone()
            .unwrap_or_else(|| url.to_string());
        Ok(())
    }

    async fn reload(&mut self) -> SessionResult<()> {
        self.reloads += 1;
        Ok(())
    }

    async fn current_url(&mut self) -> SessionResult<String> {
        Ok(self.url.clone())
    }

    async fn has_text(&mut self, _needle: &str) -> SessionResult<bool> {
        Ok(false)
    }

    async fn click_text(&mut self, _needle: &str) -> SessionResult<bool> {
        Ok(false)
    }

    async fn qr_indicator(&mut self, _min_pixels: u32) -> SessionResult<Option<QrIndicator>> {
        Ok(self.qr_visible.then(|| QrIndicator {
            source: QrSource::Canvas,
            hook: ElementHook::new("[data-xhs-hook=\"qr-1\"]"),
            rect: Rect {
                x: 500.0,
                y: 200.0,
                width: 160.0,
                height: 160.0,
            },
        }))
    }

    async fn login_container(
        &mut self,
        _anchors: &[String],
        _min_px: f64,
        _max_px: f64,
    ) -> SessionResult<Option<Located>> {
        Ok(self.container.map(|rect| Located {
            hook: ElementHook::new("[data-xhs-hook=\"card-1\"]"),
            rect,
        }))
    }

    async fn corner_element(
        &mut self,
        _container: &Rect,
        _icon_min: f64,
        _icon_max: f64,
        _inset: f64,
    ) -> SessionResult<Option<Located>> {
        Ok(self.corner.map(|rect| Located {
            hook: ElementHook::new("[data-xhs-hook=\"corner-1\"]"),
            rect,
        }))
    }

    async fn small_icons(
        &mut self,
        _region: &Rect,
        _icon_min: f64,
        _icon_max: f64,
    ) -> SessionResult<Vec<Located>> {
        Ok(Vec::new())
    }

    async fn click(&mut self, hook: &ElementHook) -> SessionResult<()> {
        self.clicks.push(hook.selector.clone());
        if self.click_reveals_qr {
            self.qr_visible = true;
        }
        Ok(())
    }

    async fn click_point(&mut self, _x: f64, _y: f64) -> SessionResult<bool> {
        Ok(false)
    }

    async fn pointer_sequence(&mut self, _x: f64, _y: f64) -> SessionResult<()> {
        Ok(())
    }

    async fn canvas_png(&mut self, _min_pixels: u32) -> SessionResult<Option<Vec<u8>>> {
        if !self.qr_visible {
            return Ok(None);
        }
        Ok(self.canvas.clone())
    }

    async fn embedded_qr_png(&mut self, _min_pixels: u32) -> SessionResult<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn element_screenshot(&mut self, _hook: &ElementHook) -> SessionResult<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn viewport_screenshot(&mut self) -> SessionResult<Vec<u8>> {
        Ok(self.viewport.clone())
    }

    async fn export_cookies(&mut self) -> SessionResult<CookieSet> {
        Ok(self.cookies.clone())
    }

    async fn inject_cookies(&mut self, _cookies: &[SessionCookie]) -> SessionResult<usize> {
        Ok(0)
    }

    async fn file_input_present(&mut self) -> SessionResult<bool> {
        Ok(false)
    }

    async fn upload_files(&mut self, _paths: &[PathBuf]) -> SessionResult<()> {
        Ok(())
    }

    async fn fill_by_placeholder(
        &mut self,
        _placeholder: &str,
        _value: &str,
    ) -> SessionResult<bool> {
        Ok(false)
    }

    async fn fill_by_selector(&mut self, _selector: &str, _value: &str) -> SessionResult<bool> {
        Ok(false)
    }

    async fn click_nth(&mut self, _selector: &str, _index: usize) -> SessionResult<bool> {
        Ok(false)
    }
}

#[tokio::test(start_paused = true)]
async fn logged_in_profile_skips_the_scan() {
    let cfg = login_config();
    let mut page = MockPage {
        url: HOME_URL.to_string(),
        ..MockPage::default()
    };
    let start = begin_qr_login(&mut page, &cfg).await.expect("begin");
    assert!(matches!(start, QrLoginStart::AlreadyAuthenticated));
    assert!(page.navigations.is_empty(), "no navigation needed");
}

#[tokio::test(start_paused = true)]
async fn visible_qr_is_captured_from_the_canvas() {
    let cfg = login_config();
    let code = png(160, 160);
    let mut page = MockPage {
        url: LOGIN_URL.to_string(),
        qr_visible: true,
        canvas: Some(code.clone()),
        ..MockPage::default()
    };
    let start = begin_qr_login(&mut page, &cfg).await.expect("begin");
    match start {
        QrLoginStart::WaitingScan {
            qr_png,
            source,
            degraded,
            ..
        } => {
            assert_eq!(qr_png, code);
            assert_eq!(source, QrSource::Canvas);
            assert!(!degraded);
        }
        other => panic!("unexpected start: {other:?}"),
    }
    // Already on the login page: refreshed in place, never re-navigated.
    assert!(page.navigations.is_empty());
    assert_eq!(page.reloads, 1);
}

#[tokio::test(start_paused = true)]
async fn corner_click_flips_the_page_into_qr_mode() {
    let cfg = login_config();
    let code = png(160, 160);
    let mut page = MockPage {
        url: LOGIN_URL.to_string(),
        click_reveals_qr: true,
        container: Some(Rect {
            x: 400.0,
            y: 150.0,
            width: 480.0,
            height: 520.0,
        }),
        corner: Some(Rect {
            x: 840.0,
            y: 150.0,
            width: 40.0,
            height: 40.0,
        }),
        canvas: Some(code.clone()),
        ..MockPage::default()
    };
    let start = begin_qr_login(&mut page, &cfg).await.expect("begin");
    match start {
        QrLoginStart::WaitingScan { qr_png, degraded, .. } => {
            assert_eq!(qr_png, code);
            assert!(!degraded);
        }
        other => panic!("unexpected start: {other:?}"),
    }
    assert!(page
        .clicks
        .iter()
        .any(|selector| selector.contains("corner")));
}

#[tokio::test(start_paused = true)]
async fn unswitchable_page_degrades_to_a_viewport_shot() {
    let cfg = login_config();
    let shot = png(1280, 800);
    let mut page = MockPage {
        url: LOGIN_URL.to_string(),
        viewport: shot.clone(),
        ..MockPage::default()
    };
    let start = begin_qr_login(&mut page, &cfg).await.expect("begin");
    match start {
        QrLoginStart::WaitingScan {
            qr_png,
            source,
            degraded,
            ..
        } => {
            assert_eq!(qr_png, shot);
            assert_eq!(source, QrSource::Viewport);
            assert!(degraded, "viewport fallback must be flagged");
        }
        other => panic!("unexpected start: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn stale_attempt_expires_even_with_marker_cookies() {
    let cfg = login_config();
    let mut page = MockPage {
        url: HOME_URL.to_string(),
        cookies: vec![marker_cookie()],
        ..MockPage::default()
    };
    let attempt = LoginAttempt::new(cfg.qr_ttl());
    tokio::time::advance(Duration::from_secs(91)).await;
    let poll = poll_login(&mut page, &attempt, &cfg).await.expect("poll");
    assert_eq!(poll, LoginPoll::Expired);
    assert!(page.navigations.is_empty(), "expiry needs no page work");
}

#[tokio::test(start_paused = true)]
async fn marker_cookie_on_the_home_page_confirms_login() {
    let cfg = login_config();
    let mut page = MockPage {
        url: HOME_URL.to_string(),
        cookies: vec![marker_cookie()],
        ..MockPage::default()
    };
    let attempt = LoginAttempt::new(cfg.qr_ttl());
    let poll = poll_login(&mut page, &attempt, &cfg).await.expect("poll");
    assert_eq!(poll, LoginPoll::LoggedIn);
}

#[tokio::test(start_paused = true)]
async fn leftover_marker_that_bounces_off_home_keeps_waiting() {
    let cfg = login_config();
    let mut page = MockPage {
        url: LOGIN_URL.to_string(),
        redirect_to: Some(LOGIN_URL.to_string()),
        cookies: vec![marker_cookie()],
        ..MockPage::default()
    };
    let attempt = LoginAttempt::new(cfg.qr_ttl());
    let poll = poll_login(&mut page, &attempt, &cfg).await.expect("poll");
    assert_eq!(poll, LoginPoll::Waiting);
    assert_eq!(page.navigations, vec![home_url(&cfg).expect("home url")]);
}

#[tokio::test(start_paused = true)]
async fn missing_marker_keeps_waiting_without_navigation() {
    let cfg = login_config();
    let mut page = MockPage {
        url: LOGIN_URL.to_string(),
        ..MockPage::default()
    };
    let attempt = LoginAttempt::new(cfg.qr_ttl());
    let poll = poll_login(&mut page, &attempt, &cfg).await.expect("poll");
    assert_eq!(poll, LoginPoll::Waiting);
    assert!(page.navigations.is_empty());
}
