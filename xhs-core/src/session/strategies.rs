use async_trait::async_trait;
use image::GenericImageView;
use tracing::{debug, warn};

use crate::config::LoginSection;
use crate::session::driver::{PageDriver, QrSource};
use crate::session::error::{SessionError, SessionResult};
use crate::session::retry::PollPolicy;

/// A captured login QR image, tagged with where it came from.
#[derive(Debug, Clone)]
pub struct QrCapture {
    pub png: Vec<u8>,
    pub source: QrSource,
    /// True when no dedicated QR surface produced a usable image and the
    /// whole viewport was captured instead.
    pub degraded: bool,
}

/// One way of flipping the login page from SMS mode into QR mode. The page
/// ships several layouts, so the engine walks an ordered list of these until
/// the QR surface shows up.
#[async_trait(?Send)]
pub trait SwitchStrategy {
    fn name(&self) -> &'static str;
    /// Try to perform the toggle. `Ok(true)` means a click was performed and
    /// the caller should wait for the page to settle; `Ok(false)` means this
    /// strategy found nothing to act on.
    async fn attempt(&self, page: &mut dyn PageDriver, cfg: &LoginSection) -> SessionResult<bool>;
}

/// Anchor walk to the login card, then click the ornament element in its
/// top-right corner.
pub struct AnchorCornerClick;

#[async_trait(?Send)]
impl SwitchStrategy for AnchorCornerClick {
    fn name(&self) -> &'static str {
        "anchor-corner-click"
    }

    async fn attempt(&self, page: &mut dyn PageDriver, cfg: &LoginSection) -> SessionResult<bool> {
        let Some(container) = page
            .login_container(
                &cfg.sms_anchor_texts,
                cfg.container_min_px,
                cfg.container_max_px,
            )
            .await?
        else {
            return Ok(false);
        };
        let Some(corner) = page
            .corner_element(
                &container.rect,
                cfg.icon_min_px,
                cfg.icon_max_px,
                cfg.corner_inset_px,
            )
            .await?
        else {
            return Ok(false);
        };
        page.click(&corner.hook).await?;
        Ok(true)
    }
}

/// Hit-test the fixed corner coordinate of the login card and click whatever
/// element renders there.
pub struct CornerPointClick;

#[async_trait(?Send)]
impl SwitchStrategy for CornerPointClick {
    fn name(&self) -> &'static str {
        "corner-point-click"
    }

    async fn attempt(&self, page: &mut dyn PageDriver, cfg: &LoginSection) -> SessionResult<bool> {
        let Some(container) = page
            .login_container(
                &cfg.sms_anchor_texts,
                cfg.container_min_px,
                cfg.container_max_px,
            )
            .await?
        else {
            return Ok(false);
        };
        let (x, y) = container.rect.corner_point(cfg.corner_inset_px);
        page.click_point(x, y).await
    }
}

/// Drive a full pointer event sequence at the corner coordinate for layouts
/// that ignore synthetic click() calls.
pub struct PointerSequenceClick;

#[async_trait(?Send)]
impl SwitchStrategy for PointerSequenceClick {
    fn name(&self) -> &'static str {
        "pointer-sequence"
    }

    async fn attempt(&self, page: &mut dyn PageDriver, cfg: &LoginSection) -> SessionResult<bool> {
        let Some(container) = page
            .login_container(
                &cfg.sms_anchor_texts,
                cfg.container_min_px,
                cfg.container_max_px,
            )
            .await?
        else {
            return Ok(false);
        };
        let (x, y) = container.rect.corner_point(cfg.corner_inset_px);
        page.pointer_sequence(x, y).await?;
        Ok(true)
    }
}

/// Click every icon-sized element inside the login card until the QR surface
/// appears. Last resort for layouts where the toggle carries no usable
/// geometry hints.
pub struct IconSweep;

#[async_trait(?Send)]
impl SwitchStrategy for IconSweep {
    fn name(&self) -> &'static str {
        "icon-sweep"
    }

    async fn attempt(&self, page: &mut dyn PageDriver, cfg: &LoginSection) -> SessionResult<bool> {
        let Some(container) = page
            .login_container(
                &cfg.sms_anchor_texts,
                cfg.container_min_px,
                cfg.container_max_px,
            )
            .await?
        else {
            return Ok(false);
        };
        let icons = page
            .small_icons(&container.rect, cfg.icon_min_px, cfg.icon_max_px)
            .await?;
        if icons.is_empty() {
            return Ok(false);
        }
        for icon in &icons {
            page.click(&icon.hook).await?;
            tokio::time::sleep(cfg.settle_delay()).await;
            if qr_mode_visible(page, cfg).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

pub fn switch_strategies() -> Vec<Box<dyn SwitchStrategy>> {
    vec![
        Box::new(AnchorCornerClick),
        Box::new(CornerPointClick),
        Box::new(PointerSequenceClick),
        Box::new(IconSweep),
    ]
}

/// One way of pulling PNG bytes for the QR image out of the page.
#[async_trait(?Send)]
pub trait CaptureStrategy {
    fn name(&self) -> &'static str;
    fn source(&self) -> QrSource;
    async fn capture(
        &self,
        page: &mut dyn PageDriver,
        cfg: &LoginSection,
    ) -> SessionResult<Option<Vec<u8>>>;
}

/// Read the QR canvas straight through toDataURL.
pub struct CanvasData;

#[async_trait(?Send)]
impl CaptureStrategy for CanvasData {
    fn name(&self) -> &'static str {
        "canvas-data"
    }

    fn source(&self) -> QrSource {
        QrSource::Canvas
    }

    async fn capture(
        &self,
        page: &mut dyn PageDriver,
        cfg: &LoginSection,
    ) -> SessionResult<Option<Vec<u8>>> {
        page.canvas_png(cfg.min_qr_pixels).await
    }
}

/// Scrape a data-URL img element rendered in place of a canvas.
pub struct EmbeddedImage;

#[async_trait(?Send)]
impl CaptureStrategy for EmbeddedImage {
    fn name(&self) -> &'static str {
        "embedded-image"
    }

    fn source(&self) -> QrSource {
        QrSource::EmbeddedImage
    }

    async fn capture(
        &self,
        page: &mut dyn PageDriver,
        cfg: &LoginSection,
    ) -> SessionResult<Option<Vec<u8>>> {
        page.embedded_qr_png(cfg.min_qr_pixels).await
    }
}

/// Screenshot the detected QR surface itself, cropped to its box.
pub struct IndicatorShot;

#[async_trait(?Send)]
impl CaptureStrategy for IndicatorShot {
    fn name(&self) -> &'static str {
        "indicator-shot"
    }

    fn source(&self) -> QrSource {
        QrSource::Container
    }

    async fn capture(
        &self,
        page: &mut dyn PageDriver,
        cfg: &LoginSection,
    ) -> SessionResult<Option<Vec<u8>>> {
        let Some(indicator) = page.qr_indicator(cfg.min_qr_pixels).await? else {
            return Ok(None);
        };
        page.element_screenshot(&indicator.hook).await
    }
}

pub fn capture_strategies() -> Vec<Box<dyn CaptureStrategy>> {
    vec![
        Box::new(CanvasData),
        Box::new(EmbeddedImage),
        Box::new(IndicatorShot),
    ]
}

/// Whether the page currently shows the QR login surface.
pub async fn qr_mode_visible(
    page: &mut dyn PageDriver,
    cfg: &LoginSection,
) -> SessionResult<bool> {
    if page.qr_indicator(cfg.min_qr_pixels).await?.is_some() {
        return Ok(true);
    }
    for marker in &cfg.qr_marker_texts {
        if page.has_text(marker).await? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Walk the switch strategies until the QR surface is visible. Detection
/// failures in one strategy only skip to the next; transport failures abort.
pub async fn switch_to_qr(page: &mut dyn PageDriver, cfg: &LoginSection) -> SessionResult<bool> {
    if qr_mode_visible(page, cfg).await? {
        return Ok(true);
    }

    let strategies = switch_strategies();
    for round in 0..cfg.strategy_attempts.max(1) {
        for strategy in &strategies {
            let acted = match strategy.attempt(page, cfg).await {
                Ok(acted) => acted,
                Err(SessionError::Detection(message)) => {
                    warn!(strategy = strategy.name(), round, %message, "switch strategy failed");
                    continue;
                }
                Err(err) => return Err(err),
            };
            if !acted {
                debug!(strategy = strategy.name(), round, "switch strategy found no target");
                continue;
            }
            if settle_into_qr_mode(page, cfg).await? {
                debug!(strategy = strategy.name(), round, "qr mode reached");
                return Ok(true);
            }
        }
    }
    Ok(false)
}

async fn settle_into_qr_mode(
    page: &mut dyn PageDriver,
    cfg: &LoginSection,
) -> SessionResult<bool> {
    let budget = cfg.settle_delay() * cfg.settle_attempts.max(1) as u32;
    let policy = PollPolicy::new(budget, cfg.settle_delay());
    let markers = cfg.qr_marker_texts.clone();
    let min_pixels = cfg.min_qr_pixels;
    let settled = policy
        .run("qr mode settle", page, move |page| {
            let markers = markers.clone();
            Box::pin(async move {
                if page.qr_indicator(min_pixels).await?.is_some() {
                    return Ok(Some(()));
                }
                for marker in &markers {
                    if page.has_text(marker).await? {
                        return Ok(Some(()));
                    }
                }
                Ok(None)
            })
        })
        .await;
    match settled {
        Ok(()) => Ok(true),
        Err(SessionError::Timeout(_)) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Pull a QR image with the capture strategies in order, falling back to a
/// whole-viewport screenshot when none of them yields a usable PNG.
pub async fn capture_qr(page: &mut dyn PageDriver, cfg: &LoginSection) -> SessionResult<QrCapture> {
    for strategy in capture_strategies() {
        let bytes = match strategy.capture(page, cfg).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => continue,
            Err(SessionError::Detection(message)) => {
                warn!(strategy = strategy.name(), %message, "capture strategy failed");
                continue;
            }
            Err(err) => return Err(err),
        };
        match qr_png_usable(&bytes, cfg.min_qr_pixels) {
            Ok(true) => {
                return Ok(QrCapture {
                    png: bytes,
                    source: strategy.source(),
                    degraded: false,
                });
            }
            Ok(false) => {
                debug!(strategy = strategy.name(), "captured image below minimum size");
            }
            Err(message) => {
                warn!(strategy = strategy.name(), %message, "captured bytes failed to decode");
            }
        }
    }

    let png = page.viewport_screenshot().await?;
    Ok(QrCapture {
        png,
        source: QrSource::Viewport,
        degraded: true,
    })
}

fn qr_png_usable(bytes: &[u8], min_pixels: u32) -> Result<bool, String> {
    let decoded = image::load_from_memory(bytes).map_err(|err| err.to_string())?;
    let (width, height) = decoded.dimensions();
    Ok(width.min(height) >= min_pixels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::driver::{
        CookieSet, ElementHook, Located, QrIndicator, Rect, SessionCookie,
    };
    use image::{ImageBuffer, ImageFormat, Rgb};
    use std::io::Cursor;
    use std::path::PathBuf;

    fn png_of(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::new(width, height);
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn login_section() -> LoginSection {
        LoginSection {
            login_url: "https://creator.xiaohongshu.com/login".into(),
            home_url_fragment: "creator/home".into(),
            login_url_fragment: "login".into(),
            qr_ttl_seconds: 90,
            flow_timeout_seconds: 120,
            min_qr_pixels: 100,
            settle_ms: 10,
            settle_attempts: 2,
            strategy_attempts: 1,
            sms_anchor_texts: vec!["短信登录".into(), "验证码登录".into()],
            qr_marker_texts: vec!["扫码登录".into(), "扫码".into()],
            refresh_control_text: "点击刷新".into(),
            container_min_px: 300.0,
            container_max_px: 700.0,
            corner_inset_px: 20.0,
            icon_min_px: 10.0,
            icon_max_px: 80.0,
            session_cookie_markers: vec!["web_session".into()],
        }
    }

    #[derive(Default)]
    struct StubPage {
        qr_visible: bool,
        container: Option<Located>,
        corner: Option<Located>,
        icons: Vec<Located>,
        canvas: Option<Vec<u8>>,
        embedded: Option<Vec<u8>>,
        indicator_shot: Option<Vec<u8>>,
        viewport: Vec<u8>,
        clicked: Vec<String>,
        clicked_points: Vec<(f64, f64)>,
        point_click_hits: bool,
        click_reveals_qr: bool,
    }

    #[async_trait(?Send)]
    impl PageDriver for StubPage {
        async fn navigate(&mut self, _url: &str) -> SessionResult<()> {
            Ok(())
        }
        async fn reload(&mut self) -> SessionResult<()> {
            Ok(())
        }
        async fn current_url(&mut self) -> SessionResult<String> {
            Ok("https://creator.xiaohongshu.com/login".into())
        }
        async fn has_text(&mut self, _needle: &str) -> SessionResult<bool> {
            Ok(false)
        }
        async fn click_text(&mut self, _needle: &str) -> SessionResult<bool> {
            Ok(false)
        }
        async fn qr_indicator(&mut self, _min: u32) -> SessionResult<Option<QrIndicator>> {
            Ok(self.qr_visible.then(|| QrIndicator {
                source: QrSource::Canvas,
                hook: ElementHook::new("[data-xhs-hook=\"qr\"]"),
                rect: Rect {
                    x: 100.0,
                    y: 100.0,
                    width: 200.0,
                    height: 200.0,
                },
            }))
        }
        async fn login_container(
            &mut self,
            _anchors: &[String],
            _min: f64,
            _max: f64,
        ) -> SessionResult<Option<Located>> {
            Ok(self.container.clone())
        }
        async fn corner_element(
            &mut self,
            _container: &Rect,
            _icon_min: f64,
            _icon_max: f64,
            _inset: f64,
        ) -> SessionResult<Option<Located>> {
            Ok(self.corner.clone())
        }
        async fn small_icons(
            &mut self,
            _region: &Rect,
            _icon_min: f64,
            _icon_max: f64,
        ) -> SessionResult<Vec<Located>> {
            Ok(self.icons.clone())
        }
        async fn click(&mut self, hook: &ElementHook) -> SessionResult<()> {
            self.clicked.push(hook.selector.clone());
            if self.click_reveals_qr {
                self.qr_visible = true;
            }
            Ok(())
        }
        async fn click_point(&mut self, x: f64, y: f64) -> SessionResult<bool> {
            self.clicked_points.push((x, y));
            if self.point_click_hits {
                if self.click_reveals_qr {
                    self.qr_visible = true;
                }
                return Ok(true);
            }
            Ok(false)
        }
        async fn pointer_sequence(&mut self, x: f64, y: f64) -> SessionResult<()> {
            self.clicked_points.push((x, y));
            Ok(())
        }
        async fn canvas_png(&mut self, _min: u32) -> SessionResult<Option<Vec<u8>>> {
            Ok(self.canvas.clone())
        }
        async fn embedded_qr_png(&mut self, _min: u32) -> SessionResult<Option<Vec<u8>>> {
            Ok(self.embedded.clone())
        }
        async fn element_screenshot(&mut self, _hook: &ElementHook) -> SessionResult<Option<Vec<u8>>> {
            Ok(self.indicator_shot.clone())
        }
        async fn viewport_screenshot(&mut self) -> SessionResult<Vec<u8>> {
            Ok(self.viewport.clone())
        }
        async fn export_cookies(&mut self) -> SessionResult<CookieSet> {
            Ok(Vec::new())
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

    fn card() -> Located {
        Located {
            hook: ElementHook::new("[data-xhs-hook=\"card\"]"),
            rect: Rect {
                x: 400.0,
                y: 150.0,
                width: 480.0,
                height: 520.0,
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn visible_qr_needs_no_clicks() {
        let mut page = StubPage {
            qr_visible: true,
            ..Default::default()
        };
        assert!(switch_to_qr(&mut page, &login_section()).await.unwrap());
        assert!(page.clicked.is_empty());
        assert!(page.clicked_points.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn anchor_strategy_clicks_the_corner_ornament() {
        let mut page = StubPage {
            container: Some(card()),
            corner: Some(Located {
                hook: ElementHook::new("[data-xhs-hook=\"corner\"]"),
                rect: Rect {
                    x: 840.0,
                    y: 160.0,
                    width: 40.0,
                    height: 40.0,
                },
            }),
            click_reveals_qr: true,
            ..Default::default()
        };
        assert!(switch_to_qr(&mut page, &login_section()).await.unwrap());
        assert_eq!(page.clicked, vec!["[data-xhs-hook=\"corner\"]".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_corner_point_when_no_ornament_found() {
        let mut page = StubPage {
            container: Some(card()),
            corner: None,
            point_click_hits: true,
            click_reveals_qr: true,
            ..Default::default()
        };
        assert!(switch_to_qr(&mut page, &login_section()).await.unwrap());
        // corner of the 480x520 card at (400,150) with a 20px inset
        assert_eq!(page.clicked_points.first(), Some(&(860.0, 170.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_attempt_budget() {
        let mut page = StubPage {
            container: Some(card()),
            ..Default::default()
        };
        assert!(!switch_to_qr(&mut page, &login_section()).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn capture_prefers_canvas_bytes() {
        let mut page = StubPage {
            canvas: Some(png_of(200, 200)),
            embedded: Some(png_of(300, 300)),
            ..Default::default()
        };
        let capture = capture_qr(&mut page, &login_section()).await.unwrap();
        assert_eq!(capture.source, QrSource::Canvas);
        assert!(!capture.degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn capture_falls_through_to_embedded_image() {
        let mut page = StubPage {
            embedded: Some(png_of(300, 300)),
            ..Default::default()
        };
        let capture = capture_qr(&mut page, &login_section()).await.unwrap();
        assert_eq!(capture.source, QrSource::EmbeddedImage);
    }

    #[tokio::test(start_paused = true)]
    async fn undersized_capture_degrades_to_viewport() {
        let mut page = StubPage {
            canvas: Some(png_of(10, 10)),
            viewport: png_of(1920, 1080),
            ..Default::default()
        };
        let capture = capture_qr(&mut page, &login_section()).await.unwrap();
        assert_eq!(capture.source, QrSource::Viewport);
        assert!(capture.degraded);
        assert!(!capture.png.is_empty());
    }
}
