use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::session::error::SessionResult;

/// Axis-aligned box in page coordinates, as reported by layout queries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn shorter_side(&self) -> f64 {
        self.width.min(self.height)
    }

    /// Point just inside the top-right corner, where the login widget keeps
    /// its mode-switch ornament.
    pub fn corner_point(&self, inset: f64) -> (f64, f64) {
        (self.x + self.width - inset, self.y + inset)
    }
}

/// Opaque handle to an element a probe already located. The production
/// driver tags elements with a data attribute and stores the matching
/// selector here so a later click or crop finds the same node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementHook {
    pub selector: String,
}

impl ElementHook {
    pub fn new(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
        }
    }
}

/// A located element together with its layout box.
#[derive(Debug, Clone)]
pub struct Located {
    pub hook: ElementHook,
    pub rect: Rect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QrSource {
    Canvas,
    EmbeddedImage,
    Container,
    Viewport,
}

/// A QR surface detected on the login page.
#[derive(Debug, Clone)]
pub struct QrIndicator {
    pub source: QrSource,
    pub hook: ElementHook,
    pub rect: Rect,
}

/// One exported browser cookie. Attribute fields are lenient on input so
/// bundles captured by external tooling still parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
}

pub type CookieSet = Vec<SessionCookie>;

/// Everything the login and publish flows need from a live page. The only
/// production implementation drives a Chromium tab over CDP; tests substitute
/// scripted mocks, so every heuristic stays exercisable without a browser.
///
/// Probes report absence as `Ok(None)`/`Ok(false)`; an `Err` always means the
/// transport or the browser itself failed.
#[async_trait(?Send)]
pub trait PageDriver {
    async fn navigate(&mut self, url: &str) -> SessionResult<()>;
    async fn reload(&mut self) -> SessionResult<()>;
    async fn current_url(&mut self) -> SessionResult<String>;

    /// True when the visible page text contains `needle`.
    async fn has_text(&mut self, needle: &str) -> SessionResult<bool>;
    /// Click the first visible element containing `needle`; false when none.
    async fn click_text(&mut self, needle: &str) -> SessionResult<bool>;

    /// Probe for a QR surface at least `min_pixels` on its shorter side.
    async fn qr_indicator(&mut self, min_pixels: u32) -> SessionResult<Option<QrIndicator>>;
    /// Walk up from an anchor text to a container whose sides both fall
    /// within `[min_px, max_px]`.
    async fn login_container(
        &mut self,
        anchors: &[String],
        min_px: f64,
        max_px: f64,
    ) -> SessionResult<Option<Located>>;
    /// Small ornament near the top-right corner of `container`.
    async fn corner_element(
        &mut self,
        container: &Rect,
        icon_min: f64,
        icon_max: f64,
        inset: f64,
    ) -> SessionResult<Option<Located>>;
    /// Every icon-sized element inside `region`, in document order.
    async fn small_icons(
        &mut self,
        region: &Rect,
        icon_min: f64,
        icon_max: f64,
    ) -> SessionResult<Vec<Located>>;

    async fn click(&mut self, hook: &ElementHook) -> SessionResult<()>;
    /// Hit-test the point and click whatever element is there.
    async fn click_point(&mut self, x: f64, y: f64) -> SessionResult<bool>;
    /// Full synthetic pointer sequence (move, down, up, click) at a point.
    async fn pointer_sequence(&mut self, x: f64, y: f64) -> SessionResult<()>;

    /// PNG readback of the largest qualifying canvas, if any.
    async fn canvas_png(&mut self, min_pixels: u32) -> SessionResult<Option<Vec<u8>>>;
    /// Raster payload of an inline data-URL image, if any qualifies.
    async fn embedded_qr_png(&mut self, min_pixels: u32) -> SessionResult<Option<Vec<u8>>>;
    async fn element_screenshot(&mut self, hook: &ElementHook) -> SessionResult<Option<Vec<u8>>>;
    async fn viewport_screenshot(&mut self) -> SessionResult<Vec<u8>>;

    async fn export_cookies(&mut self) -> SessionResult<CookieSet>;
    /// Inject cookies into the browser, returning how many were accepted.
    async fn inject_cookies(&mut self, cookies: &[SessionCookie]) -> SessionResult<usize>;

    async fn file_input_present(&mut self) -> SessionResult<bool>;
    async fn upload_files(&mut self, paths: &[PathBuf]) -> SessionResult<()>;
    async fn fill_by_placeholder(&mut self, placeholder: &str, value: &str)
        -> SessionResult<bool>;
    async fn fill_by_selector(&mut self, selector: &str, value: &str) -> SessionResult<bool>;
    /// Click the `index`-th element matching `selector`; false when missing.
    async fn click_nth(&mut self, selector: &str, index: usize) -> SessionResult<bool>;
}
