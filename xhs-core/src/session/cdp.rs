use std::path::PathBuf;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chromiumoxide::cdp::browser_protocol::dom::{
    GetDocumentParams, QuerySelectorParams, SetFileInputFilesParams,
};
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType, MouseButton,
};
use chromiumoxide::cdp::browser_protocol::network::{CookieParam, GetCookiesParams};
use chromiumoxide::cdp::browser_protocol::page::{CaptureScreenshotFormat, NavigateParams};
use chromiumoxide::layout::Point;
use chromiumoxide::page::{Page, ScreenshotParams};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::session::driver::{
    CookieSet, ElementHook, Located, PageDriver, QrIndicator, QrSource, Rect, SessionCookie,
};
use crate::session::error::{SessionError, SessionResult};

const HOOK_ATTR: &str = "data-xhs-hook";
const FILE_INPUT_SELECTOR: &str = "input[type=\"file\"]";
const MAX_SWEEP_ICONS: usize = 12;

/// Production [`PageDriver`] speaking CDP to one Chromium tab. Detection
/// scripts tag the elements they find with a `data-xhs-hook` attribute so the
/// same node can be re-found for clicks without re-running the heuristic.
#[derive(Debug)]
pub struct CdpDriver {
    page: Page,
    base_url: String,
    hook_seq: u64,
}

#[derive(Debug, Deserialize)]
struct RectPayload {
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

impl RectPayload {
    fn rect(&self) -> Rect {
        Rect {
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
        }
    }
}

#[derive(Debug, Deserialize)]
struct QrProbePayload {
    kind: String,
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

#[derive(Debug, Deserialize)]
struct IconPayload {
    index: u64,
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

impl CdpDriver {
    pub fn new(page: Page, base_url: impl Into<String>) -> Self {
        Self {
            page,
            base_url: base_url.into(),
            hook_seq: 0,
        }
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    fn next_hook(&mut self, label: &str) -> (String, ElementHook) {
        self.hook_seq += 1;
        let tag = format!("{label}-{}", self.hook_seq);
        let hook = ElementHook::new(format!("[{HOOK_ATTR}=\"{tag}\"]"));
        (tag, hook)
    }

    async fn eval<T: DeserializeOwned>(&self, script: &str) -> SessionResult<T> {
        self.page
            .evaluate(script)
            .await?
            .into_value()
            .map_err(|err| SessionError::Detection(format!("script payload: {err}")))
    }

    async fn find_tagged(&self, hook: &ElementHook) -> SessionResult<chromiumoxide::element::Element> {
        self.page
            .find_element(hook.selector.as_str())
            .await
            .map_err(|err| {
                SessionError::Detection(format!("tagged element vanished ({}): {err}", hook.selector))
            })
    }

    async fn mouse_event(
        &self,
        kind: DispatchMouseEventType,
        x: f64,
        y: f64,
    ) -> SessionResult<()> {
        let params = DispatchMouseEventParams::builder()
            .r#type(kind)
            .x(x)
            .y(y)
            .button(MouseButton::Left)
            .click_count(1)
            .build()
            .map_err(SessionError::Unexpected)?;
        self.page.execute(params).await?;
        Ok(())
    }
}

fn js_value<T: Serialize>(value: &T) -> SessionResult<String> {
    serde_json::to_string(value)
        .map_err(|err| SessionError::Unexpected(format!("script argument: {err}")))
}

fn decode_data_url(data_url: &str) -> SessionResult<Vec<u8>> {
    let encoded = data_url
        .split_once("base64,")
        .map(|(_, rest)| rest)
        .ok_or_else(|| SessionError::Detection("qr image is not a base64 data url".to_string()))?;
    BASE64
        .decode(encoded.trim())
        .map_err(|err| SessionError::Detection(format!("qr image decode: {err}")))
}

#[async_trait(?Send)]
impl PageDriver for CdpDriver {
    async fn navigate(&mut self, url: &str) -> SessionResult<()> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(SessionError::Configuration)?;
        self.page.goto(params).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    async fn reload(&mut self) -> SessionResult<()> {
        self.page.reload().await?;
        Ok(())
    }

    async fn current_url(&mut self) -> SessionResult<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    async fn has_text(&mut self, needle: &str) -> SessionResult<bool> {
        let script = format!(
            "(() => ((document.body && document.body.innerText) || '').includes({needle}))()",
            needle = js_value(&needle)?
        );
        self.eval(&script).await
    }

    async fn click_text(&mut self, needle: &str) -> SessionResult<bool> {
        let (tag, hook) = self.next_hook("text");
        let script = format!(
            r#"(() => {{
    const needle = {needle};
    const nodes = document.querySelectorAll('*');
    for (const node of nodes) {{
        const text = (node.innerText || node.textContent || '').trim();
        if (!text || !text.includes(needle)) continue;
        const rect = node.getBoundingClientRect();
        if (rect.width === 0 || rect.height === 0) continue;
        let deeper = false;
        for (const child of node.children) {{
            if (((child.innerText || child.textContent) || '').includes(needle)) {{ deeper = true; break; }}
        }}
        if (deeper) continue;
        node.setAttribute('{HOOK_ATTR}', {tag});
        return true;
    }}
    return false;
}})()"#,
            needle = js_value(&needle)?,
            tag = js_value(&tag)?,
        );
        if !self.eval::<bool>(&script).await? {
            return Ok(false);
        }
        let element = self.find_tagged(&hook).await?;
        element.click().await?;
        Ok(true)
    }

    async fn qr_indicator(&mut self, min_pixels: u32) -> SessionResult<Option<QrIndicator>> {
        let (tag, hook) = self.next_hook("qr");
        let script = format!(
            r#"(() => {{
    const min = {min_pixels};
    const candidates = [];
    document.querySelectorAll('canvas').forEach(n => candidates.push(['canvas', n]));
    document.querySelectorAll('img').forEach(n => {{
        if ((n.src || '').startsWith('data:image')) candidates.push(['img', n]);
    }});
    document.querySelectorAll('[class*="qrcode"], [class*="qr-code"], [class*="qr_code"]')
        .forEach(n => candidates.push(['box', n]));
    for (const [kind, node] of candidates) {{
        const rect = node.getBoundingClientRect();
        if (Math.min(rect.width, rect.height) < min) continue;
        node.setAttribute('{HOOK_ATTR}', {tag});
        return {{ kind, x: rect.x, y: rect.y, width: rect.width, height: rect.height }};
    }}
    return null;
}})()"#,
            tag = js_value(&tag)?,
        );
        let payload: Option<QrProbePayload> = self.eval(&script).await?;
        Ok(payload.map(|probe| {
            let source = match probe.kind.as_str() {
                "canvas" => QrSource::Canvas,
                "img" => QrSource::EmbeddedImage,
                _ => QrSource::Container,
            };
            QrIndicator {
                source,
                hook,
                rect: Rect {
                    x: probe.x,
                    y: probe.y,
                    width: probe.width,
                    height: probe.height,
                },
            }
        }))
    }

    async fn login_container(
        &mut self,
        anchors: &[String],
        min_px: f64,
        max_px: f64,
    ) -> SessionResult<Option<Located>> {
        let (tag, hook) = self.next_hook("card");
        let script = format!(
            r#"(() => {{
    const anchors = {anchors};
    const min = {min_px}, max = {max_px};
    const nodes = document.querySelectorAll('*');
    for (const node of nodes) {{
        const text = (node.innerText || node.textContent || '').trim();
        if (!text) continue;
        if (!anchors.some(a => text.includes(a))) continue;
        let current = node;
        for (let depth = 0; depth < 12 && current; depth += 1) {{
            const rect = current.getBoundingClientRect();
            if (rect.width >= min && rect.width <= max && rect.height >= min && rect.height <= max) {{
                current.setAttribute('{HOOK_ATTR}', {tag});
                return {{ x: rect.x, y: rect.y, width: rect.width, height: rect.height }};
            }}
            current = current.parentElement;
        }}
    }}
    return null;
}})()"#,
            anchors = js_value(&anchors)?,
            tag = js_value(&tag)?,
        );
        let payload: Option<RectPayload> = self.eval(&script).await?;
        Ok(payload.map(|rect| Located {
            hook,
            rect: rect.rect(),
        }))
    }

    async fn corner_element(
        &mut self,
        container: &Rect,
        icon_min: f64,
        icon_max: f64,
        inset: f64,
    ) -> SessionResult<Option<Located>> {
        let (corner_x, corner_y) = container.corner_point(inset);
        let (tag, hook) = self.next_hook("corner");
        let script = format!(
            r#"(() => {{
    const picks = document.elementsFromPoint({corner_x}, {corner_y}) || [];
    for (const node of picks) {{
        const rect = node.getBoundingClientRect();
        const side = Math.max(rect.width, rect.height);
        if (side < {icon_min} || side > {icon_max}) continue;
        node.setAttribute('{HOOK_ATTR}', {tag});
        return {{ x: rect.x, y: rect.y, width: rect.width, height: rect.height }};
    }}
    return null;
}})()"#,
            tag = js_value(&tag)?,
        );
        let payload: Option<RectPayload> = self.eval(&script).await?;
        Ok(payload.map(|rect| Located {
            hook,
            rect: rect.rect(),
        }))
    }

    async fn small_icons(
        &mut self,
        region: &Rect,
        icon_min: f64,
        icon_max: f64,
    ) -> SessionResult<Vec<Located>> {
        let (tag, _) = self.next_hook("icon");
        let script = format!(
            r#"(() => {{
    const left = {left}, top = {top}, right = {right}, bottom = {bottom};
    const results = [];
    const nodes = document.querySelectorAll('*');
    let index = 0;
    for (const node of nodes) {{
        if (results.length >= {cap}) break;
        const rect = node.getBoundingClientRect();
        if (rect.width < {icon_min} || rect.width > {icon_max}) continue;
        if (rect.height < {icon_min} || rect.height > {icon_max}) continue;
        if (rect.left < left || rect.top < top || rect.right > right || rect.bottom > bottom) continue;
        node.setAttribute('{HOOK_ATTR}', {tag} + '-' + index);
        results.push({{ index, x: rect.x, y: rect.y, width: rect.width, height: rect.height }});
        index += 1;
    }}
    return results;
}})()"#,
            left = region.x,
            top = region.y,
            right = region.x + region.width,
            bottom = region.y + region.height,
            cap = MAX_SWEEP_ICONS,
            tag = js_value(&tag)?,
        );
        let payload: Vec<IconPayload> = self.eval(&script).await?;
        Ok(payload
            .into_iter()
            .map(|icon| Located {
                hook: ElementHook::new(format!("[{HOOK_ATTR}=\"{tag}-{}\"]", icon.index)),
                rect: Rect {
                    x: icon.x,
                    y: icon.y,
                    width: icon.width,
                    height: icon.height,
                },
            })
            .collect())
    }

    async fn click(&mut self, hook: &ElementHook) -> SessionResult<()> {
        let element = self.find_tagged(hook).await?;
        element.click().await?;
        Ok(())
    }

    async fn click_point(&mut self, x: f64, y: f64) -> SessionResult<bool> {
        let script = format!(
            r#"(() => {{
    const el = document.elementFromPoint({x}, {y});
    if (!el) return false;
    el.click();
    return true;
}})()"#
        );
        self.eval(&script).await
    }

    async fn pointer_sequence(&mut self, x: f64, y: f64) -> SessionResult<()> {
        self.page.move_mouse(Point::new(x, y)).await?;
        self.mouse_event(DispatchMouseEventType::MousePressed, x, y)
            .await?;
        self.mouse_event(DispatchMouseEventType::MouseReleased, x, y)
            .await?;
        Ok(())
    }

    async fn canvas_png(&mut self, min_pixels: u32) -> SessionResult<Option<Vec<u8>>> {
        let script = format!(
            r#"(() => {{
    const min = {min_pixels};
    for (const canvas of document.querySelectorAll('canvas')) {{
        const rect = canvas.getBoundingClientRect();
        if (Math.min(rect.width, rect.height) < min) continue;
        try {{
            return canvas.toDataURL('image/png');
        }} catch (_) {{
            continue;
        }}
    }}
    return null;
}})()"#
        );
        let data_url: Option<String> = self.eval(&script).await?;
        match data_url {
            Some(data_url) => Ok(Some(decode_data_url(&data_url)?)),
            None => Ok(None),
        }
    }

    async fn embedded_qr_png(&mut self, min_pixels: u32) -> SessionResult<Option<Vec<u8>>> {
        let script = format!(
            r#"(() => {{
    const min = {min_pixels};
    for (const img of document.querySelectorAll('img')) {{
        if (!(img.src || '').startsWith('data:image')) continue;
        const rect = img.getBoundingClientRect();
        if (Math.min(rect.width, rect.height) < min) continue;
        return img.src;
    }}
    return null;
}})()"#
        );
        let data_url: Option<String> = self.eval(&script).await?;
        match data_url {
            Some(data_url) => Ok(Some(decode_data_url(&data_url)?)),
            None => Ok(None),
        }
    }

    async fn element_screenshot(&mut self, hook: &ElementHook) -> SessionResult<Option<Vec<u8>>> {
        let element = match self.page.find_element(hook.selector.as_str()).await {
            Ok(element) => element,
            Err(_) => return Ok(None),
        };
        element
            .screenshot(CaptureScreenshotFormat::Png)
            .await
            .map(Some)
            .map_err(|err| SessionError::Detection(format!("element screenshot: {err}")))
    }

    async fn viewport_screenshot(&mut self) -> SessionResult<Vec<u8>> {
        let params = ScreenshotParams::builder().build();
        Ok(self.page.screenshot(params).await?)
    }

    async fn export_cookies(&mut self) -> SessionResult<CookieSet> {
        let params = GetCookiesParams::builder()
            .urls(vec![self.base_url.clone()])
            .build();
        let result = self.page.execute(params).await?;
        Ok(result
            .result
            .cookies
            .iter()
            .map(|c| SessionCookie {
                name: c.name.clone(),
                value: c.value.clone(),
                domain: c.domain.clone(),
                path: Some(c.path.clone()),
                secure: c.secure,
                http_only: c.http_only,
            })
            .collect())
    }

    async fn inject_cookies(&mut self, cookies: &[SessionCookie]) -> SessionResult<usize> {
        let mut injected = 0usize;
        for cookie in cookies {
            if cookie.name.is_empty() {
                continue;
            }
            let mut builder = CookieParam::builder()
                .name(&cookie.name)
                .value(&cookie.value);
            if cookie.domain.is_empty() {
                builder = builder.url(&self.base_url);
            } else {
                builder = builder.domain(&cookie.domain);
            }
            if let Some(path) = &cookie.path {
                builder = builder.path(path);
            }
            match builder.build() {
                Ok(param) => {
                    if let Err(err) = self.page.set_cookie(param).await {
                        warn!(cookie = %cookie.name, error = %err, "failed to set cookie");
                    } else {
                        injected += 1;
                    }
                }
                Err(err) => {
                    warn!(cookie = %cookie.name, error = %err, "failed to build cookie");
                }
            }
        }
        debug!(injected, total = cookies.len(), "cookie injection finished");
        Ok(injected)
    }

    async fn file_input_present(&mut self) -> SessionResult<bool> {
        let script = format!(
            "(() => !!document.querySelector({selector}))()",
            selector = js_value(&FILE_INPUT_SELECTOR)?
        );
        self.eval(&script).await
    }

    async fn upload_files(&mut self, paths: &[PathBuf]) -> SessionResult<()> {
        let files: Vec<String> = paths
            .iter()
            .map(|path| path.to_string_lossy().to_string())
            .collect();
        let doc = self
            .page
            .execute(GetDocumentParams::builder().depth(0).build())
            .await?;
        let root_node_id = doc.result.root.node_id;
        let query = QuerySelectorParams::new(root_node_id, FILE_INPUT_SELECTOR);
        let query_result = self.page.execute(query).await?;
        let node_id = query_result.result.node_id;

        let mut set_files = SetFileInputFilesParams::new(files);
        set_files.node_id = Some(node_id);
        self.page
            .execute(set_files)
            .await
            .map_err(|err| SessionError::Upload(format!("set file input: {err}")))?;
        Ok(())
    }

    async fn fill_by_placeholder(
        &mut self,
        placeholder: &str,
        value: &str,
    ) -> SessionResult<bool> {
        let (tag, hook) = self.next_hook("field");
        let script = format!(
            r#"(() => {{
    const wanted = {placeholder};
    const nodes = document.querySelectorAll('input[placeholder], textarea[placeholder], [data-placeholder]');
    for (const node of nodes) {{
        const p = node.getAttribute('placeholder') || node.getAttribute('data-placeholder') || '';
        if (!p.includes(wanted)) continue;
        node.setAttribute('{HOOK_ATTR}', {tag});
        return true;
    }}
    return false;
}})()"#,
            placeholder = js_value(&placeholder)?,
            tag = js_value(&tag)?,
        );
        if !self.eval::<bool>(&script).await? {
            return Ok(false);
        }
        let element = self.find_tagged(&hook).await?;
        element.click().await?;
        element.type_str(value).await?;
        Ok(true)
    }

    async fn fill_by_selector(&mut self, selector: &str, value: &str) -> SessionResult<bool> {
        let element = match self.page.find_element(selector).await {
            Ok(element) => element,
            Err(_) => return Ok(false),
        };
        element.click().await?;
        element.type_str(value).await?;
        Ok(true)
    }

    async fn click_nth(&mut self, selector: &str, index: usize) -> SessionResult<bool> {
        let (tag, hook) = self.next_hook("nth");
        let script = format!(
            r#"(() => {{
    const nodes = document.querySelectorAll({selector});
    if (nodes.length <= {index}) return false;
    nodes[{index}].setAttribute('{HOOK_ATTR}', {tag});
    return true;
}})()"#,
            selector = js_value(&selector)?,
            tag = js_value(&tag)?,
        );
        if !self.eval::<bool>(&script).await? {
            return Ok(false);
        }
        let element = self.find_tagged(&hook).await?;
        element.click().await?;
        Ok(true)
    }
}
