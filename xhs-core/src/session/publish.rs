use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::PublishSection;
use crate::session::driver::{CookieSet, PageDriver};
use crate::session::error::{SessionError, SessionResult};
use crate::session::media::StagedMedia;
use crate::session::retry::PollPolicy;

const INPUT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const UPLOAD_POLL_INTERVAL: Duration = Duration::from_secs(2);
const POST_SUBMIT_SETTLE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishKind {
    Video,
    Images,
}

/// One submission to the creator publish form. Files are staging copies owned
/// by the pipeline; they are removed once the flow finishes either way.
#[derive(Debug, Clone)]
pub struct PublishTask {
    pub kind: PublishKind,
    pub files: Vec<PathBuf>,
    pub title: String,
    pub description: String,
}

/// What happened, plus an error screenshot when the flow died on-page.
#[derive(Debug)]
pub struct PublishOutcome {
    pub result: SessionResult<()>,
    pub error_screenshot: Option<Vec<u8>>,
}

impl PublishOutcome {
    pub fn ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Drive the whole publish form: restore the session from cookies, pick the
/// right composer tab, upload, fill metadata and submit. Staged files are
/// deleted before returning, success, failure or cancellation.
pub async fn run_publish(
    page: &mut dyn PageDriver,
    cfg: &PublishSection,
    login_fragment: &str,
    cookies: &CookieSet,
    task: &PublishTask,
) -> PublishOutcome {
    let staged = StagedMedia::from_paths(task.files.clone());
    let result = publish_steps(page, cfg, login_fragment, cookies, task).await;

    let error_screenshot = if result.is_err() {
        match page.viewport_screenshot().await {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!(error = %err, "could not capture failure screenshot");
                None
            }
        }
    } else {
        None
    };

    staged.cleanup();

    PublishOutcome {
        result,
        error_screenshot,
    }
}

async fn publish_steps(
    page: &mut dyn PageDriver,
    cfg: &PublishSection,
    login_fragment: &str,
    cookies: &CookieSet,
    task: &PublishTask,
) -> SessionResult<()> {
    validate_task(task)?;

    if cookies.is_empty() {
        return Err(SessionError::SessionExpired);
    }

    // Cookies only stick once their origin is loaded.
    page.navigate(&cfg.base_url).await?;
    let injected = page.inject_cookies(cookies).await?;
    if injected == 0 {
        return Err(SessionError::SessionExpired);
    }
    debug!(injected, "session cookies restored");

    page.navigate(&cfg.publish_url).await?;
    let url = page.current_url().await?;
    if url.contains(login_fragment) {
        return Err(SessionError::SessionExpired);
    }

    if task.kind == PublishKind::Images {
        select_image_tab(page, cfg).await?;
    }

    wait_for_file_input(page, cfg).await?;
    page.upload_files(&task.files).await?;

    match task.kind {
        PublishKind::Video => wait_for_video_processing(page, cfg).await?,
        PublishKind::Images => tokio::time::sleep(cfg.image_settle()).await,
    }

    if !page.fill_by_placeholder(&cfg.title_placeholder, &task.title).await? {
        warn!("title field not found, leaving it for manual edit");
    }
    if !task.description.is_empty()
        && !page
            .fill_by_selector(&cfg.description_selector, &task.description)
            .await?
    {
        warn!("description editor not found, leaving it for manual edit");
    }

    if !page.click_text(&cfg.submit_text).await? {
        return Err(SessionError::SubmitMissing);
    }
    tokio::time::sleep(POST_SUBMIT_SETTLE).await;
    info!(kind = ?task.kind, files = task.files.len(), "publish form submitted");
    Ok(())
}

fn validate_task(task: &PublishTask) -> SessionResult<()> {
    if task.files.is_empty() {
        return Err(SessionError::Upload("no media files to publish".to_string()));
    }
    if task.kind == PublishKind::Video && task.files.len() != 1 {
        return Err(SessionError::Upload(format!(
            "video posts take exactly one file, got {}",
            task.files.len()
        )));
    }
    Ok(())
}

async fn select_image_tab(page: &mut dyn PageDriver, cfg: &PublishSection) -> SessionResult<()> {
    if page.click_text(&cfg.image_tab_text).await? {
        return Ok(());
    }
    debug!(text = %cfg.image_tab_text, "image tab text not clickable, trying indexed tab");
    if page
        .click_nth(&cfg.tab_item_selector, cfg.tab_fallback_index)
        .await?
    {
        return Ok(());
    }
    warn!("image composer tab not found, continuing on the current tab");
    Ok(())
}

async fn wait_for_file_input(page: &mut dyn PageDriver, cfg: &PublishSection) -> SessionResult<()> {
    let policy = PollPolicy::new(cfg.file_input_wait(), INPUT_POLL_INTERVAL);
    policy
        .run("upload input", page, |page| {
            Box::pin(async move { Ok(page.file_input_present().await?.then_some(())) })
        })
        .await
        .map_err(|err| match err {
            SessionError::Timeout(_) => SessionError::UploadInputMissing,
            other => other,
        })
}

async fn wait_for_video_processing(
    page: &mut dyn PageDriver,
    cfg: &PublishSection,
) -> SessionResult<()> {
    let policy = PollPolicy::new(cfg.video_upload_timeout(), UPLOAD_POLL_INTERVAL);
    let marker = cfg.video_complete_text.clone();
    policy
        .run("upload completion", page, move |page| {
            let marker = marker.clone();
            Box::pin(async move { Ok(page.has_text(&marker).await?.then_some(())) })
        })
        .await
        .map_err(|err| match err {
            SessionError::Timeout(_) => {
                SessionError::Upload("video processing did not finish in time".to_string())
            }
            other => other,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_tasks_take_exactly_one_file() {
        let task = PublishTask {
            kind: PublishKind::Video,
            files: vec![PathBuf::from("a.mp4"), PathBuf::from("b.mp4")],
            title: "t".into(),
            description: String::new(),
        };
        assert!(matches!(
            validate_task(&task),
            Err(SessionError::Upload(_))
        ));
    }

    #[test]
    fn empty_file_lists_are_rejected() {
        let task = PublishTask {
            kind: PublishKind::Images,
            files: Vec::new(),
            title: "t".into(),
            description: String::new(),
        };
        assert!(validate_task(&task).is_err());
    }
}
