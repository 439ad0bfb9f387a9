use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::config::DisplaySection;
use crate::session::error::{SessionError, SessionResult};
use crate::session::retry::PollPolicy;

const X_SOCKET_DIR: &str = "/tmp/.X11-unix";

/// Headful rendering surface for pages that refuse to draw a scannable QR
/// in headless mode. Owns one Xvfb process per session.
#[derive(Debug)]
pub struct VirtualDisplay {
    number: u32,
    child: Option<Child>,
}

impl VirtualDisplay {
    /// Whether a virtual display is worth starting on this host.
    pub fn should_use(section: &DisplaySection) -> bool {
        Self::applicable(
            section.enabled,
            cfg!(target_os = "linux"),
            std::env::var_os("DISPLAY").is_some(),
        )
    }

    fn applicable(enabled: bool, on_linux: bool, has_display: bool) -> bool {
        enabled && on_linux && !has_display
    }

    /// Start Xvfb on the first free display number in the probe window.
    pub async fn launch(section: &DisplaySection) -> SessionResult<Self> {
        let mut last_error = None;
        for number in candidate_numbers(section) {
            if socket_path(number).exists() {
                debug!(display = number, "display number already in use");
                continue;
            }
            match Self::spawn_one(section, number).await {
                Ok(display) => return Ok(display),
                Err(SessionError::Display(message)) if message.contains("Xvfb not available") => {
                    return Err(SessionError::Display(message));
                }
                Err(err) => {
                    warn!(display = number, error = %err, "virtual display failed to come up");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            SessionError::Display(format!(
                "no free display number in :{}..:{}",
                section.base_number,
                section.base_number + section.probe_attempts
            ))
        }))
    }

    async fn spawn_one(section: &DisplaySection, number: u32) -> SessionResult<Self> {
        let screen = format!(
            "{}x{}x{}",
            section.width, section.height, section.color_depth
        );
        let mut child = Command::new("Xvfb")
            .arg(format!(":{number}"))
            .arg("-screen")
            .arg("0")
            .arg(&screen)
            .arg("-nolisten")
            .arg("tcp")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    SessionError::Display(format!("Xvfb not available: {err}"))
                } else {
                    SessionError::Display(format!("Xvfb spawn failed: {err}"))
                }
            })?;

        let socket = socket_path(number);
        let policy = PollPolicy::new(Duration::from_secs(5), Duration::from_millis(100));
        let waited = policy
            .run("x display socket", &mut child, |child| {
                let socket = socket.clone();
                Box::pin(async move {
                    if let Some(status) = child
                        .try_wait()
                        .map_err(|err| SessionError::Display(format!("Xvfb wait: {err}")))?
                    {
                        return Err(SessionError::Display(format!(
                            "Xvfb exited early with {status}"
                        )));
                    }
                    Ok(socket.exists().then_some(()))
                })
            })
            .await;

        match waited {
            Ok(()) => {
                debug!(display = number, screen = %screen, "virtual display ready");
                Ok(Self {
                    number,
                    child: Some(child),
                })
            }
            Err(err) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(err)
            }
        }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    /// Value for the DISPLAY environment and the chromium `--display` flag.
    pub fn display_name(&self) -> String {
        format!(":{}", self.number)
    }

    pub fn chromium_arg(&self) -> String {
        format!("--display=:{}", self.number)
    }

    pub async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.kill().await {
                warn!(display = self.number, error = %err, "failed to stop virtual display");
            }
        }
    }
}

impl Drop for VirtualDisplay {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

fn socket_path(number: u32) -> PathBuf {
    PathBuf::from(X_SOCKET_DIR).join(format!("X{number}"))
}

fn candidate_numbers(section: &DisplaySection) -> std::ops::Range<u32> {
    section.base_number..section.base_number + section.probe_attempts
}
