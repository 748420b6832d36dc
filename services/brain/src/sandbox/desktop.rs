//! Containerized Windows desktop backend.
//!
//! The container runs an agent server exposing a readiness endpoint, `/screenshot`,
//! `/step` and `/exec`. The container is long-lived, so start only waits
//! for readiness and stop only drops the handle.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::http::BackendClient;
use super::{
    CommandOutput, MouseAction, OsType, SandboxBackend, SandboxCapabilities, SandboxError,
    SandboxHandle, Snapshot,
};

const CAPABILITIES: SandboxCapabilities = SandboxCapabilities {
    can_snapshot: false,
    can_run_code: true,
    can_interact_with_browser: true,
    os_type: OsType::Windows,
};

const READY_ATTEMPTS: u32 = 5;
const READY_INTERVAL: Duration = Duration::from_secs(2);
const READY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
struct Step<'a> {
    action_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    x: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    y: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    button: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    keys: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    amount: Option<i32>,
}

impl<'a> Step<'a> {
    fn new(action_type: &'a str) -> Self {
        Self {
            action_type,
            x: None,
            y: None,
            button: None,
            text: None,
            keys: None,
            amount: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct Exec<'a> {
    code: &'a str,
    language: &'a str,
}

#[derive(Debug, Deserialize)]
struct ScreenshotReply {
    base64_image: String,
}

/// Sandbox backed by the Windows desktop container.
pub struct DesktopSandbox {
    client: BackendClient,
    ready_attempts: u32,
    ready_interval: Duration,
    handle: Mutex<Option<SandboxHandle>>,
}

impl DesktopSandbox {
    pub fn new(api_url: &str, timeout: Duration) -> Result<Self, SandboxError> {
        Ok(Self {
            client: BackendClient::new(api_url, timeout)?,
            ready_attempts: READY_ATTEMPTS,
            ready_interval: READY_INTERVAL,
            handle: Mutex::new(None),
        })
    }

    /// Overrides the readiness check schedule.
    pub fn with_readiness(mut self, attempts: u32, interval: Duration) -> Self {
        self.ready_attempts = attempts.max(1);
        self.ready_interval = interval;
        self
    }

    fn current(&self) -> Option<SandboxHandle> {
        self.handle.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_handle(&self, handle: Option<SandboxHandle>) {
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = handle;
    }

    async fn step(&self, step: &Step<'_>) -> Result<(), SandboxError> {
        if self.current().is_none() {
            return Err(SandboxError::NotStarted);
        }
        self.client
            .send("step", self.client.post("/step", step))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SandboxBackend for DesktopSandbox {
    fn kind(&self) -> &'static str {
        "desktop"
    }

    fn capabilities(&self) -> SandboxCapabilities {
        CAPABILITIES
    }

    fn handle(&self) -> Option<SandboxHandle> {
        self.current()
    }

    async fn start(&self) -> Result<SandboxHandle, SandboxError> {
        if let Some(handle) = self.current() {
            return Ok(handle);
        }

        info!(url = %self.client.base_url(), "waiting for desktop container");
        for attempt in 1..=self.ready_attempts {
            let ready = self
                .client
                .send_with_timeout("readiness", self.client.get("/probe"), READY_TIMEOUT)
                .await;
            match ready {
                Ok(_) => {
                    let handle = SandboxHandle::active(CAPABILITIES);
                    self.set_handle(Some(handle.clone()));
                    info!(attempt, "desktop container ready");
                    return Ok(handle);
                }
                Err(e) => {
                    debug!(attempt, error = %e, "desktop container not ready");
                    if attempt < self.ready_attempts {
                        tokio::time::sleep(self.ready_interval).await;
                    }
                }
            }
        }

        Err(SandboxError::Unavailable(format!(
            "no answer from {} after {} readiness checks",
            self.client.base_url(),
            self.ready_attempts
        )))
    }

    async fn stop(&self) -> Result<(), SandboxError> {
        self.set_handle(None);
        Ok(())
    }

    async fn get_screenshot(&self) -> Result<Vec<u8>, SandboxError> {
        let reply: ScreenshotReply = self
            .client
            .json("screenshot", self.client.get("/screenshot"), self.client.timeout())
            .await?;
        base64::engine::general_purpose::STANDARD
            .decode(reply.base64_image)
            .map_err(|e| SandboxError::InvalidResponse {
                op: "screenshot",
                message: e.to_string(),
            })
    }

    async fn execute_mouse_action(
        &self,
        action: MouseAction,
        x: i32,
        y: i32,
        button: &str,
    ) -> Result<(), SandboxError> {
        let step = Step {
            x: Some(x),
            y: Some(y),
            button: Some(if button.is_empty() { "left" } else { button }),
            ..Step::new(action.as_str())
        };
        self.step(&step).await
    }

    async fn execute_keyboard_action(
        &self,
        text: Option<&str>,
        keys: &[String],
    ) -> Result<(), SandboxError> {
        let step = Step {
            text,
            keys: Some(keys),
            ..Step::new("type")
        };
        self.step(&step).await
    }

    async fn scroll(&self, amount: i32) -> Result<(), SandboxError> {
        let step = Step {
            amount: Some(amount),
            ..Step::new("scroll")
        };
        self.step(&step).await
    }

    async fn run_command(&self, command: &str, timeout: Duration) -> Result<CommandOutput, SandboxError> {
        if self.current().is_none() {
            return Err(SandboxError::NotStarted);
        }
        let body = Exec {
            code: command,
            language: "python",
        };
        self.client
            .json("exec", self.client.post("/exec", &body), timeout)
            .await
    }

    async fn snapshot_state(&self, _tag: &str) -> Result<Snapshot, SandboxError> {
        Err(SandboxError::Unsupported {
            backend: "desktop",
            op: "snapshot",
        })
    }

    async fn restore_state(&self, _snapshot: &Snapshot) -> Result<bool, SandboxError> {
        Err(SandboxError::Unsupported {
            backend: "desktop",
            op: "restore",
        })
    }
}
