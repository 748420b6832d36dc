//! Physical Windows host backend.
//!
//! Drives the command receiver running on the host (`GET /status`,
//! `POST /action`, `GET /screenshot`). Arbitrary code execution on the host
//! is refused.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::http::BackendClient;
use super::{
    CommandOutput, MouseAction, OsType, SandboxBackend, SandboxCapabilities, SandboxError,
    SandboxHandle, Snapshot,
};

const CAPABILITIES: SandboxCapabilities = SandboxCapabilities {
    can_snapshot: false,
    can_run_code: false,
    can_interact_with_browser: true,
    os_type: OsType::Windows,
};

/// Body of `POST /action`.
#[derive(Debug, Serialize)]
struct BridgeAction<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    x: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    y: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    button: Option<&'a str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    double: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    keys: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    amount: Option<i32>,
}

impl<'a> BridgeAction<'a> {
    fn new(kind: &'a str) -> Self {
        Self {
            kind,
            x: None,
            y: None,
            button: None,
            double: false,
            text: None,
            keys: None,
            amount: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ActionReply {
    status: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct StatusReply {
    status: String,
    #[serde(default)]
    resolution: Vec<u32>,
}

/// Sandbox backed by the host's command receiver.
pub struct BridgeSandbox {
    client: BackendClient,
    handle: Mutex<Option<SandboxHandle>>,
}

impl BridgeSandbox {
    pub fn new(bridge_url: &str, timeout: Duration) -> Result<Self, SandboxError> {
        Ok(Self {
            client: BackendClient::new(bridge_url, timeout)?,
            handle: Mutex::new(None),
        })
    }

    fn current(&self) -> Option<SandboxHandle> {
        self.handle.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_handle(&self, handle: Option<SandboxHandle>) {
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = handle;
    }

    async fn post_action(&self, action: &BridgeAction<'_>) -> Result<(), SandboxError> {
        if self.current().is_none() {
            return Err(SandboxError::NotStarted);
        }

        let reply: ActionReply = self
            .client
            .json("action", self.client.post("/action", action), self.client.timeout())
            .await?;

        if reply.status != "success" {
            return Err(SandboxError::Backend {
                op: "action",
                status: 200,
                message: reply.message,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxBackend for BridgeSandbox {
    fn kind(&self) -> &'static str {
        "bridge"
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

        let status: StatusReply = self
            .client
            .json("status", self.client.get("/status"), self.client.timeout())
            .await?;
        if status.status != "online" {
            return Err(SandboxError::Unavailable(format!(
                "host reports status {:?}",
                status.status
            )));
        }

        info!(url = %self.client.base_url(), resolution = ?status.resolution, "host bridge online");
        let handle = SandboxHandle::active(CAPABILITIES);
        self.set_handle(Some(handle.clone()));
        Ok(handle)
    }

    async fn stop(&self) -> Result<(), SandboxError> {
        self.set_handle(None);
        Ok(())
    }

    async fn get_screenshot(&self) -> Result<Vec<u8>, SandboxError> {
        if self.current().is_none() {
            return Err(SandboxError::NotStarted);
        }
        let response = self
            .client
            .send("screenshot", self.client.get("/screenshot"))
            .await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| SandboxError::from_reqwest("screenshot", self.client.timeout(), e))?;
        Ok(bytes.to_vec())
    }

    async fn execute_mouse_action(
        &self,
        action: MouseAction,
        x: i32,
        y: i32,
        button: &str,
    ) -> Result<(), SandboxError> {
        let double = match action {
            MouseAction::Click => false,
            MouseAction::DoubleClick => true,
            MouseAction::Move => {
                return Err(SandboxError::Unsupported {
                    backend: "bridge",
                    op: "move",
                })
            }
        };

        let body = BridgeAction {
            x: Some(x),
            y: Some(y),
            button: Some(if button.is_empty() { "left" } else { button }),
            double,
            ..BridgeAction::new("click")
        };
        self.post_action(&body).await
    }

    async fn execute_keyboard_action(
        &self,
        text: Option<&str>,
        keys: &[String],
    ) -> Result<(), SandboxError> {
        let body = BridgeAction {
            text,
            keys: Some(keys),
            ..BridgeAction::new("type")
        };
        self.post_action(&body).await
    }

    async fn scroll(&self, amount: i32) -> Result<(), SandboxError> {
        let body = BridgeAction {
            amount: Some(amount),
            ..BridgeAction::new("scroll")
        };
        self.post_action(&body).await
    }

    async fn run_command(&self, _command: &str, _timeout: Duration) -> Result<CommandOutput, SandboxError> {
        error!("code execution on the host is blocked");
        Err(SandboxError::Unsupported {
            backend: "bridge",
            op: "run_command",
        })
    }

    async fn snapshot_state(&self, _tag: &str) -> Result<Snapshot, SandboxError> {
        Err(SandboxError::Unsupported {
            backend: "bridge",
            op: "snapshot",
        })
    }

    async fn restore_state(&self, _snapshot: &Snapshot) -> Result<bool, SandboxError> {
        Err(SandboxError::Unsupported {
            backend: "bridge",
            op: "restore",
        })
    }
}
