//! Linux micro-VM backend.
//!
//! Talks to the micro-VM manager's REST API. Input goes through `xdotool`
//! inside the guest and screenshots through a helper listening in the guest
//! on port 8000. Snapshots are taken by the manager; restoring destroys the
//! VM and boots it again from the snapshot.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::http::BackendClient;
use super::{
    CommandOutput, MouseAction, OsType, SandboxBackend, SandboxCapabilities, SandboxError,
    SandboxHandle, Snapshot,
};

const CAPABILITIES: SandboxCapabilities = SandboxCapabilities {
    can_snapshot: true,
    can_run_code: true,
    can_interact_with_browser: true,
    os_type: OsType::Linux,
};

const SCREENSHOT_COMMAND: &str = "curl -s http://localhost:8000/screenshot_b64";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateVm<'a> {
    vm_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshot_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct RunCommand<'a> {
    cmd: &'a str,
}

#[derive(Debug, Deserialize)]
struct CommandReply {
    #[serde(default)]
    output: String,
    #[serde(default)]
    error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSnapshot<'a> {
    snapshot_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotReply {
    snapshot_id: String,
}

/// Sandbox backed by a Linux micro-VM.
pub struct MicroVmSandbox {
    client: BackendClient,
    vm_name: String,
    handle: Mutex<Option<SandboxHandle>>,
}

impl MicroVmSandbox {
    pub fn new(manager_url: &str, vm_name: &str, timeout: Duration) -> Result<Self, SandboxError> {
        Ok(Self {
            client: BackendClient::new(manager_url, timeout)?,
            vm_name: vm_name.to_string(),
            handle: Mutex::new(None),
        })
    }

    pub fn vm_name(&self) -> &str {
        &self.vm_name
    }

    fn current(&self) -> Option<SandboxHandle> {
        self.handle.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn require_started(&self) -> Result<SandboxHandle, SandboxError> {
        self.current().ok_or(SandboxError::NotStarted)
    }

    fn set_handle(&self, handle: Option<SandboxHandle>) {
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = handle;
    }

    async fn create_vm(&self, snapshot_id: Option<&str>) -> Result<(), SandboxError> {
        let body = CreateVm {
            vm_name: &self.vm_name,
            snapshot_id,
        };
        self.client
            .send("create_vm", self.client.post("/v1/vms", &body))
            .await?;
        Ok(())
    }

    async fn destroy_vm(&self) -> Result<(), SandboxError> {
        let path = format!("/v1/vms/{}", self.vm_name);
        match self.client.send("destroy_vm", self.client.delete(&path)).await {
            Ok(_) => Ok(()),
            Err(SandboxError::Backend { status: 404, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Runs a guest command and fails unless it exits cleanly.
    async fn guest(&self, command: &str) -> Result<CommandOutput, SandboxError> {
        let output = self.run_command(command, self.client.timeout()).await?;
        if !output.success() {
            return Err(SandboxError::CommandFailed {
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }
}

/// `xdotool` button number for a button name.
fn xdotool_button(button: &str) -> Result<u8, SandboxError> {
    match button {
        "" | "left" => Ok(1),
        "middle" => Ok(2),
        "right" => Ok(3),
        other => Err(SandboxError::InvalidRequest(format!("unknown mouse button: {other}"))),
    }
}

/// Quotes `text` for a POSIX shell.
fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

pub(crate) fn mouse_command(action: MouseAction, x: i32, y: i32, button: &str) -> Result<String, SandboxError> {
    let button = xdotool_button(button)?;
    Ok(match action {
        MouseAction::Click => format!("xdotool mousemove {x} {y} click {button}"),
        MouseAction::DoubleClick => format!("xdotool mousemove {x} {y} click --repeat 2 {button}"),
        MouseAction::Move => format!("xdotool mousemove {x} {y}"),
    })
}

pub(crate) fn scroll_command(amount: i32) -> String {
    // Buttons 4 and 5 are wheel up and wheel down.
    let button = if amount >= 0 { 4 } else { 5 };
    format!("xdotool click --repeat {} {button}", amount.unsigned_abs().max(1))
}

#[async_trait]
impl SandboxBackend for MicroVmSandbox {
    fn kind(&self) -> &'static str {
        "microvm"
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

        info!(manager = %self.client.base_url(), vm = %self.vm_name, "starting micro-VM");
        self.create_vm(None).await?;

        let handle = SandboxHandle::active(CAPABILITIES);
        self.set_handle(Some(handle.clone()));
        Ok(handle)
    }

    async fn stop(&self) -> Result<(), SandboxError> {
        if self.current().is_none() {
            return Ok(());
        }
        self.destroy_vm().await?;
        self.set_handle(None);
        info!(vm = %self.vm_name, "micro-VM destroyed");
        Ok(())
    }

    async fn get_screenshot(&self) -> Result<Vec<u8>, SandboxError> {
        let output = self.guest(SCREENSHOT_COMMAND).await?;
        base64::engine::general_purpose::STANDARD
            .decode(output.stdout.trim())
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
        self.guest(&mouse_command(action, x, y, button)?).await?;
        Ok(())
    }

    async fn execute_keyboard_action(
        &self,
        text: Option<&str>,
        keys: &[String],
    ) -> Result<(), SandboxError> {
        if let Some(text) = text.filter(|t| !t.is_empty()) {
            self.guest(&format!("xdotool type -- {}", shell_quote(text)))
                .await?;
        }
        for key in keys {
            self.guest(&format!("xdotool key -- {}", shell_quote(key)))
                .await?;
        }
        Ok(())
    }

    async fn scroll(&self, amount: i32) -> Result<(), SandboxError> {
        self.guest(&scroll_command(amount)).await?;
        Ok(())
    }

    async fn run_command(&self, command: &str, timeout: Duration) -> Result<CommandOutput, SandboxError> {
        self.require_started()?;
        let preview: String = command.chars().take(50).collect();
        debug!(vm = %self.vm_name, command = %preview, "guest command");

        let path = format!("/v1/vms/{}/cmd", self.vm_name);
        let reply: CommandReply = self
            .client
            .json("run_command", self.client.post(&path, &RunCommand { cmd: command }), timeout)
            .await?;

        let exit_code = if reply.error.is_empty() { 0 } else { 1 };
        Ok(CommandOutput {
            stdout: reply.output,
            stderr: reply.error,
            exit_code,
        })
    }

    async fn snapshot_state(&self, tag: &str) -> Result<Snapshot, SandboxError> {
        let handle = self.require_started()?;
        info!(vm = %self.vm_name, tag = %tag, "snapshotting micro-VM");

        let path = format!("/v1/vms/{}/snapshots", self.vm_name);
        let reply: SnapshotReply = self
            .client
            .json(
                "snapshot",
                self.client.post(&path, &CreateSnapshot { snapshot_id: tag }),
                self.client.timeout(),
            )
            .await?;

        Ok(Snapshot {
            id: reply.snapshot_id,
            sandbox_id: handle.id,
            tag: tag.to_string(),
        })
    }

    async fn restore_state(&self, snapshot: &Snapshot) -> Result<bool, SandboxError> {
        let handle = self.require_started()?;
        if snapshot.sandbox_id != handle.id {
            return Err(SandboxError::ForeignSnapshot {
                snapshot: snapshot.id.clone(),
            });
        }

        warn!(vm = %self.vm_name, snapshot = %snapshot.id, "rolling micro-VM back to snapshot");
        self.destroy_vm().await?;
        if let Err(e) = self.create_vm(Some(&snapshot.id)).await {
            // The old VM is gone and the new one did not come up.
            self.set_handle(None);
            return Err(e);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mouse_commands() {
        assert_eq!(
            mouse_command(MouseAction::Click, 10, 20, "left").unwrap(),
            "xdotool mousemove 10 20 click 1"
        );
        assert_eq!(
            mouse_command(MouseAction::DoubleClick, 1, 2, "right").unwrap(),
            "xdotool mousemove 1 2 click --repeat 2 3"
        );
        assert_eq!(mouse_command(MouseAction::Move, 5, 6, "").unwrap(), "xdotool mousemove 5 6");
        assert!(mouse_command(MouseAction::Click, 0, 0, "thumb").is_err());
    }

    #[test]
    fn test_scroll_direction() {
        assert_eq!(scroll_command(3), "xdotool click --repeat 3 4");
        assert_eq!(scroll_command(-2), "xdotool click --repeat 2 5");
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[tokio::test]
    async fn test_commands_require_start() {
        let sandbox = MicroVmSandbox::new("http://127.0.0.1:1", "vm", Duration::from_millis(50)).unwrap();
        let err = sandbox.run_command("true", Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err, SandboxError::NotStarted);
    }
}
