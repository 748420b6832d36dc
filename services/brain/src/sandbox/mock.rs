//! Mock sandbox for testing and development.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::{
    CommandOutput, MouseAction, OsType, SandboxBackend, SandboxCapabilities, SandboxError,
    SandboxHandle, Snapshot,
};

/// A call the mock received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Start,
    Stop,
    Screenshot,
    Mouse { action: MouseAction, x: i32, y: i32 },
    Keyboard { text: Option<String>, keys: Vec<String> },
    Scroll(i32),
    Command(String),
    Snapshot(String),
    Restore(String),
}

/// Sandbox that records calls and fails on demand.
pub struct MockSandbox {
    capabilities: SandboxCapabilities,
    fail_start: bool,
    fail_actions: Mutex<Option<String>>,
    fail_restore: bool,
    handle: Mutex<Option<SandboxHandle>>,
    calls: Mutex<Vec<MockCall>>,
    snapshots: Mutex<u32>,
}

impl MockSandbox {
    pub fn new(capabilities: SandboxCapabilities) -> Self {
        Self {
            capabilities,
            fail_start: false,
            fail_actions: Mutex::new(None),
            fail_restore: false,
            handle: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            snapshots: Mutex::new(0),
        }
    }

    /// A Linux sandbox with snapshots.
    pub fn snapshotting() -> Self {
        Self::new(SandboxCapabilities {
            can_snapshot: true,
            can_run_code: true,
            can_interact_with_browser: true,
            os_type: OsType::Linux,
        })
    }

    /// A Windows sandbox without snapshots or code execution.
    pub fn without_snapshots() -> Self {
        Self::new(SandboxCapabilities {
            can_snapshot: false,
            can_run_code: false,
            can_interact_with_browser: true,
            os_type: OsType::Windows,
        })
    }

    /// A sandbox whose `start` always fails.
    pub fn failing_start() -> Self {
        Self {
            fail_start: true,
            ..Self::snapshotting()
        }
    }

    /// Makes every input action and command fail with `message`.
    pub fn fail_actions_with(self, message: impl Into<String>) -> Self {
        *self.fail_actions.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.into());
        self
    }

    /// Makes `restore_state` fail.
    pub fn failing_restore(mut self) -> Self {
        self.fail_restore = true;
        self
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn snapshot_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::Snapshot(tag) => Some(tag),
                _ => None,
            })
            .collect()
    }

    pub fn restore_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::Restore(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(call);
    }

    fn current(&self) -> Option<SandboxHandle> {
        self.handle.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn act(&self) -> Result<(), SandboxError> {
        if self.current().is_none() {
            return Err(SandboxError::NotStarted);
        }
        match self.fail_actions.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(message) => Err(SandboxError::Backend {
                op: "mock",
                status: 500,
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    fn require_snapshots(&self, op: &'static str) -> Result<(), SandboxError> {
        if self.capabilities.can_snapshot {
            Ok(())
        } else {
            Err(SandboxError::Unsupported { backend: "mock", op })
        }
    }
}

impl Default for MockSandbox {
    fn default() -> Self {
        Self::snapshotting()
    }
}

#[async_trait]
impl SandboxBackend for MockSandbox {
    fn kind(&self) -> &'static str {
        "mock"
    }

    fn capabilities(&self) -> SandboxCapabilities {
        self.capabilities
    }

    fn handle(&self) -> Option<SandboxHandle> {
        self.current()
    }

    async fn start(&self) -> Result<SandboxHandle, SandboxError> {
        self.record(MockCall::Start);
        if self.fail_start {
            return Err(SandboxError::Unavailable("mock configured to fail".to_string()));
        }
        if let Some(handle) = self.current() {
            return Ok(handle);
        }

        let handle = SandboxHandle::active(self.capabilities);
        info!(sandbox_id = %handle.id, "[MOCK] sandbox started");
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle.clone());
        Ok(handle)
    }

    async fn stop(&self) -> Result<(), SandboxError> {
        self.record(MockCall::Stop);
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }

    async fn get_screenshot(&self) -> Result<Vec<u8>, SandboxError> {
        self.record(MockCall::Screenshot);
        self.act()?;
        Ok(vec![0xFF, 0xD8, 0xFF])
    }

    async fn execute_mouse_action(
        &self,
        action: MouseAction,
        x: i32,
        y: i32,
        _button: &str,
    ) -> Result<(), SandboxError> {
        self.record(MockCall::Mouse { action, x, y });
        self.act()
    }

    async fn execute_keyboard_action(
        &self,
        text: Option<&str>,
        keys: &[String],
    ) -> Result<(), SandboxError> {
        self.record(MockCall::Keyboard {
            text: text.map(str::to_string),
            keys: keys.to_vec(),
        });
        self.act()
    }

    async fn scroll(&self, amount: i32) -> Result<(), SandboxError> {
        self.record(MockCall::Scroll(amount));
        self.act()
    }

    async fn run_command(&self, command: &str, _timeout: Duration) -> Result<CommandOutput, SandboxError> {
        self.record(MockCall::Command(command.to_string()));
        self.act()?;
        Ok(CommandOutput {
            stdout: format!("ran {command}"),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    async fn snapshot_state(&self, tag: &str) -> Result<Snapshot, SandboxError> {
        self.record(MockCall::Snapshot(tag.to_string()));
        self.require_snapshots("snapshot")?;
        let handle = self.current().ok_or(SandboxError::NotStarted)?;

        let mut count = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        *count += 1;
        Ok(Snapshot {
            id: format!("snap_{:04}", *count),
            sandbox_id: handle.id,
            tag: tag.to_string(),
        })
    }

    async fn restore_state(&self, snapshot: &Snapshot) -> Result<bool, SandboxError> {
        self.record(MockCall::Restore(snapshot.id.clone()));
        self.require_snapshots("restore")?;
        if self.fail_restore {
            return Err(SandboxError::Backend {
                op: "restore",
                status: 500,
                message: "mock restore failure".to_string(),
            });
        }
        Ok(true)
    }
}
