//! Sandbox abstraction.
//!
//! A sandbox is an environment the agent acts on. Three backends share one
//! contract:
//!
//! | Backend | Target | Snapshots | Code execution |
//! |---------|--------|-----------|----------------|
//! | [`MicroVmSandbox`] | Linux micro-VM manager | yes | yes |
//! | [`DesktopSandbox`] | containerized Windows desktop | no | yes |
//! | [`BridgeSandbox`] | physical Windows host | no | no |
//!
//! Callers check [`SandboxCapabilities`] before asking for a snapshot;
//! backends without snapshot support return [`SandboxError::Unsupported`].

mod bridge;
mod desktop;
mod error;
mod http;
mod microvm;
mod mock;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bravebird_id::SandboxId;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use bridge::BridgeSandbox;
pub use desktop::DesktopSandbox;
pub use error::SandboxError;
pub use microvm::MicroVmSandbox;
pub use mock::{MockCall, MockSandbox};

use crate::config::Config;

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    Linux,
    Windows,
}

/// What a backend can do. Fixed per backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxCapabilities {
    pub can_snapshot: bool,
    pub can_run_code: bool,
    pub can_interact_with_browser: bool,
    pub os_type: OsType,
}

/// The active session of a started backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    pub id: SandboxId,
    pub capabilities: SandboxCapabilities,
    pub is_active: bool,
}

impl SandboxHandle {
    pub(crate) fn active(capabilities: SandboxCapabilities) -> Self {
        Self {
            id: SandboxId::new(),
            capabilities,
            is_active: true,
        }
    }
}

/// A checkpoint a snapshot-capable backend can roll back to.
///
/// Only valid on the sandbox that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Backend-assigned identifier.
    pub id: String,
    pub sandbox_id: SandboxId,
    pub tag: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseAction {
    Click,
    DoubleClick,
    Move,
}

impl MouseAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MouseAction::Click => "click",
            MouseAction::DoubleClick => "double_click",
            MouseAction::Move => "move",
        }
    }
}

/// Result of a command run inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandOutput {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

// =============================================================================
// Backend Trait
// =============================================================================

/// Operations every sandbox backend provides.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Short backend name for logging.
    fn kind(&self) -> &'static str;

    fn capabilities(&self) -> SandboxCapabilities;

    /// The active handle, if started.
    fn handle(&self) -> Option<SandboxHandle>;

    /// Brings the sandbox up and returns its handle.
    async fn start(&self) -> Result<SandboxHandle, SandboxError>;

    /// Tears the sandbox down and drops its handle.
    async fn stop(&self) -> Result<(), SandboxError>;

    /// Current screen as an encoded image.
    async fn get_screenshot(&self) -> Result<Vec<u8>, SandboxError>;

    async fn execute_mouse_action(
        &self,
        action: MouseAction,
        x: i32,
        y: i32,
        button: &str,
    ) -> Result<(), SandboxError>;

    /// Types `text` (if any), then presses each of `keys` in order.
    async fn execute_keyboard_action(
        &self,
        text: Option<&str>,
        keys: &[String],
    ) -> Result<(), SandboxError>;

    /// Scrolls by `amount` notches; positive scrolls up.
    async fn scroll(&self, amount: i32) -> Result<(), SandboxError>;

    async fn run_command(&self, command: &str, timeout: Duration) -> Result<CommandOutput, SandboxError>;

    async fn snapshot_state(&self, tag: &str) -> Result<Snapshot, SandboxError>;

    /// Rolls back to `snapshot`. Returns whether the sandbox is now at it.
    async fn restore_state(&self, snapshot: &Snapshot) -> Result<bool, SandboxError>;
}

// =============================================================================
// Sandbox Variants
// =============================================================================

/// The concrete backends.
pub enum Sandbox {
    MicroVm(MicroVmSandbox),
    Desktop(DesktopSandbox),
    Bridge(BridgeSandbox),
}

// Async methods bind `self` to a local first so the macro never sees the
// receiver keyword inside `async_trait`'s rewritten body.
macro_rules! dispatch {
    ($self:ident, $sandbox:ident => $call:expr) => {
        match $self {
            Sandbox::MicroVm($sandbox) => $call,
            Sandbox::Desktop($sandbox) => $call,
            Sandbox::Bridge($sandbox) => $call,
        }
    };
}

#[async_trait]
impl SandboxBackend for Sandbox {
    fn kind(&self) -> &'static str {
        dispatch!(self, s => s.kind())
    }

    fn capabilities(&self) -> SandboxCapabilities {
        dispatch!(self, s => s.capabilities())
    }

    fn handle(&self) -> Option<SandboxHandle> {
        dispatch!(self, s => s.handle())
    }

    async fn start(&self) -> Result<SandboxHandle, SandboxError> {
        let sandbox = self;
        dispatch!(sandbox, s => s.start().await)
    }

    async fn stop(&self) -> Result<(), SandboxError> {
        let sandbox = self;
        dispatch!(sandbox, s => s.stop().await)
    }

    async fn get_screenshot(&self) -> Result<Vec<u8>, SandboxError> {
        let sandbox = self;
        dispatch!(sandbox, s => s.get_screenshot().await)
    }

    async fn execute_mouse_action(
        &self,
        action: MouseAction,
        x: i32,
        y: i32,
        button: &str,
    ) -> Result<(), SandboxError> {
        let sandbox = self;
        dispatch!(sandbox, s => s.execute_mouse_action(action, x, y, button).await)
    }

    async fn execute_keyboard_action(
        &self,
        text: Option<&str>,
        keys: &[String],
    ) -> Result<(), SandboxError> {
        let sandbox = self;
        dispatch!(sandbox, s => s.execute_keyboard_action(text, keys).await)
    }

    async fn scroll(&self, amount: i32) -> Result<(), SandboxError> {
        let sandbox = self;
        dispatch!(sandbox, s => s.scroll(amount).await)
    }

    async fn run_command(&self, command: &str, timeout: Duration) -> Result<CommandOutput, SandboxError> {
        let sandbox = self;
        dispatch!(sandbox, s => s.run_command(command, timeout).await)
    }

    async fn snapshot_state(&self, tag: &str) -> Result<Snapshot, SandboxError> {
        let sandbox = self;
        dispatch!(sandbox, s => s.snapshot_state(tag).await)
    }

    async fn restore_state(&self, snapshot: &Snapshot) -> Result<bool, SandboxError> {
        let sandbox = self;
        dispatch!(sandbox, s => s.restore_state(snapshot).await)
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Target key for the Linux micro-VM.
pub const TARGET_LINUX: &str = "linux";
/// Target key for the physical Windows host.
pub const TARGET_WINDOWS: &str = "windows";
/// Target key for the containerized Windows desktop.
pub const TARGET_WINDOWS_DESKTOP: &str = "windows_desktop";

/// Maps target OS keys to backends.
pub struct SandboxRegistry {
    backends: HashMap<String, Arc<dyn SandboxBackend>>,
    default_target: String,
}

impl SandboxRegistry {
    pub fn new(default_target: impl Into<String>) -> Self {
        Self {
            backends: HashMap::new(),
            default_target: default_target.into(),
        }
    }

    /// The standard backends: micro-VM, host bridge and desktop container.
    pub fn from_config(config: &Config) -> Result<Self, SandboxError> {
        let timeout = config.sandbox_timeout();
        let mut registry = Self::new(config.default_target_os.clone());

        registry.insert(
            TARGET_LINUX,
            Arc::new(Sandbox::MicroVm(MicroVmSandbox::new(
                &config.arrakis_url,
                &config.arrakis_default_image,
                timeout,
            )?)),
        );
        registry.insert(
            TARGET_WINDOWS,
            Arc::new(Sandbox::Bridge(BridgeSandbox::new(&config.windows_bridge_url, timeout)?)),
        );
        registry.insert(
            TARGET_WINDOWS_DESKTOP,
            Arc::new(Sandbox::Desktop(DesktopSandbox::new(&config.omnibox_url(), timeout)?)),
        );

        Ok(registry)
    }

    pub fn insert(&mut self, target: impl Into<String>, backend: Arc<dyn SandboxBackend>) {
        self.backends.insert(target.into(), backend);
    }

    pub fn get(&self, target: &str) -> Option<Arc<dyn SandboxBackend>> {
        self.backends.get(target).cloned()
    }

    /// Resolves a request's target; empty means the default target.
    pub fn resolve(&self, target: &str) -> Option<(String, Arc<dyn SandboxBackend>)> {
        let key = if target.is_empty() {
            self.default_target.as_str()
        } else {
            target
        };
        self.get(key).map(|backend| (key.to_string(), backend))
    }

    pub fn targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.backends.keys().cloned().collect();
        targets.sort();
        targets
    }

    /// Starts every backend. Failures are logged; the backend stays inactive
    /// and requests against it fail with [`SandboxError::NotStarted`].
    pub async fn start_all(&self) -> usize {
        let mut started = 0;
        for (target, backend) in &self.backends {
            match backend.start().await {
                Ok(handle) => {
                    info!(target = %target, backend = backend.kind(), sandbox_id = %handle.id, "sandbox started");
                    started += 1;
                }
                Err(e) => {
                    warn!(target = %target, backend = backend.kind(), error = %e, "sandbox failed to start");
                }
            }
        }
        started
    }

    pub async fn stop_all(&self) {
        for (target, backend) in &self.backends {
            if backend.handle().is_none() {
                continue;
            }
            if let Err(e) = backend.stop().await {
                warn!(target = %target, backend = backend.kind(), error = %e, "sandbox failed to stop");
            }
        }
    }
}
