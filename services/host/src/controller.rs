//! Input controller: the host's hands.
//!
//! The command receiver forwards every action to an [`InputController`].
//! Hooking real OS input is platform specific and lives outside this crate;
//! [`DryRunController`] logs and records what it was asked to do.

use std::fmt;
use std::sync::Mutex;

use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ControllerError {
    /// The OS refused or failed the input.
    #[error("input failed: {0}")]
    Input(String),

    /// The request cannot be performed as given.
    #[error("invalid input: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

impl MouseButton {
    pub fn parse(name: &str) -> Result<Self, ControllerError> {
        match name {
            "" | "left" => Ok(MouseButton::Left),
            "right" => Ok(MouseButton::Right),
            "middle" => Ok(MouseButton::Middle),
            other => Err(ControllerError::Invalid(format!("unknown mouse button: {other}"))),
        }
    }
}

impl fmt::Display for MouseButton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MouseButton::Left => "left",
            MouseButton::Right => "right",
            MouseButton::Middle => "middle",
        };
        f.write_str(s)
    }
}

/// Drives the host's mouse and keyboard. Calls block until the input has
/// been delivered.
pub trait InputController: Send + Sync + 'static {
    /// Screen size in pixels.
    fn screen_size(&self) -> (u32, u32);

    fn click(&self, x: u32, y: u32, button: MouseButton, double: bool) -> Result<(), ControllerError>;

    /// Types `text`, then presses `keys` together as one chord.
    fn type_text(&self, text: Option<&str>, keys: &[String]) -> Result<(), ControllerError>;

    /// Positive scrolls up.
    fn scroll(&self, amount: i32) -> Result<(), ControllerError>;
}

/// Clamps a point to the screen.
pub fn clamp_to_screen(x: i64, y: i64, (width, height): (u32, u32)) -> (u32, u32) {
    let max_x = i64::from(width.max(1)) - 1;
    let max_y = i64::from(height.max(1)) - 1;
    (x.clamp(0, max_x) as u32, y.clamp(0, max_y) as u32)
}

/// An input the dry-run controller received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedInput {
    Click {
        x: u32,
        y: u32,
        button: MouseButton,
        double: bool,
    },
    Type {
        text: Option<String>,
        keys: Vec<String>,
    },
    Scroll(i32),
}

/// Controller that only logs and records.
pub struct DryRunController {
    width: u32,
    height: u32,
    recorded: Mutex<Vec<RecordedInput>>,
    fail_with: Option<String>,
}

impl DryRunController {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            recorded: Mutex::new(Vec::new()),
            fail_with: None,
        }
    }

    /// Makes every input fail with `message`.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.fail_with = Some(message.into());
        self
    }

    pub fn recorded(&self) -> Vec<RecordedInput> {
        self.recorded.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, input: RecordedInput) -> Result<(), ControllerError> {
        if let Some(message) = &self.fail_with {
            return Err(ControllerError::Input(message.clone()));
        }
        info!(input = ?input, "[DRY RUN] input");
        self.recorded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(input);
        Ok(())
    }
}

impl InputController for DryRunController {
    fn screen_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn click(&self, x: u32, y: u32, button: MouseButton, double: bool) -> Result<(), ControllerError> {
        self.record(RecordedInput::Click { x, y, button, double })
    }

    fn type_text(&self, text: Option<&str>, keys: &[String]) -> Result<(), ControllerError> {
        self.record(RecordedInput::Type {
            text: text.map(str::to_string),
            keys: keys.to_vec(),
        })
    }

    fn scroll(&self, amount: i32) -> Result<(), ControllerError> {
        self.record(RecordedInput::Scroll(amount))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_to_screen() {
        assert_eq!(clamp_to_screen(-5, 20, (1920, 1080)), (0, 20));
        assert_eq!(clamp_to_screen(5000, 5000, (1920, 1080)), (1919, 1079));
        assert_eq!(clamp_to_screen(10, 10, (0, 0)), (0, 0));
    }

    #[test]
    fn test_button_names() {
        assert_eq!(MouseButton::parse("").unwrap(), MouseButton::Left);
        assert_eq!(MouseButton::parse("right").unwrap(), MouseButton::Right);
        assert!(MouseButton::parse("fourth").is_err());
    }

    #[test]
    fn test_failing_controller_records_nothing() {
        let controller = DryRunController::new(10, 10).failing("locked");
        assert!(controller.scroll(1).is_err());
        assert!(controller.recorded().is_empty());
    }
}
