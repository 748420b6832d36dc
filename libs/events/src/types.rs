//! Payload schemas for every bus channel.
//!
//! Each channel carries exactly one of the messages below. Timestamps are
//! milliseconds since the Unix epoch unless a field says otherwise.

use serde::{Deserialize, Serialize};

use crate::EventError;

// =============================================================================
// Channel Names
// =============================================================================

/// All channel names as constants.
pub mod channels {
    // Input sensors
    pub const INPUT_AUDIO_CHUNK: &str = "input.audio_chunk";
    pub const INPUT_INTERACTION: &str = "input.interaction";

    // Video
    pub const VIDEO_FRAME_READY: &str = "video.frame_ready";

    // Cognition
    pub const COGNITION_USER_VOICE: &str = "cognition.user_voice";
    pub const COGNITION_START_WORKFLOW: &str = "cognition.start_workflow";

    // Perception
    pub const PERCEPTION_GROUNDING_REQUEST: &str = "perception.grounding_request";
    pub const PERCEPTION_GROUNDING_RESULT: &str = "perception.grounding_result";
    pub const PERCEPTION_PARSE_REQUEST: &str = "perception.parse_request";
    pub const PERCEPTION_PARSE_RESULT: &str = "perception.parse_result";

    // Action
    pub const ACTION_REQUEST: &str = "action.request";
    pub const ACTION_RESULT: &str = "action.result";

    /// Returns true for channels that carry sensor streams at frame or chunk
    /// rate. These are never logged per message and tolerate eviction.
    pub fn is_high_frequency(channel: &str) -> bool {
        channel.starts_with("video.") || channel.starts_with("input.audio")
    }
}

// =============================================================================
// Input
// =============================================================================

/// A chunk of microphone audio that passed voice activity detection.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AudioChunk {
    #[prost(uint64, tag = "1")]
    pub timestamp_ms: u64,
    /// Raw little-endian f32 PCM samples.
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
    #[prost(uint32, tag = "3")]
    pub sample_rate: u32,
    #[prost(bool, tag = "4")]
    pub is_speech: bool,
}

/// A user interaction captured on the host.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Interaction {
    #[prost(uint64, tag = "1")]
    pub timestamp_ms: u64,
    #[prost(oneof = "interaction::Input", tags = "2, 3")]
    pub input: Option<interaction::Input>,
    /// Accessibility node under the pointer / focused element, when known.
    #[prost(message, optional, tag = "4")]
    pub node: Option<AccessibilityNode>,
}

pub mod interaction {
    /// Mouse or keyboard variant of an interaction.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Input {
        #[prost(message, tag = "2")]
        Mouse(super::MouseInput),
        #[prost(message, tag = "3")]
        Keyboard(super::KeyboardInput),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MouseInput {
    #[prost(int32, tag = "1")]
    pub x: i32,
    #[prost(int32, tag = "2")]
    pub y: i32,
    #[prost(string, tag = "3")]
    pub button: String,
    #[prost(bool, tag = "4")]
    pub pressed: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyboardInput {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(bool, tag = "2")]
    pub pressed: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AccessibilityNode {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub control_type: String,
    #[prost(string, tag = "3")]
    pub automation_id: String,
    #[prost(int32, repeated, tag = "4")]
    pub bounding_rect: Vec<i32>,
}

// =============================================================================
// Video
// =============================================================================

/// Notification that a new frame is in the shared-memory region.
///
/// Carries only the region handle and frame geometry; pixels stay in the
/// region.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FrameReady {
    #[prost(uint64, tag = "1")]
    pub timestamp_ms: u64,
    #[prost(uint32, tag = "2")]
    pub width: u32,
    #[prost(uint32, tag = "3")]
    pub height: u32,
    /// Path of the shared-memory file on the producer side.
    #[prost(string, tag = "4")]
    pub shm_handle: String,
    /// Pixel encoding, always `raw_bgra` today.
    #[prost(string, tag = "5")]
    pub encoding: String,
    /// Region sequence number after the frame was written.
    #[prost(uint64, tag = "6")]
    pub sequence: u64,
}

// =============================================================================
// Cognition
// =============================================================================

/// A transcribed user utterance.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserTranscript {
    #[prost(string, tag = "1")]
    pub text: String,
    #[prost(uint64, tag = "2")]
    pub timestamp_ms: u64,
}

/// Request to execute a synthesized workflow.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkflowStart {
    #[prost(string, tag = "1")]
    pub workflow_id: String,
    #[prost(string, tag = "2")]
    pub workflow_json: String,
}

// =============================================================================
// Perception
// =============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GroundingRequest {
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(string, tag = "2")]
    pub instruction: String,
}

/// Pixel coordinates for a grounding request.
///
/// A failed grounding has `confidence == 0.0` and a non-empty `error`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GroundingResult {
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(int32, tag = "2")]
    pub x: i32,
    #[prost(int32, tag = "3")]
    pub y: i32,
    #[prost(float, tag = "4")]
    pub confidence: f32,
    #[prost(string, tag = "5")]
    pub error: String,
}

impl GroundingResult {
    /// A result reporting that grounding could not be performed.
    pub fn failed(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            x: 0,
            y: 0,
            confidence: 0.0,
            error: error.into(),
        }
    }
}

/// Asks perception to list the elements on the current screen.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScreenParseRequest {
    #[prost(string, tag = "1")]
    pub request_id: String,
}

/// One detected element, in screen pixels.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScreenElement {
    /// Element kind reported by the detector (`text`, `icon`, ...).
    #[prost(string, tag = "1")]
    pub kind: String,
    #[prost(string, tag = "2")]
    pub content: String,
    #[prost(int32, tag = "3")]
    pub left: i32,
    #[prost(int32, tag = "4")]
    pub top: i32,
    #[prost(int32, tag = "5")]
    pub right: i32,
    #[prost(int32, tag = "6")]
    pub bottom: i32,
}

/// Elements found on screen. A failed parse has no elements and a
/// non-empty `error`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScreenParseResult {
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(message, repeated, tag = "2")]
    pub elements: Vec<ScreenElement>,
    #[prost(uint32, tag = "3")]
    pub width: u32,
    #[prost(uint32, tag = "4")]
    pub height: u32,
    #[prost(string, tag = "5")]
    pub error: String,
}

impl ScreenParseResult {
    pub fn failed(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            error: error.into(),
            ..Default::default()
        }
    }
}

// =============================================================================
// Action
// =============================================================================

/// Kind of action a sandbox is asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Click,
    DoubleClick,
    Move,
    Type,
    Scroll,
    Command,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Click => "click",
            ActionType::DoubleClick => "double_click",
            ActionType::Move => "move",
            ActionType::Type => "type",
            ActionType::Scroll => "scroll",
            ActionType::Command => "command",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "click" => Ok(ActionType::Click),
            "double_click" | "dblclick" => Ok(ActionType::DoubleClick),
            "move" => Ok(ActionType::Move),
            "type" => Ok(ActionType::Type),
            "scroll" => Ok(ActionType::Scroll),
            "command" => Ok(ActionType::Command),
            other => Err(EventError::UnknownActionType(other.to_string())),
        }
    }
}

/// A request for the action actor.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActionRequest {
    #[prost(string, tag = "1")]
    pub action_id: String,
    /// Logical sandbox target ("linux", "windows", ...). Empty means the
    /// configured default.
    #[prost(string, tag = "2")]
    pub target_os: String,
    /// One of the [`ActionType`] names.
    #[prost(string, tag = "3")]
    pub action_type: String,
    #[prost(bool, tag = "4")]
    pub requires_snapshot: bool,
    #[prost(int32, tag = "5")]
    pub x: i32,
    #[prost(int32, tag = "6")]
    pub y: i32,
    #[prost(string, tag = "7")]
    pub button: String,
    #[prost(string, tag = "8")]
    pub text: String,
    #[prost(string, repeated, tag = "9")]
    pub keys: Vec<String>,
    #[prost(int32, tag = "10")]
    pub amount: i32,
    #[prost(string, tag = "11")]
    pub command: String,
    /// Zero means the sandbox default.
    #[prost(uint32, tag = "12")]
    pub timeout_secs: u32,
}

impl ActionRequest {
    /// Parses the action type.
    pub fn kind(&self) -> Result<ActionType, EventError> {
        self.action_type.parse()
    }
}

/// The single outcome published for an [`ActionRequest`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActionResult {
    /// The `action_id` of the request this answers.
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(bool, tag = "2")]
    pub success: bool,
    #[prost(string, tag = "3")]
    pub details: String,
    #[prost(string, tag = "4")]
    pub error: String,
}

impl ActionResult {
    pub fn success(request_id: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            success: true,
            details: details.into(),
            error: String::new(),
        }
    }

    pub fn failure(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            details: String::new(),
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_action_type_parse() {
        assert_eq!("click".parse::<ActionType>().unwrap(), ActionType::Click);
        assert_eq!("dblclick".parse::<ActionType>().unwrap(), ActionType::DoubleClick);
        assert!(matches!(
            "teleport".parse::<ActionType>(),
            Err(EventError::UnknownActionType(_))
        ));
    }

    #[test]
    fn test_action_type_serde_names() {
        assert_eq!(
            serde_json::to_string(&ActionType::DoubleClick).unwrap(),
            "\"double_click\""
        );
        for kind in [
            ActionType::Click,
            ActionType::DoubleClick,
            ActionType::Move,
            ActionType::Type,
            ActionType::Scroll,
            ActionType::Command,
        ] {
            assert_eq!(kind.as_str().parse::<ActionType>().unwrap(), kind);
        }
    }

    #[test]
    fn test_high_frequency_channels() {
        assert!(channels::is_high_frequency(channels::VIDEO_FRAME_READY));
        assert!(channels::is_high_frequency(channels::INPUT_AUDIO_CHUNK));
        assert!(!channels::is_high_frequency(channels::INPUT_INTERACTION));
        assert!(!channels::is_high_frequency(channels::ACTION_REQUEST));
    }

    #[test]
    fn test_interaction_oneof() {
        let event = Interaction {
            timestamp_ms: 42,
            input: Some(interaction::Input::Keyboard(KeyboardInput {
                key: "enter".into(),
                pressed: true,
            })),
            node: Some(AccessibilityNode {
                name: "OK".into(),
                control_type: "Button".into(),
                automation_id: String::new(),
                bounding_rect: vec![0, 0, 80, 24],
            }),
        };
        let decoded = Interaction::decode(event.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_result_constructors() {
        let ok = ActionResult::success("act_1", "clicked");
        assert!(ok.success);
        assert!(ok.error.is_empty());

        let failed = GroundingResult::failed("req_1", "Video stream unavailable");
        assert_eq!(failed.confidence, 0.0);
        assert_eq!(failed.error, "Video stream unavailable");
    }
}
