//! Actors of the brain.
//!
//! Each actor owns one concern and reacts to bus traffic:
//!
//! ```text
//! PerceptionActor  perception.grounding_request -> perception.grounding_result
//! AudioActor       input.audio_chunk            -> cognition.user_voice
//! CognitionActor   cognition.*, perception.grounding_result, action.result
//!                                               -> perception.grounding_request, action.request
//! ActionActor      action.request               -> action.result
//! ```
//!
//! Actors never call each other; all cross-actor traffic goes over the bus.

mod action;
mod audio;
mod cognition;
mod framework;
mod perception;

pub use action::ActionActor;
pub use audio::AudioActor;
pub use cognition::{CognitionActor, CognitionStatus};
pub use framework::{
    Actor, ActorCell, ActorContext, ActorError, ActorState, ActorSystem, ManagedActor,
};
pub use perception::{FrameSource, PerceptionActor, ShmFrameSource};
