//! Bravebird Brain Library
//!
//! The brain observes a screen, decides what to do and drives a sandbox to
//! do it. It talks to the capture host and to its own actors only through
//! the event bus.
//!
//! ## Architecture
//!
//! ```text
//! ActorSystem
//! ├── PerceptionActor  (shared-memory frames + grounding service)
//! ├── AudioActor       (speech-to-text)
//! ├── CognitionActor   (agent state machine, workflow sequencing)
//! └── ActionActor      (sandbox registry, snapshot and rollback)
//! ```
//!
//! ## Modules
//!
//! - `actors`: Actor framework and implementations
//! - `arbiter`: Exclusive access to the accelerator
//! - `inference`: Grounding, element detection and speech clients
//! - `sandbox`: Sandbox backends and registry
//! - `state_machine`: Agent lifecycle states

pub mod actors;
pub mod arbiter;
pub mod config;
pub mod inference;
pub mod sandbox;
pub mod state_machine;

use std::sync::Arc;

use anyhow::{Context, Result};
use bravebird_bus::Bus;

use actors::{ActionActor, ActorSystem, AudioActor, CognitionActor, PerceptionActor, ShmFrameSource};
use arbiter::Arbiter;
use config::Config;
use inference::{GroundingClient, ParserClient, SpeechClient};
use sandbox::SandboxRegistry;

/// Everything the actors share, built once at startup.
#[derive(Clone)]
pub struct BrainContext {
    pub config: Config,
    pub bus: Bus,
    pub arbiter: Arc<Arbiter>,
    pub http: reqwest::Client,
}

impl BrainContext {
    pub fn new(config: Config, bus: Bus) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            config,
            bus,
            arbiter: Arc::new(Arbiter::new()),
            http,
        })
    }

    /// The actors in startup order: perception, audio, cognition, action.
    pub fn actor_system(&self) -> Result<ActorSystem> {
        let config = &self.config;
        let mut system = ActorSystem::new();

        system.add(
            PerceptionActor::new(
                Arc::new(
                    ShmFrameSource::new(&config.shm_file_path)
                        .with_max_size(config.screen_width, config.screen_height),
                ),
                GroundingClient::new(self.http.clone(), &config.ui_ins_url),
                ParserClient::new(self.http.clone(), &config.omniparser_url),
                self.arbiter.clone(),
            ),
            self.bus.clone(),
        );
        system.add(
            AudioActor::new(
                SpeechClient::new(self.http.clone(), &config.stt_url, config.use_cuda),
                self.arbiter.clone(),
            ),
            self.bus.clone(),
        );
        system.add(CognitionActor::new(), self.bus.clone());

        let registry =
            SandboxRegistry::from_config(config).context("failed to build sandbox registry")?;
        system.add(
            ActionActor::new(registry, config.sandbox_timeout()),
            self.bus.clone(),
        );

        Ok(system)
    }
}
