//! Audio actor: transcribes speech chunks into user utterances.

use std::sync::Arc;

use async_trait::async_trait;
use bravebird_bus::Bus;
use bravebird_events::{channels, AudioChunk, UserTranscript};
use tracing::{info, warn};

use super::framework::{Actor, ActorContext, ActorError};
use crate::arbiter::Arbiter;
use crate::inference::SpeechClient;

const HOLDER: &str = "audio";

/// Listens on `input.audio_chunk` and publishes `cognition.user_voice`.
#[derive(Clone)]
pub struct AudioActor {
    speech: SpeechClient,
    arbiter: Arc<Arbiter>,
}

impl AudioActor {
    pub fn new(speech: SpeechClient, arbiter: Arc<Arbiter>) -> Self {
        Self { speech, arbiter }
    }

    /// Transcribes one chunk. Silence, empty audio and empty transcripts
    /// yield `None`.
    pub async fn transcribe(&self, chunk: &AudioChunk) -> Option<UserTranscript> {
        if !chunk.is_speech || chunk.data.is_empty() {
            return None;
        }

        let text = match self
            .arbiter
            .run(HOLDER, self.speech.transcribe(&chunk.data, chunk.sample_rate))
            .await
        {
            Ok(text) => text,
            Err(e) => {
                // Dropped: a retried chunk would be stale by the time it ran.
                warn!(timestamp_ms = chunk.timestamp_ms, error = %e, "transcription failed");
                return None;
            }
        };

        if text.is_empty() {
            return None;
        }

        info!(text = %text, "heard user");
        Some(UserTranscript {
            text,
            timestamp_ms: chunk.timestamp_ms,
        })
    }

    async fn handle(&self, bus: &Bus, chunk: AudioChunk) -> anyhow::Result<()> {
        if let Some(transcript) = self.transcribe(&chunk).await {
            bus.try_publish(channels::COGNITION_USER_VOICE, &transcript)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Actor for AudioActor {
    fn name(&self) -> &str {
        "audio"
    }

    async fn setup(&mut self, ctx: &ActorContext) -> Result<(), ActorError> {
        info!(device = self.speech.device(), "audio pipeline ready");

        let this = self.clone();
        let bus = ctx.bus().clone();
        ctx.subscribe(channels::INPUT_AUDIO_CHUNK, move |chunk: AudioChunk| {
            let this = this.clone();
            let bus = bus.clone();
            async move { this.handle(&bus, chunk).await }
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn chunk(is_speech: bool) -> AudioChunk {
        AudioChunk {
            timestamp_ms: 42,
            data: vec![0; 64],
            sample_rate: 16000,
            is_speech,
        }
    }

    async fn actor_with_reply(text: &str) -> (AudioActor, MockServer) {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transcribe"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "text": text })))
            .mount(&server)
            .await;
        let speech = SpeechClient::new(reqwest::Client::new(), server.uri(), false);
        (AudioActor::new(speech, Arc::new(Arbiter::new())), server)
    }

    #[tokio::test]
    async fn test_speech_is_transcribed() {
        let (actor, _server) = actor_with_reply("open the browser").await;
        let transcript = actor.transcribe(&chunk(true)).await.unwrap();
        assert_eq!(transcript.text, "open the browser");
        assert_eq!(transcript.timestamp_ms, 42);
    }

    #[tokio::test]
    async fn test_silence_is_skipped() {
        let (actor, server) = actor_with_reply("ignored").await;
        assert!(actor.transcribe(&chunk(false)).await.is_none());
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_transcript_is_dropped() {
        let (actor, _server) = actor_with_reply("   ").await;
        assert!(actor.transcribe(&chunk(true)).await.is_none());
    }
}
