//! Clients for the inference collaborators.
//!
//! Each service is a plain JSON-over-HTTP endpoint:
//! - grounding: `POST /ground` maps an instruction to a normalized point
//! - element detection: `POST /parse/` lists the elements on screen
//! - speech-to-text: `POST /transcribe` turns PCM audio into text
//!
//! Callers wrap these calls in the [`crate::arbiter::Arbiter`]; the clients
//! themselves do no locking.

use std::time::Duration;

use base64::Engine;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const GROUNDING_TIMEOUT: Duration = Duration::from_secs(10);
const PARSE_TIMEOUT: Duration = Duration::from_secs(30);
const TRANSCRIBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors talking to an inference service.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("{service} request failed: {message}")]
    Http {
        service: &'static str,
        message: String,
    },

    #[error("{service} timed out")]
    Timeout { service: &'static str },

    #[error("{service} returned {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("{service} returned an invalid response: {message}")]
    InvalidResponse {
        service: &'static str,
        message: String,
    },
}

impl InferenceError {
    fn from_reqwest(service: &'static str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            InferenceError::Timeout { service }
        } else if err.is_decode() {
            InferenceError::InvalidResponse {
                service,
                message: err.to_string(),
            }
        } else {
            InferenceError::Http {
                service,
                message: err.to_string(),
            }
        }
    }
}

async fn post_json<B, T>(
    client: &Client,
    service: &'static str,
    url: &str,
    body: &B,
    timeout: Duration,
) -> Result<T, InferenceError>
where
    B: Serialize + ?Sized,
    T: DeserializeOwned,
{
    debug!(service, url = %url, "inference request");
    let response = client
        .post(url)
        .json(body)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| InferenceError::from_reqwest(service, e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(InferenceError::Status {
            service,
            status: status.as_u16(),
            body,
        });
    }

    response
        .json()
        .await
        .map_err(|e| InferenceError::from_reqwest(service, e))
}

fn join(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

// =============================================================================
// Grounding
// =============================================================================

#[derive(Debug, Serialize)]
struct GroundRequest<'a> {
    instruction: &'a str,
    base64_image: &'a str,
}

#[derive(Debug, Deserialize)]
struct GroundReply {
    point: Option<Vec<f64>>,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    raw: String,
}

/// Where the grounding model pointed.
#[derive(Debug, Clone, PartialEq)]
pub struct Grounding {
    /// Normalized `(x, y)` in `[0, 1]`, or `None` if nothing matched.
    pub point: Option<(f64, f64)>,
    pub confidence: f32,
    /// Raw model output.
    pub raw: String,
}

impl Grounding {
    /// Scales the normalized point to pixel coordinates.
    pub fn to_pixels(&self, width: u32, height: u32) -> Option<(i32, i32)> {
        self.point.map(|(x, y)| {
            let px = (x.clamp(0.0, 1.0) * width as f64).round() as i32;
            let py = (y.clamp(0.0, 1.0) * height as f64).round() as i32;
            (px.min(width as i32 - 1).max(0), py.min(height as i32 - 1).max(0))
        })
    }
}

/// Client for the visual grounding service.
#[derive(Debug, Clone)]
pub struct GroundingClient {
    client: Client,
    base_url: String,
}

impl GroundingClient {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub async fn ground(&self, instruction: &str, base64_image: &str) -> Result<Grounding, InferenceError> {
        let reply: GroundReply = post_json(
            &self.client,
            "grounding",
            &join(&self.base_url, "/ground"),
            &GroundRequest {
                instruction,
                base64_image,
            },
            GROUNDING_TIMEOUT,
        )
        .await?;

        let point = match reply.point.as_deref() {
            None => None,
            Some([x, y, ..]) => Some((*x, *y)),
            Some(other) => {
                return Err(InferenceError::InvalidResponse {
                    service: "grounding",
                    message: format!("point has {} coordinates", other.len()),
                })
            }
        };

        let confidence = match point {
            Some(_) => reply.confidence.unwrap_or(1.0),
            None => 0.0,
        };

        Ok(Grounding {
            point,
            confidence,
            raw: reply.raw,
        })
    }
}

// =============================================================================
// Element Detection
// =============================================================================

#[derive(Debug, Serialize)]
struct ParseRequest<'a> {
    base64_image: &'a str,
}

/// One detected element.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ParsedElement {
    /// Normalized `[x1, y1, x2, y2]`.
    #[serde(default)]
    pub bbox: Vec<f64>,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub content: Option<String>,
}

/// The parsed screen.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ParsedScreen {
    /// Screenshot annotated with element marks.
    #[serde(default)]
    pub som_image_base64: String,
    #[serde(default)]
    pub parsed_content_list: Vec<ParsedElement>,
    #[serde(default)]
    pub latency: f64,
}

/// Client for the element detection service.
#[derive(Debug, Clone)]
pub struct ParserClient {
    client: Client,
    base_url: String,
}

impl ParserClient {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub async fn parse(&self, base64_image: &str) -> Result<ParsedScreen, InferenceError> {
        post_json(
            &self.client,
            "parser",
            &join(&self.base_url, "/parse/"),
            &ParseRequest { base64_image },
            PARSE_TIMEOUT,
        )
        .await
    }
}

// =============================================================================
// Speech-to-Text
// =============================================================================

#[derive(Debug, Serialize)]
struct TranscribeRequest<'a> {
    audio_base64: &'a str,
    sample_rate: u32,
    device: &'a str,
}

#[derive(Debug, Deserialize)]
struct TranscribeReply {
    #[serde(default)]
    text: String,
}

/// Client for the speech-to-text service.
#[derive(Debug, Clone)]
pub struct SpeechClient {
    client: Client,
    base_url: String,
    device: &'static str,
}

impl SpeechClient {
    pub fn new(client: Client, base_url: impl Into<String>, use_cuda: bool) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            device: if use_cuda { "cuda" } else { "cpu" },
        }
    }

    pub fn device(&self) -> &str {
        self.device
    }

    /// Transcribes little-endian f32 PCM; returns trimmed text.
    pub async fn transcribe(&self, pcm: &[u8], sample_rate: u32) -> Result<String, InferenceError> {
        let audio_base64 = base64::engine::general_purpose::STANDARD.encode(pcm);
        let reply: TranscribeReply = post_json(
            &self.client,
            "speech",
            &join(&self.base_url, "/transcribe"),
            &TranscribeRequest {
                audio_base64: &audio_base64,
                sample_rate,
                device: self.device,
            },
            TRANSCRIBE_TIMEOUT,
        )
        .await?;
        Ok(reply.text.trim().to_string())
    }
}
