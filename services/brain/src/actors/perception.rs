//! Perception actor: turns grounding requests into screen coordinates.
//!
//! The actor reads the newest frame from the shared-memory region, encodes
//! it, asks the grounding service where the instruction points and
//! publishes the pixel coordinates. Every request gets a result; failures
//! are reported with zero confidence and an error string.
//!
//! Screen parse requests go through the element detection service the same
//! way and come back as element boxes in pixels.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use bravebird_events::{
    channels, FrameReady, GroundingRequest, GroundingResult, ScreenElement, ScreenParseRequest,
    ScreenParseResult,
};
use bravebird_shm::{Frame, ShmError, ShmReader};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::framework::{Actor, ActorContext, ActorError};
use crate::arbiter::Arbiter;
use crate::inference::{GroundingClient, InferenceError, ParsedElement, ParserClient};

/// Interval of the awareness heartbeat.
const AWARENESS_INTERVAL: Duration = Duration::from_secs(1);

/// A frame announcement older than this is reported as stale.
const STALE_AFTER: Duration = Duration::from_secs(5);

const JPEG_QUALITY: u8 = 85;

const HOLDER: &str = "perception";

// =============================================================================
// Frame Sources
// =============================================================================

/// Where the actor gets its frames from.
#[async_trait]
pub trait FrameSource: Send + Sync + 'static {
    /// The newest complete frame.
    async fn latest(&self) -> Result<Frame, ShmError>;
}

/// Reads frames from the shared-memory region.
///
/// The region is opened on first use, so the brain can start before the
/// host has created it.
pub struct ShmFrameSource {
    path: PathBuf,
    max_size: Option<(u32, u32)>,
    reader: Arc<Mutex<Option<ShmReader>>>,
}

impl ShmFrameSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_size: None,
            reader: Arc::new(Mutex::new(None)),
        }
    }

    /// Rejects frames larger than the given screen.
    pub fn with_max_size(mut self, width: u32, height: u32) -> Self {
        self.max_size = Some((width, height));
        self
    }
}

#[async_trait]
impl FrameSource for ShmFrameSource {
    async fn latest(&self) -> Result<Frame, ShmError> {
        let slot = self.reader.clone();
        let path = self.path.clone();
        let max_size = self.max_size;

        tokio::task::spawn_blocking(move || {
            let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
            let reader = match slot.take() {
                Some(reader) => reader,
                None => {
                    let reader = ShmReader::open(&path)?;
                    info!(path = %path.display(), bytes = reader.len(), "attached to video region");
                    reader
                }
            };
            let frame = reader.read_latest();
            *slot = Some(reader);
            let frame = frame?;
            match max_size {
                Some((max_width, max_height))
                    if frame.width > max_width || frame.height > max_height =>
                {
                    Err(ShmError::FrameTooLarge {
                        width: frame.width,
                        height: frame.height,
                        max_width,
                        max_height,
                    })
                }
                _ => Ok(frame),
            }
        })
        .await
        .map_err(|e| ShmError::Io(std::io::Error::other(e)))?
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
enum PerceptionError {
    #[error("video unavailable: {0}")]
    Video(#[from] ShmError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error("no element matches '{0}'")]
    NotFound(String),

    #[error("frame encoding task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

// =============================================================================
// Actor
// =============================================================================

/// Latest `video.frame_ready` seen, with its arrival time.
#[derive(Debug, Default)]
struct Awareness {
    latest: Option<(FrameReady, Instant)>,
    stale_reported: bool,
}

/// Grounds instructions against the live screen.
#[derive(Clone)]
pub struct PerceptionActor {
    frames: Arc<dyn FrameSource>,
    grounding: GroundingClient,
    parser: ParserClient,
    arbiter: Arc<Arbiter>,
    awareness: Arc<Mutex<Awareness>>,
}

impl PerceptionActor {
    pub fn new(
        frames: Arc<dyn FrameSource>,
        grounding: GroundingClient,
        parser: ParserClient,
        arbiter: Arc<Arbiter>,
    ) -> Self {
        Self {
            frames,
            grounding,
            parser,
            arbiter,
            awareness: Arc::new(Mutex::new(Awareness::default())),
        }
    }

    /// The most recent frame announcement, if any.
    pub fn latest_frame(&self) -> Option<FrameReady> {
        self.awareness
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .latest
            .as_ref()
            .map(|(frame, _)| frame.clone())
    }

    /// Grounds one request. Never fails: problems become a zero-confidence
    /// result carrying the error text.
    pub async fn ground(&self, request: &GroundingRequest) -> GroundingResult {
        match self.try_ground(request).await {
            Ok(result) => {
                info!(
                    request_id = %request.request_id,
                    x = result.x,
                    y = result.y,
                    confidence = result.confidence,
                    "grounded instruction"
                );
                result
            }
            Err(e) => {
                warn!(request_id = %request.request_id, error = %e, "grounding failed");
                GroundingResult::failed(&request.request_id, e.to_string())
            }
        }
    }

    async fn try_ground(&self, request: &GroundingRequest) -> Result<GroundingResult, PerceptionError> {
        let frame = self.frames.latest().await?;
        let (width, height) = (frame.width, frame.height);
        let image = encode_frame(frame).await?;

        let grounding = self
            .arbiter
            .run(HOLDER, self.grounding.ground(&request.instruction, &image))
            .await?;

        let (x, y) = grounding
            .to_pixels(width, height)
            .ok_or_else(|| PerceptionError::NotFound(request.instruction.clone()))?;

        Ok(GroundingResult {
            request_id: request.request_id.clone(),
            x,
            y,
            confidence: grounding.confidence,
            error: String::new(),
        })
    }

    /// Lists the elements on the current screen. Never fails: problems
    /// become an empty result carrying the error text.
    pub async fn parse_screen(&self, request: &ScreenParseRequest) -> ScreenParseResult {
        match self.try_parse(request).await {
            Ok(result) => {
                info!(
                    request_id = %request.request_id,
                    elements = result.elements.len(),
                    "parsed screen"
                );
                result
            }
            Err(e) => {
                warn!(request_id = %request.request_id, error = %e, "screen parse failed");
                ScreenParseResult::failed(&request.request_id, e.to_string())
            }
        }
    }

    async fn try_parse(
        &self,
        request: &ScreenParseRequest,
    ) -> Result<ScreenParseResult, PerceptionError> {
        let frame = self.frames.latest().await?;
        let (width, height) = (frame.width, frame.height);
        let image = encode_frame(frame).await?;

        let parsed = self.arbiter.run(HOLDER, self.parser.parse(&image)).await?;
        debug!(
            elements = parsed.parsed_content_list.len(),
            latency = parsed.latency,
            "element detection finished"
        );

        Ok(ScreenParseResult {
            request_id: request.request_id.clone(),
            elements: parsed
                .parsed_content_list
                .iter()
                .filter_map(|element| element_in_pixels(element, width, height))
                .collect(),
            width,
            height,
            error: String::new(),
        })
    }

    fn observe(&self, frame: FrameReady) {
        let mut awareness = self.awareness.lock().unwrap_or_else(|e| e.into_inner());
        awareness.latest = Some((frame, Instant::now()));
        awareness.stale_reported = false;
    }

    fn heartbeat(&self) {
        let mut awareness = self.awareness.lock().unwrap_or_else(|e| e.into_inner());
        let age = match &awareness.latest {
            Some((frame, seen)) => {
                debug!(sequence = frame.sequence, width = frame.width, height = frame.height, "visual awareness");
                seen.elapsed()
            }
            None => return,
        };
        if age > STALE_AFTER && !awareness.stale_reported {
            warn!(age_ms = age.as_millis() as u64, "video feed is stale");
            awareness.stale_reported = true;
        }
    }
}

/// Scales a normalized `[x1, y1, x2, y2]` box to the frame. Elements
/// without a usable box are dropped.
fn element_in_pixels(element: &ParsedElement, width: u32, height: u32) -> Option<ScreenElement> {
    let [x1, y1, x2, y2] = <[f64; 4]>::try_from(element.bbox.as_slice()).ok()?;
    let scale = |v: f64, size: u32| (v.clamp(0.0, 1.0) * f64::from(size)).round() as i32;
    Some(ScreenElement {
        kind: element.kind.clone(),
        content: element.content.clone().unwrap_or_default(),
        left: scale(x1, width),
        top: scale(y1, height),
        right: scale(x2, width),
        bottom: scale(y2, height),
    })
}

async fn encode_frame(frame: Frame) -> Result<String, PerceptionError> {
    let jpeg = tokio::task::spawn_blocking(move || frame.to_jpeg(JPEG_QUALITY)).await??;
    Ok(base64::engine::general_purpose::STANDARD.encode(jpeg))
}

#[async_trait]
impl Actor for PerceptionActor {
    fn name(&self) -> &str {
        "perception"
    }

    async fn setup(&mut self, ctx: &ActorContext) -> Result<(), ActorError> {
        let this = self.clone();
        ctx.subscribe(channels::VIDEO_FRAME_READY, move |frame: FrameReady| {
            this.observe(frame);
            async { Ok(()) }
        })
        .await?;

        let this = self.clone();
        let bus = ctx.bus().clone();
        ctx.subscribe(
            channels::PERCEPTION_GROUNDING_REQUEST,
            move |request: GroundingRequest| {
                let this = this.clone();
                let bus = bus.clone();
                async move {
                    let result = this.ground(&request).await;
                    bus.try_publish(channels::PERCEPTION_GROUNDING_RESULT, &result)
                        .await?;
                    Ok(())
                }
            },
        )
        .await?;

        let this = self.clone();
        let bus = ctx.bus().clone();
        ctx.subscribe(
            channels::PERCEPTION_PARSE_REQUEST,
            move |request: ScreenParseRequest| {
                let this = this.clone();
                let bus = bus.clone();
                async move {
                    let result = this.parse_screen(&request).await;
                    bus.try_publish(channels::PERCEPTION_PARSE_RESULT, &result)
                        .await?;
                    Ok(())
                }
            },
        )
        .await?;

        let this = self.clone();
        ctx.spawn("awareness", async move {
            let mut ticker = tokio::time::interval(AWARENESS_INTERVAL);
            loop {
                ticker.tick().await;
                this.heartbeat();
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    struct NoVideo;

    #[async_trait]
    impl FrameSource for NoVideo {
        async fn latest(&self) -> Result<Frame, ShmError> {
            Err(ShmError::NotReady(PathBuf::from("/tmp/missing.shm")))
        }
    }

    fn actor(frames: Arc<dyn FrameSource>) -> PerceptionActor {
        let client = reqwest::Client::new();
        PerceptionActor::new(
            frames,
            GroundingClient::new(client.clone(), "http://127.0.0.1:9"),
            ParserClient::new(client, "http://127.0.0.1:9"),
            Arc::new(Arbiter::new()),
        )
    }

    #[tokio::test]
    async fn test_missing_video_yields_failed_result() {
        let actor = actor(Arc::new(NoVideo));
        let request = GroundingRequest {
            request_id: "req_1".to_string(),
            instruction: "Click Save".to_string(),
        };

        let result = actor.ground(&request).await;
        assert_eq!(result.request_id, "req_1");
        assert_eq!(result.confidence, 0.0);
        assert!(result.error.contains("not ready"));
    }

    #[test]
    fn test_observe_tracks_latest_frame() {
        let actor = actor(Arc::new(NoVideo));
        assert!(actor.latest_frame().is_none());

        actor.observe(FrameReady {
            sequence: 4,
            ..Default::default()
        });
        actor.observe(FrameReady {
            sequence: 6,
            ..Default::default()
        });
        assert_eq!(actor.latest_frame().map(|f| f.sequence), Some(6));
    }

    #[tokio::test]
    async fn test_shm_source_not_ready_until_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video.shm");
        let source = ShmFrameSource::new(&path);

        assert!(matches!(source.latest().await, Err(ShmError::NotReady(_))));

        let mut writer = bravebird_shm::ShmWriter::create(&path, 4, 4).unwrap();
        writer.write_frame(1.0, 2, 2, &[7u8; 16]).unwrap();

        let frame = source.latest().await.unwrap();
        assert_eq!((frame.width, frame.height), (2, 2));
        assert_eq!(frame.pixels, vec![7u8; 16]);
    }

    #[tokio::test]
    async fn test_shm_source_rejects_oversized_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video.shm");
        let mut writer = bravebird_shm::ShmWriter::create(&path, 8, 8).unwrap();
        writer.write_frame(1.0, 8, 4, &[1u8; 8 * 4 * 4]).unwrap();

        let source = ShmFrameSource::new(&path).with_max_size(4, 4);
        assert!(matches!(
            source.latest().await,
            Err(ShmError::FrameTooLarge { width: 8, .. })
        ));
    }

    #[tokio::test]
    async fn test_parse_screen_scales_boxes_to_frame() {
        let dir = tempfile::tempdir().unwrap();
        let region = dir.path().join("video.shm");
        let mut writer = bravebird_shm::ShmWriter::create(&region, 200, 100).unwrap();
        writer
            .write_frame(1.0, 200, 100, &vec![0x30; 200 * 100 * 4])
            .unwrap();

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/parse/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "som_image_base64": "",
                "parsed_content_list": [
                    {"bbox": [0.1, 0.2, 0.5, 0.4], "type": "text", "content": "Save"},
                    {"bbox": [0.9], "type": "icon"}
                ],
                "latency": 0.12
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let actor = PerceptionActor::new(
            Arc::new(ShmFrameSource::new(&region)),
            GroundingClient::new(client.clone(), "http://127.0.0.1:9"),
            ParserClient::new(client, server.uri()),
            Arc::new(Arbiter::new()),
        );

        let result = actor
            .parse_screen(&ScreenParseRequest {
                request_id: "req_parse".to_string(),
            })
            .await;

        assert!(result.error.is_empty(), "{}", result.error);
        assert_eq!(result.request_id, "req_parse");
        assert_eq!((result.width, result.height), (200, 100));
        assert_eq!(
            result.elements,
            vec![ScreenElement {
                kind: "text".to_string(),
                content: "Save".to_string(),
                left: 20,
                top: 20,
                right: 100,
                bottom: 40,
            }]
        );
    }

    #[tokio::test]
    async fn test_parse_screen_without_video_reports_error() {
        let actor = actor(Arc::new(NoVideo));
        let result = actor
            .parse_screen(&ScreenParseRequest {
                request_id: "req_2".to_string(),
            })
            .await;

        assert_eq!(result.request_id, "req_2");
        assert!(result.elements.is_empty());
        assert!(result.error.contains("not ready"));
    }
}
