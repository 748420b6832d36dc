//! Command receiver: the HTTP surface the brain drives the host through.
//!
//! - `GET /status`: `{status: "online", resolution: [w, h]}`
//! - `POST /action`: click, type or scroll, forwarded to the controller
//! - `GET /screenshot`: latest captured frame as JPEG
//!
//! Runs on its own thread with its own runtime so a slow action never
//! stalls capture.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::capture::FrameCache;
use crate::controller::{clamp_to_screen, ControllerError, InputController, MouseButton};

const JPEG_QUALITY: u8 = 80;

/// Shared state of the receiver.
#[derive(Clone)]
pub struct BridgeState {
    pub controller: Arc<dyn InputController>,
    pub frames: FrameCache,
}

/// Create the receiver router.
pub fn create_router(state: BridgeState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/action", post(action))
        .route("/screenshot", get(screenshot))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub resolution: [u32; 2],
}

async fn status(State(state): State<BridgeState>) -> Json<StatusResponse> {
    let (width, height) = state.controller.screen_size();
    Json(StatusResponse {
        status: "online".to_string(),
        resolution: [width, height],
    })
}

/// Body of `POST /action`.
#[derive(Debug, Deserialize)]
struct ActionBody {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    x: i64,
    #[serde(default)]
    y: i64,
    #[serde(default)]
    button: Option<String>,
    #[serde(default)]
    double: bool,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    keys: Option<Vec<String>>,
    #[serde(default)]
    amount: i32,
}

fn reply(status: StatusCode, body: serde_json::Value) -> Response {
    (status, Json(body)).into_response()
}

fn bad_request(message: impl Into<String>) -> Response {
    let message = message.into();
    warn!(message = %message, "rejected action");
    reply(
        StatusCode::BAD_REQUEST,
        json!({ "status": "error", "message": message }),
    )
}

async fn action(State(state): State<BridgeState>, body: Bytes) -> Response {
    if body.is_empty() {
        return bad_request("no data provided");
    }
    let body: ActionBody = match serde_json::from_slice(&body) {
        Ok(body) => body,
        Err(e) => return bad_request(format!("invalid body: {e}")),
    };

    let controller = state.controller.clone();
    let outcome = match body.kind.as_deref() {
        Some("click") => {
            let button = match MouseButton::parse(body.button.as_deref().unwrap_or("left")) {
                Ok(button) => button,
                Err(e) => return bad_request(e.to_string()),
            };
            let (x, y) = clamp_to_screen(body.x, body.y, controller.screen_size());
            let double = body.double;
            forward(move || controller.click(x, y, button, double)).await
        }
        Some("type") => {
            let text = body.text;
            let keys = body.keys.unwrap_or_default();
            forward(move || controller.type_text(text.as_deref(), &keys)).await
        }
        Some("scroll") => {
            let amount = body.amount;
            forward(move || controller.scroll(amount)).await
        }
        Some(other) => return bad_request(format!("unknown action type: {other}")),
        None => return bad_request("missing action type"),
    };

    match outcome {
        Ok(()) => reply(StatusCode::OK, json!({ "status": "success" })),
        Err(e) => {
            error!(error = %e, "action failed");
            reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "status": "error", "message": e.to_string() }),
            )
        }
    }
}

/// Runs a blocking controller call off the async workers.
async fn forward<F>(call: F) -> Result<(), ControllerError>
where
    F: FnOnce() -> Result<(), ControllerError> + Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| ControllerError::Input(format!("controller task failed: {e}")))?
}

async fn screenshot(State(state): State<BridgeState>) -> Response {
    let Some(frame) = state.frames.latest() else {
        return reply(
            StatusCode::SERVICE_UNAVAILABLE,
            json!({ "status": "error", "message": "no frame captured yet" }),
        );
    };

    match tokio::task::spawn_blocking(move || frame.to_jpeg(JPEG_QUALITY)).await {
        Ok(Ok(jpeg)) => ([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response(),
        Ok(Err(e)) => reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "status": "error", "message": e.to_string() }),
        ),
        Err(e) => reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "status": "error", "message": e.to_string() }),
        ),
    }
}

// =============================================================================
// Server
// =============================================================================

/// Serves the receiver on its own thread and runtime until `cancel` fires.
pub fn spawn(
    addr: SocketAddr,
    state: BridgeState,
    cancel: CancellationToken,
) -> std::io::Result<JoinHandle<Result<()>>> {
    std::thread::Builder::new()
        .name("bridge".to_string())
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("failed to build bridge runtime")?;
            runtime.block_on(serve(addr, state, cancel))
        })
}

async fn serve(addr: SocketAddr, state: BridgeState, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind command receiver on {addr}"))?;
    info!(addr = %addr, "command receiver listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .context("command receiver failed")?;

    info!("command receiver stopped");
    Ok(())
}
