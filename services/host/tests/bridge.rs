//! Command receiver routes, driven in-process.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use bravebird_host::bridge::{create_router, BridgeState};
use bravebird_host::capture::FrameCache;
use bravebird_host::controller::{DryRunController, MouseButton, RecordedInput};
use bravebird_shm::Frame;
use serde_json::{json, Value};
use tower::ServiceExt;

fn router(controller: Arc<DryRunController>, frames: FrameCache) -> Router {
    create_router(BridgeState { controller, frames })
}

async fn send(router: Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

fn post_action(body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/action")
        .header(header::CONTENT_TYPE, "application/json")
        .body(body.into())
        .unwrap()
}

#[tokio::test]
async fn test_status_reports_resolution() {
    let controller = Arc::new(DryRunController::new(1280, 720));
    let request = Request::get("/status").body(Body::empty()).unwrap();

    let (status, body) = send(router(controller, FrameCache::new()), request).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body, json!({ "status": "online", "resolution": [1280, 720] }));
}

#[tokio::test]
async fn test_click_is_clamped_to_screen() {
    let controller = Arc::new(DryRunController::new(100, 50));
    let body = json!({ "type": "click", "x": 500, "y": -3, "button": "right", "double": true });

    let (status, response) = send(
        router(controller.clone(), FrameCache::new()),
        post_action(body.to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let response: Value = serde_json::from_slice(&response).unwrap();
    assert_eq!(response["status"], "success");
    assert_eq!(
        controller.recorded(),
        vec![RecordedInput::Click {
            x: 99,
            y: 0,
            button: MouseButton::Right,
            double: true,
        }]
    );
}

#[tokio::test]
async fn test_type_and_scroll() {
    let controller = Arc::new(DryRunController::new(100, 50));
    let app = router(controller.clone(), FrameCache::new());

    let typed = json!({ "type": "type", "text": "hello", "keys": ["enter"] });
    let (status, _) = send(app.clone(), post_action(typed.to_string())).await;
    assert_eq!(status, StatusCode::OK);

    let scrolled = json!({ "type": "scroll", "amount": -3 });
    let (status, _) = send(app, post_action(scrolled.to_string())).await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(
        controller.recorded(),
        vec![
            RecordedInput::Type {
                text: Some("hello".to_string()),
                keys: vec!["enter".to_string()],
            },
            RecordedInput::Scroll(-3),
        ]
    );
}

#[tokio::test]
async fn test_empty_body_is_rejected() {
    let controller = Arc::new(DryRunController::new(100, 50));
    let (status, body) = send(router(controller.clone(), FrameCache::new()), post_action("")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["status"], "error");
    assert!(controller.recorded().is_empty());
}

#[tokio::test]
async fn test_unknown_type_is_rejected() {
    let controller = Arc::new(DryRunController::new(100, 50));
    let body = json!({ "type": "teleport", "x": 1, "y": 1 });

    let (status, body) = send(
        router(controller.clone(), FrameCache::new()),
        post_action(body.to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert!(body["message"].as_str().unwrap().contains("teleport"));
    assert!(controller.recorded().is_empty());
}

#[tokio::test]
async fn test_controller_failure_is_500() {
    let controller = Arc::new(DryRunController::new(100, 50).failing("input blocked"));
    let body = json!({ "type": "click", "x": 1, "y": 1 });

    let (status, body) = send(router(controller, FrameCache::new()), post_action(body.to_string())).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert!(body["message"].as_str().unwrap().contains("input blocked"));
}

#[tokio::test]
async fn test_screenshot() {
    let controller = Arc::new(DryRunController::new(4, 4));
    let frames = FrameCache::new();
    let app = router(controller, frames.clone());

    let request = || Request::get("/screenshot").body(Body::empty()).unwrap();
    let (status, _) = send(app.clone(), request()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    frames.store(Frame {
        timestamp: 1.0,
        width: 4,
        height: 4,
        sequence: 2,
        pixels: vec![0x80; 4 * 4 * 4],
    });
    let (status, body) = send(app, request()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..2], &[0xFF, 0xD8]);
}
