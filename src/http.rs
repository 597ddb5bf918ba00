//! HTTP surface (spec.md §6): one route table, one `AppState`, fixed
//! error-to-status mapping per spec.md §7. No business logic lives here
//! beyond translating wire envelopes to/from `envd-core` calls.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio_stream::StreamExt as _;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use envd_core::{FsError, ManagerError, ProcessManager, StartRequest};

use crate::wire::{
    ExecRequest, ExecResponse, KillQuery, PathQuery, StartResponse, StatResponse, StatusResponse,
};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ProcessManager>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/exec", post(exec))
        .route("/exec/start", post(exec_start))
        .route("/exec/{id}", get(status))
        .route("/exec/{id}/kill", post(kill))
        .route("/exec/{id}/stream", get(stream))
        .route("/exec/{id}/input", post(input))
        .route("/exec/{id}/fs", get(fs_read).put(fs_write))
        .route("/exec/{id}/fs/list", get(fs_list))
        .route("/exec/{id}/fs/stat", get(fs_stat))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// API-facing error, mapped once at the boundary per spec.md §7: errors
/// cross either via HTTP status or the handle's `error` field, never both.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

impl From<ManagerError> for ApiError {
    fn from(err: ManagerError) -> Self {
        let status = match err {
            ManagerError::NotFound => StatusCode::NOT_FOUND,
            ManagerError::NotRunning | ManagerError::StdinUnavailable => StatusCode::BAD_REQUEST,
            ManagerError::Exec(_) | ManagerError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<FsError> for ApiError {
    fn from(err: FsError) -> Self {
        let status = match &err {
            FsError::AbsolutePath | FsError::Escapes => StatusCode::BAD_REQUEST,
            FsError::Io(io_err) if io_err.kind() == std::io::ErrorKind::NotFound => {
                StatusCode::NOT_FOUND
            }
            FsError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

fn start_request_from_wire(req: ExecRequest) -> StartRequest {
    StartRequest {
        command: req.command,
        args: req.args,
        env: req.env,
        cwd: req.cwd,
        timeout_ms: req.timeout_ms,
    }
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn exec(
    State(state): State<AppState>,
    Json(req): Json<ExecRequest>,
) -> Result<Json<ExecResponse>, ApiError> {
    let output = state.manager.exec(start_request_from_wire(req)).await?;
    Ok(Json(ExecResponse {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.exit_code,
        error: output.error,
    }))
}

async fn exec_start(
    State(state): State<AppState>,
    Json(req): Json<ExecRequest>,
) -> Result<Json<StartResponse>, ApiError> {
    let id = state.manager.start(start_request_from_wire(req)).await?;
    Ok(Json(StartResponse { id }))
}

async fn status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let snapshot = state.manager.status(&id)?;
    Ok(Json(StatusResponse {
        id: snapshot.id,
        state: snapshot.state.as_wire_str(),
        exit_code: snapshot.exit_code,
        error: snapshot.err,
    }))
}

async fn kill(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<KillQuery>,
) -> Result<StatusCode, ApiError> {
    state.manager.kill(&id, query.force).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Concatenates stdout and stderr in arrival order (spec.md §6 framing: no
/// ordering guarantee between the two streams) into one chunked response.
async fn stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let handle = state.manager.handle(&id)?;

    let mut stdout_rx = handle.stdout_bcast.subscribe();
    let mut stderr_rx = handle.stderr_bcast.subscribe();
    let (tx, rx) = tokio::sync::mpsc::channel::<Vec<u8>>(32);

    tokio::spawn(async move {
        let mut stdout_open = true;
        let mut stderr_open = true;
        while stdout_open || stderr_open {
            tokio::select! {
                chunk = stdout_rx.recv(), if stdout_open => match chunk {
                    Some(bytes) => { if tx.send(bytes).await.is_err() { break; } }
                    None => stdout_open = false,
                },
                chunk = stderr_rx.recv(), if stderr_open => match chunk {
                    Some(bytes) => { if tx.send(bytes).await.is_err() { break; } }
                    None => stderr_open = false,
                },
            }
        }
    });

    let body_stream = ReceiverStream::new(rx).map(|chunk| Ok::<_, std::io::Error>(Bytes::from(chunk)));
    let body = Body::from_stream(body_stream);

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/octet-stream")
        .body(body)
        .expect("response builder with fixed headers cannot fail"))
}

async fn input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    state.manager.write_input(&id, body.to_vec()).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn fs_read(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PathQuery>,
) -> Result<Bytes, ApiError> {
    let handle = state.manager.handle(&id)?;
    let data = handle.fs.read_file(&query.path).await?;
    Ok(Bytes::from(data))
}

async fn fs_write(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PathQuery>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let handle = state.manager.handle(&id)?;
    handle.fs.write_file(&query.path, &body).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn fs_list(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PathQuery>,
) -> Result<Json<Vec<String>>, ApiError> {
    let handle = state.manager.handle(&id)?;
    let names = handle.fs.list_dir(&query.path).await?;
    Ok(Json(names))
}

async fn fs_stat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PathQuery>,
) -> Result<Json<StatResponse>, ApiError> {
    let handle = state.manager.handle(&id)?;
    let stat = handle.fs.stat(&query.path).await?;
    Ok(Json(StatResponse {
        size: stat.len,
        is_dir: stat.is_dir,
        mtime: stat.mtime,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body as AxumBody;
    use axum::http::Request;
    use envd_core::ManagerConfig;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        AppState {
            manager: ProcessManager::new(ManagerConfig {
                base_dir: std::env::temp_dir().join(format!("envd-http-test-{}", uuid::Uuid::new_v4())),
                subscriber_capacity: 16,
                reconcile_interval: std::time::Duration::from_secs(30),
                max_output_bytes: None,
            }),
        }
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let router = create_router(test_state());
        let response = router
            .oneshot(Request::builder().uri("/healthz").body(AxumBody::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn exec_echo_round_trip() {
        let router = create_router(test_state());
        let body = serde_json::json!({"command": "echo", "args": ["hello"]});
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/exec")
                    .header("content-type", "application/json")
                    .body(AxumBody::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["exitCode"], 0);
        assert_eq!(parsed["stdout"], "hello\n");
    }

    #[tokio::test]
    async fn exec_of_missing_binary_surfaces_error_in_body_not_500() {
        let router = create_router(test_state());
        let body = serde_json::json!({"command": "envd-this-binary-does-not-exist"});
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/exec")
                    .header("content-type", "application/json")
                    .body(AxumBody::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["exitCode"], -1);
        assert!(parsed["error"].is_string());
    }

    #[tokio::test]
    async fn status_of_unknown_id_is_404() {
        let router = create_router(test_state());
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/exec/does-not-exist")
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn fs_escape_is_400() {
        let router = create_router(test_state());
        let start = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/exec/start")
                    .header("content-type", "application/json")
                    .body(AxumBody::from(
                        serde_json::json!({"command": "sleep", "args": ["2"]}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(start.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let id = parsed["id"].as_str().unwrap();

        let response = router
            .oneshot(
                Request::builder()
                    .uri(format!("/exec/{id}/fs?path=../escape"))
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
