use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;

use super::sse;
use crate::errors::RunError;
use crate::orchestrator::RunService;
use crate::run::RunId;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub service: RunService,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct StartRunRequest {
    pub prompt: String,
    #[serde(default, alias = "projectName")]
    pub project_name: Option<String>,
}

#[derive(Deserialize)]
pub struct ReasonRequest {
    pub reason: String,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Conflict(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<RunError> for ApiError {
    fn from(err: RunError) -> Self {
        let message = err.to_string();
        match err {
            RunError::RunNotFound { .. } => ApiError::NotFound(message),
            RunError::InvalidTransition { .. } | RunError::NotWaitingForApproval { .. } => {
                ApiError::Conflict(message)
            }
            RunError::UnsafePath { .. } | RunError::InvalidInput(_) => ApiError::BadRequest(message),
            RunError::CapabilityFailure { .. } | RunError::StorageFailure(_) => {
                tracing::error!(error = %message, "Run operation failed");
                ApiError::Internal(message)
            }
        }
    }
}

pub(crate) fn parse_run_id(raw: &str) -> Result<RunId, ApiError> {
    raw.parse::<RunId>().map_err(ApiError::BadRequest)
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/runs", post(start_run))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/advance", post(advance_run))
        .route("/api/runs/{id}/deploy", post(deploy_run))
        .route("/api/runs/{id}/approve", post(approve_run))
        .route("/api/runs/{id}/reject", post(reject_run))
        .route("/api/runs/{id}/fail", post(fail_run))
        .route("/api/runs/{id}/retry", post(retry_run))
        .route("/api/runs/{id}/events", get(sse::stream_run_events))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn start_run(
    State(state): State<SharedState>,
    Json(req): Json<StartRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state
        .service
        .start_run(&req.prompt, req.project_name.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(run)))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let details = state.service.get_run(parse_run_id(&id)?).await?;
    Ok(Json(details))
}

async fn advance_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.service.advance_run(parse_run_id(&id)?).await?;
    Ok(Json(run))
}

async fn deploy_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.service.deploy_run(parse_run_id(&id)?).await?;
    Ok(Json(run))
}

async fn approve_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.service.approve_run(parse_run_id(&id)?).await?;
    Ok(Json(run))
}

async fn reject_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<ReasonRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state
        .service
        .reject_run(parse_run_id(&id)?, &req.reason)
        .await?;
    Ok(Json(run))
}

async fn fail_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<ReasonRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state
        .service
        .fail_run(parse_run_id(&id)?, &req.reason)
        .await?;
    Ok(Json(run))
}

async fn retry_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.service.retry_run(parse_run_id(&id)?).await?;
    Ok(Json(run))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::CapabilitySet;
    use crate::store::SqliteStore;
    use crate::workspace::FsWorkspace;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_app() -> (TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let workspace = Arc::new(FsWorkspace::new(dir.path()));
        let service = RunService::new(store.clone(), store, workspace, CapabilitySet::echo());
        let state = Arc::new(AppState { service });
        (dir, api_router().with_state(state))
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post_empty(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn create_run(app: &Router) -> String {
        let response = app
            .clone()
            .oneshot(post_json("/api/runs", serde_json::json!({"prompt": "build X"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let run: serde_json::Value = body_json(response.into_body()).await;
        run["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (_dir, app) = test_app();
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_start_run() {
        let (_dir, app) = test_app();
        let response = app
            .oneshot(post_json(
                "/api/runs",
                serde_json::json!({"prompt": "build X", "projectName": "demo"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let run: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(run["state"], "init");
        assert_eq!(run["prompt"], "build X");
        assert_eq!(run["project_name"], "demo");
        assert_eq!(run["retry_count"], 0);
    }

    #[tokio::test]
    async fn test_start_run_rejects_blank_prompt() {
        let (_dir, app) = test_app();
        let response = app
            .oneshot(post_json("/api/runs", serde_json::json!({"prompt": "  "})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("prompt"));
    }

    #[tokio::test]
    async fn test_get_run_includes_recent_events() {
        let (_dir, app) = test_app();
        let id = create_run(&app).await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/runs/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let details: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(details["id"], id.as_str());
        assert_eq!(details["recent_events"][0]["type"], "state_changed");
        assert_eq!(details["recent_events"][0]["seq"], 1);
    }

    #[tokio::test]
    async fn test_get_run_not_found() {
        let (_dir, app) = test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/runs/{}", RunId::new()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_run_id_is_bad_request() {
        let (_dir, app) = test_app();
        let response = app.oneshot(post_empty("/api/runs/not-a-uuid/advance")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_advance_moves_run_forward() {
        let (_dir, app) = test_app();
        let id = create_run(&app).await;

        let response = app
            .oneshot(post_empty(&format!("/api/runs/{}/advance", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let run: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(run["state"], "spec");
    }

    #[tokio::test]
    async fn test_approve_outside_gate_is_conflict() {
        let (_dir, app) = test_app();
        let id = create_run(&app).await;

        let response = app
            .oneshot(post_empty(&format!("/api/runs/{}/approve", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_reject_marks_run_failed() {
        let (_dir, app) = test_app();
        let id = create_run(&app).await;

        let response = app
            .oneshot(post_json(
                &format!("/api/runs/{}/reject", id),
                serde_json::json!({"reason": "scope creep"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let run: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(run["state"], "fail");
        assert_eq!(run["failure_reason"], "scope creep");
        assert_eq!(run["failure_kind"], "rejected");
    }

    #[tokio::test]
    async fn test_reject_requires_reason() {
        let (_dir, app) = test_app();
        let id = create_run(&app).await;

        let response = app
            .oneshot(post_json(
                &format!("/api/runs/{}/reject", id),
                serde_json::json!({"reason": ""}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_full_pipeline_over_http() {
        let (_dir, app) = test_app();
        let id = create_run(&app).await;

        for _ in 0..7 {
            let response = app
                .clone()
                .oneshot(post_empty(&format!("/api/runs/{}/advance", id)))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = app
            .clone()
            .oneshot(post_empty(&format!("/api/runs/{}/approve", id)))
            .await
            .unwrap();
        let run: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(run["state"], "deploy");

        let response = app
            .oneshot(post_empty(&format!("/api/runs/{}/deploy", id)))
            .await
            .unwrap();
        let run: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(run["state"], "done");
        assert_eq!(run["artifacts"].as_array().unwrap().len(), 7);
    }
}
