//! HTTP API.
//!
//! Maps requests onto the lifecycle controllers and the catalog. Error bodies
//! are `{"detail": "..."}`.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::catalog::{Catalog, Project};
use crate::error::ManagerError;
use crate::lifecycle::{ServiceController, ServiceStatus, StartOutcome, StopOutcome};
use crate::project::{ProjectController, ProjectReport};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<Catalog>,
    pub services: ServiceController,
    pub projects: ProjectController,
    pub static_dir: PathBuf,
}

impl AppState {
    pub fn new(services: ServiceController, static_dir: PathBuf) -> Self {
        Self {
            catalog: services.catalog().clone(),
            projects: ProjectController::new(services.clone()),
            services,
            static_dir,
        }
    }
}

/// A `ManagerError` rendered as an HTTP response.
pub struct ApiError(ManagerError);

impl From<ManagerError> for ApiError {
    fn from(err: ManagerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            err if err.is_not_found() => StatusCode::NOT_FOUND,
            ManagerError::Conflict(_) => StatusCode::BAD_REQUEST,
            err => {
                error!(error = %err, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "detail": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/projects", get(list_projects).post(register_project))
        .route(
            "/projects/{project_id}",
            get(get_project).delete(unregister_project),
        )
        .route("/projects/{project_id}/start", post(start_project))
        .route("/projects/{project_id}/stop", post(stop_project))
        .route("/services/status", get(list_service_status))
        .route("/services/{service_id}/status", get(service_status))
        .route("/services/{service_id}/start", post(start_service))
        .route("/services/{service_id}/stop", post(stop_service))
        .with_state(state)
}

/// Serves the API on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("server error")
}

async fn index(State(state): State<AppState>) -> Response {
    let path = state.static_dir.join("index.html");
    match tokio::fs::read_to_string(&path).await {
        Ok(body) => Html(body).into_response(),
        Err(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": "index not found" })),
        )
            .into_response(),
    }
}

async fn list_projects(State(state): State<AppState>) -> Json<Vec<Project>> {
    Json(state.catalog.projects().await)
}

async fn register_project(
    State(state): State<AppState>,
    Json(project): Json<Project>,
) -> ApiResult<Project> {
    let outcome = state.catalog.register(project.clone()).await?;
    info!(project = %project.id, ?outcome, "registered project");
    Ok(Json(project))
}

async fn get_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<Project> {
    state
        .catalog
        .project(&project_id)
        .await
        .map(Json)
        .ok_or_else(|| ManagerError::ProjectNotFound(project_id).into())
}

async fn unregister_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    state.catalog.unregister(&project_id).await?;
    info!(project = %project_id, "unregistered project");
    Ok(Json(
        json!({ "status": "unregistered", "project_id": project_id }),
    ))
}

async fn start_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<ProjectReport> {
    Ok(Json(state.projects.start(&project_id).await?))
}

async fn stop_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<ProjectReport> {
    Ok(Json(state.projects.stop(&project_id).await?))
}

async fn list_service_status(State(state): State<AppState>) -> Json<Vec<ServiceStatus>> {
    Json(state.projects.status_all().await)
}

async fn service_status(
    State(state): State<AppState>,
    Path(service_id): Path<String>,
) -> ApiResult<ServiceStatus> {
    Ok(Json(state.services.status(&service_id).await?))
}

async fn start_service(
    State(state): State<AppState>,
    Path(service_id): Path<String>,
) -> ApiResult<StartOutcome> {
    Ok(Json(state.services.start(&service_id).await?))
}

async fn stop_service(
    State(state): State<AppState>,
    Path(service_id): Path<String>,
) -> ApiResult<StopOutcome> {
    Ok(Json(state.services.stop(&service_id).await?))
}
