use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use url::Url;

use crate::{
    orchestrator::{Orchestrator, WorkerLaunch},
    slug::ProjectId,
};

/// How preview addresses are derived from a project id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewConfig {
    pub scheme: String,
    pub domain: String,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            scheme: "http".into(),
            domain: "localhost:8000".into(),
        }
    }
}

impl PreviewConfig {
    pub fn url_for(&self, project_id: &ProjectId) -> String {
        format!("{}://{}.{}", self.scheme, project_id, self.domain)
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<dyn Orchestrator>,
    pub preview: PreviewConfig,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    #[serde(default, alias = "gitURL")]
    pub source_location: Option<String>,
    #[serde(default, alias = "slug")]
    pub project_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployResponse {
    pub status: String,
    pub project_id: String,
    pub preview_url: String,
    pub log_channel: String,
}

pub fn build_router(state: ApiState, allowed_origins: Vec<axum::http::HeaderValue>) -> Router {
    let cors = if allowed_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed_origins))
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE])
    };

    Router::new()
        .route("/healthz", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/project", post(deploy_project))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<ApiState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// POST /project - start a build worker for a source location.
pub async fn deploy_project(
    State(state): State<ApiState>,
    payload: Result<Json<DeployRequest>, JsonRejection>,
) -> Result<Json<DeployResponse>, ApiError> {
    let validated = payload
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
        .and_then(|Json(request)| validate(request));
    let launch = match validated {
        Ok(launch) => launch,
        Err(err) => {
            counter!("harbor_deploy_requests_total", "outcome" => "invalid").increment(1);
            return Err(err);
        }
    };

    info!(
        project_id = %launch.project_id,
        source_location = %launch.source_location,
        "starting build worker"
    );

    match state.orchestrator.start_worker(&launch).await {
        Ok(handle) => {
            counter!("harbor_deploy_requests_total", "outcome" => "queued").increment(1);
            info!(
                project_id = %launch.project_id,
                task_arn = ?handle.task_arn,
                "build worker queued"
            );
            Ok(Json(DeployResponse {
                status: "queued".into(),
                preview_url: state.preview.url_for(&launch.project_id),
                log_channel: launch.project_id.log_channel(),
                project_id: launch.project_id.to_string(),
            }))
        }
        Err(err) => {
            counter!("harbor_deploy_requests_total", "outcome" => "failed").increment(1);
            warn!(project_id = %launch.project_id, error = %err, "deployment failed");
            Err(ApiError::DeploymentFailed(err.to_string()))
        }
    }
}

fn validate(request: DeployRequest) -> Result<WorkerLaunch, ApiError> {
    let source_location = request
        .source_location
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::BadRequest("sourceLocation is required".into()))?;
    Url::parse(&source_location)
        .map_err(|err| ApiError::BadRequest(format!("sourceLocation is not a valid URL: {err}")))?;

    let project_id = match request.project_id.as_deref() {
        Some(raw) => ProjectId::parse(raw).map_err(|err| ApiError::BadRequest(err.to_string()))?,
        None => ProjectId::generate(),
    };

    Ok(WorkerLaunch {
        source_location,
        project_id,
    })
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    DeploymentFailed(String),
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, "bad_request", message),
            ApiError::DeploymentFailed(message) => {
                (StatusCode::BAD_GATEWAY, "deployment_failed", message)
            }
        };
        (status, Json(ApiErrorBody { error, message })).into_response()
    }
}
