//! HTTP tool server.
//!
//! Serves the [`ToolRegistry`] as a small JSON API.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/tools/list` | All tools with schemas and side effects |
//! | `POST` | `/tools/{name}` | Call a tool |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! Errors are returned as
//!
//! ```json
//! { "error": { "code": "path_conflict", "message": "path /x is already registered to container 'a'" } }
//! ```
//!
//! with the code and status derived from the underlying [`FolioError`].

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use folio_core::error::{EmbeddingError, FolioError};

use crate::container::ContainerManager;
use crate::traits::{validate_params, ToolContext, ToolInfo, ToolRegistry};

#[derive(Clone)]
struct AppState {
    ctx: ToolContext,
    tools: Arc<ToolRegistry>,
}

/// Build the router. Split from [`run_server`] so tests can drive it.
pub fn router(manager: Arc<ContainerManager>, tools: Arc<ToolRegistry>) -> Router {
    let state = AppState {
        ctx: ToolContext::new(manager),
        tools,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/tools/list", get(handle_list_tools))
        .route("/tools/{name}", post(handle_tool_call))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Serve the built-in tools on `[server].bind` until the process ends.
pub async fn run_server(manager: Arc<ContainerManager>) -> anyhow::Result<()> {
    let bind_addr = manager.config().server.bind.clone();
    let tools = Arc::new(ToolRegistry::with_builtins());

    for t in tools.tools() {
        info!(tool = t.name(), "registered");
    }

    let app = router(manager, tools);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    println!("Folio tool server listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn error(status: StatusCode, code: &'static str, message: impl Into<String>) -> AppError {
    AppError {
        status,
        code,
        message: message.into(),
    }
}

/// Status code and error code for a domain error.
fn classify(err: &FolioError) -> (StatusCode, &'static str) {
    match err {
        FolioError::ContainerNotFound(_) => (StatusCode::NOT_FOUND, "container_not_found"),
        FolioError::PathNotRegistered { .. } => (StatusCode::NOT_FOUND, "path_not_registered"),
        FolioError::ContainerExists(_) => (StatusCode::CONFLICT, "container_exists"),
        FolioError::PathConflict { .. } => (StatusCode::CONFLICT, "path_conflict"),
        FolioError::IndexingInProgress(_) => (StatusCode::CONFLICT, "indexing_in_progress"),
        FolioError::InvalidContainerName(_) => (StatusCode::BAD_REQUEST, "invalid_container_name"),
        FolioError::InvalidPath { .. } => (StatusCode::BAD_REQUEST, "invalid_path"),
        FolioError::DefaultContainer => (StatusCode::BAD_REQUEST, "default_container"),
        FolioError::EmptyIndex(_) => (StatusCode::CONFLICT, "empty_index"),
        FolioError::IndexCorruption { .. } => (StatusCode::SERVICE_UNAVAILABLE, "index_corruption"),
        FolioError::Embedding(EmbeddingError::Disabled) => {
            (StatusCode::BAD_REQUEST, "embeddings_disabled")
        }
        FolioError::Embedding(EmbeddingError::Timeout(_)) => {
            (StatusCode::GATEWAY_TIMEOUT, "timeout")
        }
        FolioError::Embedding(_) => (StatusCode::BAD_GATEWAY, "embedding_error"),
        FolioError::Config(_) => (StatusCode::BAD_REQUEST, "config_error"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    }
}

fn classify_tool_error(tool_name: &str, err: anyhow::Error) -> AppError {
    let message = format!("{}: {}", tool_name, err);
    match err.downcast_ref::<FolioError>() {
        Some(e) => {
            let (status, code) = classify(e);
            error(status, code, message)
        }
        // Plain anyhow errors come from parameter checks inside tools.
        None => error(StatusCode::BAD_REQUEST, "bad_request", message),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /tools/list ============

#[derive(Serialize)]
struct ToolListResponse {
    tools: Vec<ToolInfo>,
}

async fn handle_list_tools(State(state): State<AppState>) -> Json<ToolListResponse> {
    Json(ToolListResponse {
        tools: state
            .tools
            .tools()
            .iter()
            .map(|t| ToolInfo::of(t.as_ref()))
            .collect(),
    })
}

// ============ POST /tools/{name} ============

async fn handle_tool_call(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(params): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, AppError> {
    let tool = state.tools.find(&name).ok_or_else(|| {
        error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no tool registered with name: {}", name),
        )
    })?;

    let params = validate_params(&tool.parameters_schema(), &params)
        .map_err(|e| error(StatusCode::BAD_REQUEST, "bad_request", e.to_string()))?;

    let result = tool.execute(params, &state.ctx).await.map_err(|e| {
        warn!(tool = %name, error = %e, "tool call failed");
        classify_tool_error(&name, e)
    })?;

    Ok(Json(serde_json::json!({ "result": result })))
}
