//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::manager::TaskManager;
use crate::store::StorageMetrics;
use crate::task::{CreateTaskInput, Task, TaskError};
use crate::tools::{self, ToolDefinition, ToolRegistry, UpdateTaskArgs};

use super::events;
use super::types::*;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub manager: Arc<TaskManager>,
    pub tools: ToolRegistry,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error_response(err: TaskError) -> ApiError {
    let status = if err.is_validation() {
        StatusCode::BAD_REQUEST
    } else if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    let details = match err.root() {
        TaskError::Validation(validation) => serde_json::to_value(&validation.issues).ok(),
        _ => None,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("Request failed: {}", err);
    }
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            details,
        }),
    )
}

/// Build the router over `state`.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/task/*path", get(get_task))
        .route("/api/tasks/update", post(update_task))
        .route("/api/metrics", get(get_metrics))
        .route("/api/events", get(events::stream))
        .route("/api/tools", get(list_tools))
        .route("/api/tools/:name", post(call_tool))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config, manager: Arc<TaskManager>) -> anyhow::Result<()> {
    let state = Arc::new(AppState {
        tools: ToolRegistry::new(Arc::clone(&manager)),
        config: config.clone(),
        manager,
    });
    let app = router(Arc::clone(&state));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = state.manager.close().await {
        tracing::warn!("Failed to close task store: {}", e);
    }
    tracing::info!("Graceful shutdown complete");

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, closing task store...");
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        persistent: state.manager.is_persistent(),
        transaction_id: state.manager.events().current_transaction_id(),
    })
}

async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<Vec<Task>>, ApiError> {
    let tasks = match query.parent.as_deref() {
        Some(parent) => state.manager.get_children(parent).await,
        None => state.manager.list_tasks().await,
    };
    tasks.map(Json).map_err(error_response)
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(input): Json<CreateTaskInput>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let task = state.manager.create_task(input).await.map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Result<Json<Task>, ApiError> {
    let path = path.trim_start_matches('/');
    match state.manager.get_task(path).await {
        Ok(Some(task)) => Ok(Json(task)),
        Ok(None) => Err(error_response(TaskError::not_found(path))),
        Err(e) => Err(error_response(e)),
    }
}

async fn update_task(
    State(state): State<Arc<AppState>>,
    Json(args): Json<UpdateTaskArgs>,
) -> Result<Json<Task>, ApiError> {
    tools::update_task(&state.manager, args)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn get_metrics(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StorageMetrics>, ApiError> {
    state
        .manager
        .get_metrics()
        .await
        .map(Json)
        .map_err(error_response)
}

async fn list_tools(State(state): State<Arc<AppState>>) -> Json<Vec<ToolDefinition>> {
    Json(state.tools.get_tool_schemas())
}

async fn call_tool(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(args): Json<Value>,
) -> Result<Json<ToolCallResponse>, (StatusCode, String)> {
    if !state.tools.has_tool(&name) {
        return Err((StatusCode::NOT_FOUND, format!("Unknown tool: {}", name)));
    }
    match state.tools.execute(&name, args).await {
        Ok(result) => Ok(Json(ToolCallResponse { tool: name, result })),
        Err(e) => Err((StatusCode::BAD_REQUEST, e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::store::InMemoryTaskStore;
    use crate::task::TaskStatus;
    use serde_json::json;

    fn state() -> Arc<AppState> {
        let manager = Arc::new(TaskManager::new(
            Arc::new(InMemoryTaskStore::new()),
            Arc::new(EventBus::new(16)),
        ));
        Arc::new(AppState {
            config: Config::in_memory(),
            tools: ToolRegistry::new(Arc::clone(&manager)),
            manager,
        })
    }

    #[tokio::test]
    async fn test_create_get_and_update() {
        let state = state();
        let (status, Json(created)) = create_task(
            State(Arc::clone(&state)),
            Json(CreateTaskInput::new("proj/api", "API")),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created.parent_path.as_deref(), Some("proj"));

        let Json(task) = get_task(State(Arc::clone(&state)), Path("proj/api".to_string()))
            .await
            .unwrap();
        assert_eq!(task.id, created.id);

        let args: UpdateTaskArgs = serde_json::from_value(json!({
            "path": "proj/api",
            "updates": { "status": "IN_PROGRESS" }
        }))
        .unwrap();
        let Json(updated) = update_task(State(Arc::clone(&state)), Json(args)).await.unwrap();
        assert_eq!(updated.status, TaskStatus::InProgress);

        let Json(health) = health(State(state)).await;
        assert_eq!(health.transaction_id, 2);
        assert!(!health.persistent);
    }

    #[tokio::test]
    async fn test_error_status_codes() {
        let state = state();
        let (status, _) = get_task(State(Arc::clone(&state)), Path("missing".to_string()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, Json(body)) = create_task(
            State(Arc::clone(&state)),
            Json(CreateTaskInput::new("/bad/", "Bad")),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.details.is_some());

        let (status, _) = call_tool(State(state), Path("nope".to_string()), Json(json!({})))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
