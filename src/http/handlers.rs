use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::builder::SetupRequest;
use crate::engine::ExecuteRequest;
use crate::error::{CoreError, Result};

use super::AppState;

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn setup_environment(
    State(state): State<AppState>,
    Json(req): Json<SetupRequest>,
) -> Result<Json<serde_json::Value>> {
    let env = state.builder.setup(req, CancellationToken::new()).await?;
    Ok(Json(json!({
        "id": env.id,
        "status": env.status.as_str(),
        "mainModule": env.main_module,
        "runtime": env.runtime.as_str(),
        "createdAt": env.created_at,
        "ttlSeconds": env.ttl_seconds,
    })))
}

pub async fn execute_environment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<serde_json::Value>> {
    let outcome = state.engine.execute(id, req, CancellationToken::new()).await?;
    Ok(Json(json!({
        "executionId": outcome.execution_id,
        "exitCode": outcome.exit_code,
        "stdout": outcome.stdout,
        "stderr": outcome.stderr,
        "durationMs": outcome.duration_ms,
    })))
}

pub async fn list_environments(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let envs = state.store.environments().await;
    let list = envs.list()?;
    Ok(Json(json!(list
        .into_iter()
        .map(|env| json!({
            "id": env.id,
            "mainModule": env.main_module,
            "runtime": env.runtime.as_str(),
            "status": env.status.as_str(),
            "createdAt": env.created_at,
            "lastExecutedAt": env.last_executed_at,
            "executionCount": env.execution_count,
            "ttlSeconds": env.ttl_seconds,
        }))
        .collect::<Vec<_>>())))
}

pub async fn get_environment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>> {
    let envs = state.store.environments().await;
    let env = envs
        .get(&id)?
        .ok_or_else(|| CoreError::NotFound(format!("environment {id} not found")))?;

    Ok(Json(json!({
        "id": env.id,
        "mainModule": env.main_module,
        "runtime": env.runtime.as_str(),
        "status": env.status.as_str(),
        "createdAt": env.created_at,
        "lastExecutedAt": env.last_executed_at,
        "executionCount": env.execution_count,
        "ttlSeconds": env.ttl_seconds,
    })))
}

pub async fn delete_environment(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode> {
    let env = {
        let envs = state.store.environments().await;
        envs.get(&id)?
            .ok_or_else(|| CoreError::NotFound(format!("environment {id} not found")))?
    };

    state.runtime.remove_volume(&env.volume_name).await?;

    let envs = state.store.environments().await;
    envs.delete(&id)?;

    Ok(StatusCode::NO_CONTENT)
}
