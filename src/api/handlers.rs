//! API request handlers

use super::models::{
    AddWorkerRequest, DeployRequest, DeployResponse, HealthResponse, LogsQuery, LogsResponse,
    WaitQuery, WorkerInfo,
};
use super::routes::AppState;
use crate::config::AuthConfig;
use crate::error::FleetError;
use crate::supervisor::RouteSummary;
use crate::types::{RouteName, WorkerId};
use axum::{
    Json,
    extract::{Path, Query, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// GET /health - Manager health check
pub async fn health() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now(),
        }),
    )
}

/// GET /metrics - Prometheus metrics
pub async fn metrics(State(state): State<AppState>) -> String {
    state.prometheus_handle.render()
}

/// ANY /{user}/models/{model}[/] - Authorized prediction proxy
pub async fn predict(
    State(state): State<AppState>,
    Path((user, model)): Path<(String, String)>,
    request: Request,
) -> Response {
    let route = RouteName::new(user, model);
    if let Err(failure) = state.auth.authorize(request.headers(), &route) {
        return failure.into_response();
    }
    state.supervisor.predict(&route, request).await
}

/// GET /admin/routes - List every known route
pub async fn list_routes(State(state): State<AppState>) -> Json<Vec<RouteSummary>> {
    Json(state.supervisor.routes().await)
}

fn lifecycle_response(route: &RouteName, waited: bool) -> (StatusCode, Json<DeployResponse>) {
    let (code, status) = if waited {
        (StatusCode::OK, "online")
    } else {
        (StatusCode::ACCEPTED, "queued")
    };
    (
        code,
        Json(DeployResponse {
            user: route.user.clone(),
            model: route.model.clone(),
            status: status.to_string(),
        }),
    )
}

/// POST /admin/deployments - Deploy a model version
pub async fn create_deployment(
    State(state): State<AppState>,
    Query(query): Query<WaitQuery>,
    Json(req): Json<DeployRequest>,
) -> Result<(StatusCode, Json<DeployResponse>), FleetError> {
    let route = RouteName::new(req.user, req.model);

    if query.wait {
        state.supervisor.deploy(&route, req.version).await?;
    } else {
        state
            .supervisor
            .deploy_in_background(route.clone(), req.version);
    }

    Ok(lifecycle_response(&route, query.wait))
}

/// POST /admin/routes/{user}/{model}/sleep - Stop serving a route
pub async fn sleep_route(
    State(state): State<AppState>,
    Path((user, model)): Path<(String, String)>,
) -> Result<StatusCode, FleetError> {
    state.supervisor.sleep(&RouteName::new(user, model)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /admin/routes/{user}/{model}/wake - Redeploy a sleeping route
pub async fn wake_route(
    State(state): State<AppState>,
    Path((user, model)): Path<(String, String)>,
    Query(query): Query<WaitQuery>,
) -> Result<(StatusCode, Json<DeployResponse>), FleetError> {
    let route = RouteName::new(user, model);

    if query.wait {
        state.supervisor.wake(&route).await?;
    } else {
        // Reject right away rather than failing in the background
        if !state.supervisor.is_asleep(&route).await {
            return Err(FleetError::AlreadyAwake(route));
        }
        let supervisor = state.supervisor.clone();
        let task_route = route.clone();
        state.supervisor.spawn("wake", async move {
            supervisor.wake(&task_route).await
        });
    }

    Ok(lifecycle_response(&route, query.wait))
}

/// POST /admin/routes/{user}/{model}/restart - Redeploy the serving version
pub async fn restart_route(
    State(state): State<AppState>,
    Path((user, model)): Path<(String, String)>,
    Query(query): Query<WaitQuery>,
) -> Result<(StatusCode, Json<DeployResponse>), FleetError> {
    let route = RouteName::new(user, model);

    if query.wait {
        state.supervisor.restart(&route).await?;
    } else {
        state.supervisor.restart_in_background(route.clone());
    }

    Ok(lifecycle_response(&route, query.wait))
}

/// DELETE /admin/routes/{user}/{model} - Remove a route
pub async fn delete_route(
    State(state): State<AppState>,
    Path((user, model)): Path<(String, String)>,
) -> StatusCode {
    state.supervisor.delete(&RouteName::new(user, model)).await;
    StatusCode::NO_CONTENT
}

/// DELETE /admin/users/{user} - Remove every route of a user
pub async fn delete_user(State(state): State<AppState>, Path(user): Path<String>) -> StatusCode {
    state.supervisor.delete_user(&user, false).await;
    StatusCode::NO_CONTENT
}

/// GET /admin/workers - List workers with their load
pub async fn list_workers(State(state): State<AppState>) -> Json<Vec<WorkerInfo>> {
    let pool = state.supervisor.pool();
    let mut workers = Vec::new();
    for id in pool.workers().await {
        if let Some(instances) = pool.load(id).await {
            workers.push(WorkerInfo { id, instances });
        }
    }
    Json(workers)
}

/// POST /admin/workers - Add a worker to the pool
pub async fn add_worker(
    State(state): State<AppState>,
    Json(req): Json<AddWorkerRequest>,
) -> Result<(StatusCode, Json<WorkerInfo>), FleetError> {
    state.supervisor.add_worker(&req.url, req.id).await?;
    let instances = state.supervisor.pool().load(req.id).await.unwrap_or(0);

    Ok((
        StatusCode::CREATED,
        Json(WorkerInfo {
            id: req.id,
            instances,
        }),
    ))
}

/// DELETE /admin/workers/{id} - Remove a worker and destroy its instances
pub async fn remove_worker(
    State(state): State<AppState>,
    Path(id): Path<WorkerId>,
) -> Result<StatusCode, FleetError> {
    state.supervisor.remove_worker(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /admin/workers/{id}/release - Remove a worker, leaving its instances running
pub async fn release_worker(
    State(state): State<AppState>,
    Path(id): Path<WorkerId>,
) -> Result<StatusCode, FleetError> {
    state.supervisor.release_worker(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /admin/auth - Replace prediction credentials
pub async fn set_auth(State(state): State<AppState>, Json(config): Json<AuthConfig>) -> StatusCode {
    state.auth.set_auth(&config);
    StatusCode::NO_CONTENT
}

/// Resolve a Python-style index against `len`
fn slice_index(index: Option<i32>, len: usize, default: usize) -> usize {
    match index {
        Some(i) if i < 0 => (len as i64 + i as i64).max(0) as usize,
        Some(i) => (i as usize).min(len),
        None => default,
    }
}

/// GET /admin/routes/{user}/{model}/logs - Get route logs with Python-style slicing
pub async fn route_logs(
    State(state): State<AppState>,
    Path((user, model)): Path<(String, String)>,
    Query(params): Query<LogsQuery>,
) -> Result<Json<LogsResponse>, FleetError> {
    let route = RouteName::new(user, model);
    let lines = match params.deployment_id {
        Some(deploy_id) => {
            state
                .supervisor
                .read_deployment_logs(&route, deploy_id)
                .await?
        }
        None => state.supervisor.read_model_logs(&route).await?,
    };

    let total_lines = lines.len();
    let start = slice_index(params.start, total_lines, 0);
    let end = slice_index(params.end, total_lines, total_lines);

    let lines = if start < end {
        lines.into_iter().skip(start).take(end - start).collect()
    } else {
        Vec::new()
    };

    Ok(Json(LogsResponse {
        lines,
        start,
        end,
        total_lines,
    }))
}
