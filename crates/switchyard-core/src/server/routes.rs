//! HTTP handlers, one router per resource.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use switchyard_orchestrator::agents::{
    Agent, AgentRegistration, HeartbeatReport, NewTask, Task, TaskOutcome, TaskStatus,
};
use switchyard_orchestrator::context::{Context, ContextType, NewContext};
use switchyard_orchestrator::routing::{
    HealthCheckResult, RouteRequest, RouteResponse, ServiceInstance, ServiceRegistration,
};
use switchyard_orchestrator::workflow::{
    ExecutionStarted, Workflow, WorkflowDefinition, WorkflowExecution,
};
use switchyard_orchestrator::{HealthSummary, OrchestrationError};
use tracing::info;

use super::AppState;
use super::response::{ApiJson, ApiQuery, ApiResponse, ApiResult, OptionalJson, created, ok};

type AppStateArc = Arc<AppState>;

// ============================================================================
// Routing
// ============================================================================

pub fn route_routes() -> Router<AppStateArc> {
    Router::new().route("/route", post(route_request))
}

/// Always 200: routing failures are reported inside the envelope.
async fn route_request(
    State(state): State<AppStateArc>,
    ApiJson(request): ApiJson<RouteRequest>,
) -> Json<ApiResponse<RouteResponse>> {
    let response = state.orchestrator.routing().route(request).await;
    Json(ApiResponse { success: response.success, error: response.error.clone(), data: Some(response) })
}

// ============================================================================
// Services
// ============================================================================

pub fn service_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/services", get(list_services))
        .route("/services/register", post(register_service))
        .route("/services/deregister", post(deregister_service))
        .route("/services/:name", get(get_service))
        .route("/services/:name/health-check", post(check_service))
}

#[derive(Debug, Deserialize)]
struct DeregisterRequest {
    name: String,
    url: String,
}

#[derive(Debug, Serialize)]
struct Deregistered {
    deregistered: bool,
}

async fn register_service(
    State(state): State<AppStateArc>,
    ApiJson(registration): ApiJson<ServiceRegistration>,
) -> ApiResult<ServiceInstance> {
    let instance = state.orchestrator.registry().register(registration).await?;
    created(instance)
}

async fn deregister_service(
    State(state): State<AppStateArc>,
    ApiJson(request): ApiJson<DeregisterRequest>,
) -> ApiResult<Deregistered> {
    let deregistered = state.orchestrator.registry().deregister(&request.name, &request.url).await;
    ok(Deregistered { deregistered })
}

async fn list_services(
    State(state): State<AppStateArc>,
) -> ApiResult<HashMap<String, Vec<ServiceInstance>>> {
    ok(state.orchestrator.registry().snapshot().await)
}

async fn get_service(
    State(state): State<AppStateArc>,
    Path(name): Path<String>,
) -> ApiResult<Vec<ServiceInstance>> {
    ok(state.orchestrator.registry().list(&name).await)
}

async fn check_service(
    State(state): State<AppStateArc>,
    Path(name): Path<String>,
) -> ApiResult<Vec<HealthCheckResult>> {
    ok(state.orchestrator.registry().check_service(&name).await)
}

// ============================================================================
// Contexts
// ============================================================================

pub fn context_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/contexts", post(create_context).get(list_contexts))
        .route("/contexts/:id", get(get_context).put(update_context).delete(delete_context))
        .route("/contexts/:id/extend", post(extend_context))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContextQuery {
    user_id: Option<String>,
    session_id: Option<String>,
    #[serde(rename = "type")]
    context_type: Option<ContextType>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtendRequest {
    ttl_ms: u64,
}

#[derive(Debug, Serialize)]
struct Deleted {
    deleted: bool,
}

async fn create_context(
    State(state): State<AppStateArc>,
    ApiJson(params): ApiJson<NewContext>,
) -> ApiResult<Context> {
    created(state.orchestrator.contexts().create(params).await)
}

async fn list_contexts(
    State(state): State<AppStateArc>,
    ApiQuery(query): ApiQuery<ContextQuery>,
) -> ApiResult<Vec<Context>> {
    let contexts = state.orchestrator.contexts();
    let found = match (&query.user_id, &query.session_id) {
        (Some(user_id), _) => contexts.list_by_user(user_id, query.context_type).await,
        (None, Some(session_id)) => contexts.list_by_session(session_id, query.context_type).await,
        (None, None) => {
            return Err(OrchestrationError::Validation("userId or sessionId is required".into()).into());
        }
    };
    ok(found)
}

async fn get_context(State(state): State<AppStateArc>, Path(id): Path<String>) -> ApiResult<Context> {
    ok(state.orchestrator.contexts().get(&id).await?)
}

async fn update_context(
    State(state): State<AppStateArc>,
    Path(id): Path<String>,
    ApiJson(patch): ApiJson<Map<String, Value>>,
) -> ApiResult<Context> {
    ok(state.orchestrator.contexts().update(&id, patch).await?)
}

async fn delete_context(State(state): State<AppStateArc>, Path(id): Path<String>) -> ApiResult<Deleted> {
    if state.orchestrator.contexts().delete(&id).await {
        ok(Deleted { deleted: true })
    } else {
        Err(OrchestrationError::ContextNotFound(id).into())
    }
}

async fn extend_context(
    State(state): State<AppStateArc>,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<ExtendRequest>,
) -> ApiResult<Context> {
    ok(state.orchestrator.contexts().extend(&id, Duration::from_millis(request.ttl_ms)).await?)
}

// ============================================================================
// Agents
// ============================================================================

pub fn agent_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/agents", post(register_agent).get(list_agents))
        .route("/agents/:id", get(get_agent).delete(unregister_agent))
        .route("/agents/:id/heartbeat", post(heartbeat))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Unregistered {
    agent_id: String,
    cancelled_tasks: Vec<String>,
}

async fn register_agent(
    State(state): State<AppStateArc>,
    ApiJson(registration): ApiJson<AgentRegistration>,
) -> ApiResult<Agent> {
    created(state.orchestrator.coordinator().register_agent(registration).await?)
}

async fn list_agents(State(state): State<AppStateArc>) -> ApiResult<Vec<Agent>> {
    ok(state.orchestrator.coordinator().list_agents().await)
}

async fn get_agent(State(state): State<AppStateArc>, Path(id): Path<String>) -> ApiResult<Agent> {
    ok(state.orchestrator.coordinator().get_agent(&id).await?)
}

async fn unregister_agent(
    State(state): State<AppStateArc>,
    Path(id): Path<String>,
) -> ApiResult<Unregistered> {
    let cancelled_tasks = state.orchestrator.coordinator().unregister_agent(&id).await?;
    ok(Unregistered { agent_id: id, cancelled_tasks })
}

async fn heartbeat(
    State(state): State<AppStateArc>,
    Path(id): Path<String>,
    OptionalJson(report): OptionalJson<HeartbeatReport>,
) -> ApiResult<Agent> {
    let report = report.unwrap_or_default();
    ok(state.orchestrator.coordinator().heartbeat(&id, report).await?)
}

// ============================================================================
// Tasks
// ============================================================================

pub fn task_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/queue", get(queued_tasks))
        .route("/tasks/:id", get(get_task))
        .route("/tasks/:id/complete", post(complete_task))
        .route("/tasks/:id/cancel", post(cancel_task))
}

#[derive(Debug, Deserialize)]
struct TaskQuery {
    status: Option<TaskStatus>,
}

#[derive(Debug, Deserialize)]
struct CompleteRequest {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

impl From<CompleteRequest> for TaskOutcome {
    fn from(request: CompleteRequest) -> Self {
        match request.error {
            Some(error) => Self::Failed(error),
            None => Self::Succeeded(request.result),
        }
    }
}

async fn create_task(State(state): State<AppStateArc>, ApiJson(new_task): ApiJson<NewTask>) -> ApiResult<Task> {
    created(state.orchestrator.coordinator().create_task(new_task).await?)
}

async fn list_tasks(
    State(state): State<AppStateArc>,
    ApiQuery(query): ApiQuery<TaskQuery>,
) -> ApiResult<Vec<Task>> {
    ok(state.orchestrator.coordinator().list_tasks(query.status).await)
}

async fn queued_tasks(State(state): State<AppStateArc>) -> ApiResult<Vec<Task>> {
    ok(state.orchestrator.coordinator().queue_snapshot().await)
}

async fn get_task(State(state): State<AppStateArc>, Path(id): Path<String>) -> ApiResult<Task> {
    ok(state.orchestrator.coordinator().get_task(&id).await?)
}

async fn complete_task(
    State(state): State<AppStateArc>,
    Path(id): Path<String>,
    OptionalJson(body): OptionalJson<CompleteRequest>,
) -> ApiResult<Task> {
    let outcome = body.map_or(TaskOutcome::Succeeded(None), Into::into);
    ok(state.orchestrator.coordinator().complete_task(&id, outcome).await?)
}

async fn cancel_task(State(state): State<AppStateArc>, Path(id): Path<String>) -> ApiResult<Task> {
    ok(state.orchestrator.coordinator().cancel_task(&id).await?)
}

// ============================================================================
// Workflows
// ============================================================================

pub fn workflow_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/workflows", post(create_workflow).get(list_workflows))
        .route("/workflows/events/:name", post(fire_event))
        .route("/workflows/:id", get(get_workflow))
        .route("/workflows/:id/execute", post(execute_workflow))
        .route("/executions", get(list_executions))
        .route("/executions/:id", get(get_execution).delete(cancel_execution))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteRequest {
    #[serde(default)]
    context_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionQuery {
    workflow_id: Option<String>,
}

async fn create_workflow(
    State(state): State<AppStateArc>,
    ApiJson(definition): ApiJson<WorkflowDefinition>,
) -> ApiResult<Workflow> {
    created(state.orchestrator.workflows().create_workflow(definition).await?)
}

async fn list_workflows(State(state): State<AppStateArc>) -> ApiResult<Vec<Workflow>> {
    ok(state.orchestrator.workflows().list_workflows().await)
}

async fn get_workflow(State(state): State<AppStateArc>, Path(id): Path<String>) -> ApiResult<Workflow> {
    ok(state.orchestrator.workflows().get_workflow(&id).await?)
}

async fn execute_workflow(
    State(state): State<AppStateArc>,
    Path(id): Path<String>,
    OptionalJson(body): OptionalJson<ExecuteRequest>,
) -> ApiResult<ExecutionStarted> {
    let request = body.unwrap_or_default();
    let started = state.orchestrator.workflows().execute_workflow(&id, request.context_id).await?;
    info!(workflow_id = %id, execution_id = %started.execution_id, "Workflow execution requested");
    created(started)
}

async fn fire_event(
    State(state): State<AppStateArc>,
    Path(name): Path<String>,
    OptionalJson(body): OptionalJson<ExecuteRequest>,
) -> ApiResult<Vec<ExecutionStarted>> {
    let request = body.unwrap_or_default();
    ok(state.orchestrator.workflows().trigger_event(&name, request.context_id).await?)
}

async fn list_executions(
    State(state): State<AppStateArc>,
    ApiQuery(query): ApiQuery<ExecutionQuery>,
) -> ApiResult<Vec<WorkflowExecution>> {
    ok(state.orchestrator.workflows().list_executions(query.workflow_id.as_deref()).await)
}

async fn get_execution(
    State(state): State<AppStateArc>,
    Path(id): Path<String>,
) -> ApiResult<WorkflowExecution> {
    ok(state.orchestrator.workflows().get_execution(&id).await?)
}

async fn cancel_execution(
    State(state): State<AppStateArc>,
    Path(id): Path<String>,
) -> ApiResult<WorkflowExecution> {
    ok(state.orchestrator.workflows().cancel_execution(&id).await?)
}

// ============================================================================
// Health
// ============================================================================

pub fn health_routes() -> Router<AppStateArc> {
    Router::new().route("/health", get(health))
}

async fn health(State(state): State<AppStateArc>) -> (StatusCode, Json<ApiResponse<HealthSummary>>) {
    (StatusCode::OK, Json(ApiResponse::ok(state.orchestrator.health().await)))
}
