//! HTTP handlers over `WorkflowEngine`.
//!
//! Mutating routes take the acting user from the `X-User-Id` header.

use actix_web::dev::Payload;
use actix_web::http::StatusCode;
use actix_web::{
    get, post, web, FromRequest, HttpRequest, HttpResponse, Responder, ResponseError,
    Result as ActixResult,
};
use actix_ws::Message;
use loomcore::{EngineError, ExecutionId, InteractionId, NodeId, WorkflowGraph, WorkflowId};
use loomruntime::{WorkflowCatalog, WorkflowEngine};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::{ready, Ready};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

pub const USER_HEADER: &str = "X-User-Id";

/// Application state shared across handlers
pub struct AppState {
    pub engine: WorkflowEngine,
    pub catalog: Arc<WorkflowCatalog>,
}

/// User named by the `X-User-Id` header
pub struct ActingUser(pub String);

impl FromRequest for ActingUser {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let user = req
            .headers()
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        ready(match user {
            Some(user) => Ok(ActingUser(user.to_string())),
            None => Err(actix_web::error::ErrorBadRequest(format!(
                "missing {} header",
                USER_HEADER
            ))),
        })
    }
}

/// Engine error rendered as `{"error": kind, "message": ...}`
#[derive(Debug)]
pub struct ApiError(EngineError);

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError(e)
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self.0.kind() {
            "validation" => StatusCode::BAD_REQUEST,
            "not_found" => StatusCode::NOT_FOUND,
            "interaction_unavailable" | "concurrency_conflict" | "retry_limit_exceeded" => {
                StatusCode::CONFLICT
            }
            "timeout" => StatusCode::GONE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
        }))
    }
}

type ApiResult = Result<HttpResponse, ApiError>;

#[derive(Debug, Default, Deserialize)]
struct StartRequest {
    #[serde(default)]
    trigger_context: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct SkipRequest {
    #[serde(default = "default_skip_reason")]
    reason: String,
}

fn default_skip_reason() -> String {
    "skipped by operator".to_string()
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    #[serde(default)]
    data: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct CancelInteractionRequest {
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    #[serde(default)]
    skip: usize,
    #[serde(default = "default_take")]
    take: usize,
}

fn default_take() -> usize {
    100
}

#[derive(Debug, Deserialize)]
struct EventQuery {
    execution_id: Option<ExecutionId>,
}

/// Health check endpoint
#[get("/health")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "loom"
    }))
}

#[get("/api/workflows")]
async fn list_workflows(data: web::Data<AppState>) -> impl Responder {
    let workflows: Vec<_> = data
        .catalog
        .list()
        .await
        .iter()
        .map(|w| {
            json!({
                "id": w.id,
                "name": w.name,
                "description": w.description,
                "nodes": w.nodes.len(),
                "edges": w.edges.len(),
            })
        })
        .collect();
    HttpResponse::Ok().json(workflows)
}

/// Validate and register a workflow
#[post("/api/workflows")]
async fn create_workflow(
    data: web::Data<AppState>,
    workflow: web::Json<WorkflowGraph>,
) -> ApiResult {
    let workflow = workflow.into_inner();
    data.engine.validate_workflow(&workflow)?;
    info!("Creating workflow: {} ({})", workflow.name, workflow.id);
    let id = data.catalog.register_workflow(workflow).await;
    Ok(HttpResponse::Created().json(json!({ "id": id })))
}

#[get("/api/workflows/{id}")]
async fn get_workflow(data: web::Data<AppState>, path: web::Path<WorkflowId>) -> ApiResult {
    use loomruntime::WorkflowSource;

    let id = path.into_inner();
    let workflow = data
        .catalog
        .get_workflow(id)
        .await
        .ok_or(EngineError::WorkflowNotFound(id))?;
    Ok(HttpResponse::Ok().json(workflow))
}

#[post("/api/workflows/{id}/executions")]
async fn start_execution(
    data: web::Data<AppState>,
    path: web::Path<WorkflowId>,
    user: ActingUser,
    body: Option<web::Json<StartRequest>>,
) -> ApiResult {
    let trigger_context = body.map(|b| b.into_inner()).unwrap_or_default().trigger_context;
    let execution_id = data
        .engine
        .start_execution(path.into_inner(), trigger_context, &user.0)
        .await?;
    Ok(HttpResponse::Created().json(json!({ "execution_id": execution_id })))
}

#[get("/api/executions")]
async fn list_active_executions(data: web::Data<AppState>) -> ApiResult {
    Ok(HttpResponse::Ok().json(data.engine.list_active_executions().await?))
}

/// Requeue or fail work orphaned by a previous process
#[post("/api/executions/recover")]
async fn recover(data: web::Data<AppState>) -> ApiResult {
    let recovered = data.engine.recover().await?;
    Ok(HttpResponse::Ok().json(json!({ "recovered": recovered })))
}

#[get("/api/executions/{id}")]
async fn get_status(data: web::Data<AppState>, path: web::Path<ExecutionId>) -> ApiResult {
    Ok(HttpResponse::Ok().json(data.engine.get_status(path.into_inner()).await?))
}

#[post("/api/executions/{id}/pause")]
async fn pause(data: web::Data<AppState>, path: web::Path<ExecutionId>, user: ActingUser) -> ApiResult {
    Ok(HttpResponse::Ok().json(data.engine.pause(path.into_inner(), &user.0).await?))
}

#[post("/api/executions/{id}/resume")]
async fn resume(data: web::Data<AppState>, path: web::Path<ExecutionId>, user: ActingUser) -> ApiResult {
    Ok(HttpResponse::Ok().json(data.engine.resume(path.into_inner(), &user.0).await?))
}

#[post("/api/executions/{id}/cancel")]
async fn cancel(data: web::Data<AppState>, path: web::Path<ExecutionId>, user: ActingUser) -> ApiResult {
    Ok(HttpResponse::Ok().json(data.engine.cancel(path.into_inner(), &user.0).await?))
}

#[post("/api/executions/{id}/nodes/{node_id}/execute")]
async fn execute_node(
    data: web::Data<AppState>,
    path: web::Path<(ExecutionId, NodeId)>,
    user: ActingUser,
) -> ApiResult {
    let (id, node_id) = path.into_inner();
    Ok(HttpResponse::Ok().json(data.engine.execute_node(id, &node_id, &user.0).await?))
}

#[post("/api/executions/{id}/nodes/{node_id}/retry")]
async fn retry_node(
    data: web::Data<AppState>,
    path: web::Path<(ExecutionId, NodeId)>,
    user: ActingUser,
) -> ApiResult {
    let (id, node_id) = path.into_inner();
    Ok(HttpResponse::Ok().json(data.engine.retry_node(id, &node_id, &user.0).await?))
}

#[post("/api/executions/{id}/nodes/{node_id}/skip")]
async fn skip_node(
    data: web::Data<AppState>,
    path: web::Path<(ExecutionId, NodeId)>,
    user: ActingUser,
    body: Option<web::Json<SkipRequest>>,
) -> ApiResult {
    let (id, node_id) = path.into_inner();
    let reason = body.map(|b| b.into_inner().reason).unwrap_or_else(default_skip_reason);
    Ok(HttpResponse::Ok().json(
        data.engine
            .skip_node(id, &node_id, &reason, &user.0)
            .await?,
    ))
}

#[post("/api/executions/{id}/nodes/{node_id}/interactions/{interaction_id}")]
async fn complete_ui_interaction(
    data: web::Data<AppState>,
    path: web::Path<(ExecutionId, NodeId, InteractionId)>,
    user: ActingUser,
    body: web::Json<SubmitRequest>,
) -> ApiResult {
    let (id, node_id, interaction_id) = path.into_inner();
    let outcome = data
        .engine
        .complete_ui_interaction(id, &node_id, interaction_id, body.into_inner().data, &user.0)
        .await?;
    Ok(HttpResponse::Ok().json(outcome))
}

#[get("/api/executions/{id}/outputs")]
async fn get_all_outputs(data: web::Data<AppState>, path: web::Path<ExecutionId>) -> ApiResult {
    Ok(HttpResponse::Ok().json(data.engine.get_all_outputs(path.into_inner()).await?))
}

#[get("/api/executions/{id}/outputs/{node_id}")]
async fn get_output(
    data: web::Data<AppState>,
    path: web::Path<(ExecutionId, NodeId)>,
) -> ApiResult {
    let (id, node_id) = path.into_inner();
    match data.engine.get_output(id, &node_id).await? {
        Some(output) => Ok(HttpResponse::Ok().json(output)),
        None => Ok(HttpResponse::NoContent().finish()),
    }
}

#[get("/api/executions/{id}/statistics")]
async fn get_statistics(data: web::Data<AppState>, path: web::Path<ExecutionId>) -> ApiResult {
    Ok(HttpResponse::Ok().json(data.engine.get_statistics(path.into_inner()).await?))
}

#[get("/api/executions/{id}/logs")]
async fn get_logs(
    data: web::Data<AppState>,
    path: web::Path<ExecutionId>,
    query: web::Query<LogQuery>,
) -> ApiResult {
    let logs = data
        .engine
        .get_logs(path.into_inner(), query.skip, query.take)
        .await?;
    Ok(HttpResponse::Ok().json(logs))
}

#[get("/api/executions/{id}/interactions")]
async fn list_interactions_for_execution(
    data: web::Data<AppState>,
    path: web::Path<ExecutionId>,
) -> ApiResult {
    Ok(HttpResponse::Ok().json(
        data.engine
            .list_interactions_for_execution(path.into_inner())
            .await?,
    ))
}

/// Pending interactions assigned to the acting user
#[get("/api/interactions/pending")]
async fn list_pending_interactions(data: web::Data<AppState>, user: ActingUser) -> ApiResult {
    Ok(HttpResponse::Ok().json(
        data.engine
            .list_pending_interactions_for_user(&user.0)
            .await?,
    ))
}

#[post("/api/interactions/sweep")]
async fn sweep_interactions(data: web::Data<AppState>) -> ApiResult {
    let timed_out = data.engine.process_timed_out_interactions().await?;
    Ok(HttpResponse::Ok().json(json!({ "timed_out": timed_out })))
}

#[get("/api/interactions/{id}")]
async fn get_interaction(data: web::Data<AppState>, path: web::Path<InteractionId>) -> ApiResult {
    Ok(HttpResponse::Ok().json(data.engine.get_interaction(path.into_inner()).await?))
}

#[post("/api/interactions/{id}/submit")]
async fn submit_interaction(
    data: web::Data<AppState>,
    path: web::Path<InteractionId>,
    user: ActingUser,
    body: web::Json<SubmitRequest>,
) -> ApiResult {
    let outcome = data
        .engine
        .submit_interaction(path.into_inner(), body.into_inner().data, &user.0)
        .await?;
    Ok(HttpResponse::Ok().json(outcome))
}

#[post("/api/interactions/{id}/cancel")]
async fn cancel_interaction(
    data: web::Data<AppState>,
    path: web::Path<InteractionId>,
    user: ActingUser,
    body: Option<web::Json<CancelInteractionRequest>>,
) -> ApiResult {
    let reason = body.map(|b| b.into_inner().reason).unwrap_or_default();
    let outcome = data
        .engine
        .cancel_interaction(path.into_inner(), &user.0, &reason)
        .await?;
    Ok(HttpResponse::Ok().json(outcome))
}

/// List available node types
#[get("/api/nodes")]
async fn list_node_types(data: web::Data<AppState>) -> impl Responder {
    let registry = data.engine.registry();
    let nodes: Vec<_> = registry
        .list_node_types()
        .iter()
        .map(|node_type| {
            let metadata = registry.get_metadata(node_type).unwrap_or_default();
            json!({
                "type": node_type,
                "description": metadata.description,
                "category": metadata.category,
                "inputs": metadata.inputs.iter().map(|p| &p.name).collect::<Vec<_>>(),
                "outputs": metadata.outputs.iter().map(|p| &p.name).collect::<Vec<_>>(),
            })
        })
        .collect();
    HttpResponse::Ok().json(nodes)
}

/// WebSocket stream of execution events, optionally for one execution
#[get("/api/events")]
async fn websocket_events(
    req: HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
    query: web::Query<EventQuery>,
) -> ActixResult<HttpResponse> {
    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;
    let filter = query.execution_id;
    let mut events = data.engine.subscribe_events();

    info!(execution_id = ?filter, "WebSocket client connected");

    actix_web::rt::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        if filter.is_some_and(|id| id != event.execution_id()) {
                            continue;
                        }
                        if let Ok(text) = serde_json::to_string(&event) {
                            if session.text(text).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("WebSocket client lagged, {} events dropped", missed);
                    }
                    Err(RecvError::Closed) => break,
                },

                Some(Ok(msg)) = msg_stream.recv() => match msg {
                    Message::Ping(bytes) => {
                        if session.pong(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                },

                else => break,
            }
        }

        info!("WebSocket client disconnected");
        let _ = session.close(None).await;
    });

    Ok(res)
}

/// Register every route. Literal segments come before `{id}` captures.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health_check)
        .service(list_workflows)
        .service(create_workflow)
        .service(get_workflow)
        .service(start_execution)
        .service(list_active_executions)
        .service(recover)
        .service(get_status)
        .service(pause)
        .service(resume)
        .service(cancel)
        .service(execute_node)
        .service(retry_node)
        .service(skip_node)
        .service(complete_ui_interaction)
        .service(get_all_outputs)
        .service(get_output)
        .service(get_statistics)
        .service(get_logs)
        .service(list_interactions_for_execution)
        .service(list_pending_interactions)
        .service(sweep_interactions)
        .service(get_interaction)
        .service(submit_interaction)
        .service(cancel_interaction)
        .service(list_node_types)
        .service(websocket_events);
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};
    use loomcore::NodeSpec;

    fn state() -> web::Data<AppState> {
        let catalog = Arc::new(WorkflowCatalog::new());
        let engine = WorkflowEngine::builder()
            .registry(Arc::new(loomnodes::builtin_registry()))
            .workflows(catalog.clone())
            .build();
        web::Data::new(AppState { engine, catalog })
    }

    fn approval() -> WorkflowGraph {
        let mut workflow = WorkflowGraph::new("approval");
        workflow.add_node(NodeSpec::interaction("approve", "Approve"));
        workflow.add_node(NodeSpec::new("log", "debug.log"));
        workflow.connect("approve", "log");
        workflow
    }

    #[actix_web::test]
    async fn test_interaction_flow_over_http() {
        let state = state();
        let app = test::init_service(App::new().app_data(state.clone()).configure(configure)).await;

        let req = test::TestRequest::post()
            .uri("/api/workflows")
            .set_json(approval())
            .to_request();
        let created: Value = test::call_and_read_body_json(&app, req).await;
        let workflow_id = created["id"].as_str().unwrap().to_string();

        let req = test::TestRequest::post()
            .uri(&format!("/api/workflows/{}/executions", workflow_id))
            .insert_header((USER_HEADER, "alice"))
            .set_json(json!({"trigger_context": {"message": "hi"}}))
            .to_request();
        let started: Value = test::call_and_read_body_json(&app, req).await;
        let execution_id: ExecutionId = started["execution_id"].as_str().unwrap().parse().unwrap();

        let req = test::TestRequest::get()
            .uri("/api/interactions/pending")
            .insert_header((USER_HEADER, "alice"))
            .to_request();
        let pending: Vec<Value> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(pending.len(), 1);
        let interaction_id = pending[0]["id"].as_str().unwrap().to_string();

        let req = test::TestRequest::post()
            .uri(&format!("/api/interactions/{}/submit", interaction_id))
            .insert_header((USER_HEADER, "alice"))
            .set_json(json!({"data": {"approved": true}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());

        let req = test::TestRequest::post()
            .uri(&format!("/api/interactions/{}/submit", interaction_id))
            .insert_header((USER_HEADER, "bob"))
            .set_json(json!({"data": {"approved": false}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let exec = state
            .engine
            .wait_for_completion(execution_id)
            .await
            .unwrap();
        assert_eq!(exec.status, loomcore::ExecutionStatus::Completed);
    }

    #[actix_web::test]
    async fn test_errors_map_to_status_codes() {
        let state = state();
        let app = test::init_service(App::new().app_data(state).configure(configure)).await;

        let req = test::TestRequest::post()
            .uri(&format!("/api/executions/{}/pause", uuid::Uuid::new_v4()))
            .insert_header((USER_HEADER, "alice"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], json!("not_found"));

        let mut cyclic = WorkflowGraph::new("cyclic");
        cyclic.add_node(NodeSpec::new("a", "debug.log"));
        cyclic.add_node(NodeSpec::new("b", "debug.log"));
        cyclic.connect("a", "b");
        cyclic.connect("b", "a");
        let req = test::TestRequest::post()
            .uri("/api/workflows")
            .set_json(cyclic)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::post()
            .uri(&format!("/api/executions/{}/cancel", uuid::Uuid::new_v4()))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
