//! Engine API Server
//!
//! REST endpoints consumed by the dashboard and the CLI:
//! - Module discovery: registry dashboard
//! - Module management: catalog, deploy, scale, undeploy, per-instance operations, orphans
//! - Reconciliation: zombie cleanup, drift report
//! - Pipelines: definition CRUD, validation, execution order
//! - Clusters: list, create, delete
//! - Events: server-sent deployment events

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use super::dashboard::{summarize, Dashboard};
use super::resources::{OperationStatus, ResourceList};
use super::state::AppState;
use crate::cluster::ClusterRequest;
use crate::error::{EngineError, EngineResult};
use crate::modules::{LifecycleError, ModuleDescriptor, ModuleInstance};
use crate::pipeline::{PipelineDefinition, ValidationMode, ValidationResult};

/// Create the engine router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/metrics", get(metrics))
        // Discovery
        .route("/api/v1/module-discovery/dashboard", get(dashboard))
        // Module management
        .route(
            "/api/v1/module-management/available",
            get(list_available).post(publish_module),
        )
        .route("/api/v1/module-management/deployed", get(list_deployed))
        .route("/api/v1/module-management/orphaned", get(list_orphaned))
        .route(
            "/api/v1/module-management/orphaned/{container_id}/redeploy",
            post(redeploy_orphan),
        )
        .route("/api/v1/module-management/{module}/deploy", post(deploy_module))
        .route("/api/v1/module-management/{module}/scale-up", post(scale_up_module))
        .route("/api/v1/module-management/{module}/undeploy", delete(undeploy_module))
        .route("/api/v1/module-management/{module}/instances", get(list_module_instances))
        .route(
            "/api/v1/module-management/{module}/instance/{instance_id}",
            get(get_instance).delete(undeploy_instance),
        )
        .route(
            "/api/v1/module-management/{module}/instance/{instance_id}/enable",
            post(enable_instance),
        )
        .route(
            "/api/v1/module-management/{module}/instance/{instance_id}/disable",
            post(disable_instance),
        )
        .route(
            "/api/v1/module-management/{module}/instance/{instance_id}/registration",
            delete(deregister_instance),
        )
        // Reconciliation
        .route("/api/v1/modules/cleanup-zombies", post(cleanup_zombies))
        .route("/api/v1/modules/reconcile", get(reconcile_report))
        // Pipelines
        .route(
            "/api/v1/pipelines/definitions",
            get(list_pipelines).post(create_pipeline),
        )
        .route("/api/v1/pipelines/definitions/validate", post(validate_draft))
        .route(
            "/api/v1/pipelines/definitions/{id}",
            get(get_pipeline).put(update_pipeline).delete(delete_pipeline),
        )
        .route("/api/v1/pipelines/definitions/{id}/validate", post(validate_stored))
        .route(
            "/api/v1/pipelines/definitions/{id}/execution-order",
            get(execution_order),
        )
        // Clusters
        .route("/api/v1/clusters", get(list_clusters))
        .route(
            "/api/v1/clusters/{name}",
            get(get_cluster).post(create_cluster).delete(delete_cluster),
        )
        // Connections
        .route("/api/v1/connections", get(list_connections))
        .route("/api/v1/connections/{service}/resolve", post(resolve_connection))
        // Events
        .route("/api/v1/module-deployment/events", get(deployment_events))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Request / response types
// ============================================================================

/// `?validationMode=DESIGN|DEPLOY`, case-insensitive, DESIGN when absent
#[derive(Debug, Default, Deserialize)]
pub struct ModeQuery {
    #[serde(rename = "validationMode")]
    pub validation_mode: Option<String>,
}

impl ModeQuery {
    fn mode(&self, default: ValidationMode) -> EngineResult<ValidationMode> {
        match self.validation_mode.as_deref() {
            None | Some("") => Ok(default),
            Some(raw) => raw.parse().map_err(EngineError::InvalidRequest),
        }
    }
}

/// Returned by calls whose work continues in the background
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Accepted {
    pub status: String,
    pub module_name: String,
    pub instance_ids: Vec<String>,
    pub message: String,
}

impl Accepted {
    fn new(module_name: &str, instance_ids: Vec<String>, message: impl Into<String>) -> Self {
        Self {
            status: "accepted".to_string(),
            module_name: module_name.to_string(),
            instance_ids,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupResponse {
    pub removed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedService {
    pub service: String,
    pub endpoints: Vec<String>,
}

// ============================================================================
// Status
// ============================================================================

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

async fn dashboard(State(state): State<AppState>) -> EngineResult<Json<Dashboard>> {
    let advertised = state.registry.all_instances().await?;
    let zombie_count = match state.reconciler.scan().await {
        Ok(report) => report.zombies.len(),
        Err(e) => {
            warn!("Dashboard zombie count from last report: {}", e);
            state
                .reconciler
                .last_report()
                .map(|r| r.zombies.len())
                .unwrap_or(0)
        }
    };
    let catalog: HashSet<String> = state.catalog.list().into_iter().map(|d| d.name).collect();
    Ok(Json(summarize(&advertised, &catalog, zombie_count)))
}

// ============================================================================
// Module management
// ============================================================================

async fn list_available(State(state): State<AppState>) -> impl IntoResponse {
    Json(ResourceList::new("ModuleList", state.catalog.list()))
}

async fn publish_module(
    State(state): State<AppState>,
    Json(descriptor): Json<ModuleDescriptor>,
) -> EngineResult<impl IntoResponse> {
    if state.catalog.contains(&descriptor.name) {
        return Err(EngineError::Conflict(format!(
            "Module '{}' is already published",
            descriptor.name
        )));
    }
    state.catalog.publish(descriptor.clone())?;
    info!("Published module '{}' ({})", descriptor.name, descriptor.image);
    Ok((StatusCode::CREATED, Json(descriptor)))
}

async fn list_deployed(State(state): State<AppState>) -> impl IntoResponse {
    Json(ResourceList::new("ModuleInstanceList", state.lifecycle.list()))
}

async fn list_orphaned(State(state): State<AppState>) -> EngineResult<impl IntoResponse> {
    let orphans = state.reconciler.orphans().await?;
    Ok(Json(ResourceList::new("OrphanList", orphans)))
}

async fn redeploy_orphan(
    State(state): State<AppState>,
    Path(container_id): Path<String>,
) -> EngineResult<impl IntoResponse> {
    let instance_id = state.reconciler.redeploy_orphan(&container_id).await?;
    let module_name = state
        .lifecycle
        .get(&instance_id)
        .map(|i| i.module_name)
        .unwrap_or_default();
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted::new(
            &module_name,
            vec![instance_id],
            format!("Adopting container {}", container_id),
        )),
    ))
}

async fn deploy_module(
    State(state): State<AppState>,
    Path(module): Path<String>,
) -> EngineResult<impl IntoResponse> {
    let instance_id = state.lifecycle.deploy(&module).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted::new(
            &module,
            vec![instance_id],
            "Deployment started; follow /api/v1/module-deployment/events",
        )),
    ))
}

async fn scale_up_module(
    State(state): State<AppState>,
    Path(module): Path<String>,
) -> EngineResult<impl IntoResponse> {
    let instance_id = state.lifecycle.scale_up(&module).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted::new(&module, vec![instance_id], "Additional instance starting")),
    ))
}

async fn undeploy_module(
    State(state): State<AppState>,
    Path(module): Path<String>,
) -> EngineResult<impl IntoResponse> {
    let ids = state.lifecycle.instance_ids_of(&module);
    if ids.is_empty() && !state.catalog.contains(&module) {
        return Err(LifecycleError::ModuleUnknown(module).into());
    }

    let lifecycle = state.lifecycle.clone();
    let name = module.clone();
    tokio::spawn(async move {
        let removed = lifecycle.undeploy_module(&name).await;
        info!("Undeployed {} instances of '{}'", removed.len(), name);
    });

    let message = format!("Undeploying {} instances", ids.len());
    Ok((StatusCode::ACCEPTED, Json(Accepted::new(&module, ids, message))))
}

async fn list_module_instances(
    State(state): State<AppState>,
    Path(module): Path<String>,
) -> EngineResult<impl IntoResponse> {
    let instances = state.lifecycle.list_module(&module);
    if instances.is_empty() && !state.catalog.contains(&module) {
        return Err(LifecycleError::ModuleUnknown(module).into());
    }
    Ok(Json(ResourceList::new("ModuleInstanceList", instances)))
}

async fn get_instance(
    State(state): State<AppState>,
    Path((module, instance_id)): Path<(String, String)>,
) -> EngineResult<Json<ModuleInstance>> {
    Ok(Json(tracked_instance(&state, &module, &instance_id)?))
}

async fn undeploy_instance(
    State(state): State<AppState>,
    Path((module, instance_id)): Path<(String, String)>,
) -> EngineResult<impl IntoResponse> {
    let instance = tracked_instance(&state, &module, &instance_id)?;
    if instance.state.is_terminal() {
        return Err(LifecycleError::AlreadyTerminal(instance_id).into());
    }

    let lifecycle = state.lifecycle.clone();
    let id = instance_id.clone();
    tokio::spawn(async move {
        if let Err(e) = lifecycle.undeploy(&id).await {
            warn!("Undeploy of {} failed: {}", id, e);
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted::new(&module, vec![instance_id], "Undeploy started")),
    ))
}

async fn enable_instance(
    State(state): State<AppState>,
    Path((module, instance_id)): Path<(String, String)>,
) -> EngineResult<Json<ModuleInstance>> {
    tracked_instance(&state, &module, &instance_id)?;
    Ok(Json(state.lifecycle.enable(&instance_id).await?))
}

async fn disable_instance(
    State(state): State<AppState>,
    Path((module, instance_id)): Path<(String, String)>,
) -> EngineResult<Json<ModuleInstance>> {
    tracked_instance(&state, &module, &instance_id)?;
    Ok(Json(state.lifecycle.disable(&instance_id).await?))
}

async fn deregister_instance(
    State(state): State<AppState>,
    Path((module, instance_id)): Path<(String, String)>,
) -> EngineResult<Json<ModuleInstance>> {
    tracked_instance(&state, &module, &instance_id)?;
    Ok(Json(state.lifecycle.deregister(&instance_id).await?))
}

/// A tracked instance of `module`; GONE ids answer AlreadyTerminal
fn tracked_instance(state: &AppState, module: &str, instance_id: &str) -> EngineResult<ModuleInstance> {
    match state.lifecycle.get(instance_id) {
        Some(instance) if instance.module_name == module => Ok(instance),
        Some(_) => Err(LifecycleError::InstanceNotFound(instance_id.to_string()).into()),
        None if state.lifecycle.is_tombstoned(instance_id) => {
            Err(LifecycleError::AlreadyTerminal(instance_id.to_string()).into())
        }
        None => Err(LifecycleError::InstanceNotFound(instance_id.to_string()).into()),
    }
}

// ============================================================================
// Reconciliation
// ============================================================================

async fn cleanup_zombies(State(state): State<AppState>) -> EngineResult<Json<CleanupResponse>> {
    let removed = state.reconciler.cleanup_zombies().await?;
    Ok(Json(CleanupResponse { removed }))
}

async fn reconcile_report(State(state): State<AppState>) -> EngineResult<impl IntoResponse> {
    Ok(Json(state.reconciler.scan().await?))
}

// ============================================================================
// Pipelines
// ============================================================================

async fn list_pipelines(State(state): State<AppState>) -> EngineResult<impl IntoResponse> {
    let pipelines = state.pipelines.list().await?;
    Ok(Json(ResourceList::new("PipelineList", pipelines)))
}

async fn create_pipeline(
    State(state): State<AppState>,
    Query(query): Query<ModeQuery>,
    Json(definition): Json<PipelineDefinition>,
) -> EngineResult<impl IntoResponse> {
    let mode = query.mode(ValidationMode::Design)?;
    let stored = state.pipelines.create(definition, mode).await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn get_pipeline(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> EngineResult<impl IntoResponse> {
    Ok(Json(state.pipelines.get(&id).await?))
}

async fn update_pipeline(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ModeQuery>,
    Json(definition): Json<PipelineDefinition>,
) -> EngineResult<impl IntoResponse> {
    let mode = query.mode(ValidationMode::Design)?;
    Ok(Json(state.pipelines.update(&id, definition, mode).await?))
}

async fn delete_pipeline(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> EngineResult<impl IntoResponse> {
    state.pipelines.delete(&id).await?;
    Ok(Json(OperationStatus::success(format!("Pipeline '{}' deleted", id))))
}

/// Validation results are data: an invalid pipeline is still a 200
async fn validate_draft(
    State(state): State<AppState>,
    Query(query): Query<ModeQuery>,
    Json(definition): Json<PipelineDefinition>,
) -> EngineResult<Json<ValidationResult>> {
    let mode = query.mode(ValidationMode::Deploy)?;
    Ok(Json(state.pipelines.validate(&definition, mode).await))
}

async fn validate_stored(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ModeQuery>,
) -> EngineResult<Json<ValidationResult>> {
    let mode = query.mode(ValidationMode::Deploy)?;
    Ok(Json(state.pipelines.validate_stored(&id, mode).await?))
}

async fn execution_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> EngineResult<impl IntoResponse> {
    Ok(Json(state.pipelines.execution_order(&id).await?))
}

// ============================================================================
// Clusters
// ============================================================================

async fn list_clusters(State(state): State<AppState>) -> EngineResult<impl IntoResponse> {
    let clusters = state.clusters.list().await?;
    Ok(Json(ResourceList::new("ClusterList", clusters)))
}

async fn get_cluster(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> EngineResult<impl IntoResponse> {
    Ok(Json(state.clusters.get(&name).await?))
}

async fn create_cluster(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> EngineResult<impl IntoResponse> {
    // The body is optional
    let request: ClusterRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ClusterRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| EngineError::InvalidRequest(e.to_string()))?
    };
    let cluster = state.clusters.create(&name, request).await?;
    Ok((StatusCode::CREATED, Json(cluster)))
}

async fn delete_cluster(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> EngineResult<impl IntoResponse> {
    state.clusters.delete(&name).await?;
    Ok(Json(OperationStatus::success(format!("Cluster '{}' deleted", name))))
}

// ============================================================================
// Connections
// ============================================================================

async fn list_connections(State(state): State<AppState>) -> impl IntoResponse {
    Json(ResourceList::new("ConnectionList", state.connections.cached_services()))
}

async fn resolve_connection(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> EngineResult<Json<ResolvedService>> {
    let handle = state.connections.resolve(&service).await?;
    Ok(Json(ResolvedService {
        service: handle.service_name().to_string(),
        endpoints: handle.endpoints(),
    }))
}

// ============================================================================
// Events
// ============================================================================

/// One SSE message per deployment event; the SSE event name repeats the
/// JSON `type` field
async fn deployment_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let stream = state
        .events
        .stream()
        .map(|event| Event::default().event(event.kind.as_str()).json_data(&event));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::modules::{Collaborators, ModuleCatalog, ModuleType, StaticProbe};
    use crate::registry::InMemoryRegistry;
    use crate::runtime::InMemoryRuntime;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use std::sync::Arc;
    use tower::ServiceExt;

    fn create_test_app() -> Router {
        let registry = Arc::new(InMemoryRegistry::new());
        let deps = Collaborators {
            registry: registry.clone(),
            kv: registry,
            runtime: Arc::new(InMemoryRuntime::new()),
            probe: Arc::new(StaticProbe::new(true)),
        };
        let catalog = ModuleCatalog::with_descriptors([ModuleDescriptor::new(
            "echo",
            ModuleType::Processor,
            "modules/echo:1",
        )])
        .unwrap();
        create_router(AppState::new(&EngineConfig::default(), catalog, deps))
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = create_test_app();

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_list_available_modules() {
        let app = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/module-management/available")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["kind"], "ModuleList");
        assert_eq!(body["items"][0]["name"], "echo");
    }

    #[tokio::test]
    async fn test_deploy_unknown_module_is_not_found() {
        let app = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/module-management/ghost/deploy")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"]["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_deploy_is_accepted() {
        let app = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/module-management/echo/deploy")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["status"], "accepted");
        assert_eq!(body["instanceIds"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_pipeline_design_and_deploy_modes() {
        let app = create_test_app();
        let draft = serde_json::json!({
            "name": "p1",
            "steps": {"a": {"module": "ghost"}}
        });

        let response = app
            .clone()
            .oneshot(json_request("POST", "/api/v1/pipelines/definitions", draft.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["validationStatus"]["valid"], true);

        let strict = serde_json::json!({
            "name": "p2",
            "description": "strict",
            "steps": {"a": {"module": "ghost"}}
        });
        let response = app
            .oneshot(json_request(
                "POST",
                "/api/v1/pipelines/definitions?validationMode=DEPLOY",
                strict,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert_eq!(body["error"]["kind"], "validation_failed");
        assert_eq!(body["error"]["validation"]["issues"][0]["rule"], "moduleExists");
    }

    #[tokio::test]
    async fn test_invalid_validation_mode() {
        let app = create_test_app();
        let response = app
            .oneshot(json_request(
                "POST",
                "/api/v1/pipelines/definitions/validate?validationMode=strict",
                serde_json::json!({"name": "p"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_validate_draft_returns_result_as_data() {
        let app = create_test_app();
        let response = app
            .oneshot(json_request(
                "POST",
                "/api/v1/pipelines/definitions/validate",
                serde_json::json!({
                    "name": "dup",
                    "steps": {"x": {"module": "echo"}, "x": {"module": "echo"}}
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["valid"], false);
        let unique: Vec<&serde_json::Value> = body["issues"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|i| i["rule"] == "uniqueStepNames")
            .collect();
        assert_eq!(unique.len(), 1);
        assert_eq!(unique[0]["field"], "steps");
    }

    #[tokio::test]
    async fn test_default_cluster_cannot_be_deleted() {
        let app = create_test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/v1/clusters/default")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_cleanup_zombies_on_empty_registry() {
        let app = create_test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/modules/cleanup-zombies")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["removed"], 0);
    }

    #[tokio::test]
    async fn test_unknown_instance_is_not_found() {
        let app = create_test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/v1/module-management/echo/instance/echo-missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_resolve_unknown_service() {
        let app = create_test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/connections/nothing/resolve")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
