//! End-to-end lifecycle tests against in-memory collaborators
//!
//! Wires a full AppState the way `serve` does, then drives deploy,
//! registration, reconciliation, adoption and undeploy through it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::timeout;

use modplane::config::EngineConfig;
use modplane::events::{DeploymentEventKind, DeploymentView, ObservedStatus};
use modplane::modules::{
    Collaborators, DeploymentState, LifecycleError, ModuleCatalog, ModuleDescriptor, ModuleType,
    StaticProbe,
};
use modplane::pipeline::{PipelineDefinition, StepConfig, ValidationMode};
use modplane::registry::{InMemoryRegistry, ServiceRegistration, ServiceRegistry, MODULE_TAG};
use modplane::runtime::{
    ContainerInfo, InMemoryRuntime, LABEL_INSTANCE, LABEL_MANAGED, LABEL_MODULE,
};
use modplane::server::AppState;

struct Engine {
    state: AppState,
    registry: Arc<InMemoryRegistry>,
    runtime: Arc<InMemoryRuntime>,
}

/// Health and registration timings short enough for tests
fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.lifecycle.health.first_check_after_secs = 0;
    config.lifecycle.health.probe_interval_secs = 0;
    config.lifecycle.health.success_threshold = 1;
    config.lifecycle.health.timeout_secs = 5;
    config.lifecycle.registration_confirm_interval_ms = 10;
    config.lifecycle.max_instances_per_module = 2;
    config
}

fn engine() -> Engine {
    let registry = Arc::new(InMemoryRegistry::new());
    let runtime = Arc::new(InMemoryRuntime::new());
    let deps = Collaborators {
        registry: registry.clone(),
        kv: registry.clone(),
        runtime: runtime.clone(),
        probe: Arc::new(StaticProbe::new(true)),
    };
    let catalog = ModuleCatalog::with_descriptors([
        ModuleDescriptor::new("echo", ModuleType::Processor, "modules/echo:1"),
        ModuleDescriptor::new("chunker", ModuleType::Processor, "modules/chunker:1"),
    ])
    .unwrap();

    Engine {
        state: AppState::new(&fast_config(), catalog, deps),
        registry,
        runtime,
    }
}

async fn wait_for_state(state: &AppState, id: &str, expected: DeploymentState) {
    for _ in 0..300 {
        if state.lifecycle.get(id).map(|i| i.state) == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "{} never reached {:?}, now {:?}",
        id,
        expected,
        state.lifecycle.get(id).map(|i| i.state)
    );
}

fn stale_registration(id: &str) -> ServiceRegistration {
    ServiceRegistration {
        id: id.to_string(),
        name: "echo".to_string(),
        address: "10.0.0.9".to_string(),
        port: 50051,
        tags: vec![MODULE_TAG.to_string()],
        meta: HashMap::new(),
    }
}

fn lost_container(container_id: &str, instance_id: &str) -> ContainerInfo {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
    labels.insert(LABEL_INSTANCE.to_string(), instance_id.to_string());
    labels.insert(LABEL_MODULE.to_string(), "echo".to_string());
    ContainerInfo {
        id: container_id.to_string(),
        name: instance_id.to_string(),
        image: "modules/echo:1".to_string(),
        running: true,
        address: "127.0.0.1".to_string(),
        ports: [("grpc".to_string(), 50051)].into_iter().collect(),
        labels,
        sidecars: vec![],
    }
}

#[tokio::test]
async fn test_deploy_register_resolve_undeploy() {
    let engine = engine();
    let state = &engine.state;
    let mut events = state.events.stream();

    let id = state.lifecycle.deploy("echo").await.unwrap();
    wait_for_state(state, &id, DeploymentState::Active).await;

    // Subscribers see the whole deployment in order
    let mut view = DeploymentView::new();
    let mut kinds = Vec::new();
    while view.status_of(&id) != Some(ObservedStatus::Registered) {
        let event = timeout(Duration::from_secs(5), events.next())
            .await
            .expect("event stream stalled")
            .expect("event stream closed");
        kinds.push(event.kind);
        view.apply(&event);
    }
    assert_eq!(kinds.first(), Some(&DeploymentEventKind::DeploymentStarted));
    let success = kinds
        .iter()
        .position(|k| *k == DeploymentEventKind::DeploymentSuccess)
        .expect("no deployment_success");
    let registered = kinds
        .iter()
        .position(|k| *k == DeploymentEventKind::ModuleRegistered)
        .expect("no module_registered");
    assert!(success < registered);

    // The registry advertises it and the connection cache resolves it
    let advertised = engine.registry.instances("echo").await.unwrap();
    assert_eq!(advertised.len(), 1);
    assert_eq!(advertised[0].id, id);
    let handle = state.connections.resolve("echo").await.unwrap();
    assert_eq!(handle.endpoints().len(), 1);

    // Nothing drifted
    let report = state.reconciler.scan().await.unwrap();
    assert!(report.zombies.is_empty());
    assert!(report.orphans.is_empty());
    assert_eq!(report.tracked, 1);

    state.lifecycle.undeploy(&id).await.unwrap();
    assert!(state.lifecycle.get(&id).is_none());
    assert!(engine.registry.instances("echo").await.unwrap().is_empty());
    assert_eq!(engine.runtime.container_count(), 0);
    assert!(matches!(
        state.lifecycle.undeploy(&id).await,
        Err(LifecycleError::AlreadyTerminal(_))
    ));
}

#[tokio::test]
async fn test_capacity_is_per_module() {
    let engine = engine();
    let state = &engine.state;

    state.lifecycle.deploy("echo").await.unwrap();
    state.lifecycle.scale_up("echo").await.unwrap();
    assert!(matches!(
        state.lifecycle.scale_up("echo").await,
        Err(LifecycleError::CapacityExceeded { max: 2, .. })
    ));
    assert!(state.lifecycle.deploy("chunker").await.is_ok());
    assert!(matches!(
        state.lifecycle.deploy("ghost").await,
        Err(LifecycleError::ModuleUnknown(_))
    ));
}

#[tokio::test]
async fn test_zombie_cleanup_then_orphan_adoption() {
    let engine = engine();
    let state = &engine.state;

    // A container that is still advertised but nothing tracks
    engine.runtime.insert_container(lost_container("c-lost", "echo-lost"));
    engine.registry.register(&stale_registration("echo-lost")).await.unwrap();

    let report = state.reconciler.scan().await.unwrap();
    assert_eq!(report.zombies.len(), 1);
    assert!(report.orphans.is_empty());

    assert_eq!(state.reconciler.cleanup_zombies().await.unwrap(), 1);
    assert_eq!(state.reconciler.cleanup_zombies().await.unwrap(), 0);

    // Deregistered, the running container is now an orphan
    let orphans = state.reconciler.orphans().await.unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].container_id, "c-lost");

    let adopted = state.reconciler.redeploy_orphan("c-lost").await.unwrap();
    assert_eq!(adopted, "echo-lost");
    wait_for_state(state, &adopted, DeploymentState::Active).await;

    let instance = state.lifecycle.get(&adopted).unwrap();
    assert!(instance.adopted);
    assert!(instance.registered);

    let report = state.reconciler.scan().await.unwrap();
    assert!(report.zombies.is_empty());
    assert!(report.orphans.is_empty());
}

#[tokio::test]
async fn test_pipeline_validation_follows_catalog_and_clusters() {
    let engine = engine();
    let state = &engine.state;

    let pipeline = PipelineDefinition::new("ingest")
        .with_description("Chunk then echo")
        .with_step("chunk", StepConfig::new("chunker").with_outputs(["echo"]))
        .with_step("echo", StepConfig::new("echo"));

    let stored = state
        .pipelines
        .create(pipeline.clone(), ValidationMode::Deploy)
        .await
        .unwrap();
    assert!(stored.validation_status.valid);
    assert_eq!(
        state.pipelines.execution_order("ingest").await.unwrap().order,
        vec!["chunk", "echo"]
    );

    // Unknown cluster fails only once deployment rules run
    let elsewhere = pipeline.clone().with_cluster("gpu-pool");
    assert!(
        state
            .pipelines
            .validate(&elsewhere, ValidationMode::Design)
            .await
            .valid
    );
    assert!(
        !state
            .pipelines
            .validate(&elsewhere, ValidationMode::Deploy)
            .await
            .valid
    );

    state
        .clusters
        .create("gpu-pool", Default::default())
        .await
        .unwrap();
    assert!(
        state
            .pipelines
            .validate(&elsewhere, ValidationMode::Deploy)
            .await
            .valid
    );
}
