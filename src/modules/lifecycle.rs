//! Module Lifecycle Manager
//!
//! Drives each instance through the deployment state machine:
//! start the container, wait for health, register, then track operator
//! toggles and teardown. Transitions of one instance are serialized by that
//! instance's transition lock; different instances proceed independently.
//! Deploys and adoptions run in background tasks and report their outcome
//! only through the event bus and subsequent queries.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::descriptor::{ModuleCatalog, ModuleDescriptor, GRPC_PORT_ROLE, HTTP_PORT_ROLE};
use super::health::{format_duration, HealthPolicy, HealthProbe, HealthTracker, ProbeTarget};
use super::instance::{generate_instance_id, DeploymentState, ModuleInstance, Sidecar};
use crate::events::{DeploymentEvent, DeploymentEventKind, EventBus};
use crate::metrics::EngineMetrics;
use crate::registry::{
    KvStore, RegistryError, ServiceRegistration, ServiceRegistry, META_CONTAINER,
    META_GRPC_SERVICES, META_MODULE, MODULE_TAG,
};
use crate::runtime::{
    docker::sidecar_name, sidecar_env, ContainerInfo, ContainerRuntime, ContainerSpec,
    RuntimeError, SidecarSpec,
};

/// KV prefix of registration records
pub const REGISTRATION_PREFIX: &str = "modplane/modules/registrations/";

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Module '{0}' is not known")]
    ModuleUnknown(String),

    #[error("Module '{module}' already has the maximum of {max} instances")]
    CapacityExceeded { module: String, max: usize },

    #[error("Instance '{instance}' did not become healthy within {waited}: {reason}")]
    HealthTimeout {
        instance: String,
        waited: String,
        reason: String,
    },

    #[error("Container runtime error: {0}")]
    ContainerRuntime(#[from] RuntimeError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Instance '{0}' is already gone")]
    AlreadyTerminal(String),

    #[error("Instance '{0}' not found")]
    InstanceNotFound(String),

    #[error("Cannot {action} instance '{instance}' in state {state}")]
    InvalidTransition {
        instance: String,
        state: DeploymentState,
        action: &'static str,
    },

    #[error("Container '{0}' cannot be adopted: {1}")]
    NotAdoptable(String, String),
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Lifecycle tuning
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Live (non-failed, non-terminal) instances allowed per module
    pub max_instances_per_module: usize,
    pub health: HealthPolicy,
    /// Registry lookups made to confirm a registration before giving up
    pub registration_confirm_attempts: u32,
    pub registration_confirm_interval: Duration,
    /// Image of the registry sidecar started next to modules that need one
    pub sidecar_image: Option<String>,
    /// Written into the `io.modplane.engine` container label
    pub engine_id: String,
    /// Remembered GONE ids
    pub tombstone_capacity: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_instances_per_module: 5,
            health: HealthPolicy::default(),
            registration_confirm_attempts: 5,
            registration_confirm_interval: Duration::from_secs(1),
            sidecar_image: None,
            engine_id: "modplane".to_string(),
            tombstone_capacity: 1024,
        }
    }
}

/// External collaborators of the lifecycle manager
#[derive(Clone)]
pub struct Collaborators {
    pub registry: Arc<dyn ServiceRegistry>,
    pub kv: Arc<dyn KvStore>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub probe: Arc<dyn HealthProbe>,
}

/// Registration record persisted next to the registry entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRecord {
    pub instance_id: String,
    pub module_name: String,
    pub address: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default)]
    pub grpc_services: Vec<String>,
    pub registered_at: DateTime<Utc>,
}

/// One tracked instance: a transition lock plus the readable current state
struct InstanceSlot {
    transition: Mutex<()>,
    state: RwLock<ModuleInstance>,
}

impl InstanceSlot {
    fn new(instance: ModuleInstance) -> Self {
        Self {
            transition: Mutex::new(()),
            state: RwLock::new(instance),
        }
    }

    fn snapshot(&self) -> ModuleInstance {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn update<R>(&self, f: impl FnOnce(&mut ModuleInstance) -> R) -> R {
        let mut guard = self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }
}

enum HealthOutcome {
    Healthy,
    Cancelled,
    TimedOut(String),
}

/// The deployment state machine for every module instance the engine owns
#[derive(Clone)]
pub struct LifecycleManager {
    catalog: Arc<ModuleCatalog>,
    deps: Collaborators,
    events: EventBus,
    metrics: Arc<EngineMetrics>,
    config: Arc<LifecycleConfig>,
    instances: Arc<DashMap<String, Arc<InstanceSlot>>>,
    tombstones: Arc<StdMutex<VecDeque<String>>>,
    /// Serializes capacity checks with instance creation
    admission: Arc<Mutex<()>>,
}

impl LifecycleManager {
    pub fn new(
        catalog: Arc<ModuleCatalog>,
        deps: Collaborators,
        events: EventBus,
        metrics: Arc<EngineMetrics>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            catalog,
            deps,
            events,
            metrics,
            config: Arc::new(config),
            instances: Arc::new(DashMap::new()),
            tombstones: Arc::new(StdMutex::new(VecDeque::new())),
            admission: Arc::new(Mutex::new(())),
        }
    }

    pub fn catalog(&self) -> &Arc<ModuleCatalog> {
        &self.catalog
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Start a new instance of a module. Returns once the instance is
    /// tracked; the deployment itself continues in the background.
    pub async fn deploy(&self, module_name: &str) -> LifecycleResult<String> {
        let descriptor = self
            .catalog
            .get(module_name)
            .ok_or_else(|| LifecycleError::ModuleUnknown(module_name.to_string()))?;

        let slot = {
            let _admission = self.admission.lock().await;
            let live = self.live_count(module_name);
            if live >= self.config.max_instances_per_module {
                warn!(
                    "Refusing deploy of '{}': {} live instances (max {})",
                    module_name, live, self.config.max_instances_per_module
                );
                return Err(LifecycleError::CapacityExceeded {
                    module: module_name.to_string(),
                    max: self.config.max_instances_per_module,
                });
            }

            let instance_id = generate_instance_id(module_name);
            let mut instance = ModuleInstance::new(&instance_id, module_name);
            instance.port = descriptor.grpc_port().unwrap_or_default();
            instance.grpc_services = descriptor.grpc_services.iter().cloned().collect();
            let slot = Arc::new(InstanceSlot::new(instance));

            // Tracked before admission is released so the next capacity check counts it
            let _guard = slot.transition.lock().await;
            self.instances.insert(instance_id.clone(), slot.clone());
            self.metrics.record_deploy_started();
            info!("Deploying module '{}' as {}", module_name, instance_id);
            self.emit(
                &slot,
                DeploymentEventKind::DeploymentStarted,
                format!("Deploying {} from image {}", module_name, descriptor.image),
            );
            drop(_guard);
            slot
        };
        let instance_id = slot.snapshot().instance_id;

        let this = self.clone();
        tokio::spawn(async move {
            this.run_deploy(slot, descriptor).await;
        });

        Ok(instance_id)
    }

    /// Add a sibling instance of a module; existing instances are untouched
    pub async fn scale_up(&self, module_name: &str) -> LifecycleResult<String> {
        self.deploy(module_name).await
    }

    pub async fn enable(&self, instance_id: &str) -> LifecycleResult<ModuleInstance> {
        self.set_enabled(instance_id, true).await
    }

    pub async fn disable(&self, instance_id: &str) -> LifecycleResult<ModuleInstance> {
        self.set_enabled(instance_id, false).await
    }

    async fn set_enabled(&self, instance_id: &str, enabled: bool) -> LifecycleResult<ModuleInstance> {
        let slot = self.slot_or_err(instance_id)?;
        let _guard = slot.transition.lock().await;
        let current = slot.snapshot();

        let (target, action) = if enabled {
            (DeploymentState::Active, "enable")
        } else {
            (DeploymentState::Disabled, "disable")
        };
        match current.state {
            s if s == target => return Ok(current),
            DeploymentState::Active | DeploymentState::Disabled => {}
            DeploymentState::Gone => {
                return Err(LifecycleError::AlreadyTerminal(instance_id.to_string()))
            }
            state => {
                return Err(LifecycleError::InvalidTransition {
                    instance: instance_id.to_string(),
                    state,
                    action,
                })
            }
        }

        if current.registered {
            self.deps.registry.set_enabled(instance_id, enabled).await?;
        }
        let updated = slot.update(|i| {
            i.enabled = enabled;
            i.transition(target);
            i.clone()
        });
        info!("Instance {} {}d", instance_id, action);
        self.emit(
            &slot,
            DeploymentEventKind::DeploymentProgress,
            format!("Instance {} {}d", instance_id, action),
        );
        Ok(updated)
    }

    /// Remove the registry registration without touching the container
    pub async fn deregister(&self, instance_id: &str) -> LifecycleResult<ModuleInstance> {
        let slot = self.slot_or_err(instance_id)?;
        let _guard = slot.transition.lock().await;
        if slot.snapshot().state.is_terminal() {
            return Err(LifecycleError::AlreadyTerminal(instance_id.to_string()));
        }

        match self.deps.registry.deregister(instance_id).await {
            Ok(()) | Err(RegistryError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.delete_registration_record(instance_id).await;

        let updated = slot.update(|i| {
            i.registered = false;
            i.clone()
        });
        info!("Instance {} deregistered", instance_id);
        self.emit(
            &slot,
            DeploymentEventKind::DeploymentProgress,
            format!("Instance {} deregistered; container left running", instance_id),
        );
        Ok(updated)
    }

    /// Tear an instance down. Queues behind any in-flight transition; an
    /// instance still deploying is failed first, then undeployed.
    pub async fn undeploy(&self, instance_id: &str) -> LifecycleResult<()> {
        let slot = self.slot_or_err(instance_id)?;
        let _guard = slot.transition.lock().await;
        let current = slot.snapshot();
        if current.state.is_terminal() {
            return Err(LifecycleError::AlreadyTerminal(instance_id.to_string()));
        }

        if current.state.is_in_progress() {
            self.fail_instance(&slot, "deployment cancelled by undeploy");
        }
        if !slot.update(|i| i.transition(DeploymentState::Undeploying)) {
            return Err(LifecycleError::InvalidTransition {
                instance: instance_id.to_string(),
                state: slot.snapshot().state,
                action: "undeploy",
            });
        }
        info!("Undeploying instance {}", instance_id);
        self.emit(
            &slot,
            DeploymentEventKind::ModuleUndeploying,
            format!("Undeploying instance {}", instance_id),
        );

        if let Some(container_id) = current.container_id.as_deref() {
            if let Err(e) = self.teardown_container(container_id).await {
                self.abort_undeploy(&slot, &e.to_string());
                return Err(e.into());
            }
        }

        if slot.snapshot().registered {
            match self.deps.registry.deregister(instance_id).await {
                Ok(()) | Err(RegistryError::NotFound(_)) => {}
                Err(e) => {
                    self.abort_undeploy(&slot, &e.to_string());
                    return Err(e.into());
                }
            }
            self.delete_registration_record(instance_id).await;
            slot.update(|i| i.registered = false);
        }

        slot.update(|i| {
            i.healthy = false;
            i.transition(DeploymentState::Gone)
        });
        self.metrics.record_undeploy();
        info!("Instance {} undeployed", instance_id);
        self.emit(
            &slot,
            DeploymentEventKind::ModuleUndeployed,
            format!("Instance {} undeployed", instance_id),
        );

        self.instances.remove(instance_id);
        self.tombstone(instance_id);
        Ok(())
    }

    /// Ids of every tracked instance of a module
    pub fn instance_ids_of(&self, module_name: &str) -> Vec<String> {
        self.list_module(module_name)
            .into_iter()
            .map(|i| i.instance_id)
            .collect()
    }

    /// Undeploy every tracked instance of a module, returning the ids that
    /// were torn down
    pub async fn undeploy_module(&self, module_name: &str) -> Vec<String> {
        let mut removed = Vec::new();
        for instance_id in self.instance_ids_of(module_name) {
            match self.undeploy(&instance_id).await {
                Ok(()) => removed.push(instance_id),
                Err(e) => warn!("Failed to undeploy {}: {}", instance_id, e),
            }
        }
        removed
    }

    /// Track a running container the engine lost track of, entering the
    /// health wait directly. Adopting an already-tracked container returns
    /// its existing instance id.
    pub async fn adopt_orphan(&self, container_id: &str) -> LifecycleResult<String> {
        let info = self
            .deps
            .runtime
            .inspect(container_id)
            .await?
            .ok_or_else(|| RuntimeError::ContainerNotFound(container_id.to_string()))?;
        if !info.running {
            return Err(LifecycleError::NotAdoptable(
                container_id.to_string(),
                "container is not running".to_string(),
            ));
        }
        let module_name = info
            .module_name()
            .ok_or_else(|| {
                LifecycleError::NotAdoptable(
                    container_id.to_string(),
                    "container carries no module label".to_string(),
                )
            })?
            .to_string();
        let descriptor = self
            .catalog
            .get(&module_name)
            .ok_or_else(|| LifecycleError::ModuleUnknown(module_name.clone()))?;

        let (slot, target) = {
            let _admission = self.admission.lock().await;
            if let Some(existing) = self.find_by_container(&info) {
                return Ok(existing);
            }

            let instance_id = info.instance_id().to_string();
            self.untombstone(&instance_id);
            let (instance, target) = adopted_instance(&info, &descriptor);
            let slot = Arc::new(InstanceSlot::new(instance));
            let _guard = slot.transition.lock().await;
            self.instances.insert(instance_id.clone(), slot.clone());
            self.metrics.record_orphan_adopted();
            info!("Adopting orphaned container {} as {}", info.id, instance_id);
            self.emit(
                &slot,
                DeploymentEventKind::DeploymentStarted,
                format!("Adopting orphaned container {}", info.name),
            );
            drop(_guard);
            (slot, target)
        };

        let instance_id = slot.snapshot().instance_id;
        let this = self.clone();
        tokio::spawn(async move {
            this.await_health_and_register(slot, descriptor, target).await;
        });
        Ok(instance_id)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get(&self, instance_id: &str) -> Option<ModuleInstance> {
        self.instances.get(instance_id).map(|s| s.snapshot())
    }

    /// Every tracked instance, sorted by module then id
    pub fn list(&self) -> Vec<ModuleInstance> {
        let mut all: Vec<ModuleInstance> = self.instances.iter().map(|s| s.snapshot()).collect();
        all.sort_by(|a, b| {
            a.module_name
                .cmp(&b.module_name)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        all
    }

    pub fn list_module(&self, module_name: &str) -> Vec<ModuleInstance> {
        self.list()
            .into_iter()
            .filter(|i| i.module_name == module_name)
            .collect()
    }

    pub fn tracked_ids(&self) -> HashSet<String> {
        self.instances.iter().map(|e| e.key().clone()).collect()
    }

    pub fn tracked_container_ids(&self) -> HashSet<String> {
        self.instances
            .iter()
            .filter_map(|s| s.snapshot().container_id)
            .collect()
    }

    /// Catalog modules plus modules of tracked instances
    pub fn known_modules(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = self.catalog.list().into_iter().map(|d| d.name).collect();
        names.extend(self.instances.iter().map(|s| s.snapshot().module_name));
        names
    }

    pub fn is_tombstoned(&self, instance_id: &str) -> bool {
        self.tombstones
            .lock()
            .map(|t| t.iter().any(|id| id == instance_id))
            .unwrap_or(false)
    }

    // ========================================================================
    // Deployment flow
    // ========================================================================

    async fn run_deploy(&self, slot: Arc<InstanceSlot>, descriptor: ModuleDescriptor) {
        let target = {
            let _guard = slot.transition.lock().await;
            let current = slot.snapshot();
            if current.state != DeploymentState::Requested {
                debug!("Deploy of {} superseded ({})", current.instance_id, current.state);
                return;
            }
            slot.update(|i| i.transition(DeploymentState::Starting));

            let spec = self.container_spec(&current.instance_id, &descriptor);
            self.emit(
                &slot,
                DeploymentEventKind::DeploymentProgress,
                format!("Starting container {}", spec.name),
            );

            // The transition lock is held across the start; an undeploy queues here
            match self.deps.runtime.start(&spec).await {
                Ok(info) => {
                    let target = probe_target(&current.instance_id, &info, &descriptor);
                    slot.update(|i| {
                        i.container_id = Some(info.id.clone());
                        i.address = target.address.clone();
                        i.port = target.grpc_port;
                        i.sidecars = sidecars_of(&info);
                        i.transition(DeploymentState::AwaitingHealth);
                    });
                    debug!("Container {} started for {}", info.id, current.instance_id);
                    self.emit(
                        &slot,
                        DeploymentEventKind::DeploymentProgress,
                        format!(
                            "Container started at {}:{}, waiting for health",
                            target.address, target.grpc_port
                        ),
                    );
                    target
                }
                Err(e) => {
                    self.fail_instance(&slot, format!("container start failed: {}", e));
                    return;
                }
            }
        };

        self.await_health_and_register(slot, descriptor, target).await;
    }

    async fn await_health_and_register(
        &self,
        slot: Arc<InstanceSlot>,
        descriptor: ModuleDescriptor,
        target: ProbeTarget,
    ) {
        match self.wait_for_health(&slot, &target).await {
            HealthOutcome::Healthy => {}
            HealthOutcome::Cancelled => {
                debug!("Health wait for {} cancelled", target.instance_id);
                return;
            }
            HealthOutcome::TimedOut(reason) => {
                let _guard = slot.transition.lock().await;
                if slot.snapshot().state == DeploymentState::AwaitingHealth {
                    let err = LifecycleError::HealthTimeout {
                        instance: target.instance_id.clone(),
                        waited: format_duration(self.config.health.timeout),
                        reason,
                    };
                    self.fail_instance(&slot, err.to_string());
                }
                return;
            }
        }

        let registration = {
            let _guard = slot.transition.lock().await;
            if slot.snapshot().state != DeploymentState::AwaitingHealth {
                return;
            }
            let current = slot.update(|i| {
                i.healthy = true;
                i.transition(DeploymentState::Registering);
                i.clone()
            });
            self.emit(
                &slot,
                DeploymentEventKind::DeploymentProgress,
                "Instance healthy, registering with service registry".to_string(),
            );

            let registration = registration_for(&current);
            if let Err(e) = self.deps.registry.register(&registration).await {
                self.fail_instance(&slot, format!("registration failed: {}", e));
                return;
            }
            self.write_registration_record(&current).await;

            slot.update(|i| {
                i.registered = true;
                i.transition(DeploymentState::Active)
            });
            self.metrics.record_deploy_succeeded();
            info!(
                "Instance {} of '{}' active at {}",
                current.instance_id,
                descriptor.name,
                current.endpoint()
            );
            self.emit(
                &slot,
                DeploymentEventKind::DeploymentSuccess,
                format!("{} deployed at {}", current.instance_id, current.endpoint()),
            );
            registration
        };

        self.confirm_registration(&slot, &registration).await;
    }

    async fn wait_for_health(&self, slot: &InstanceSlot, target: &ProbeTarget) -> HealthOutcome {
        let policy = &self.config.health;
        let started = Instant::now();

        {
            let _guard = slot.transition.lock().await;
            if !self.still_awaiting_health(slot) {
                return HealthOutcome::Cancelled;
            }
            self.emit(
                slot,
                DeploymentEventKind::DeploymentProgress,
                format!(
                    "Waiting {} before first health check",
                    format_duration(policy.first_check_after)
                ),
            );
        }
        tokio::time::sleep(policy.first_check_after).await;

        let mut tracker = HealthTracker::default();
        loop {
            if !self.still_awaiting_health(slot) {
                return HealthOutcome::Cancelled;
            }

            let result = self.deps.probe.probe(target).await;
            tracker.record(&result);
            slot.update(|i| i.healthy = result.success);
            if tracker.is_healthy(policy.success_threshold) {
                return HealthOutcome::Healthy;
            }

            let elapsed = started.elapsed();
            if elapsed >= policy.timeout {
                return HealthOutcome::TimedOut(
                    tracker
                        .last_error
                        .unwrap_or_else(|| "not yet healthy".to_string()),
                );
            }
            tokio::time::sleep(policy.probe_interval.min(policy.timeout - elapsed)).await;
        }
    }

    fn still_awaiting_health(&self, slot: &InstanceSlot) -> bool {
        let current = slot.snapshot();
        current.state == DeploymentState::AwaitingHealth
            && self.instances.contains_key(&current.instance_id)
    }

    async fn confirm_registration(&self, slot: &InstanceSlot, registration: &ServiceRegistration) {
        for attempt in 0..self.config.registration_confirm_attempts.max(1) {
            match self.deps.registry.instances(&registration.name).await {
                Ok(instances) if instances.iter().any(|i| i.id == registration.id) => {
                    let _guard = slot.transition.lock().await;
                    if still_registered(&slot.snapshot()) {
                        self.emit(
                            slot,
                            DeploymentEventKind::ModuleRegistered,
                            format!("Registry confirmed {}", registration.id),
                        );
                    }
                    return;
                }
                Ok(_) => debug!(
                    "Registration of {} not visible yet (attempt {})",
                    registration.id,
                    attempt + 1
                ),
                Err(e) => debug!("Registry lookup for {} failed: {}", registration.id, e),
            }
            tokio::time::sleep(self.config.registration_confirm_interval).await;
        }

        warn!("Registry never confirmed {}", registration.id);
        let _guard = slot.transition.lock().await;
        if still_registered(&slot.snapshot()) {
            self.emit(
                slot,
                DeploymentEventKind::DeploymentProgress,
                format!("Registration of {} not yet visible in registry", registration.id),
            );
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn emit(&self, slot: &InstanceSlot, kind: DeploymentEventKind, message: String) {
        let current = slot.snapshot();
        self.events.publish(DeploymentEvent::new(
            kind,
            current.module_name,
            Some(&current.instance_id),
            message,
        ));
    }

    fn fail_instance(&self, slot: &InstanceSlot, reason: impl Into<String>) {
        let reason = reason.into();
        let current = slot.snapshot();
        if !slot.update(|i| i.fail(reason.clone())) {
            return;
        }
        self.metrics.record_deploy_failed();
        error!("Instance {} failed: {}", current.instance_id, reason);
        self.events.publish(DeploymentEvent::failed(
            current.module_name,
            &current.instance_id,
            reason,
        ));
    }

    /// Undeploy could not finish: park the instance in FAILED so it can be retried
    fn abort_undeploy(&self, slot: &InstanceSlot, error: &str) {
        let reason = format!("undeploy failed: {}", error);
        slot.update(|i| i.fail(reason.clone()));
        error!("{}: {}", slot.snapshot().instance_id, reason);
        self.emit(slot, DeploymentEventKind::DeploymentProgress, reason);
    }

    async fn teardown_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        match self.deps.runtime.stop(container_id).await {
            Ok(()) | Err(RuntimeError::ContainerNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        match self.deps.runtime.remove(container_id).await {
            Ok(()) | Err(RuntimeError::ContainerNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn container_spec(&self, instance_id: &str, descriptor: &ModuleDescriptor) -> ContainerSpec {
        let mut spec = ContainerSpec::for_instance(
            instance_id,
            &descriptor.name,
            &descriptor.image,
            &descriptor.default_ports,
            &self.config.engine_id,
        );
        if descriptor.capabilities().needs_registry_sidecar {
            if let Some(image) = &self.config.sidecar_image {
                spec.sidecars.push(SidecarSpec {
                    name: sidecar_name(instance_id, "registrar"),
                    image: image.clone(),
                    env: sidecar_env(
                        instance_id,
                        &descriptor.name,
                        descriptor.grpc_port().unwrap_or_default(),
                    ),
                });
            }
        }
        spec
    }

    fn live_count(&self, module_name: &str) -> usize {
        self.instances
            .iter()
            .map(|s| s.snapshot())
            .filter(|i| i.module_name == module_name)
            .filter(|i| {
                !matches!(
                    i.state,
                    DeploymentState::Failed | DeploymentState::Undeploying | DeploymentState::Gone
                )
            })
            .count()
    }

    fn find_by_container(&self, info: &ContainerInfo) -> Option<String> {
        self.instances
            .iter()
            .map(|s| s.snapshot())
            .find(|i| {
                i.instance_id == info.instance_id() || i.container_id.as_deref() == Some(&info.id)
            })
            .map(|i| i.instance_id)
    }

    fn slot_or_err(&self, instance_id: &str) -> LifecycleResult<Arc<InstanceSlot>> {
        if let Some(slot) = self.instances.get(instance_id) {
            return Ok(slot.clone());
        }
        if self.is_tombstoned(instance_id) {
            Err(LifecycleError::AlreadyTerminal(instance_id.to_string()))
        } else {
            Err(LifecycleError::InstanceNotFound(instance_id.to_string()))
        }
    }

    fn tombstone(&self, instance_id: &str) {
        if let Ok(mut tombstones) = self.tombstones.lock() {
            tombstones.push_back(instance_id.to_string());
            while tombstones.len() > self.config.tombstone_capacity {
                tombstones.pop_front();
            }
        }
    }

    fn untombstone(&self, instance_id: &str) {
        if let Ok(mut tombstones) = self.tombstones.lock() {
            tombstones.retain(|id| id != instance_id);
        }
    }

    async fn write_registration_record(&self, instance: &ModuleInstance) {
        let record = RegistrationRecord {
            instance_id: instance.instance_id.clone(),
            module_name: instance.module_name.clone(),
            address: instance.address.clone(),
            port: instance.port,
            container_id: instance.container_id.clone(),
            grpc_services: instance.grpc_services.iter().cloned().collect(),
            registered_at: Utc::now(),
        };
        let key = format!("{}{}", REGISTRATION_PREFIX, instance.instance_id);
        let result = match serde_json::to_string(&record) {
            Ok(json) => self.deps.kv.put(&key, &json).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = result {
            warn!("Failed to persist registration record {}: {}", key, e);
        }
    }

    async fn delete_registration_record(&self, instance_id: &str) {
        let key = format!("{}{}", REGISTRATION_PREFIX, instance_id);
        if let Err(e) = self.deps.kv.delete(&key).await {
            warn!("Failed to delete registration record {}: {}", key, e);
        }
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

fn probe_target(instance_id: &str, info: &ContainerInfo, descriptor: &ModuleDescriptor) -> ProbeTarget {
    ProbeTarget {
        instance_id: instance_id.to_string(),
        address: info.address.clone(),
        grpc_port: info
            .ports
            .get(GRPC_PORT_ROLE)
            .copied()
            .or_else(|| descriptor.grpc_port())
            .unwrap_or_default(),
        http_port: info
            .ports
            .get(HTTP_PORT_ROLE)
            .copied()
            .or_else(|| descriptor.default_ports.get(HTTP_PORT_ROLE).copied()),
    }
}

/// Registered and not torn down since
fn still_registered(instance: &ModuleInstance) -> bool {
    instance.registered
        && matches!(
            instance.state,
            DeploymentState::Active | DeploymentState::Disabled
        )
}

fn sidecars_of(info: &ContainerInfo) -> Vec<Sidecar> {
    info.sidecars
        .iter()
        .map(|s| Sidecar {
            name: s.name.clone(),
            container_id: Some(s.container_id.clone()),
            address: info.address.clone(),
            port: 0,
            healthy: s.running,
        })
        .collect()
}

/// Instance record for an adopted container, already in AWAITING_HEALTH
fn adopted_instance(info: &ContainerInfo, descriptor: &ModuleDescriptor) -> (ModuleInstance, ProbeTarget) {
    let target = probe_target(info.instance_id(), info, descriptor);
    let mut instance = ModuleInstance::new(info.instance_id(), descriptor.name.clone());
    instance.state = DeploymentState::AwaitingHealth;
    instance.adopted = true;
    instance.container_id = Some(info.id.clone());
    instance.address = target.address.clone();
    instance.port = target.grpc_port;
    instance.grpc_services = descriptor.grpc_services.iter().cloned().collect();
    instance.sidecars = sidecars_of(info);
    (instance, target)
}

/// Registry entry for an instance
pub fn registration_for(instance: &ModuleInstance) -> ServiceRegistration {
    let mut meta = std::collections::HashMap::new();
    meta.insert(META_MODULE.to_string(), instance.module_name.clone());
    if !instance.grpc_services.is_empty() {
        let services: Vec<&str> = instance.grpc_services.iter().map(String::as_str).collect();
        meta.insert(META_GRPC_SERVICES.to_string(), services.join(","));
    }
    if let Some(container_id) = &instance.container_id {
        meta.insert(META_CONTAINER.to_string(), container_id.clone());
    }

    ServiceRegistration {
        id: instance.instance_id.clone(),
        name: instance.module_name.clone(),
        address: instance.address.clone(),
        port: instance.port,
        tags: vec![MODULE_TAG.to_string()],
        meta,
    }
}
