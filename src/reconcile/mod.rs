//! Reconciliation Loop
//!
//! Compares three views of the world (what the registry advertises, what
//! the container runtime runs, what the lifecycle manager tracks) and
//! classifies the drift:
//!
//! - zombie: a module registration in the registry that nothing tracks
//! - orphan: an engine-labelled running container that is neither tracked
//!   nor registered
//!
//! Zombies are bulk-cleaned by deregistration. Orphans are never touched
//! automatically; an operator adopts them one at a time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::metrics::EngineMetrics;
use crate::modules::lifecycle::{Collaborators, LifecycleError, LifecycleManager, REGISTRATION_PREFIX};
use crate::modules::{DeploymentState, ModuleInstance};
use crate::registry::{RegistryError, ServiceInstance};
use crate::runtime::{ContainerInfo, RuntimeError};

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Container runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub interval: Duration,
    /// Deregister zombies on every periodic pass, not only on request
    pub auto_cleanup_zombies: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            auto_cleanup_zombies: false,
        }
    }
}

/// A stale registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZombieRecord {
    pub instance_id: String,
    pub module_name: String,
    pub address: String,
    pub port: u16,
    pub healthy: bool,
}

/// A running container the engine lost track of
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrphanRecord {
    pub container_id: String,
    pub container_name: String,
    pub instance_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_name: Option<String>,
    pub image: String,
    pub address: String,
    pub ports: std::collections::BTreeMap<String, u16>,
}

/// Result of one reconciliation pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub zombies: Vec<ZombieRecord>,
    pub orphans: Vec<OrphanRecord>,
    /// Tracked ACTIVE/DISABLED instances the registry no longer advertises
    pub unregistered_active: Vec<String>,
    pub tracked: usize,
    pub scanned_at: DateTime<Utc>,
}

pub struct Reconciler {
    lifecycle: LifecycleManager,
    deps: Collaborators,
    metrics: Arc<EngineMetrics>,
    last_report: RwLock<Option<ReconcileReport>>,
    /// One cleanup at a time
    cleanup: Mutex<()>,
}

impl Reconciler {
    pub fn new(lifecycle: LifecycleManager, deps: Collaborators, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            lifecycle,
            deps,
            metrics,
            last_report: RwLock::new(None),
            cleanup: Mutex::new(()),
        }
    }

    /// Take the three snapshots and classify drift
    ///
    /// The tracked set is read last: anything the lifecycle manager starts
    /// while the registry and runtime are being listed is already tracked
    /// by the time it could show up in either.
    pub async fn scan(&self) -> Result<ReconcileReport, ReconcileError> {
        let advertised = self.deps.registry.all_instances().await?;
        let containers = self.deps.runtime.list_managed().await?;
        let tracked = self.lifecycle.list();
        let catalog: HashSet<String> = self
            .lifecycle
            .catalog()
            .list()
            .into_iter()
            .map(|d| d.name)
            .collect();

        let report = classify(&advertised, &containers, &tracked, &catalog);
        self.metrics.record_reconcile_pass();
        debug!(
            "Reconcile pass: {} zombies, {} orphans, {} unregistered active",
            report.zombies.len(),
            report.orphans.len(),
            report.unregistered_active.len()
        );

        if let Ok(mut last) = self.last_report.write() {
            *last = Some(report.clone());
        }
        Ok(report)
    }

    /// Deregister every zombie found by a fresh scan. Returns how many were
    /// removed; a second call with no topology change returns 0.
    pub async fn cleanup_zombies(&self) -> Result<usize, ReconcileError> {
        let _guard = self.cleanup.lock().await;
        let report = self.scan().await?;

        let mut removed = 0;
        for zombie in &report.zombies {
            match self.deps.registry.deregister(&zombie.instance_id).await {
                Ok(()) => removed += 1,
                Err(RegistryError::NotFound(_)) => {
                    debug!("Zombie {} already gone", zombie.instance_id);
                    continue;
                }
                Err(e) => {
                    error!("Failed to deregister zombie {}: {}", zombie.instance_id, e);
                    return Err(e.into());
                }
            }
            let key = format!("{}{}", REGISTRATION_PREFIX, zombie.instance_id);
            if let Err(e) = self.deps.kv.delete(&key).await {
                warn!("Failed to delete registration record {}: {}", key, e);
            }
            info!(
                "Removed zombie registration {} ({})",
                zombie.instance_id, zombie.module_name
            );
        }

        self.metrics.record_zombies_removed(removed as u64);
        if removed > 0 {
            info!("Zombie cleanup removed {} registrations", removed);
        }
        Ok(removed)
    }

    /// Adopt an orphaned container into lifecycle tracking
    pub async fn redeploy_orphan(&self, container_id: &str) -> Result<String, LifecycleError> {
        self.lifecycle.adopt_orphan(container_id).await
    }

    pub async fn orphans(&self) -> Result<Vec<OrphanRecord>, ReconcileError> {
        Ok(self.scan().await?.orphans)
    }

    pub fn last_report(&self) -> Option<ReconcileReport> {
        self.last_report.read().ok().and_then(|r| r.clone())
    }

    async fn periodic_pass(&self, config: &ReconcileConfig) {
        if config.auto_cleanup_zombies {
            match self.cleanup_zombies().await {
                Ok(removed) if removed > 0 => info!("Periodic cleanup removed {} zombies", removed),
                Ok(_) => {}
                Err(e) => warn!("Periodic zombie cleanup failed: {}", e),
            }
            return;
        }

        match self.scan().await {
            Ok(report) => {
                if !report.zombies.is_empty() {
                    warn!(
                        "{} zombie registrations found: {}",
                        report.zombies.len(),
                        join_ids(report.zombies.iter().map(|z| z.instance_id.as_str()))
                    );
                }
                if !report.orphans.is_empty() {
                    warn!(
                        "{} orphaned containers found: {}",
                        report.orphans.len(),
                        join_ids(report.orphans.iter().map(|o| o.container_name.as_str()))
                    );
                }
            }
            Err(e) => warn!("Reconcile pass failed: {}", e),
        }
    }
}

/// Spawn the periodic reconciliation loop
///
/// Returns a shutdown sender that stops the loop.
pub fn spawn_reconciler(reconciler: Arc<Reconciler>, config: ReconcileConfig) -> watch::Sender<bool> {
    let (shutdown_tx, mut shutdown) = watch::channel(false);
    let interval = config.interval.max(Duration::from_secs(1));

    tokio::spawn(async move {
        info!(
            "Starting reconciler: interval={}s, auto_cleanup={}",
            interval.as_secs(),
            config.auto_cleanup_zombies
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    reconciler.periodic_pass(&config).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }
    });

    shutdown_tx
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Classify registry and runtime state against the tracked set
pub fn classify(
    advertised: &[ServiceInstance],
    containers: &[ContainerInfo],
    tracked: &[ModuleInstance],
    catalog: &HashSet<String>,
) -> ReconcileReport {
    let tracked_ids: HashSet<&str> = tracked.iter().map(|i| i.instance_id.as_str()).collect();
    let tracked_containers: HashSet<&str> = tracked
        .iter()
        .filter_map(|i| i.container_id.as_deref())
        .collect();
    let registered_ids: HashSet<&str> = advertised.iter().map(|i| i.id.as_str()).collect();

    let mut zombies: Vec<ZombieRecord> = advertised
        .iter()
        .filter(|i| i.is_module() || catalog.contains(&i.service))
        .filter(|i| !tracked_ids.contains(i.id.as_str()))
        .map(|i| ZombieRecord {
            instance_id: i.id.clone(),
            module_name: i.module_name().to_string(),
            address: i.address.clone(),
            port: i.port,
            healthy: i.healthy,
        })
        .collect();
    zombies.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

    let mut orphans: Vec<OrphanRecord> = containers
        .iter()
        .filter(|c| c.running && c.is_managed() && !c.is_sidecar())
        .filter(|c| {
            !tracked_ids.contains(c.instance_id())
                && !tracked_containers.contains(c.id.as_str())
                && !registered_ids.contains(c.instance_id())
        })
        .map(|c| OrphanRecord {
            container_id: c.id.clone(),
            container_name: c.name.clone(),
            instance_id: c.instance_id().to_string(),
            module_name: c.module_name().map(String::from),
            image: c.image.clone(),
            address: c.address.clone(),
            ports: c.ports.clone(),
        })
        .collect();
    orphans.sort_by(|a, b| a.container_name.cmp(&b.container_name));

    let unregistered_active: BTreeSet<String> = tracked
        .iter()
        .filter(|i| matches!(i.state, DeploymentState::Active | DeploymentState::Disabled))
        .filter(|i| !registered_ids.contains(i.instance_id.as_str()))
        .map(|i| i.instance_id.clone())
        .collect();

    ReconcileReport {
        zombies,
        orphans,
        unregistered_active: unregistered_active.into_iter().collect(),
        tracked: tracked.len(),
        scanned_at: Utc::now(),
    }
}

fn join_ids<'a>(ids: impl Iterator<Item = &'a str>) -> String {
    ids.collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::modules::{
        HealthPolicy, LifecycleConfig, ModuleCatalog, ModuleDescriptor, ModuleType, StaticProbe,
    };
    use crate::registry::{
        InMemoryRegistry, KvStore, ServiceRegistration, ServiceRegistry, MODULE_TAG,
    };
    use crate::runtime::{ContainerRuntime, InMemoryRuntime, LABEL_INSTANCE, LABEL_MANAGED, LABEL_MODULE};
    use std::collections::{BTreeMap, HashMap};

    struct Fixture {
        reconciler: Reconciler,
        lifecycle: LifecycleManager,
        registry: Arc<InMemoryRegistry>,
        runtime: Arc<InMemoryRuntime>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(InMemoryRegistry::new());
        let runtime = Arc::new(InMemoryRuntime::new());
        let deps = Collaborators {
            registry: registry.clone(),
            kv: registry.clone(),
            runtime: runtime.clone(),
            probe: Arc::new(StaticProbe::new(true)),
        };
        let catalog = Arc::new(
            ModuleCatalog::with_descriptors(vec![ModuleDescriptor::new(
                "echo",
                ModuleType::Processor,
                "modules/echo:1",
            )])
            .unwrap(),
        );
        let metrics = Arc::new(EngineMetrics::new());
        let lifecycle = LifecycleManager::new(
            catalog,
            deps.clone(),
            EventBus::new(64),
            metrics.clone(),
            LifecycleConfig {
                health: HealthPolicy {
                    first_check_after: Duration::from_millis(5),
                    probe_interval: Duration::from_millis(5),
                    success_threshold: 1,
                    timeout: Duration::from_millis(200),
                },
                registration_confirm_interval: Duration::from_millis(5),
                ..Default::default()
            },
        );
        Fixture {
            reconciler: Reconciler::new(lifecycle.clone(), deps, metrics),
            lifecycle,
            registry,
            runtime,
        }
    }

    fn module_registration(id: &str) -> ServiceRegistration {
        ServiceRegistration {
            id: id.to_string(),
            name: "echo".to_string(),
            address: "10.0.0.9".to_string(),
            port: 50051,
            tags: vec![MODULE_TAG.to_string()],
            meta: HashMap::new(),
        }
    }

    fn labelled_container(id: &str, instance: &str) -> ContainerInfo {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_INSTANCE.to_string(), instance.to_string());
        labels.insert(LABEL_MODULE.to_string(), "echo".to_string());
        ContainerInfo {
            id: id.to_string(),
            name: instance.to_string(),
            image: "modules/echo:1".to_string(),
            running: true,
            address: "127.0.0.1".to_string(),
            ports: [("grpc".to_string(), 50051)].into_iter().collect(),
            labels,
            sidecars: vec![],
        }
    }

    async fn wait_active(lifecycle: &LifecycleManager, id: &str) {
        for _ in 0..200 {
            if lifecycle.get(id).map(|i| i.state) == Some(DeploymentState::Active) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never became active", id);
    }

    #[tokio::test]
    async fn test_runtime_only_container_is_orphan() {
        let f = fixture();
        f.runtime.insert_container(labelled_container("c1", "echo-lost"));

        let report = f.reconciler.scan().await.unwrap();
        assert!(report.zombies.is_empty());
        assert_eq!(report.orphans.len(), 1);
        assert_eq!(report.orphans[0].instance_id, "echo-lost");
        assert_eq!(report.orphans[0].module_name.as_deref(), Some("echo"));
    }

    #[tokio::test]
    async fn test_untracked_registration_is_zombie() {
        let f = fixture();
        f.registry.register(&module_registration("echo-stale")).await.unwrap();

        let report = f.reconciler.scan().await.unwrap();
        assert_eq!(report.zombies.len(), 1);
        assert_eq!(report.zombies[0].instance_id, "echo-stale");
        assert!(report.orphans.is_empty());
    }

    #[tokio::test]
    async fn test_foreign_services_ignored() {
        let f = fixture();
        f.registry
            .register(&ServiceRegistration {
                id: "consul".to_string(),
                name: "consul".to_string(),
                address: "10.0.0.1".to_string(),
                port: 8500,
                tags: vec![],
                meta: HashMap::new(),
            })
            .await
            .unwrap();
        assert!(f.reconciler.scan().await.unwrap().zombies.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let f = fixture();
        f.registry.register(&module_registration("echo-a")).await.unwrap();
        f.registry.register(&module_registration("echo-b")).await.unwrap();
        f.registry
            .put(&format!("{}echo-a", REGISTRATION_PREFIX), "{}")
            .await
            .unwrap();

        assert_eq!(f.reconciler.cleanup_zombies().await.unwrap(), 2);
        assert_eq!(f.reconciler.cleanup_zombies().await.unwrap(), 0);
        assert!(f.registry.instances("echo").await.unwrap().is_empty());
        assert!(f
            .registry
            .get(&format!("{}echo-a", REGISTRATION_PREFIX))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_cleanup_never_touches_orphans() {
        let f = fixture();
        f.runtime.insert_container(labelled_container("c1", "echo-lost"));
        assert_eq!(f.reconciler.cleanup_zombies().await.unwrap(), 0);
        assert!(f.runtime.inspect("c1").await.unwrap().unwrap().running);
    }

    #[tokio::test]
    async fn test_registered_untracked_container_becomes_orphan_after_cleanup() {
        let f = fixture();
        f.runtime.insert_container(labelled_container("c1", "echo-x"));
        f.registry.register(&module_registration("echo-x")).await.unwrap();

        let before = f.reconciler.scan().await.unwrap();
        assert_eq!(before.zombies.len(), 1);
        assert!(before.orphans.is_empty());

        f.reconciler.cleanup_zombies().await.unwrap();
        let after = f.reconciler.scan().await.unwrap();
        assert!(after.zombies.is_empty());
        assert_eq!(after.orphans.len(), 1);
    }

    #[tokio::test]
    async fn test_tracked_deploy_is_neither() {
        let f = fixture();
        let id = f.lifecycle.deploy("echo").await.unwrap();
        wait_active(&f.lifecycle, &id).await;

        let report = f.reconciler.scan().await.unwrap();
        assert!(report.zombies.is_empty());
        assert!(report.orphans.is_empty());
        assert!(report.unregistered_active.is_empty());
        assert_eq!(report.tracked, 1);
    }

    #[tokio::test]
    async fn test_unregistered_active_reported() {
        let f = fixture();
        let id = f.lifecycle.deploy("echo").await.unwrap();
        wait_active(&f.lifecycle, &id).await;
        f.registry.deregister(&id).await.unwrap();

        let report = f.reconciler.scan().await.unwrap();
        assert_eq!(report.unregistered_active, vec![id]);
    }

    #[tokio::test]
    async fn test_redeploy_orphan_moves_to_deployed() {
        let f = fixture();
        f.runtime.insert_container(labelled_container("c1", "echo-lost"));

        let id = f.reconciler.redeploy_orphan("c1").await.unwrap();
        wait_active(&f.lifecycle, &id).await;

        assert!(f.lifecycle.list().iter().any(|i| i.instance_id == id));
        assert!(f.reconciler.orphans().await.unwrap().is_empty());
        // Adopting again is a no-op
        assert_eq!(f.reconciler.redeploy_orphan("c1").await.unwrap(), id);
    }

    #[tokio::test]
    async fn test_scan_surfaces_runtime_outage() {
        let f = fixture();
        f.runtime.set_available(false);
        assert!(matches!(
            f.reconciler.scan().await,
            Err(ReconcileError::Runtime(RuntimeError::Unavailable(_)))
        ));
        assert!(f.reconciler.last_report().is_none());
    }
}
