use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cluster::{ClusterStore, EngineValidationContext};
use crate::config::{ConfigError, EngineConfig, RegistryBackend, RuntimeBackend};
use crate::connections::{spawn_reaper, ConnectionCache};
use crate::events::EventBus;
use crate::metrics::EngineMetrics;
use crate::modules::{
    probe_from_config, Collaborators, HealthProbe, LifecycleManager, ModuleCatalog, StaticProbe,
};
use crate::pipeline::{pipeline_id, PipelineStore};
use crate::reconcile::{spawn_reconciler, Reconciler};
use crate::registry::{ConsulRegistry, InMemoryRegistry, KvEvent, KvStore, ServiceRegistry};
use crate::runtime::{ContainerRuntime, DockerCli, InMemoryRuntime, SerializedRuntime};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<ModuleCatalog>,
    pub registry: Arc<dyn ServiceRegistry>,
    pub lifecycle: LifecycleManager,
    pub reconciler: Arc<Reconciler>,
    pub pipelines: Arc<PipelineStore>,
    pub clusters: Arc<ClusterStore>,
    pub connections: Arc<ConnectionCache>,
    pub events: EventBus,
    pub metrics: Arc<EngineMetrics>,
}

impl AppState {
    /// Wire every component around the given collaborators
    pub fn new(config: &EngineConfig, catalog: ModuleCatalog, deps: Collaborators) -> Self {
        let catalog = Arc::new(catalog);
        let events = EventBus::new(config.events.capacity);
        let metrics = Arc::new(EngineMetrics::new());

        let lifecycle = LifecycleManager::new(
            catalog.clone(),
            deps.clone(),
            events.clone(),
            metrics.clone(),
            config.lifecycle_config(),
        );
        let reconciler = Arc::new(Reconciler::new(lifecycle.clone(), deps.clone(), metrics.clone()));
        let clusters = Arc::new(ClusterStore::new(deps.kv.clone()));
        let context = Arc::new(EngineValidationContext::new(catalog.clone(), clusters.clone()));
        let pipelines = Arc::new(PipelineStore::new(deps.kv.clone(), context));
        let connections = Arc::new(ConnectionCache::new(
            deps.registry.clone(),
            config.connection_config(),
            metrics.clone(),
        ));

        Self {
            catalog,
            registry: deps.registry,
            lifecycle,
            reconciler,
            pipelines,
            clusters,
            connections,
            events,
            metrics,
        }
    }

    /// Build collaborators and catalog from config, then wire the state
    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        let catalog = config.catalog()?;
        Ok(Self::new(config, catalog, collaborators_from_config(config)))
    }

    /// Start the periodic reconciler, the idle-channel reaper and the
    /// pipeline change follower
    pub fn spawn_background(&self, config: &EngineConfig) -> BackgroundTasks {
        BackgroundTasks {
            shutdowns: vec![
                spawn_reconciler(self.reconciler.clone(), config.reconcile_config()),
                spawn_reaper(self.connections.clone()),
                spawn_pipeline_follower(self.pipelines.clone()),
            ],
        }
    }
}

/// Shutdown handles of the background loops
pub struct BackgroundTasks {
    shutdowns: Vec<watch::Sender<bool>>,
}

impl BackgroundTasks {
    pub fn shutdown(&self) {
        for tx in &self.shutdowns {
            let _ = tx.send(true);
        }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Registry, KV, runtime and probe selected by the config's backends
pub fn collaborators_from_config(config: &EngineConfig) -> Collaborators {
    let (registry, kv): (Arc<dyn ServiceRegistry>, Arc<dyn KvStore>) = match config.registry.backend {
        RegistryBackend::Consul => {
            let consul = Arc::new(ConsulRegistry::new(config.registry.consul.clone()));
            (consul.clone() as Arc<dyn ServiceRegistry>, consul as Arc<dyn KvStore>)
        }
        RegistryBackend::Memory => {
            let memory = Arc::new(InMemoryRegistry::new());
            (memory.clone() as Arc<dyn ServiceRegistry>, memory as Arc<dyn KvStore>)
        }
    };

    let (runtime, probe): (Arc<dyn ContainerRuntime>, Arc<dyn HealthProbe>) = match config.runtime.backend {
        RuntimeBackend::Docker => (
            Arc::new(SerializedRuntime::new(Arc::new(DockerCli::new(
                config.runtime.docker.clone(),
            )))) as Arc<dyn ContainerRuntime>,
            probe_from_config(&config.lifecycle.health),
        ),
        // Recorded containers never listen, so nothing could answer a real probe
        RuntimeBackend::Memory => (
            Arc::new(InMemoryRuntime::new()) as Arc<dyn ContainerRuntime>,
            Arc::new(StaticProbe::new(true)) as Arc<dyn HealthProbe>,
        ),
    };

    Collaborators {
        registry,
        kv,
        runtime,
        probe,
    }
}

/// Log pipeline definitions written by anyone, this engine included
pub fn spawn_pipeline_follower(pipelines: Arc<PipelineStore>) -> watch::Sender<bool> {
    let (shutdown_tx, mut shutdown) = watch::channel(false);
    let mut changes = pipelines.watch();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                change = changes.next() => {
                    match change {
                        Some(KvEvent::Put { key }) => {
                            info!("Pipeline definition '{}' written", pipeline_id(&key).unwrap_or(&key));
                        }
                        Some(KvEvent::Delete { key }) => {
                            info!("Pipeline definition '{}' removed", pipeline_id(&key).unwrap_or(&key));
                        }
                        None => {
                            warn!("Pipeline watch ended");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    shutdown_tx
}
