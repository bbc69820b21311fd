//! Container runtime capability
//!
//! The engine does not own container orchestration; it starts, stops,
//! removes and observes module containers through [`ContainerRuntime`].
//! Every container the engine starts carries `io.modplane.*` labels so the
//! reconciliation loop can recognise its own containers after a restart.

pub mod docker;
pub mod memory;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub use docker::{DockerCli, DockerRuntimeConfig};
pub use memory::InMemoryRuntime;

pub const LABEL_MANAGED: &str = "io.modplane.managed";
pub const LABEL_INSTANCE: &str = "io.modplane.instance-id";
pub const LABEL_MODULE: &str = "io.modplane.module";
pub const LABEL_ENGINE: &str = "io.modplane.engine";
pub const LABEL_SIDECAR_OF: &str = "io.modplane.sidecar-of";
/// Prefix of per-role port labels, e.g. `io.modplane.port.grpc=50051`
pub const LABEL_PORT_PREFIX: &str = "io.modplane.port.";

/// Errors from the container runtime collaborator
#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    #[error("Container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("Container '{0}' not found")]
    ContainerNotFound(String),

    #[error("Container start failed: {0}")]
    StartFailed(String),

    #[error("Runtime command failed: {0}")]
    CommandFailed(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// A helper container started next to a module container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// What to start for one module instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    /// Container name, equal to the instance id
    pub name: String,
    pub image: String,
    /// Port role -> container port
    pub ports: BTreeMap<String, u16>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub sidecars: Vec<SidecarSpec>,
}

impl ContainerSpec {
    /// Build a spec carrying the engine's identifying labels
    pub fn for_instance(
        instance_id: &str,
        module_name: &str,
        image: &str,
        ports: &BTreeMap<String, u16>,
        engine: &str,
    ) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_INSTANCE.to_string(), instance_id.to_string());
        labels.insert(LABEL_MODULE.to_string(), module_name.to_string());
        labels.insert(LABEL_ENGINE.to_string(), engine.to_string());
        for (role, port) in ports {
            labels.insert(format!("{}{}", LABEL_PORT_PREFIX, role), port.to_string());
        }

        let mut env = BTreeMap::new();
        env.insert("MODULE_NAME".to_string(), module_name.to_string());
        env.insert("INSTANCE_ID".to_string(), instance_id.to_string());

        Self {
            name: instance_id.to_string(),
            image: image.to_string(),
            ports: ports.clone(),
            env,
            labels,
            sidecars: Vec::new(),
        }
    }
}

/// Observed state of a helper container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarInfo {
    pub name: String,
    pub container_id: String,
    pub running: bool,
}

/// Observed state of a module container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
    /// Address other processes use to reach the container
    pub address: String,
    /// Port role -> reachable port
    pub ports: BTreeMap<String, u16>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub sidecars: Vec<SidecarInfo>,
}

impl ContainerInfo {
    pub fn is_managed(&self) -> bool {
        self.labels.get(LABEL_MANAGED).map(String::as_str) == Some("true")
    }

    pub fn is_sidecar(&self) -> bool {
        self.labels.contains_key(LABEL_SIDECAR_OF)
    }

    /// Instance id from labels, falling back to the container name
    pub fn instance_id(&self) -> &str {
        self.labels
            .get(LABEL_INSTANCE)
            .map(String::as_str)
            .unwrap_or(&self.name)
    }

    pub fn module_name(&self) -> Option<&str> {
        self.labels.get(LABEL_MODULE).map(String::as_str)
    }

    /// Port roles recorded in labels: role -> container port
    pub fn labelled_ports(&self) -> BTreeMap<String, u16> {
        self.labels
            .iter()
            .filter_map(|(k, v)| {
                let role = k.strip_prefix(LABEL_PORT_PREFIX)?;
                Some((role.to_string(), v.parse().ok()?))
            })
            .collect()
    }
}

/// Start/stop/observe operations against an external container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start a container (and its sidecars) and return its observed state
    async fn start(&self, spec: &ContainerSpec) -> RuntimeResult<ContainerInfo>;

    /// Stop a container and its sidecars
    async fn stop(&self, container_id: &str) -> RuntimeResult<()>;

    /// Remove a stopped container and its sidecars
    async fn remove(&self, container_id: &str) -> RuntimeResult<()>;

    async fn inspect(&self, container_id: &str) -> RuntimeResult<Option<ContainerInfo>>;

    /// Every engine-labelled module container, sidecars excluded
    async fn list_managed(&self) -> RuntimeResult<Vec<ContainerInfo>>;
}

// ============================================================================
// Per-container serialization
// ============================================================================

/// One async mutex per container id
#[derive(Default)]
pub struct ContainerLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ContainerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, container_id: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(container_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Drop the mutex for an id once nobody holds or waits on it
    pub fn prune(&self, container_id: &str) {
        self.locks
            .remove_if(container_id, |_, m| Arc::strong_count(m) == 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Runtime wrapper that serializes conflicting operations on the same
/// container while letting different containers proceed concurrently
pub struct SerializedRuntime {
    inner: Arc<dyn ContainerRuntime>,
    locks: ContainerLocks,
}

impl SerializedRuntime {
    pub fn new(inner: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            inner,
            locks: ContainerLocks::new(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for SerializedRuntime {
    async fn start(&self, spec: &ContainerSpec) -> RuntimeResult<ContainerInfo> {
        let guard = self.locks.lock(&spec.name).await;
        let result = self.inner.start(spec).await;
        drop(guard);
        self.locks.prune(&spec.name);
        result
    }

    async fn stop(&self, container_id: &str) -> RuntimeResult<()> {
        let guard = self.locks.lock(container_id).await;
        let result = self.inner.stop(container_id).await;
        drop(guard);
        self.locks.prune(container_id);
        result
    }

    async fn remove(&self, container_id: &str) -> RuntimeResult<()> {
        let guard = self.locks.lock(container_id).await;
        let result = self.inner.remove(container_id).await;
        drop(guard);
        self.locks.prune(container_id);
        result
    }

    async fn inspect(&self, container_id: &str) -> RuntimeResult<Option<ContainerInfo>> {
        self.inner.inspect(container_id).await
    }

    async fn list_managed(&self) -> RuntimeResult<Vec<ContainerInfo>> {
        self.inner.list_managed().await
    }
}

/// Environment handed to a registry sidecar so it can register its module
pub fn sidecar_env(instance_id: &str, module_name: &str, grpc_port: u16) -> BTreeMap<String, String> {
    [
        ("MODULE_NAME", module_name.to_string()),
        ("MODULE_INSTANCE_ID", instance_id.to_string()),
        ("MODULE_GRPC_PORT", grpc_port.to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}
