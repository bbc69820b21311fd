//! In-process container runtime for tests and `runtime.backend: memory`

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;

use super::{
    ContainerInfo, ContainerRuntime, ContainerSpec, RuntimeError, RuntimeResult, SidecarInfo,
};

/// Records containers instead of running them
pub struct InMemoryRuntime {
    containers: DashMap<String, ContainerInfo>,
    next_id: AtomicU64,
    start_failure: Mutex<Option<String>>,
    available: AtomicBool,
    /// `start` waits while this is false
    start_gate: watch::Sender<bool>,
    address: String,
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self {
            containers: DashMap::new(),
            next_id: AtomicU64::new(1),
            start_failure: Mutex::new(None),
            available: AtomicBool::new(true),
            start_gate: watch::Sender::new(true),
            address: "127.0.0.1".to_string(),
        }
    }

    /// Make every subsequent `start` fail with the given reason (or succeed again with `None`)
    pub fn fail_starts(&self, reason: Option<&str>) {
        if let Ok(mut failure) = self.start_failure.lock() {
            *failure = reason.map(String::from);
        }
    }

    /// Park every `start` until `release_starts` is called
    pub fn hold_starts(&self) {
        self.start_gate.send_replace(false);
    }

    pub fn release_starts(&self) {
        self.start_gate.send_replace(true);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Place a container as if something outside the engine had started it
    pub fn insert_container(&self, info: ContainerInfo) {
        self.containers.insert(info.id.clone(), info);
    }

    pub fn container_count(&self) -> usize {
        self.containers.len()
    }

    fn check_available(&self) -> RuntimeResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RuntimeError::Unavailable(
                "in-memory runtime marked unavailable".to_string(),
            ))
        }
    }

    /// Resolve either a container id or a container name
    fn resolve_id(&self, id_or_name: &str) -> Option<String> {
        if self.containers.contains_key(id_or_name) {
            return Some(id_or_name.to_string());
        }
        self.containers
            .iter()
            .find(|e| e.name == id_or_name)
            .map(|e| e.key().clone())
    }
}

impl Default for InMemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    async fn start(&self, spec: &ContainerSpec) -> RuntimeResult<ContainerInfo> {
        let mut gate = self.start_gate.subscribe();
        if gate.wait_for(|open| *open).await.is_err() {
            return Err(RuntimeError::Unavailable("start gate closed".to_string()));
        }
        self.check_available()?;
        let failure = self
            .start_failure
            .lock()
            .map_err(|e| RuntimeError::CommandFailed(e.to_string()))?
            .clone();
        if let Some(reason) = failure {
            return Err(RuntimeError::StartFailed(reason));
        }
        if self.resolve_id(&spec.name).is_some() {
            return Err(RuntimeError::StartFailed(format!(
                "container name '{}' already in use",
                spec.name
            )));
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("mem{:012x}", n);
        let sidecars = spec
            .sidecars
            .iter()
            .enumerate()
            .map(|(i, s)| SidecarInfo {
                name: s.name.clone(),
                container_id: format!("{}-s{}", id, i),
                running: true,
            })
            .collect();

        let info = ContainerInfo {
            id: id.clone(),
            name: spec.name.clone(),
            image: spec.image.clone(),
            running: true,
            address: self.address.clone(),
            ports: spec.ports.clone(),
            labels: spec.labels.clone(),
            sidecars,
        };
        self.containers.insert(id, info.clone());
        Ok(info)
    }

    async fn stop(&self, container_id: &str) -> RuntimeResult<()> {
        self.check_available()?;
        let id = self
            .resolve_id(container_id)
            .ok_or_else(|| RuntimeError::ContainerNotFound(container_id.to_string()))?;
        if let Some(mut info) = self.containers.get_mut(&id) {
            info.running = false;
            for sidecar in info.sidecars.iter_mut() {
                sidecar.running = false;
            }
        }
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> RuntimeResult<()> {
        self.check_available()?;
        let id = self
            .resolve_id(container_id)
            .ok_or_else(|| RuntimeError::ContainerNotFound(container_id.to_string()))?;
        self.containers.remove(&id);
        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> RuntimeResult<Option<ContainerInfo>> {
        self.check_available()?;
        Ok(self
            .resolve_id(container_id)
            .and_then(|id| self.containers.get(&id).map(|e| e.value().clone())))
    }

    async fn list_managed(&self) -> RuntimeResult<Vec<ContainerInfo>> {
        self.check_available()?;
        let mut containers: Vec<ContainerInfo> = self
            .containers
            .iter()
            .filter(|e| e.is_managed() && !e.is_sidecar())
            .map(|e| e.value().clone())
            .collect();
        containers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(containers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec(name: &str) -> ContainerSpec {
        let ports: BTreeMap<String, u16> = [("grpc".to_string(), 50051)].into_iter().collect();
        ContainerSpec::for_instance(name, "echo", "modules/echo:1.0", &ports, "test")
    }

    #[tokio::test]
    async fn test_start_stop_remove() {
        let runtime = InMemoryRuntime::new();
        let info = runtime.start(&spec("echo-1")).await.unwrap();
        assert!(info.running);
        assert_eq!(info.ports["grpc"], 50051);

        runtime.stop(&info.id).await.unwrap();
        let stopped = runtime.inspect(&info.id).await.unwrap().unwrap();
        assert!(!stopped.running);

        runtime.remove("echo-1").await.unwrap();
        assert!(runtime.inspect(&info.id).await.unwrap().is_none());
        assert!(matches!(
            runtime.remove(&info.id).await,
            Err(RuntimeError::ContainerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_start_failure_injection() {
        let runtime = InMemoryRuntime::new();
        runtime.fail_starts(Some("image pull denied"));
        let err = runtime.start(&spec("echo-1")).await.unwrap_err();
        assert!(matches!(err, RuntimeError::StartFailed(ref r) if r == "image pull denied"));

        runtime.fail_starts(None);
        assert!(runtime.start(&spec("echo-1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_held_start_waits_for_release() {
        let runtime = std::sync::Arc::new(InMemoryRuntime::new());
        runtime.hold_starts();

        let starting = {
            let runtime = runtime.clone();
            tokio::spawn(async move { runtime.start(&spec("echo-1")).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!starting.is_finished());
        assert_eq!(runtime.container_count(), 0);

        runtime.release_starts();
        let info = starting.await.unwrap().unwrap();
        assert_eq!(info.name, "echo-1");
        assert_eq!(runtime.container_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let runtime = InMemoryRuntime::new();
        runtime.start(&spec("echo-1")).await.unwrap();
        assert!(runtime.start(&spec("echo-1")).await.is_err());
    }

    #[tokio::test]
    async fn test_list_managed_skips_unlabelled() {
        let runtime = InMemoryRuntime::new();
        runtime.start(&spec("echo-1")).await.unwrap();
        runtime.insert_container(ContainerInfo {
            id: "foreign".to_string(),
            name: "postgres".to_string(),
            image: "postgres:16".to_string(),
            running: true,
            address: "127.0.0.1".to_string(),
            ports: BTreeMap::new(),
            labels: BTreeMap::new(),
            sidecars: vec![],
        });

        let managed = runtime.list_managed().await.unwrap();
        assert_eq!(managed.len(), 1);
        assert_eq!(managed[0].name, "echo-1");
    }
}
