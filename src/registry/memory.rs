//! In-process registry used for tests and `registry.backend: memory`

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::{BroadcastStream, WatchStream};

use super::{
    InstanceWatch, KvEvent, KvStore, KvWatch, RegistryError, RegistryResult, ServiceInstance,
    ServiceRegistration, ServiceRegistry,
};

/// Registry catalog and KV namespace held in memory.
///
/// Watches are push-based: every mutation republishes the affected
/// service's snapshot on a `tokio::sync::watch` channel.
pub struct InMemoryRegistry {
    instances: DashMap<String, ServiceInstance>,
    watchers: DashMap<String, watch::Sender<Vec<ServiceInstance>>>,
    kv: RwLock<BTreeMap<String, String>>,
    kv_events: broadcast::Sender<KvEvent>,
    available: AtomicBool,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        let (kv_events, _) = broadcast::channel(256);
        Self {
            instances: DashMap::new(),
            watchers: DashMap::new(),
            kv: RwLock::new(BTreeMap::new()),
            kv_events,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the registry becoming unreachable (or reachable again)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Flip the health of a registered instance, as the registry's own checks would
    pub fn set_healthy(&self, instance_id: &str, healthy: bool) -> RegistryResult<()> {
        let service = {
            let mut entry = self
                .instances
                .get_mut(instance_id)
                .ok_or_else(|| RegistryError::NotFound(instance_id.to_string()))?;
            entry.healthy = healthy;
            entry.service.clone()
        };
        self.notify(&service);
        Ok(())
    }

    /// Register an instance with an explicit initial health state
    pub fn insert_instance(&self, instance: ServiceInstance) {
        let service = instance.service.clone();
        self.instances.insert(instance.id.clone(), instance);
        self.notify(&service);
    }

    fn check_available(&self) -> RegistryResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RegistryError::Unavailable(
                "in-memory registry marked unavailable".to_string(),
            ))
        }
    }

    fn snapshot(&self, service: &str) -> Vec<ServiceInstance> {
        let mut instances: Vec<ServiceInstance> = self
            .instances
            .iter()
            .filter(|e| e.service == service)
            .map(|e| e.value().clone())
            .collect();
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        instances
    }

    fn notify(&self, service: &str) {
        if let Some(tx) = self.watchers.get(service) {
            tx.send_replace(self.snapshot(service));
        }
    }

    fn publish_kv(&self, event: KvEvent) {
        // No receivers is fine
        let _ = self.kv_events.send(event);
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceRegistry for InMemoryRegistry {
    async fn register(&self, registration: &ServiceRegistration) -> RegistryResult<()> {
        self.check_available()?;
        self.instances
            .insert(registration.id.clone(), ServiceInstance::from(registration));
        self.notify(&registration.name);
        Ok(())
    }

    async fn deregister(&self, instance_id: &str) -> RegistryResult<()> {
        self.check_available()?;
        let (_, removed) = self
            .instances
            .remove(instance_id)
            .ok_or_else(|| RegistryError::NotFound(instance_id.to_string()))?;
        self.notify(&removed.service);
        Ok(())
    }

    async fn set_enabled(&self, instance_id: &str, enabled: bool) -> RegistryResult<()> {
        self.check_available()?;
        let service = {
            let mut entry = self
                .instances
                .get_mut(instance_id)
                .ok_or_else(|| RegistryError::NotFound(instance_id.to_string()))?;
            entry.enabled = enabled;
            entry.service.clone()
        };
        self.notify(&service);
        Ok(())
    }

    async fn instances(&self, service: &str) -> RegistryResult<Vec<ServiceInstance>> {
        self.check_available()?;
        Ok(self.snapshot(service))
    }

    async fn services(&self) -> RegistryResult<Vec<String>> {
        self.check_available()?;
        let mut names: Vec<String> = self.instances.iter().map(|e| e.service.clone()).collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn watch(&self, service: &str) -> InstanceWatch {
        let rx = {
            let tx = self
                .watchers
                .entry(service.to_string())
                .or_insert_with(|| watch::channel(Vec::new()).0);
            tx.send_replace(self.snapshot(service));
            tx.subscribe()
        };
        WatchStream::new(rx).boxed()
    }
}

#[async_trait]
impl KvStore for InMemoryRegistry {
    async fn get(&self, key: &str) -> RegistryResult<Option<String>> {
        self.check_available()?;
        let kv = self
            .kv
            .read()
            .map_err(|e| RegistryError::Protocol(e.to_string()))?;
        Ok(kv.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> RegistryResult<()> {
        self.check_available()?;
        {
            let mut kv = self
                .kv
                .write()
                .map_err(|e| RegistryError::Protocol(e.to_string()))?;
            kv.insert(key.to_string(), value.to_string());
        }
        self.publish_kv(KvEvent::Put {
            key: key.to_string(),
        });
        Ok(())
    }

    async fn list(&self, prefix: &str) -> RegistryResult<Vec<(String, String)>> {
        self.check_available()?;
        let kv = self
            .kv
            .read()
            .map_err(|e| RegistryError::Protocol(e.to_string()))?;
        Ok(kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn delete(&self, key: &str) -> RegistryResult<bool> {
        self.check_available()?;
        let existed = {
            let mut kv = self
                .kv
                .write()
                .map_err(|e| RegistryError::Protocol(e.to_string()))?;
            kv.remove(key).is_some()
        };
        if existed {
            self.publish_kv(KvEvent::Delete {
                key: key.to_string(),
            });
        }
        Ok(existed)
    }

    fn watch(&self, prefix: &str) -> KvWatch {
        let prefix = prefix.to_string();
        BroadcastStream::new(self.kv_events.subscribe())
            .filter_map(move |item| {
                let matched = match item {
                    Ok(event) if event.key().starts_with(&prefix) => Some(event),
                    _ => None,
                };
                futures::future::ready(matched)
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn registration(id: &str, service: &str) -> ServiceRegistration {
        ServiceRegistration {
            id: id.to_string(),
            name: service.to_string(),
            address: "127.0.0.1".to_string(),
            port: 50051,
            tags: vec![],
            meta: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = InMemoryRegistry::new();
        registry.register(&registration("echo-1", "echo")).await.unwrap();
        registry.register(&registration("echo-2", "echo")).await.unwrap();
        registry
            .register(&registration("chunker-1", "chunker"))
            .await
            .unwrap();

        let echo = registry.instances("echo").await.unwrap();
        assert_eq!(echo.len(), 2);
        assert_eq!(echo[0].id, "echo-1");

        let services = registry.services().await.unwrap();
        assert_eq!(services, vec!["chunker", "echo"]);
        assert_eq!(registry.all_instances().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_deregister_unknown_is_not_found() {
        let registry = InMemoryRegistry::new();
        let err = registry.deregister("missing").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unavailable_registry_fails_calls() {
        let registry = InMemoryRegistry::new();
        registry.set_available(false);
        let err = registry.services().await.unwrap_err();
        assert!(matches!(err, RegistryError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_watch_emits_snapshot_then_changes() {
        let registry = InMemoryRegistry::new();
        registry.register(&registration("echo-1", "echo")).await.unwrap();

        let mut watch = ServiceRegistry::watch(&registry, "echo");
        let first = watch.next().await.unwrap();
        assert_eq!(first.len(), 1);

        registry.set_healthy("echo-1", false).unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), watch.next())
            .await
            .unwrap()
            .unwrap();
        assert!(!second[0].healthy);
    }

    #[tokio::test]
    async fn test_kv_roundtrip_and_prefix_list() {
        let registry = InMemoryRegistry::new();
        registry.put("pipelines/definitions/a", "{}").await.unwrap();
        registry.put("pipelines/definitions/b", "{}").await.unwrap();
        registry.put("clusters/default", "{}").await.unwrap();

        let listed = registry.list("pipelines/definitions/").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].0, "pipelines/definitions/a");

        assert!(registry.delete("pipelines/definitions/a").await.unwrap());
        assert!(!registry.delete("pipelines/definitions/a").await.unwrap());
        assert_eq!(registry.get("pipelines/definitions/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_kv_watch_filters_by_prefix() {
        let registry = InMemoryRegistry::new();
        let mut watch = KvStore::watch(&registry, "pipelines/");

        registry.put("clusters/x", "{}").await.unwrap();
        registry.put("pipelines/definitions/p1", "{}").await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), watch.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            KvEvent::Put {
                key: "pipelines/definitions/p1".to_string()
            }
        );
    }
}
