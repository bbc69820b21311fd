//! Dynamic Connection Cache
//!
//! Maps a logical service name to a load-balanced gRPC channel whose backing
//! instance set follows the registry. Callers never see which physical
//! instance answers; a registry watch swaps instances in and out of the
//! channel without disturbing calls already in flight.

use dashmap::DashMap;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tonic::transport::channel::Change;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, warn};

use crate::metrics::EngineMetrics;
use crate::registry::{RegistryError, ServiceInstance, ServiceRegistry};

/// Pending endpoint changes buffered per channel
const CHANGE_BUFFER: usize = 64;

#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    #[error("Service '{0}' has no healthy instances in the registry")]
    ServiceUnknown(String),

    #[error("No healthy instance available for '{0}'")]
    NoHealthyInstance(String),

    #[error("Registry lookup failed: {0}")]
    Registry(#[from] RegistryError),

    #[error("Invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
}

/// Cache tuning
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Unreferenced channels idle this long are torn down
    pub idle_ttl: Duration,
    pub reaper_interval: Duration,
    pub connect_timeout: Duration,
    pub rpc_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(300),
            reaper_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(30),
        }
    }
}

/// One cached service: the balanced channel plus its current target set
struct CachedService {
    name: String,
    channel: Channel,
    changes: mpsc::Sender<Change<String, Endpoint>>,
    /// instance id -> "address:port"
    targets: RwLock<BTreeMap<String, String>>,
    /// Size of `targets`, watched by calls in flight
    eligible: watch::Sender<usize>,
    last_used: StdMutex<Instant>,
    /// Live `ConnectionHandle`s
    leases: AtomicUsize,
    cursor: AtomicUsize,
    cancel: CancellationToken,
}

impl CachedService {
    fn touch(&self) {
        if let Ok(mut last) = self.last_used.lock() {
            *last = Instant::now();
        }
    }

    fn is_idle(&self, now: Instant, ttl: Duration) -> bool {
        if self.leases.load(Ordering::SeqCst) > 0 {
            return false;
        }
        self.last_used
            .lock()
            .map(|last| now.saturating_duration_since(*last) >= ttl)
            .unwrap_or(false)
    }

    fn target_endpoints(&self) -> Vec<String> {
        self.targets
            .read()
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Push a fresh registry snapshot into the balancer
    async fn apply(&self, instances: &[ServiceInstance], config: &ConnectionConfig) {
        let diff = {
            let current = match self.targets.read() {
                Ok(t) => t.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            };
            diff_targets(&current, instances)
        };
        if diff.is_empty() {
            return;
        }

        for id in &diff.removed {
            if self.changes.send(Change::Remove(id.clone())).await.is_err() {
                return;
            }
            debug!("'{}': instance {} left the target set", self.name, id);
        }
        let mut inserted = Vec::new();
        for (id, address) in &diff.inserted {
            match build_endpoint(address, config) {
                Ok(endpoint) => {
                    if self.changes.send(Change::Insert(id.clone(), endpoint)).await.is_err() {
                        return;
                    }
                    inserted.push((id.clone(), address.clone()));
                }
                Err(e) => warn!("'{}': skipping instance {}: {}", self.name, id, e),
            }
        }

        let remaining = {
            let mut targets = self
                .targets
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for id in &diff.removed {
                targets.remove(id);
            }
            targets.extend(inserted);
            targets.len()
        };
        self.eligible.send_replace(remaining);
        if remaining == 0 {
            warn!("'{}' has no eligible instances left; failing calls in flight", self.name);
        }
        info!(
            "'{}' target set updated: +{} -{} ({} eligible)",
            self.name,
            diff.inserted.len(),
            diff.removed.len(),
            remaining
        );
    }
}

/// A resolved service. Holding a handle keeps its channel out of the reaper.
pub struct ConnectionHandle {
    service: Arc<CachedService>,
}

impl ConnectionHandle {
    fn new(service: Arc<CachedService>) -> Self {
        service.leases.fetch_add(1, Ordering::SeqCst);
        service.touch();
        Self { service }
    }

    pub fn service_name(&self) -> &str {
        &self.service.name
    }

    /// The balanced channel, or `NoHealthyInstance` when every instance
    /// behind the name is currently ineligible.
    ///
    /// A channel taken here keeps waiting for an endpoint if the target set
    /// later drains; use [`ConnectionHandle::call`] to fail instead.
    pub fn channel(&self) -> Result<Channel, ConnectionError> {
        self.service.touch();
        if self.service.target_endpoints().is_empty() {
            return Err(ConnectionError::NoHealthyInstance(self.service.name.clone()));
        }
        Ok(self.service.channel.clone())
    }

    /// Run `f` against the balanced channel.
    ///
    /// Fails with `NoHealthyInstance` up front when nothing is eligible, and
    /// abandons `f` as soon as the last eligible instance leaves the target
    /// set while it runs. No retry is attempted.
    ///
    /// ```ignore
    /// let reply = handle
    ///     .call(|channel| async move { EchoClient::new(channel).echo(request).await })
    ///     .await??;
    /// ```
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T, ConnectionError>
    where
        F: FnOnce(Channel) -> Fut,
        Fut: Future<Output = T>,
    {
        let mut eligible = self.service.eligible.subscribe();
        let channel = self.channel()?;

        tokio::select! {
            biased;
            Ok(_) = eligible.wait_for(|n| *n == 0) => {
                debug!("Call to '{}' abandoned: target set drained", self.service.name);
                Err(ConnectionError::NoHealthyInstance(self.service.name.clone()))
            }
            output = f(channel) => Ok(output),
        }
    }

    /// Round-robin over eligible endpoints, for callers that dial directly
    pub fn pick(&self) -> Result<String, ConnectionError> {
        let endpoints = self.service.target_endpoints();
        if endpoints.is_empty() {
            return Err(ConnectionError::NoHealthyInstance(self.service.name.clone()));
        }
        let n = self.service.cursor.fetch_add(1, Ordering::Relaxed);
        Ok(endpoints[n % endpoints.len()].clone())
    }

    /// Currently eligible "address:port" targets
    pub fn endpoints(&self) -> Vec<String> {
        self.service.target_endpoints()
    }
}

impl Clone for ConnectionHandle {
    fn clone(&self) -> Self {
        Self::new(self.service.clone())
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.service.leases.fetch_sub(1, Ordering::SeqCst);
        self.service.touch();
    }
}

/// Snapshot of one cache entry for status views
#[derive(Debug, Clone, serde::Serialize)]
pub struct CachedServiceInfo {
    pub name: String,
    pub endpoints: Vec<String>,
    pub handles: usize,
}

pub struct ConnectionCache {
    registry: Arc<dyn ServiceRegistry>,
    config: ConnectionConfig,
    metrics: Arc<EngineMetrics>,
    entries: DashMap<String, Arc<CachedService>>,
    /// Serializes channel builds per service name
    build_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ConnectionCache {
    pub fn new(
        registry: Arc<dyn ServiceRegistry>,
        config: ConnectionConfig,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            registry,
            config,
            metrics,
            entries: DashMap::new(),
            build_locks: DashMap::new(),
        }
    }

    /// Resolve a service name to a load-balanced channel handle.
    ///
    /// The first resolution of a name builds the channel from the registry's
    /// current instances and subscribes to its watch. Fails with
    /// `ServiceUnknown` when nothing is cached and the registry has no
    /// eligible instance. Callers own retry policy.
    pub async fn resolve(&self, service: &str) -> Result<ConnectionHandle, ConnectionError> {
        if let Some(entry) = self.cached(service) {
            return Ok(entry);
        }

        let lock = self
            .build_locks
            .entry(service.to_string())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        // Another caller may have finished the build while we waited
        if let Some(entry) = self.cached(service) {
            return Ok(entry);
        }

        self.metrics.record_cache_miss();
        info!("Connection cache miss for '{}', building channel", service);

        let instances = self.registry.instances(service).await?;
        if !instances.iter().any(ServiceInstance::is_eligible) {
            warn!("No eligible instances of '{}' in the registry", service);
            return Err(ConnectionError::ServiceUnknown(service.to_string()));
        }

        let (channel, changes) = Channel::balance_channel::<String>(CHANGE_BUFFER);
        let entry = Arc::new(CachedService {
            name: service.to_string(),
            channel,
            changes,
            targets: RwLock::new(BTreeMap::new()),
            eligible: watch::Sender::new(0),
            last_used: StdMutex::new(Instant::now()),
            leases: AtomicUsize::new(0),
            cursor: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
        });
        entry.apply(&instances, &self.config).await;
        if entry.target_endpoints().is_empty() {
            return Err(ConnectionError::InvalidEndpoint {
                endpoint: service.to_string(),
                reason: "no instance produced a usable endpoint".to_string(),
            });
        }

        self.spawn_watch(entry.clone());
        let handle = ConnectionHandle::new(entry.clone());
        self.entries.insert(service.to_string(), entry);
        Ok(handle)
    }

    fn cached(&self, service: &str) -> Option<ConnectionHandle> {
        let entry = self.entries.get(service)?.clone();
        self.metrics.record_cache_hit();
        Some(ConnectionHandle::new(entry))
    }

    fn spawn_watch(&self, entry: Arc<CachedService>) {
        let mut updates = self.registry.watch(&entry.name);
        let config = self.config.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = entry.cancel.cancelled() => {
                        debug!("Watch for '{}' stopped", entry.name);
                        break;
                    }
                    next = updates.next() => match next {
                        Some(instances) => entry.apply(&instances, &config).await,
                        None => {
                            warn!("Registry watch for '{}' ended; target set frozen", entry.name);
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Tear down channels with no live handle that have been idle for the TTL
    pub fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let ttl = self.config.idle_ttl;
        let candidates: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.is_idle(now, ttl))
            .map(|e| e.key().clone())
            .collect();

        let mut evicted = 0;
        for name in candidates {
            if let Some((_, entry)) = self.entries.remove_if(&name, |_, e| e.is_idle(now, ttl)) {
                entry.cancel.cancel();
                self.build_locks.remove(&name);
                self.metrics.record_channel_evicted();
                info!("Evicted idle channel for '{}'", name);
                evicted += 1;
            }
        }
        evicted
    }

    /// Drop a cached channel regardless of use; the next resolve rebuilds it
    pub fn invalidate(&self, service: &str) -> bool {
        match self.entries.remove(service) {
            Some((_, entry)) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cached_services(&self) -> Vec<CachedServiceInfo> {
        let mut all: Vec<CachedServiceInfo> = self
            .entries
            .iter()
            .map(|e| CachedServiceInfo {
                name: e.name.clone(),
                endpoints: e.target_endpoints(),
                handles: e.leases.load(Ordering::SeqCst),
            })
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for ConnectionCache {
    fn drop(&mut self) {
        for entry in self.entries.iter() {
            entry.cancel.cancel();
        }
    }
}

/// Spawn the idle-channel reaper
///
/// Returns a shutdown sender that stops the loop.
pub fn spawn_reaper(cache: Arc<ConnectionCache>) -> watch::Sender<bool> {
    let (shutdown_tx, mut shutdown) = watch::channel(false);
    let interval = cache.config.reaper_interval.max(Duration::from_millis(10));

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let evicted = cache.evict_idle();
                    if evicted > 0 {
                        debug!("Reaper evicted {} channels", evicted);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Connection reaper shutting down");
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

#[derive(Debug, Default, PartialEq)]
struct TargetDiff {
    inserted: Vec<(String, String)>,
    removed: Vec<String>,
}

impl TargetDiff {
    fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.removed.is_empty()
    }
}

/// Compare the current target set with a registry snapshot. Only healthy,
/// enabled instances are eligible; an instance whose address moved is
/// re-inserted.
fn diff_targets(current: &BTreeMap<String, String>, snapshot: &[ServiceInstance]) -> TargetDiff {
    let eligible: BTreeMap<&str, String> = snapshot
        .iter()
        .filter(|i| i.is_eligible())
        .map(|i| (i.id.as_str(), i.endpoint()))
        .collect();

    let removed = current
        .keys()
        .filter(|id| !eligible.contains_key(id.as_str()))
        .cloned()
        .collect();
    let inserted = eligible
        .iter()
        .filter(|(id, endpoint)| current.get(**id) != Some(*endpoint))
        .map(|(id, endpoint)| (id.to_string(), endpoint.clone()))
        .collect();

    TargetDiff { inserted, removed }
}

fn build_endpoint(address: &str, config: &ConnectionConfig) -> Result<Endpoint, ConnectionError> {
    let uri = format!("http://{}", address);
    let endpoint = Endpoint::from_shared(uri).map_err(|e| ConnectionError::InvalidEndpoint {
        endpoint: address.to_string(),
        reason: e.to_string(),
    })?;
    Ok(endpoint
        .connect_timeout(config.connect_timeout)
        .timeout(config.rpc_timeout)
        .tcp_keepalive(Some(Duration::from_secs(30))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{InMemoryRegistry, ServiceRegistration};
    use std::collections::HashMap;

    fn instance(id: &str, port: u16, healthy: bool, enabled: bool) -> ServiceInstance {
        ServiceInstance {
            id: id.to_string(),
            service: "echo".to_string(),
            address: "127.0.0.1".to_string(),
            port,
            tags: vec![],
            meta: HashMap::new(),
            healthy,
            enabled,
        }
    }

    fn registration(id: &str, port: u16) -> ServiceRegistration {
        ServiceRegistration {
            id: id.to_string(),
            name: "echo".to_string(),
            address: "127.0.0.1".to_string(),
            port,
            tags: vec![],
            meta: HashMap::new(),
        }
    }

    fn cache_with(registry: Arc<InMemoryRegistry>, idle_ttl: Duration) -> ConnectionCache {
        ConnectionCache::new(
            registry,
            ConnectionConfig {
                idle_ttl,
                ..Default::default()
            },
            Arc::new(EngineMetrics::new()),
        )
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never held");
    }

    #[test]
    fn test_diff_only_eligible() {
        let current = BTreeMap::new();
        let snapshot = vec![
            instance("a", 1, true, true),
            instance("b", 2, false, true),
            instance("c", 3, true, false),
        ];
        let diff = diff_targets(&current, &snapshot);
        assert_eq!(diff.inserted, vec![("a".to_string(), "127.0.0.1:1".to_string())]);
        assert!(diff.removed.is_empty());
    }

    #[test]
    fn test_diff_removes_and_moves() {
        let mut current = BTreeMap::new();
        current.insert("a".to_string(), "127.0.0.1:1".to_string());
        current.insert("b".to_string(), "127.0.0.1:2".to_string());

        let snapshot = vec![instance("a", 9, true, true), instance("b", 2, false, true)];
        let diff = diff_targets(&current, &snapshot);
        assert_eq!(diff.removed, vec!["b".to_string()]);
        assert_eq!(diff.inserted, vec![("a".to_string(), "127.0.0.1:9".to_string())]);
    }

    #[test]
    fn test_diff_steady_state_is_empty() {
        let mut current = BTreeMap::new();
        current.insert("a".to_string(), "127.0.0.1:1".to_string());
        assert!(diff_targets(&current, &[instance("a", 1, true, true)]).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_service_then_recovers() {
        let registry = Arc::new(InMemoryRegistry::new());
        let cache = cache_with(registry.clone(), Duration::from_secs(300));

        let err = cache.resolve("echo").await.err().unwrap();
        assert!(matches!(err, ConnectionError::ServiceUnknown(_)));
        assert!(cache.is_empty());

        registry.register(&registration("echo-1", 50051)).await.unwrap();
        let handle = cache.resolve("echo").await.unwrap();
        assert_eq!(handle.endpoints(), vec!["127.0.0.1:50051"]);
        assert!(handle.channel().is_ok());
    }

    #[tokio::test]
    async fn test_second_resolve_is_cache_hit() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.register(&registration("echo-1", 50051)).await.unwrap();
        let metrics = Arc::new(EngineMetrics::new());
        let cache = ConnectionCache::new(registry, ConnectionConfig::default(), metrics.clone());

        let _a = cache.resolve("echo").await.unwrap();
        let _b = cache.resolve("echo").await.unwrap();

        let snap = metrics.snapshot();
        assert_eq!(snap.cache_misses, 1);
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(cache.cached_services()[0].handles, 2);
    }

    #[tokio::test]
    async fn test_watch_tracks_health_flips() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.register(&registration("echo-1", 50051)).await.unwrap();
        let cache = cache_with(registry.clone(), Duration::from_secs(300));
        let handle = cache.resolve("echo").await.unwrap();

        registry.set_healthy("echo-1", false).unwrap();
        eventually(|| handle.endpoints().is_empty()).await;
        assert!(matches!(
            handle.channel(),
            Err(ConnectionError::NoHealthyInstance(_))
        ));
        assert!(handle.pick().is_err());

        registry.register(&registration("echo-2", 50052)).await.unwrap();
        eventually(|| handle.endpoints() == vec!["127.0.0.1:50052".to_string()]).await;

        // Same handle, no invalidation needed
        assert!(handle.channel().is_ok());
        assert_eq!(handle.pick().unwrap(), "127.0.0.1:50052");
    }

    #[tokio::test]
    async fn test_call_fails_fast_when_targets_drain() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.register(&registration("echo-1", 1)).await.unwrap();
        let cache = cache_with(registry.clone(), Duration::from_secs(300));
        let handle = cache.resolve("echo").await.unwrap();

        // A call in flight when the last instance turns unhealthy
        let in_flight = handle.call(|_channel| std::future::pending::<()>());
        let drain = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            registry.set_healthy("echo-1", false).unwrap();
        };
        let (result, ()) = tokio::time::timeout(Duration::from_secs(3), async {
            tokio::join!(in_flight, drain)
        })
        .await
        .expect("call hung after the target set drained");
        assert!(matches!(result, Err(ConnectionError::NoHealthyInstance(ref s)) if s == "echo"));

        // Calls issued afterwards fail without touching the channel
        eventually(|| handle.endpoints().is_empty()).await;
        let mut invoked = false;
        let result = handle
            .call(|_channel| {
                invoked = true;
                async {}
            })
            .await;
        assert!(matches!(result, Err(ConnectionError::NoHealthyInstance(_))));
        assert!(!invoked);

        // Recovery needs no invalidation
        registry.set_healthy("echo-1", true).unwrap();
        eventually(|| !handle.endpoints().is_empty()).await;
        assert_eq!(handle.call(|_channel| async { 7 }).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_disabled_instance_not_a_target() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.register(&registration("echo-1", 50051)).await.unwrap();
        registry.register(&registration("echo-2", 50052)).await.unwrap();
        let cache = cache_with(registry.clone(), Duration::from_secs(300));
        let handle = cache.resolve("echo").await.unwrap();
        assert_eq!(handle.endpoints().len(), 2);

        registry.set_enabled("echo-1", false).await.unwrap();
        eventually(|| handle.endpoints() == vec!["127.0.0.1:50052".to_string()]).await;
    }

    #[tokio::test]
    async fn test_pick_round_robin() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.register(&registration("echo-1", 1)).await.unwrap();
        registry.register(&registration("echo-2", 2)).await.unwrap();
        let cache = cache_with(registry, Duration::from_secs(300));
        let handle = cache.resolve("echo").await.unwrap();

        let first = handle.pick().unwrap();
        let second = handle.pick().unwrap();
        let third = handle.pick().unwrap();
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[tokio::test]
    async fn test_reaper_skips_referenced_channels() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.register(&registration("echo-1", 50051)).await.unwrap();
        let cache = cache_with(registry, Duration::ZERO);

        let handle = cache.resolve("echo").await.unwrap();
        assert_eq!(cache.evict_idle(), 0);
        assert_eq!(cache.len(), 1);

        drop(handle);
        assert_eq!(cache.evict_idle(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_registry_outage_surfaces() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.set_available(false);
        let cache = cache_with(registry, Duration::from_secs(300));
        let err = cache.resolve("echo").await.err().unwrap();
        assert!(matches!(err, ConnectionError::Registry(RegistryError::Unavailable(_))));
    }
}
