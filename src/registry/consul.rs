//! Consul HTTP API backend
//!
//! Catalog watches and KV watches use Consul blocking queries
//! (`?index=N&wait=Ns`), so topology changes are pushed as soon as Consul
//! observes them. When a blocking query fails the loop falls back to a
//! bounded retry interval, never tighter than [`MIN_POLL_FALLBACK`].

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::{
    InstanceWatch, KvEvent, KvStore, KvWatch, RegistryError, RegistryResult, ServiceInstance,
    ServiceRegistration, ServiceRegistry,
};

/// Lower bound on the retry interval after a failed blocking query
pub const MIN_POLL_FALLBACK: Duration = Duration::from_secs(2);

const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";
const MAINTENANCE_CHECK_PREFIX: &str = "_service_maintenance";

/// Connection settings for a Consul agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsulConfig {
    /// Agent base URL, e.g. `http://localhost:8500`
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub datacenter: Option<String>,
    /// Blocking query wait time
    #[serde(default = "default_watch_wait")]
    pub watch_wait_secs: u64,
    /// Retry interval after a failed watch request
    #[serde(default = "default_poll_fallback")]
    pub poll_fallback_secs: u64,
    /// When set, registrations carry a Consul gRPC check with this interval (e.g. "10s")
    #[serde(default)]
    pub grpc_check_interval: Option<String>,
}

fn default_watch_wait() -> u64 {
    30
}

fn default_poll_fallback() -> u64 {
    5
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8500".to_string(),
            token: None,
            datacenter: None,
            watch_wait_secs: default_watch_wait(),
            poll_fallback_secs: default_poll_fallback(),
            grpc_check_interval: None,
        }
    }
}

impl ConsulConfig {
    fn poll_fallback(&self) -> Duration {
        Duration::from_secs(self.poll_fallback_secs).max(MIN_POLL_FALLBACK)
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    address: &'a str,
    port: u16,
    tags: &'a [String],
    meta: &'a HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    check: Option<AgentCheck>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentCheck {
    #[serde(rename = "GRPC")]
    grpc: String,
    interval: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    #[serde(default)]
    node: Option<HealthNode>,
    service: HealthService,
    #[serde(default)]
    checks: Vec<HealthCheck>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthNode {
    #[serde(default)]
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthService {
    #[serde(rename = "ID")]
    id: String,
    service: String,
    #[serde(default)]
    address: String,
    #[serde(default)]
    port: u16,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    meta: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthCheck {
    #[serde(rename = "CheckID")]
    check_id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvEntry {
    key: String,
    modify_index: u64,
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Convert a `/v1/health/service` entry to an instance, deriving health and
/// maintenance state from its checks
fn instance_from_entry(entry: HealthEntry) -> ServiceInstance {
    let enabled = !entry
        .checks
        .iter()
        .any(|c| c.check_id.starts_with(MAINTENANCE_CHECK_PREFIX));
    let healthy = entry
        .checks
        .iter()
        .filter(|c| !c.check_id.starts_with(MAINTENANCE_CHECK_PREFIX))
        .all(|c| c.status == "passing");

    let address = if entry.service.address.is_empty() {
        entry.node.map(|n| n.address).unwrap_or_default()
    } else {
        entry.service.address
    };

    let mut tags = entry.service.tags.unwrap_or_default();
    tags.sort();

    ServiceInstance {
        id: entry.service.id,
        service: entry.service.service,
        address,
        port: entry.service.port,
        tags,
        meta: entry.service.meta.unwrap_or_default(),
        healthy,
        enabled,
    }
}

/// Diff two `key -> ModifyIndex` maps into change events, sorted by key
fn diff_kv_indexes(old: &HashMap<String, u64>, new: &HashMap<String, u64>) -> Vec<KvEvent> {
    let mut events: Vec<KvEvent> = new
        .iter()
        .filter(|(key, index)| old.get(*key) != Some(*index))
        .map(|(key, _)| KvEvent::Put { key: key.clone() })
        .chain(
            old.keys()
                .filter(|key| !new.contains_key(*key))
                .map(|key| KvEvent::Delete { key: key.clone() }),
        )
        .collect();
    events.sort_by(|a, b| a.key().cmp(b.key()));
    events
}

/// Consul resets the index when it goes backwards
fn next_index(previous: u64, reported: u64) -> u64 {
    if reported < previous {
        0
    } else {
        reported
    }
}

// ============================================================================
// Client
// ============================================================================

/// Registry client for a Consul agent
#[derive(Clone)]
pub struct ConsulRegistry {
    client: reqwest::Client,
    config: ConsulConfig,
}

impl ConsulRegistry {
    pub fn new(config: ConsulConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.url.trim_end_matches('/'), path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, self.url(path));
        if let Some(ref token) = self.config.token {
            req = req.header(TOKEN_HEADER, token);
        }
        if let Some(ref dc) = self.config.datacenter {
            req = req.query(&[("dc", dc)]);
        }
        req
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> RegistryResult<reqwest::Response> {
        req.send()
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))
    }

    async fn expect_success(resp: reqwest::Response, what: &str) -> RegistryResult<reqwest::Response> {
        let status = resp.status();
        if status.as_u16() == 404 {
            return Err(RegistryError::NotFound(what.to_string()));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RegistryError::Protocol(format!(
                "{} returned {}: {}",
                what, status, body
            )));
        }
        Ok(resp)
    }

    /// One blocking query against `/v1/health/service/{name}`
    async fn health_query(
        &self,
        service: &str,
        index: u64,
    ) -> RegistryResult<(u64, Vec<ServiceInstance>)> {
        let wait = self.config.watch_wait_secs;
        let req = self
            .request(
                reqwest::Method::GET,
                &format!("/v1/health/service/{}", service),
            )
            .query(&[("index", index.to_string()), ("wait", format!("{}s", wait))])
            .timeout(Duration::from_secs(wait + 10));

        let resp = Self::expect_success(self.send(req).await?, service).await?;
        let reported = index_header(&resp);
        let entries: Vec<HealthEntry> = resp
            .json()
            .await
            .map_err(|e| RegistryError::Protocol(e.to_string()))?;
        let mut instances: Vec<ServiceInstance> =
            entries.into_iter().map(instance_from_entry).collect();
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        Ok((reported, instances))
    }

    /// One blocking query over a KV prefix, returning key modify indexes
    async fn kv_index_query(
        &self,
        prefix: &str,
        index: u64,
    ) -> RegistryResult<(u64, HashMap<String, u64>)> {
        let wait = self.config.watch_wait_secs;
        let req = self
            .request(reqwest::Method::GET, &format!("/v1/kv/{}", prefix))
            .query(&[
                ("recurse", "true".to_string()),
                ("index", index.to_string()),
                ("wait", format!("{}s", wait)),
            ])
            .timeout(Duration::from_secs(wait + 10));

        let resp = self.send(req).await?;
        let reported = index_header(&resp);
        if resp.status().as_u16() == 404 {
            return Ok((reported, HashMap::new()));
        }
        let resp = Self::expect_success(resp, prefix).await?;
        let entries: Vec<KvEntry> = resp
            .json()
            .await
            .map_err(|e| RegistryError::Protocol(e.to_string()))?;
        Ok((
            reported,
            entries
                .into_iter()
                .map(|e| (e.key, e.modify_index))
                .collect(),
        ))
    }
}

fn index_header(resp: &reqwest::Response) -> u64 {
    resp.headers()
        .get(INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl ServiceRegistry for ConsulRegistry {
    async fn register(&self, registration: &ServiceRegistration) -> RegistryResult<()> {
        let check = self.config.grpc_check_interval.as_ref().map(|interval| AgentCheck {
            grpc: format!("{}:{}", registration.address, registration.port),
            interval: interval.clone(),
        });
        let body = AgentServiceRegistration {
            id: &registration.id,
            name: &registration.name,
            address: &registration.address,
            port: registration.port,
            tags: &registration.tags,
            meta: &registration.meta,
            check,
        };
        let req = self
            .request(reqwest::Method::PUT, "/v1/agent/service/register")
            .json(&body);
        Self::expect_success(self.send(req).await?, &registration.id).await?;
        debug!("Registered {} ({}) with Consul", registration.id, registration.name);
        Ok(())
    }

    async fn deregister(&self, instance_id: &str) -> RegistryResult<()> {
        let req = self.request(
            reqwest::Method::PUT,
            &format!("/v1/agent/service/deregister/{}", instance_id),
        );
        Self::expect_success(self.send(req).await?, instance_id).await?;
        debug!("Deregistered {} from Consul", instance_id);
        Ok(())
    }

    async fn set_enabled(&self, instance_id: &str, enabled: bool) -> RegistryResult<()> {
        let req = self
            .request(
                reqwest::Method::PUT,
                &format!("/v1/agent/service/maintenance/{}", instance_id),
            )
            .query(&[
                ("enable", (!enabled).to_string()),
                ("reason", "disabled by operator".to_string()),
            ]);
        Self::expect_success(self.send(req).await?, instance_id).await?;
        Ok(())
    }

    async fn instances(&self, service: &str) -> RegistryResult<Vec<ServiceInstance>> {
        let req = self.request(
            reqwest::Method::GET,
            &format!("/v1/health/service/{}", service),
        );
        let resp = Self::expect_success(self.send(req).await?, service).await?;
        let entries: Vec<HealthEntry> = resp
            .json()
            .await
            .map_err(|e| RegistryError::Protocol(e.to_string()))?;
        let mut instances: Vec<ServiceInstance> =
            entries.into_iter().map(instance_from_entry).collect();
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(instances)
    }

    async fn services(&self) -> RegistryResult<Vec<String>> {
        let req = self.request(reqwest::Method::GET, "/v1/catalog/services");
        let resp = Self::expect_success(self.send(req).await?, "catalog").await?;
        let services: HashMap<String, Vec<String>> = resp
            .json()
            .await
            .map_err(|e| RegistryError::Protocol(e.to_string()))?;
        let mut names: Vec<String> = services.into_keys().collect();
        names.sort();
        Ok(names)
    }

    fn watch(&self, service: &str) -> InstanceWatch {
        let (tx, rx) = mpsc::channel(16);
        let registry = self.clone();
        let service = service.to_string();
        let fallback = self.config.poll_fallback();

        tokio::spawn(async move {
            let mut index = 0u64;
            let mut last: Option<Vec<ServiceInstance>> = None;
            loop {
                match registry.health_query(&service, index).await {
                    Ok((reported, instances)) => {
                        index = next_index(index, reported);
                        if last.as_ref() != Some(&instances) {
                            if tx.send(instances.clone()).await.is_err() {
                                break;
                            }
                            last = Some(instances);
                        }
                    }
                    Err(e) => {
                        warn!("Watch on service '{}' failed: {}", service, e);
                        if tx.is_closed() {
                            break;
                        }
                        tokio::time::sleep(fallback).await;
                    }
                }
                if tx.is_closed() {
                    break;
                }
            }
            debug!("Watch on service '{}' stopped", service);
        });

        ReceiverStream::new(rx).boxed()
    }
}

#[async_trait]
impl KvStore for ConsulRegistry {
    async fn get(&self, key: &str) -> RegistryResult<Option<String>> {
        let req = self
            .request(reqwest::Method::GET, &format!("/v1/kv/{}", key))
            .query(&[("raw", "true")]);
        let resp = self.send(req).await?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        let resp = Self::expect_success(resp, key).await?;
        resp.text()
            .await
            .map(Some)
            .map_err(|e| RegistryError::Protocol(e.to_string()))
    }

    async fn put(&self, key: &str, value: &str) -> RegistryResult<()> {
        let req = self
            .request(reqwest::Method::PUT, &format!("/v1/kv/{}", key))
            .body(value.to_string());
        Self::expect_success(self.send(req).await?, key).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> RegistryResult<Vec<(String, String)>> {
        let req = self
            .request(reqwest::Method::GET, &format!("/v1/kv/{}", prefix))
            .query(&[("keys", "true")]);
        let resp = self.send(req).await?;
        if resp.status().as_u16() == 404 {
            return Ok(Vec::new());
        }
        let resp = Self::expect_success(resp, prefix).await?;
        let mut keys: Vec<String> = resp
            .json()
            .await
            .map_err(|e| RegistryError::Protocol(e.to_string()))?;
        keys.sort();

        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            // Keys ending in '/' are folders
            if key.ends_with('/') {
                continue;
            }
            if let Some(value) = self.get(&key).await? {
                entries.push((key, value));
            }
        }
        Ok(entries)
    }

    async fn delete(&self, key: &str) -> RegistryResult<bool> {
        let existed = self.get(key).await?.is_some();
        if existed {
            let req = self.request(reqwest::Method::DELETE, &format!("/v1/kv/{}", key));
            Self::expect_success(self.send(req).await?, key).await?;
        }
        Ok(existed)
    }

    fn watch(&self, prefix: &str) -> KvWatch {
        let (tx, rx) = mpsc::channel(64);
        let registry = self.clone();
        let prefix = prefix.to_string();
        let fallback = self.config.poll_fallback();

        tokio::spawn(async move {
            let mut index = 0u64;
            let mut known: Option<HashMap<String, u64>> = None;
            'outer: loop {
                match registry.kv_index_query(&prefix, index).await {
                    Ok((reported, current)) => {
                        index = next_index(index, reported);
                        // The first response only seeds the baseline
                        if let Some(ref previous) = known {
                            for event in diff_kv_indexes(previous, &current) {
                                if tx.send(event).await.is_err() {
                                    break 'outer;
                                }
                            }
                        }
                        known = Some(current);
                    }
                    Err(e) => {
                        warn!("Watch on KV prefix '{}' failed: {}", prefix, e);
                        tokio::time::sleep(fallback).await;
                    }
                }
                if tx.is_closed() {
                    break;
                }
            }
        });

        ReceiverStream::new(rx).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(checks: Vec<(&str, &str)>) -> HealthEntry {
        HealthEntry {
            node: Some(HealthNode {
                address: "192.168.1.10".to_string(),
            }),
            service: HealthService {
                id: "echo-1".to_string(),
                service: "echo".to_string(),
                address: String::new(),
                port: 50051,
                tags: Some(vec!["modplane-module".to_string()]),
                meta: None,
            },
            checks: checks
                .into_iter()
                .map(|(id, status)| HealthCheck {
                    check_id: id.to_string(),
                    status: status.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_passing_checks_are_healthy() {
        let inst = instance_from_entry(entry(vec![
            ("serfHealth", "passing"),
            ("service:echo-1", "passing"),
        ]));
        assert!(inst.healthy);
        assert!(inst.enabled);
        // Falls back to the node address
        assert_eq!(inst.address, "192.168.1.10");
    }

    #[test]
    fn test_critical_check_is_unhealthy() {
        let inst = instance_from_entry(entry(vec![
            ("serfHealth", "passing"),
            ("service:echo-1", "critical"),
        ]));
        assert!(!inst.healthy);
    }

    #[test]
    fn test_maintenance_disables_without_affecting_health() {
        let inst = instance_from_entry(entry(vec![
            ("serfHealth", "passing"),
            ("_service_maintenance:echo-1", "critical"),
        ]));
        assert!(inst.healthy);
        assert!(!inst.enabled);
    }

    #[test]
    fn test_health_entry_deserializes_consul_shape() {
        let json = r#"[{
            "Node": {"Node": "n1", "Address": "10.0.0.1"},
            "Service": {"ID": "echo-1", "Service": "echo", "Address": "10.0.0.9", "Port": 50051,
                        "Tags": ["modplane-module"], "Meta": {"module": "echo"}},
            "Checks": [{"CheckID": "serfHealth", "Status": "passing"}]
        }]"#;
        let entries: Vec<HealthEntry> = serde_json::from_str(json).unwrap();
        let inst = instance_from_entry(entries.into_iter().next().unwrap());
        assert_eq!(inst.address, "10.0.0.9");
        assert_eq!(inst.module_name(), "echo");
        assert!(inst.is_module());
    }

    #[test]
    fn test_kv_diff() {
        let old: HashMap<String, u64> = [("a".to_string(), 1), ("b".to_string(), 2)]
            .into_iter()
            .collect();
        let new: HashMap<String, u64> = [("a".to_string(), 1), ("b".to_string(), 5), ("c".to_string(), 6)]
            .into_iter()
            .collect();
        assert_eq!(
            diff_kv_indexes(&old, &new),
            vec![
                KvEvent::Put { key: "b".to_string() },
                KvEvent::Put { key: "c".to_string() },
            ]
        );

        let gone: HashMap<String, u64> = HashMap::new();
        assert_eq!(
            diff_kv_indexes(&new, &gone),
            vec![
                KvEvent::Delete { key: "a".to_string() },
                KvEvent::Delete { key: "b".to_string() },
                KvEvent::Delete { key: "c".to_string() },
            ]
        );
    }

    #[test]
    fn test_index_reset_when_going_backwards() {
        assert_eq!(next_index(10, 12), 12);
        assert_eq!(next_index(10, 3), 0);
    }

    #[test]
    fn test_poll_fallback_is_clamped() {
        let config = ConsulConfig {
            poll_fallback_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.poll_fallback(), MIN_POLL_FALLBACK);
    }

    #[test]
    fn test_registration_wire_format() {
        let meta = HashMap::new();
        let tags = vec!["modplane-module".to_string()];
        let body = AgentServiceRegistration {
            id: "echo-1",
            name: "echo",
            address: "10.0.0.9",
            port: 50051,
            tags: &tags,
            meta: &meta,
            check: Some(AgentCheck {
                grpc: "10.0.0.9:50051".to_string(),
                interval: "10s".to_string(),
            }),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["ID"], "echo-1");
        assert_eq!(json["Name"], "echo");
        assert_eq!(json["Check"]["GRPC"], "10.0.0.9:50051");
    }
}
