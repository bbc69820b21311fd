//! Service registry client
//!
//! The engine consumes an external, Consul-like registry for two things:
//! - the service catalog (register, deregister, health-aware instance lookup, watch)
//! - a key-value namespace for persisted state (pipeline definitions,
//!   registration records, clusters)
//!
//! Both are modeled as traits so the lifecycle manager, connection cache and
//! stores can run against [`ConsulRegistry`] in production and
//! [`InMemoryRegistry`] in tests and local development.

pub mod consul;
pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

pub use consul::{ConsulConfig, ConsulRegistry};
pub use memory::InMemoryRegistry;

/// Tag attached to every registration the engine makes for a module instance
pub const MODULE_TAG: &str = "modplane-module";

/// Metadata key carrying the module name of a registration
pub const META_MODULE: &str = "module";

/// Metadata key carrying the comma-separated gRPC service names
pub const META_GRPC_SERVICES: &str = "grpc-services";

/// Metadata key carrying the container id backing an instance
pub const META_CONTAINER: &str = "container-id";

/// Errors from the registry backend
#[derive(Error, Debug, Clone)]
pub enum RegistryError {
    #[error("Registry unavailable: {0}")]
    Unavailable(String),

    #[error("Registry entry '{0}' not found")]
    NotFound(String),

    #[error("Unexpected registry response: {0}")]
    Protocol(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// A registration request for one service instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRegistration {
    /// Unique instance id (also the registry service id)
    pub id: String,
    /// Logical service name shared by all instances of a module
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub meta: HashMap<String, String>,
}

/// An instance as currently advertised by the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub id: String,
    pub service: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub meta: HashMap<String, String>,
    /// All health checks passing
    pub healthy: bool,
    /// Not placed in maintenance by an operator
    pub enabled: bool,
}

impl ServiceInstance {
    /// Whether the connection cache may route calls to this instance
    pub fn is_eligible(&self) -> bool {
        self.healthy && self.enabled
    }

    /// Whether this registration was made by the engine for a module
    pub fn is_module(&self) -> bool {
        self.tags.iter().any(|t| t == MODULE_TAG) || self.meta.contains_key(META_MODULE)
    }

    /// Module name, taken from metadata, falling back to the service name
    pub fn module_name(&self) -> &str {
        self.meta
            .get(META_MODULE)
            .map(String::as_str)
            .unwrap_or(&self.service)
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn grpc_services(&self) -> Vec<String> {
        self.meta
            .get(META_GRPC_SERVICES)
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl From<&ServiceRegistration> for ServiceInstance {
    fn from(reg: &ServiceRegistration) -> Self {
        Self {
            id: reg.id.clone(),
            service: reg.name.clone(),
            address: reg.address.clone(),
            port: reg.port,
            tags: reg.tags.clone(),
            meta: reg.meta.clone(),
            healthy: true,
            enabled: true,
        }
    }
}

/// Full snapshots of a service's instances, one per topology change
pub type InstanceWatch = BoxStream<'static, Vec<ServiceInstance>>;

/// Change notification for a key under a watched prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KvEvent {
    Put { key: String },
    Delete { key: String },
}

impl KvEvent {
    pub fn key(&self) -> &str {
        match self {
            KvEvent::Put { key } | KvEvent::Delete { key } => key,
        }
    }
}

pub type KvWatch = BoxStream<'static, KvEvent>;

/// Service catalog operations
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    async fn register(&self, registration: &ServiceRegistration) -> RegistryResult<()>;

    async fn deregister(&self, instance_id: &str) -> RegistryResult<()>;

    /// Toggle registry-advertised availability without removing the registration
    async fn set_enabled(&self, instance_id: &str, enabled: bool) -> RegistryResult<()>;

    /// Every instance of a service, healthy or not
    async fn instances(&self, service: &str) -> RegistryResult<Vec<ServiceInstance>>;

    /// Names of every service in the catalog
    async fn services(&self) -> RegistryResult<Vec<String>>;

    /// Every instance of every service
    async fn all_instances(&self) -> RegistryResult<Vec<ServiceInstance>> {
        let mut all = Vec::new();
        for service in self.services().await? {
            all.extend(self.instances(&service).await?);
        }
        Ok(all)
    }

    /// Subscribe to topology changes of one service.
    ///
    /// The first item is the current snapshot; later items arrive only when
    /// the instance set or its health changes.
    fn watch(&self, service: &str) -> InstanceWatch;
}

/// Key-value namespace operations
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> RegistryResult<Option<String>>;

    async fn put(&self, key: &str, value: &str) -> RegistryResult<()>;

    /// All entries whose key starts with `prefix`, sorted by key
    async fn list(&self, prefix: &str) -> RegistryResult<Vec<(String, String)>>;

    /// Returns whether the key existed
    async fn delete(&self, key: &str) -> RegistryResult<bool>;

    fn watch(&self, prefix: &str) -> KvWatch;
}
