//! Cluster store
//!
//! Clusters are deployment targets named by pipelines. They live in the
//! registry's KV namespace; the `default` cluster always exists and is never
//! stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::naming::is_valid_name;
use crate::registry::{KvStore, RegistryError};

/// KV prefix of cluster records
pub const CLUSTER_PREFIX: &str = "modplane/clusters/";

/// Name of the implicit, non-deletable cluster
pub const DEFAULT_CLUSTER: &str = "default";

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Cluster '{0}' not found")]
    NotFound(String),

    #[error("Cluster '{0}' already exists")]
    AlreadyExists(String),

    #[error("Cluster '{0}' cannot be deleted")]
    Protected(String),

    #[error("Invalid cluster name '{0}': use lowercase letters, digits and hyphens")]
    InvalidName(String),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Stored cluster '{0}' is unreadable")]
    Corrupt(String),
}

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// `None` for the implicit default cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Cluster {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            created_at: Some(Utc::now()),
        }
    }

    pub fn default_cluster() -> Self {
        Self {
            name: DEFAULT_CLUSTER.to_string(),
            description: Some("Implicit default cluster".to_string()),
            created_at: None,
        }
    }

    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_CLUSTER
    }
}

/// Body accepted when creating a cluster
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterRequest {
    #[serde(default)]
    pub description: Option<String>,
}

pub struct ClusterStore {
    kv: Arc<dyn KvStore>,
    writes: Mutex<()>,
}

impl ClusterStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            writes: Mutex::new(()),
        }
    }

    /// Default cluster first, then stored clusters by name
    pub async fn list(&self) -> ClusterResult<Vec<Cluster>> {
        let mut clusters = vec![Cluster::default_cluster()];
        for (key, value) in self.kv.list(CLUSTER_PREFIX).await? {
            match serde_json::from_str::<Cluster>(&value) {
                Ok(cluster) if !cluster.is_default() => clusters.push(cluster),
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable cluster {}: {}", key, e),
            }
        }
        Ok(clusters)
    }

    pub async fn get(&self, name: &str) -> ClusterResult<Cluster> {
        if name == DEFAULT_CLUSTER {
            return Ok(Cluster::default_cluster());
        }
        let value = self
            .kv
            .get(&cluster_key(name))
            .await?
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))?;
        serde_json::from_str(&value).map_err(|_| ClusterError::Corrupt(name.to_string()))
    }

    pub async fn exists(&self, name: &str) -> ClusterResult<bool> {
        if name == DEFAULT_CLUSTER {
            return Ok(true);
        }
        Ok(self.kv.get(&cluster_key(name)).await?.is_some())
    }

    pub async fn create(&self, name: &str, request: ClusterRequest) -> ClusterResult<Cluster> {
        if !is_valid_name(name) {
            return Err(ClusterError::InvalidName(name.to_string()));
        }
        if name == DEFAULT_CLUSTER {
            return Err(ClusterError::AlreadyExists(name.to_string()));
        }

        let _guard = self.writes.lock().await;
        let key = cluster_key(name);
        if self.kv.get(&key).await?.is_some() {
            return Err(ClusterError::AlreadyExists(name.to_string()));
        }

        let cluster = Cluster {
            description: request.description,
            ..Cluster::new(name)
        };
        let json = serde_json::to_string(&cluster).map_err(|_| ClusterError::Corrupt(name.to_string()))?;
        self.kv.put(&key, &json).await?;
        info!("Created cluster '{}'", name);
        Ok(cluster)
    }

    pub async fn delete(&self, name: &str) -> ClusterResult<()> {
        if name == DEFAULT_CLUSTER {
            return Err(ClusterError::Protected(name.to_string()));
        }
        let _guard = self.writes.lock().await;
        if !self.kv.delete(&cluster_key(name)).await? {
            return Err(ClusterError::NotFound(name.to_string()));
        }
        info!("Deleted cluster '{}'", name);
        Ok(())
    }
}

pub fn cluster_key(name: &str) -> String {
    format!("{}{}", CLUSTER_PREFIX, name)
}
