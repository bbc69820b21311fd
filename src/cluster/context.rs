//! Live validation context backed by the module catalog and cluster store

use async_trait::async_trait;
use std::sync::Arc;

use super::store::ClusterStore;
use crate::modules::{ModuleCatalog, ModuleDescriptor};
use crate::pipeline::{LookupError, ValidationContext};

pub struct EngineValidationContext {
    catalog: Arc<ModuleCatalog>,
    clusters: Arc<ClusterStore>,
}

impl EngineValidationContext {
    pub fn new(catalog: Arc<ModuleCatalog>, clusters: Arc<ClusterStore>) -> Self {
        Self { catalog, clusters }
    }
}

#[async_trait]
impl ValidationContext for EngineValidationContext {
    async fn lookup_module(&self, name: &str) -> Result<Option<ModuleDescriptor>, LookupError> {
        Ok(self.catalog.get(name))
    }

    async fn cluster_exists(&self, name: &str) -> Result<bool, LookupError> {
        self.clusters
            .exists(name)
            .await
            .map_err(|e| LookupError(e.to_string()))
    }
}
