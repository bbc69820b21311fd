//! Pipeline Definition Store
//!
//! CRUD over the registry's KV namespace. Only the definition is persisted;
//! `validationStatus` is recomputed on every read.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::definition::{PipelineDefinition, ValidationMode};
use super::validation::{
    execution_order, validate_for_mode, ExecutionOrder, RuleSet, Severity, ValidationContext,
    ValidationIssue, ValidationResult,
};
use crate::registry::{KvStore, KvWatch, RegistryError};

/// KV prefix of pipeline definitions
pub const PIPELINE_PREFIX: &str = "modplane/pipelines/definitions/";

#[derive(Error, Debug)]
pub enum PipelineStoreError {
    #[error("Pipeline '{0}' not found")]
    NotFound(String),

    #[error("Pipeline '{0}' already exists")]
    AlreadyExists(String),

    #[error("Pipeline '{id}' cannot be renamed to '{name}'")]
    NameImmutable { id: String, name: String },

    #[error("Pipeline rejected with {} validation errors", .0.summary.errors)]
    Rejected(ValidationResult),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Stored pipeline '{key}' is unreadable: {reason}")]
    Corrupt { key: String, reason: String },
}

pub type PipelineStoreResult<T> = Result<T, PipelineStoreError>;

/// A definition as returned to callers, with its derived validation status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredPipeline {
    #[serde(flatten)]
    pub definition: PipelineDefinition,
    pub validation_status: ValidationResult,
}

pub struct PipelineStore {
    kv: Arc<dyn KvStore>,
    context: Arc<dyn ValidationContext>,
    /// Serializes existence checks with writes
    writes: Mutex<()>,
}

impl PipelineStore {
    pub fn new(kv: Arc<dyn KvStore>, context: Arc<dyn ValidationContext>) -> Self {
        Self {
            kv,
            context,
            writes: Mutex::new(()),
        }
    }

    /// Create a pipeline. DESIGN mode persists drafts even with errors;
    /// DEPLOY mode refuses anything with an ERROR issue. A pipeline whose
    /// name cannot serve as a key is refused in either mode.
    pub async fn create(
        &self,
        definition: PipelineDefinition,
        mode: ValidationMode,
    ) -> PipelineStoreResult<StoredPipeline> {
        let result = self.validate(&definition, mode).await;
        check_keyable(&definition.name, &result)?;
        if mode == ValidationMode::Deploy && !result.valid {
            return Err(PipelineStoreError::Rejected(result));
        }

        let _guard = self.writes.lock().await;
        let key = pipeline_key(&definition.name);
        if self.kv.get(&key).await?.is_some() {
            return Err(PipelineStoreError::AlreadyExists(definition.name));
        }
        self.put(&key, &definition).await?;
        info!(
            "Created pipeline '{}' ({} steps, {} mode, {} errors)",
            definition.name,
            definition.steps.len(),
            mode,
            result.summary.errors
        );

        Ok(StoredPipeline {
            definition,
            validation_status: result,
        })
    }

    /// Replace a pipeline with a full new definition. The name is immutable.
    pub async fn update(
        &self,
        id: &str,
        definition: PipelineDefinition,
        mode: ValidationMode,
    ) -> PipelineStoreResult<StoredPipeline> {
        if definition.name != id {
            return Err(PipelineStoreError::NameImmutable {
                id: id.to_string(),
                name: definition.name,
            });
        }
        let result = self.validate(&definition, mode).await;
        if mode == ValidationMode::Deploy && !result.valid {
            return Err(PipelineStoreError::Rejected(result));
        }

        let _guard = self.writes.lock().await;
        let key = pipeline_key(id);
        if self.kv.get(&key).await?.is_none() {
            return Err(PipelineStoreError::NotFound(id.to_string()));
        }
        self.put(&key, &definition).await?;
        info!("Updated pipeline '{}' ({} mode)", id, mode);

        Ok(StoredPipeline {
            definition,
            validation_status: result,
        })
    }

    pub async fn get(&self, id: &str) -> PipelineStoreResult<StoredPipeline> {
        let definition = self.load(id).await?;
        let validation_status = self.validate(&definition, ValidationMode::Design).await;
        Ok(StoredPipeline {
            definition,
            validation_status,
        })
    }

    /// Every stored pipeline, sorted by name. Unreadable entries are skipped.
    pub async fn list(&self) -> PipelineStoreResult<Vec<StoredPipeline>> {
        let mut pipelines = Vec::new();
        for (key, value) in self.kv.list(PIPELINE_PREFIX).await? {
            match serde_json::from_str::<PipelineDefinition>(&value) {
                Ok(definition) => {
                    let validation_status = self.validate(&definition, ValidationMode::Design).await;
                    pipelines.push(StoredPipeline {
                        definition,
                        validation_status,
                    });
                }
                Err(e) => warn!("Skipping unreadable pipeline {}: {}", key, e),
            }
        }
        pipelines.sort_by(|a, b| a.definition.name.cmp(&b.definition.name));
        Ok(pipelines)
    }

    pub async fn delete(&self, id: &str) -> PipelineStoreResult<()> {
        let _guard = self.writes.lock().await;
        if !self.kv.delete(&pipeline_key(id)).await? {
            return Err(PipelineStoreError::NotFound(id.to_string()));
        }
        info!("Deleted pipeline '{}'", id);
        Ok(())
    }

    /// Validate an arbitrary definition without storing it
    pub async fn validate(&self, definition: &PipelineDefinition, mode: ValidationMode) -> ValidationResult {
        validate_for_mode(definition, mode, self.context.as_ref()).await
    }

    pub async fn validate_stored(&self, id: &str, mode: ValidationMode) -> PipelineStoreResult<ValidationResult> {
        let definition = self.load(id).await?;
        Ok(self.validate(&definition, mode).await)
    }

    pub async fn execution_order(&self, id: &str) -> PipelineStoreResult<ExecutionOrder> {
        Ok(execution_order(&self.load(id).await?))
    }

    /// Change notifications for stored definitions
    pub fn watch(&self) -> KvWatch {
        self.kv.watch(PIPELINE_PREFIX)
    }

    async fn load(&self, id: &str) -> PipelineStoreResult<PipelineDefinition> {
        let key = pipeline_key(id);
        let value = self
            .kv
            .get(&key)
            .await?
            .ok_or_else(|| PipelineStoreError::NotFound(id.to_string()))?;
        serde_json::from_str(&value).map_err(|e| PipelineStoreError::Corrupt {
            key,
            reason: e.to_string(),
        })
    }

    async fn put(&self, key: &str, definition: &PipelineDefinition) -> PipelineStoreResult<()> {
        let json = serde_json::to_string(definition).map_err(|e| PipelineStoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.kv.put(key, &json).await?;
        debug!("Wrote {} ({} bytes)", key, json.len());
        Ok(())
    }
}

/// Pipeline id -> KV key
pub fn pipeline_key(id: &str) -> String {
    format!("{}{}", PIPELINE_PREFIX, id)
}

/// Key of a change notification -> pipeline id
pub fn pipeline_id(key: &str) -> Option<&str> {
    key.strip_prefix(PIPELINE_PREFIX).filter(|id| !id.is_empty())
}

/// Refuse names that cannot be stored under a key: blank, or containing a
/// path separator
fn check_keyable(name: &str, result: &ValidationResult) -> PipelineStoreResult<()> {
    if name.trim().is_empty() {
        return Err(PipelineStoreError::Rejected(result.clone()));
    }
    if name.contains('/') || name != name.trim() {
        let mut issues = result.issues.clone();
        issues.push(
            ValidationIssue::new(
                RuleSet::Metadata,
                "nameUsableAsKey",
                Severity::Error,
                format!("Pipeline name '{}' cannot contain '/' or surrounding spaces", name),
            )
            .on_field("name"),
        );
        return Err(PipelineStoreError::Rejected(ValidationResult::from_issues(issues)));
    }
    Ok(())
}
