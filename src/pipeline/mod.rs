//! Pipeline definitions, validation and storage

pub mod definition;
pub mod store;
pub mod validation;

pub use definition::{PipelineDefinition, StepConfig, StepMap, ValidationMode};
pub use store::{
    pipeline_id, pipeline_key, PipelineStore, PipelineStoreError, PipelineStoreResult,
    StoredPipeline, PIPELINE_PREFIX,
};
pub use validation::{
    execution_order, validate, validate_for_mode, ExecutionOrder, LookupError, RuleSet, Severity,
    StaticValidationContext, ValidationContext, ValidationIssue, ValidationResult,
    ValidationSummary,
};
