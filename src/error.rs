//! Engine error taxonomy
//!
//! Component errors (`RegistryError`, `LifecycleError`, ...) all collapse into
//! [`EngineError`] at the API boundary. Each kind maps to one HTTP status and
//! a stable machine-readable name.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::cluster::ClusterError;
use crate::connections::ConnectionError;
use crate::modules::{CatalogError, LifecycleError};
use crate::pipeline::{PipelineStoreError, ValidationResult};
use crate::reconcile::ReconcileError;
use crate::registry::RegistryError;
use crate::runtime::RuntimeError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    /// Malformed input that no engine state could make acceptable
    #[error("{0}")]
    InvalidRequest(String),

    #[error("Validation failed with {} errors", .0.summary.errors)]
    ValidationFailed(Box<ValidationResult>),

    #[error("{0}")]
    DependencyUnavailable(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Internal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::Conflict(_) => "conflict",
            EngineError::InvalidRequest(_) => "invalid_request",
            EngineError::ValidationFailed(_) => "validation_failed",
            EngineError::DependencyUnavailable(_) => "dependency_unavailable",
            EngineError::Timeout(_) => "timeout",
            EngineError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Conflict(_) => StatusCode::CONFLICT,
            EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            EngineError::ValidationFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::DependencyUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn body(&self) -> ErrorBody {
        let validation = match self {
            EngineError::ValidationFailed(result) => Some(result.as_ref().clone()),
            _ => None,
        };
        ErrorBody {
            error: ErrorDetail {
                kind: self.kind(),
                message: self.to_string(),
                validation,
            },
        }
    }
}

/// `{"error": {"kind": ..., "message": ..., "validation"?: ...}}`
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationResult>,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed ({}): {}", self.kind(), self);
        } else {
            warn!("Request rejected ({}): {}", self.kind(), self);
        }
        (status, Json(self.body())).into_response()
    }
}

// ============================================================================
// Component error conversions
// ============================================================================

impl From<RegistryError> for EngineError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(_) => EngineError::NotFound(e.to_string()),
            RegistryError::Unavailable(_) | RegistryError::Protocol(_) => {
                EngineError::DependencyUnavailable(e.to_string())
            }
        }
    }
}

impl From<RuntimeError> for EngineError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::ContainerNotFound(_) => EngineError::NotFound(e.to_string()),
            RuntimeError::Unavailable(_) | RuntimeError::CommandFailed(_) => {
                EngineError::DependencyUnavailable(e.to_string())
            }
            RuntimeError::StartFailed(_) => EngineError::Internal(e.to_string()),
        }
    }
}

impl From<LifecycleError> for EngineError {
    fn from(e: LifecycleError) -> Self {
        match e {
            LifecycleError::ContainerRuntime(inner) => inner.into(),
            LifecycleError::Registry(inner) => inner.into(),
            LifecycleError::ModuleUnknown(_) | LifecycleError::InstanceNotFound(_) => {
                EngineError::NotFound(e.to_string())
            }
            LifecycleError::CapacityExceeded { .. }
            | LifecycleError::AlreadyTerminal(_)
            | LifecycleError::InvalidTransition { .. }
            | LifecycleError::NotAdoptable(..) => EngineError::Conflict(e.to_string()),
            LifecycleError::HealthTimeout { .. } => EngineError::Timeout(e.to_string()),
        }
    }
}

impl From<ConnectionError> for EngineError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::Registry(inner) => inner.into(),
            ConnectionError::ServiceUnknown(_) => EngineError::NotFound(e.to_string()),
            ConnectionError::NoHealthyInstance(_) => EngineError::DependencyUnavailable(e.to_string()),
            ConnectionError::InvalidEndpoint { .. } => EngineError::Internal(e.to_string()),
        }
    }
}

impl From<ReconcileError> for EngineError {
    fn from(e: ReconcileError) -> Self {
        match e {
            ReconcileError::Registry(inner) => inner.into(),
            ReconcileError::Runtime(inner) => inner.into(),
        }
    }
}

impl From<PipelineStoreError> for EngineError {
    fn from(e: PipelineStoreError) -> Self {
        match e {
            PipelineStoreError::Registry(inner) => inner.into(),
            PipelineStoreError::Rejected(result) => EngineError::ValidationFailed(Box::new(result)),
            PipelineStoreError::NotFound(_) => EngineError::NotFound(e.to_string()),
            PipelineStoreError::AlreadyExists(_) => EngineError::Conflict(e.to_string()),
            PipelineStoreError::NameImmutable { .. } => EngineError::InvalidRequest(e.to_string()),
            PipelineStoreError::Corrupt { .. } => EngineError::Internal(e.to_string()),
        }
    }
}

impl From<ClusterError> for EngineError {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::Registry(inner) => inner.into(),
            ClusterError::NotFound(_) => EngineError::NotFound(e.to_string()),
            ClusterError::AlreadyExists(_) | ClusterError::Protected(_) => {
                EngineError::Conflict(e.to_string())
            }
            ClusterError::InvalidName(_) => EngineError::InvalidRequest(e.to_string()),
            ClusterError::Corrupt(_) => EngineError::Internal(e.to_string()),
        }
    }
}

impl From<CatalogError> for EngineError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::AlreadyPublished(_) => EngineError::Conflict(e.to_string()),
            CatalogError::InvalidName(_) | CatalogError::InvalidDescriptor(_) => {
                EngineError::InvalidRequest(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::DeploymentState;
    use crate::pipeline::{RuleSet, Severity, ValidationIssue};

    #[test]
    fn test_kinds_map_to_statuses() {
        let cases = [
            (EngineError::NotFound("x".into()), StatusCode::NOT_FOUND, "not_found"),
            (EngineError::Conflict("x".into()), StatusCode::CONFLICT, "conflict"),
            (
                EngineError::DependencyUnavailable("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
                "dependency_unavailable",
            ),
            (EngineError::Timeout("x".into()), StatusCode::GATEWAY_TIMEOUT, "timeout"),
            (EngineError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        ];
        for (err, status, kind) in cases {
            assert_eq!(err.status(), status);
            assert_eq!(err.kind(), kind);
        }
    }

    #[test]
    fn test_lifecycle_conversion() {
        let err: EngineError = LifecycleError::CapacityExceeded {
            module: "echo".into(),
            max: 5,
        }
        .into();
        assert_eq!(err.kind(), "conflict");

        let err: EngineError = LifecycleError::InvalidTransition {
            instance: "echo-1".into(),
            state: DeploymentState::Starting,
            action: "enable",
        }
        .into();
        assert_eq!(err.status(), StatusCode::CONFLICT);

        let err: EngineError =
            LifecycleError::Registry(RegistryError::Unavailable("down".into())).into();
        assert_eq!(err.kind(), "dependency_unavailable");

        let err: EngineError = LifecycleError::HealthTimeout {
            instance: "echo-1".into(),
            waited: "120s".into(),
            reason: "no answer".into(),
        }
        .into();
        assert_eq!(err.kind(), "timeout");
    }

    #[test]
    fn test_validation_failure_carries_result() {
        let result = ValidationResult::from_issues(vec![ValidationIssue::new(
            RuleSet::Metadata,
            "nameRequired",
            Severity::Error,
            "Pipeline name is required",
        )]);
        let err: EngineError = PipelineStoreError::Rejected(result).into();
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body = serde_json::to_value(err.body()).unwrap();
        assert_eq!(body["error"]["kind"], "validation_failed");
        assert_eq!(body["error"]["validation"]["valid"], false);
        assert_eq!(body["error"]["validation"]["issues"][0]["rule"], "nameRequired");
    }

    #[test]
    fn test_plain_errors_omit_validation() {
        let body = serde_json::to_value(EngineError::NotFound("Pipeline 'p' not found".into()).body()).unwrap();
        assert_eq!(body["error"]["message"], "Pipeline 'p' not found");
        assert!(body["error"].get("validation").is_none());
    }
}
