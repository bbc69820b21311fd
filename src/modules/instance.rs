//! Module instances and their deployment state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Deployment state of one instance
///
/// ```text
/// REQUESTED -> STARTING -> AWAITING_HEALTH -> REGISTERING -> ACTIVE <-> DISABLED
///     any non-terminal state -> FAILED
///     ACTIVE | DISABLED | FAILED -> UNDEPLOYING -> GONE
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentState {
    Requested,
    Starting,
    AwaitingHealth,
    Registering,
    Active,
    Disabled,
    Failed,
    Undeploying,
    Gone,
}

impl DeploymentState {
    pub fn is_terminal(self) -> bool {
        self == DeploymentState::Gone
    }

    /// States in which a deploy attempt is still in flight
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            DeploymentState::Requested
                | DeploymentState::Starting
                | DeploymentState::AwaitingHealth
                | DeploymentState::Registering
        )
    }

    /// Whether `self -> next` is an edge of the state machine
    pub fn can_transition_to(self, next: DeploymentState) -> bool {
        use DeploymentState::*;
        match (self, next) {
            (Gone, _) => false,
            (Requested, Starting) => true,
            (Starting, AwaitingHealth) => true,
            (AwaitingHealth, Registering) => true,
            (Registering, Active) => true,
            (Active, Disabled) | (Disabled, Active) => true,
            (Undeploying, Gone) => true,
            (Active | Disabled | Failed, Undeploying) => true,
            (Failed, Failed) => false,
            (_, Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentState::Requested => "REQUESTED",
            DeploymentState::Starting => "STARTING",
            DeploymentState::AwaitingHealth => "AWAITING_HEALTH",
            DeploymentState::Registering => "REGISTERING",
            DeploymentState::Active => "ACTIVE",
            DeploymentState::Disabled => "DISABLED",
            DeploymentState::Failed => "FAILED",
            DeploymentState::Undeploying => "UNDEPLOYING",
            DeploymentState::Gone => "GONE",
        }
    }
}

impl std::fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A co-located helper process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sidecar {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub address: String,
    pub port: u16,
    pub healthy: bool,
}

/// One running (or transitioning) process of a module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleInstance {
    pub instance_id: String,
    pub module_name: String,
    pub state: DeploymentState,
    pub address: String,
    pub port: u16,
    /// Present only for runtime-managed instances
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    /// Last known from active probing
    pub healthy: bool,
    /// Present in the registry's service catalog
    pub registered: bool,
    /// Operator intent, independent of health
    pub enabled: bool,
    #[serde(default)]
    pub grpc_services: BTreeSet<String>,
    #[serde(default)]
    pub sidecars: Vec<Sidecar>,
    /// Adopted from an orphaned container rather than started by the engine
    #[serde(default)]
    pub adopted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ModuleInstance {
    pub fn new(instance_id: impl Into<String>, module_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance_id.into(),
            module_name: module_name.into(),
            state: DeploymentState::Requested,
            address: String::new(),
            port: 0,
            container_id: None,
            healthy: false,
            registered: false,
            enabled: true,
            grpc_services: BTreeSet::new(),
            sidecars: Vec::new(),
            adopted: false,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move along a state machine edge; returns false (and changes nothing)
    /// if the edge does not exist
    pub fn transition(&mut self, next: DeploymentState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        self.updated_at = Utc::now();
        true
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        if !self.transition(DeploymentState::Failed) {
            return false;
        }
        self.healthy = false;
        self.failure_reason = Some(reason.into());
        true
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Generate an instance id: module name plus a short random suffix
pub fn generate_instance_id(module_name: &str) -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", module_name, &uuid[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use DeploymentState::*;

    #[test]
    fn test_happy_path_edges() {
        let path = [Requested, Starting, AwaitingHealth, Registering, Active, Disabled, Active];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_no_skipping_states() {
        assert!(!Requested.can_transition_to(Active));
        assert!(!Starting.can_transition_to(Registering));
        assert!(!AwaitingHealth.can_transition_to(Active));
    }

    #[test]
    fn test_undeploy_edges() {
        assert!(Active.can_transition_to(Undeploying));
        assert!(Disabled.can_transition_to(Undeploying));
        assert!(Failed.can_transition_to(Undeploying));
        assert!(!Starting.can_transition_to(Undeploying));
        assert!(Undeploying.can_transition_to(Gone));
    }

    #[test]
    fn test_gone_is_terminal() {
        for next in [Requested, Active, Failed, Undeploying, Gone] {
            assert!(!Gone.can_transition_to(next));
        }
        assert!(Gone.is_terminal());
    }

    #[test]
    fn test_failure_from_in_progress_states() {
        for state in [Requested, Starting, AwaitingHealth, Registering, Active] {
            assert!(state.can_transition_to(Failed));
        }
        assert!(!Failed.can_transition_to(Failed));
    }

    #[test]
    fn test_instance_fail_records_reason() {
        let mut inst = ModuleInstance::new("echo-1", "echo");
        assert!(inst.transition(Starting));
        assert!(inst.fail("image pull denied"));
        assert_eq!(inst.state, Failed);
        assert_eq!(inst.failure_reason.as_deref(), Some("image pull denied"));
        assert!(!inst.transition(Active));
    }

    #[test]
    fn test_state_wire_format() {
        assert_eq!(serde_json::to_value(AwaitingHealth).unwrap(), "AWAITING_HEALTH");
        assert_eq!(AwaitingHealth.to_string(), "AWAITING_HEALTH");
    }

    #[test]
    fn test_generated_ids_are_distinct() {
        let a = generate_instance_id("echo");
        let b = generate_instance_id("echo");
        assert!(a.starts_with("echo-"));
        assert_eq!(a.len(), "echo-".len() + 8);
        assert_ne!(a, b);
    }
}
