//! Deployment event bus
//!
//! A single ordered stream of lifecycle events per engine, fanned out to any
//! number of subscribers over a `tokio::sync::broadcast` channel. Delivery is
//! at-most-once: there is no replay buffer, and a subscriber that falls
//! behind the channel capacity skips the events it missed. Subscribers
//! reconcile current state with a query call when they connect.
//!
//! Events for one instance are published by whoever holds that instance's
//! transition lock, so per-instance order is the order transitions happened.

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

/// Default broadcast capacity before slow subscribers start skipping events
pub const DEFAULT_CAPACITY: usize = 1024;

/// Event discriminator, serialized as the `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentEventKind {
    DeploymentStarted,
    /// Informational message, not a state change
    DeploymentProgress,
    DeploymentSuccess,
    DeploymentFailed,
    ModuleRegistered,
    ModuleUndeploying,
    ModuleUndeployed,
}

impl DeploymentEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeploymentStarted => "deployment_started",
            Self::DeploymentProgress => "deployment_progress",
            Self::DeploymentSuccess => "deployment_success",
            Self::DeploymentFailed => "deployment_failed",
            Self::ModuleRegistered => "module_registered",
            Self::ModuleUndeploying => "module_undeploying",
            Self::ModuleUndeployed => "module_undeployed",
        }
    }
}

impl std::fmt::Display for DeploymentEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentEvent {
    #[serde(rename = "type")]
    pub kind: DeploymentEventKind,
    pub module_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    pub message: String,
    /// Failure reason, only on `deployment_failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Engine-wide publication sequence number
    #[serde(default)]
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

impl DeploymentEvent {
    pub fn new(
        kind: DeploymentEventKind,
        module_name: impl Into<String>,
        instance_id: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            module_name: module_name.into(),
            instance_id: instance_id.map(String::from),
            message: message.into(),
            reason: None,
            sequence: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(module_name: impl Into<String>, instance_id: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let mut event = Self::new(
            DeploymentEventKind::DeploymentFailed,
            module_name,
            Some(instance_id),
            format!("Deployment failed: {}", reason),
        );
        event.reason = Some(reason);
        event
    }
}

/// Publish/subscribe hub for deployment events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DeploymentEvent>,
    sequence: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish to every current subscriber; returns how many received it
    pub fn publish(&self, mut event: DeploymentEvent) -> usize {
        event.sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            "Event {} {} ({})",
            event.kind,
            event.instance_id.as_deref().unwrap_or(&event.module_name),
            event.message
        );
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeploymentEvent> {
        self.sender.subscribe()
    }

    /// Subscriber as a stream; lagged gaps are skipped silently
    pub fn stream(&self) -> BoxStream<'static, DeploymentEvent> {
        BroadcastStream::new(self.sender.subscribe())
            .filter_map(|item| futures::future::ready(item.ok()))
            .boxed()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ============================================================================
// Subscriber-side reducer
// ============================================================================

/// Status of one instance as seen by a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservedStatus {
    Deploying,
    Running,
    Registered,
    Failed,
    Undeploying,
    Removed,
}

/// What a subscriber knows about one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedInstance {
    pub module_name: String,
    pub status: ObservedStatus,
    pub last_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// Folds an event sequence into per-instance state.
///
/// `apply` is deterministic: the same event sequence always yields the same view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentView {
    pub instances: BTreeMap<String, ObservedInstance>,
    pub events_seen: u64,
}

impl DeploymentView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &DeploymentEvent) {
        self.events_seen += 1;
        let key = event
            .instance_id
            .clone()
            .unwrap_or_else(|| event.module_name.clone());

        let next = match event.kind {
            DeploymentEventKind::DeploymentStarted => Some(ObservedStatus::Deploying),
            DeploymentEventKind::DeploymentProgress => None,
            DeploymentEventKind::DeploymentSuccess => Some(ObservedStatus::Running),
            DeploymentEventKind::DeploymentFailed => Some(ObservedStatus::Failed),
            DeploymentEventKind::ModuleRegistered => Some(ObservedStatus::Registered),
            DeploymentEventKind::ModuleUndeploying => Some(ObservedStatus::Undeploying),
            DeploymentEventKind::ModuleUndeployed => Some(ObservedStatus::Removed),
        };

        let entry = self
            .instances
            .entry(key)
            .or_insert_with(|| ObservedInstance {
                module_name: event.module_name.clone(),
                status: ObservedStatus::Deploying,
                last_message: String::new(),
                failure_reason: None,
            });
        if let Some(status) = next {
            entry.status = status;
        }
        if event.kind == DeploymentEventKind::DeploymentFailed {
            entry.failure_reason = event.reason.clone();
        }
        entry.last_message = event.message.clone();
    }

    pub fn status_of(&self, instance_id: &str) -> Option<ObservedStatus> {
        self.instances.get(instance_id).map(|i| i.status)
    }

    /// Instances neither removed nor failed
    pub fn live_count(&self) -> usize {
        self.instances
            .values()
            .filter(|i| !matches!(i.status, ObservedStatus::Removed | ObservedStatus::Failed))
            .count()
    }
}
