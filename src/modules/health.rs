//! Active health probing of module instances
//!
//! Two probes are available: a gRPC probe that calls the standard
//! `grpc.health.v1.Health/Check` RPC on the module's gRPC port, and an HTTP
//! probe against a `/health` endpoint on the module's `http` port. The wait policy timings are configuration, not
//! protocol guarantees.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tonic::transport::Endpoint;
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;

/// Which probe the lifecycle manager uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    #[default]
    Grpc,
    Http,
}

/// Health wait settings as they appear in the config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default)]
    pub kind: ProbeKind,
    /// Delay before the first probe after the container starts
    #[serde(default = "default_first_check_after")]
    pub first_check_after_secs: u64,
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
    /// Consecutive successful probes before the instance counts as healthy
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Total wait window before the deploy fails
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    /// Path probed by the HTTP probe
    #[serde(default = "default_health_path")]
    pub http_path: String,
    /// Service named in gRPC health checks; empty asks about the whole server
    #[serde(default)]
    pub grpc_service: String,
}

fn default_first_check_after() -> u64 {
    15
}

fn default_probe_interval() -> u64 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_timeout() -> u64 {
    120
}

fn default_probe_timeout() -> u64 {
    3
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            kind: ProbeKind::default(),
            first_check_after_secs: default_first_check_after(),
            probe_interval_secs: default_probe_interval(),
            success_threshold: default_success_threshold(),
            timeout_secs: default_timeout(),
            probe_timeout_secs: default_probe_timeout(),
            http_path: default_health_path(),
            grpc_service: String::new(),
        }
    }
}

/// Bounded wait window for a starting instance
#[derive(Debug, Clone, PartialEq)]
pub struct HealthPolicy {
    pub first_check_after: Duration,
    pub probe_interval: Duration,
    pub success_threshold: u32,
    pub timeout: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        HealthPolicy::from(&HealthConfig::default())
    }
}

impl From<&HealthConfig> for HealthPolicy {
    fn from(config: &HealthConfig) -> Self {
        Self {
            first_check_after: Duration::from_secs(config.first_check_after_secs),
            probe_interval: Duration::from_secs(config.probe_interval_secs),
            success_threshold: config.success_threshold.max(1),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

/// Where to probe
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeTarget {
    pub instance_id: String,
    pub address: String,
    pub grpc_port: u16,
    pub http_port: Option<u16>,
}

/// Result of a single health probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthProbeResult {
    pub success: bool,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthProbeResult {
    pub fn ok(latency: Duration) -> Self {
        Self {
            success: true,
            latency_ms: latency.as_millis() as u64,
            timestamp: Utc::now(),
            error: None,
        }
    }

    pub fn failed(latency: Duration, error: impl Into<String>) -> Self {
        Self {
            success: false,
            latency_ms: latency.as_millis() as u64,
            timestamp: Utc::now(),
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, target: &ProbeTarget) -> HealthProbeResult;
}

/// Consecutive success/failure bookkeeping
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthTracker {
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl HealthTracker {
    pub fn record(&mut self, result: &HealthProbeResult) {
        if result.success {
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;
            self.last_error = result.error.clone();
        }
    }

    pub fn is_healthy(&self, threshold: u32) -> bool {
        self.consecutive_successes >= threshold.max(1)
    }
}

// ============================================================================
// Probes
// ============================================================================

/// Healthy when the module answers `grpc.health.v1.Health/Check` with SERVING
pub struct GrpcHealthProbe {
    service: String,
    probe_timeout: Duration,
}

impl GrpcHealthProbe {
    pub fn new(service: impl Into<String>, probe_timeout: Duration) -> Self {
        Self {
            service: service.into(),
            probe_timeout,
        }
    }
}

#[async_trait]
impl HealthProbe for GrpcHealthProbe {
    async fn probe(&self, target: &ProbeTarget) -> HealthProbeResult {
        let start = Instant::now();
        let uri = format!("http://{}:{}", target.address, target.grpc_port);
        let endpoint = match Endpoint::from_shared(uri) {
            Ok(e) => e.connect_timeout(self.probe_timeout),
            Err(e) => return HealthProbeResult::failed(start.elapsed(), e.to_string()),
        };

        let check = async {
            let channel = endpoint.connect().await.map_err(|e| e.to_string())?;
            let request = HealthCheckRequest {
                service: self.service.clone(),
            };
            HealthClient::new(channel)
                .check(request)
                .await
                .map(|response| response.into_inner().status())
                .map_err(|status| format!("{:?}: {}", status.code(), status.message()))
        };

        match timeout(self.probe_timeout, check).await {
            Ok(Ok(ServingStatus::Serving)) => HealthProbeResult::ok(start.elapsed()),
            Ok(Ok(status)) => HealthProbeResult::failed(start.elapsed(), status.as_str_name()),
            Ok(Err(e)) => HealthProbeResult::failed(start.elapsed(), e),
            Err(_) => HealthProbeResult::failed(self.probe_timeout, "Timeout"),
        }
    }
}

/// Healthy when `GET http://address:http_port{path}` answers 2xx
pub struct HttpHealthProbe {
    client: Client,
    path: String,
    probe_timeout: Duration,
}

impl HttpHealthProbe {
    pub fn new(path: impl Into<String>, probe_timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            path: path.into(),
            probe_timeout,
        }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, target: &ProbeTarget) -> HealthProbeResult {
        let start = Instant::now();
        let port = target.http_port.unwrap_or(target.grpc_port);
        let url = format!("http://{}:{}{}", target.address, port, self.path);

        match timeout(self.probe_timeout, self.client.get(&url).send()).await {
            Ok(Ok(response)) if response.status().is_success() => {
                HealthProbeResult::ok(start.elapsed())
            }
            Ok(Ok(response)) => HealthProbeResult::failed(
                start.elapsed(),
                format!("HTTP {}", response.status().as_u16()),
            ),
            Ok(Err(e)) => HealthProbeResult::failed(start.elapsed(), e.to_string()),
            Err(_) => HealthProbeResult::failed(self.probe_timeout, "Timeout"),
        }
    }
}

/// Reports a fixed, switchable result. Used with the in-memory runtime,
/// where there is no process to probe.
pub struct StaticProbe {
    healthy: AtomicBool,
}

impl StaticProbe {
    pub fn new(healthy: bool) -> Self {
        Self {
            healthy: AtomicBool::new(healthy),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl HealthProbe for StaticProbe {
    async fn probe(&self, _target: &ProbeTarget) -> HealthProbeResult {
        if self.healthy.load(Ordering::SeqCst) {
            HealthProbeResult::ok(Duration::ZERO)
        } else {
            HealthProbeResult::failed(Duration::ZERO, "reported unhealthy")
        }
    }
}

/// Build the probe selected by config
pub fn probe_from_config(config: &HealthConfig) -> Arc<dyn HealthProbe> {
    let probe_timeout = Duration::from_secs(config.probe_timeout_secs.max(1));
    match config.kind {
        ProbeKind::Grpc => Arc::new(GrpcHealthProbe::new(
            config.grpc_service.clone(),
            probe_timeout,
        )),
        ProbeKind::Http => Arc::new(HttpHealthProbe::new(
            config.http_path.clone(),
            probe_timeout,
        )),
    }
}

/// Format a duration as human-readable string
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m", secs / 3600, (secs % 3600) / 60)
    }
}
