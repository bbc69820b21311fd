//! Engine configuration
//!
//! One YAML or JSON document with a section per component. Every field has a
//! default, so an empty file (or no file at all) gives a working local setup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::connections::ConnectionConfig;
use crate::modules::{CatalogError, HealthConfig, HealthPolicy, LifecycleConfig, ModuleCatalog, ModuleDescriptor};
use crate::reconcile::ReconcileConfig;
use crate::registry::ConsulConfig;
use crate::runtime::DockerRuntimeConfig;

/// Default API server port
pub const DEFAULT_PORT: u16 = 38082;

/// Errors for file I/O operations (separate from pure parsing errors)
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(String),

    #[error("Invalid module catalog: {0}")]
    Catalog(#[from] CatalogError),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub lifecycle: LifecycleSettings,
    #[serde(default)]
    pub reconcile: ReconcileSettings,
    #[serde(default)]
    pub connections: ConnectionSettings,
    #[serde(default)]
    pub events: EventSettings,
    /// Catalog seed
    #[serde(default)]
    pub modules: Vec<ModuleDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    #[default]
    Consul,
    Memory,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub backend: RegistryBackend,
    #[serde(default)]
    pub consul: ConsulConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeBackend {
    #[default]
    Docker,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub backend: RuntimeBackend,
    #[serde(default)]
    pub docker: DockerRuntimeConfig,
    /// Image of the registry sidecar for modules that need one
    #[serde(default)]
    pub sidecar_image: Option<String>,
    /// Value of the engine label on every container this engine starts
    #[serde(default = "default_engine_id")]
    pub engine_id: String,
}

/// `modplane-<hostname>` when the hostname is readable
fn default_engine_id() -> String {
    match hostname::get().ok().and_then(|h| h.into_string().ok()) {
        Some(host) if !host.is_empty() => format!("modplane-{}", host),
        _ => "modplane".to_string(),
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: RuntimeBackend::default(),
            docker: DockerRuntimeConfig::default(),
            sidecar_image: None,
            engine_id: default_engine_id(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleSettings {
    #[serde(default = "default_max_instances")]
    pub max_instances_per_module: usize,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default = "default_confirm_attempts")]
    pub registration_confirm_attempts: u32,
    #[serde(default = "default_confirm_interval_ms")]
    pub registration_confirm_interval_ms: u64,
    #[serde(default = "default_tombstone_capacity")]
    pub tombstone_capacity: usize,
}

fn default_max_instances() -> usize {
    5
}

fn default_confirm_attempts() -> u32 {
    5
}

fn default_confirm_interval_ms() -> u64 {
    1000
}

fn default_tombstone_capacity() -> usize {
    1024
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            max_instances_per_module: default_max_instances(),
            health: HealthConfig::default(),
            registration_confirm_attempts: default_confirm_attempts(),
            registration_confirm_interval_ms: default_confirm_interval_ms(),
            tombstone_capacity: default_tombstone_capacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileSettings {
    #[serde(default = "default_reconcile_interval")]
    pub interval_secs: u64,
    #[serde(default)]
    pub auto_cleanup_zombies: bool,
}

fn default_reconcile_interval() -> u64 {
    60
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval(),
            auto_cleanup_zombies: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
}

fn default_idle_ttl() -> u64 {
    300
}

fn default_reaper_interval() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_rpc_timeout() -> u64 {
    30
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_idle_ttl(),
            reaper_interval_secs: default_reaper_interval(),
            connect_timeout_secs: default_connect_timeout(),
            rpc_timeout_secs: default_rpc_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSettings {
    /// Events buffered per subscriber before a slow one starts lagging
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
}

impl ConfigFormat {
    /// `.json` is JSON; anything else is read as YAML
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ConfigFormat::Json,
            _ => ConfigFormat::Yaml,
        }
    }
}

impl EngineConfig {
    pub fn parse(content: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        match format {
            ConfigFormat::Json => serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string())),
            ConfigFormat::Yaml => serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string())),
        }
    }

    /// Build the module catalog from the configured seed
    pub fn catalog(&self) -> Result<ModuleCatalog, ConfigError> {
        Ok(ModuleCatalog::with_descriptors(self.modules.iter().cloned())?)
    }

    pub fn lifecycle_config(&self) -> LifecycleConfig {
        let settings = &self.lifecycle;
        LifecycleConfig {
            max_instances_per_module: settings.max_instances_per_module,
            health: HealthPolicy::from(&settings.health),
            registration_confirm_attempts: settings.registration_confirm_attempts.max(1),
            registration_confirm_interval: Duration::from_millis(settings.registration_confirm_interval_ms),
            sidecar_image: self.runtime.sidecar_image.clone(),
            engine_id: self.runtime.engine_id.clone(),
            tombstone_capacity: settings.tombstone_capacity,
        }
    }

    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            interval: Duration::from_secs(self.reconcile.interval_secs.max(1)),
            auto_cleanup_zombies: self.reconcile.auto_cleanup_zombies,
        }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        let c = &self.connections;
        ConnectionConfig {
            idle_ttl: Duration::from_secs(c.idle_ttl_secs),
            reaper_interval: Duration::from_secs(c.reaper_interval_secs.max(1)),
            connect_timeout: Duration::from_secs(c.connect_timeout_secs),
            rpc_timeout: Duration::from_secs(c.rpc_timeout_secs),
        }
    }
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

/// Load a config file from disk. `~` in the path is expanded.
pub fn load_config_file(path: &Path) -> Result<EngineConfig, ConfigError> {
    let expanded = expand_path(path);
    let content = std::fs::read_to_string(&expanded).map_err(|source| ConfigError::Io {
        path: expanded.clone(),
        source,
    })?;
    EngineConfig::parse(&content, ConfigFormat::from_path(&expanded))
}

pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(raw.as_ref()).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::{ModuleType, ProbeKind};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_file(content: &str, suffix: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = EngineConfig::parse("", ConfigFormat::Yaml).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.server.addr(), "0.0.0.0:38082");
        assert_eq!(config.registry.backend, RegistryBackend::Consul);
        assert_eq!(config.lifecycle.max_instances_per_module, 5);
        assert_eq!(config.lifecycle.health.first_check_after_secs, 15);
        assert_eq!(config.reconcile.interval_secs, 60);
        assert_eq!(config.connections.idle_ttl_secs, 300);
    }

    #[test]
    fn test_yaml_sections() {
        let yaml = r#"
server:
  port: 9000
registry:
  backend: memory
runtime:
  backend: memory
  sidecar_image: modplane/registrar:1
lifecycle:
  max_instances_per_module: 2
  health:
    kind: http
    timeout_secs: 30
reconcile:
  auto_cleanup_zombies: true
modules:
  - name: echo
    type: PROCESSOR
    image: modules/echo:1
    defaultPorts:
      grpc: 50051
"#;
        let config = EngineConfig::parse(yaml, ConfigFormat::Yaml).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.bind_addr, "0.0.0.0");
        assert_eq!(config.registry.backend, RegistryBackend::Memory);
        assert_eq!(config.runtime.backend, RuntimeBackend::Memory);
        assert_eq!(config.lifecycle.health.kind, ProbeKind::Http);
        assert_eq!(config.lifecycle.health.probe_interval_secs, 5);
        assert!(config.reconcile.auto_cleanup_zombies);

        let catalog = config.catalog().unwrap();
        assert_eq!(catalog.get("echo").unwrap().module_type, ModuleType::Processor);

        let lifecycle = config.lifecycle_config();
        assert_eq!(lifecycle.max_instances_per_module, 2);
        assert_eq!(lifecycle.health.timeout, Duration::from_secs(30));
        assert_eq!(lifecycle.sidecar_image.as_deref(), Some("modplane/registrar:1"));
    }

    #[test]
    fn test_load_json_by_extension() {
        let file = create_temp_file(r#"{"server": {"port": 1234}}"#, ".json");
        let config = load_config_file(file.path()).unwrap();
        assert_eq!(config.server.port, 1234);
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = load_config_file(Path::new("/nonexistent/modplane.yaml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_invalid_catalog_seed() {
        let yaml = r#"
modules:
  - name: Bad Name
    type: PROCESSOR
    image: x
    defaultPorts: {grpc: 1}
"#;
        let config = EngineConfig::parse(yaml, ConfigFormat::Yaml).unwrap();
        assert!(matches!(config.catalog(), Err(ConfigError::Catalog(_))));
    }

    #[test]
    fn test_malformed_yaml() {
        let result = EngineConfig::parse("server: [1, 2", ConfigFormat::Yaml);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(ConfigFormat::from_path(Path::new("a.JSON")), ConfigFormat::Json);
        assert_eq!(ConfigFormat::from_path(Path::new("a.yml")), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path(Path::new("noext")), ConfigFormat::Yaml);
    }
}
