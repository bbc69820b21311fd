//! Docker CLI driver for module containers
//!
//! Argument generation and inspect parsing are pure functions; [`DockerCli`]
//! only shells out to the docker binary and maps its failures.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{
    ContainerInfo, ContainerRuntime, ContainerSpec, RuntimeError, RuntimeResult, SidecarInfo,
    SidecarSpec, LABEL_MANAGED, LABEL_SIDECAR_OF,
};

/// Docker driver settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DockerRuntimeConfig {
    /// Docker binary to invoke
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Network to attach module containers to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,

    /// When set, module ports are published on random host ports and
    /// instances are advertised at this host instead of their container IP
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise_host: Option<String>,

    /// Container restart policy: "no", "always", "unless-stopped", "on-failure"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,

    /// Seconds docker waits before killing a container on stop
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Additional environment variables for every module container
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

fn default_binary() -> String {
    "docker".to_string()
}

fn default_stop_timeout() -> u64 {
    10
}

impl Default for DockerRuntimeConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            network: None,
            advertise_host: None,
            restart: None,
            stop_timeout_secs: default_stop_timeout(),
            env: BTreeMap::new(),
        }
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Generate `docker run` arguments for a module container
pub fn generate_run_args(spec: &ContainerSpec, config: &DockerRuntimeConfig) -> Vec<String> {
    let mut args = vec!["run".to_string(), "-d".to_string()];

    args.push("--name".to_string());
    args.push(spec.name.clone());

    if let Some(network) = &config.network {
        args.push("--network".to_string());
        args.push(network.clone());
    }

    if let Some(restart) = &config.restart {
        args.push("--restart".to_string());
        args.push(restart.clone());
    }

    // Random host ports only when advertising a host address
    if config.advertise_host.is_some() {
        for port in spec.ports.values() {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
    }

    for (key, value) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }

    for (key, value) in config.env.iter().chain(spec.env.iter()) {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    args.push(spec.image.clone());
    args
}

/// Generate `docker run` arguments for a sidecar sharing the module's network namespace
pub fn generate_sidecar_run_args(
    sidecar: &SidecarSpec,
    owner: &ContainerSpec,
    config: &DockerRuntimeConfig,
) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        sidecar.name.clone(),
        "--network".to_string(),
        format!("container:{}", owner.name),
        "--label".to_string(),
        format!("{}=true", LABEL_MANAGED),
        "--label".to_string(),
        format!("{}={}", LABEL_SIDECAR_OF, owner.name),
    ];

    if let Some(restart) = &config.restart {
        args.push("--restart".to_string());
        args.push(restart.clone());
    }

    for (key, value) in &sidecar.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    args.push(sidecar.image.clone());
    args
}

pub fn generate_stop_args(container: &str, timeout_secs: u64) -> Vec<String> {
    vec![
        "stop".to_string(),
        "-t".to_string(),
        timeout_secs.to_string(),
        container.to_string(),
    ]
}

pub fn generate_rm_args(container: &str) -> Vec<String> {
    vec!["rm".to_string(), "-f".to_string(), container.to_string()]
}

/// List ids of running containers carrying a label filter
pub fn generate_ps_args(label_filter: &str) -> Vec<String> {
    vec![
        "ps".to_string(),
        "--filter".to_string(),
        format!("label={}", label_filter),
        "--format".to_string(),
        "{{.ID}}".to_string(),
    ]
}

pub fn generate_inspect_args(containers: &[String]) -> Vec<String> {
    let mut args = vec!["inspect".to_string()];
    args.extend(containers.iter().cloned());
    args
}

/// Sidecar container name for a module container
pub fn sidecar_name(owner: &str, sidecar: &str) -> String {
    let sanitized = sidecar.replace(['/', ':'], "-").to_lowercase();
    format!("{}-{}", owner, sanitized)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectContainer {
    id: String,
    name: String,
    config: InspectConfig,
    state: InspectState,
    network_settings: InspectNetwork,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    image: String,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    running: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetwork {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
    #[serde(default)]
    ports: Option<HashMap<String, Option<Vec<PortBinding>>>>,
    #[serde(default)]
    networks: Option<HashMap<String, NetworkEndpoint>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PortBinding {
    #[serde(default)]
    host_port: String,
}

#[derive(Debug, Deserialize)]
struct NetworkEndpoint {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

/// Parse `docker inspect` output into container infos
pub fn parse_inspect(json: &str, config: &DockerRuntimeConfig) -> RuntimeResult<Vec<ContainerInfo>> {
    let containers: Vec<InspectContainer> = serde_json::from_str(json)
        .map_err(|e| RuntimeError::CommandFailed(format!("unreadable inspect output: {}", e)))?;
    Ok(containers
        .into_iter()
        .map(|c| container_info(c, config))
        .collect())
}

fn container_info(c: InspectContainer, config: &DockerRuntimeConfig) -> ContainerInfo {
    let labels = c.config.labels.unwrap_or_default();
    let mut info = ContainerInfo {
        id: c.id,
        name: c.name.trim_start_matches('/').to_string(),
        image: c.config.image,
        running: c.state.running,
        address: String::new(),
        ports: BTreeMap::new(),
        labels,
        sidecars: Vec::new(),
    };
    let container_ports = info.labelled_ports();

    match &config.advertise_host {
        Some(host) => {
            info.address = host.clone();
            let published = c.network_settings.ports.unwrap_or_default();
            info.ports = container_ports
                .into_iter()
                .map(|(role, port)| {
                    let host_port = published
                        .get(&format!("{}/tcp", port))
                        .and_then(|b| b.as_ref())
                        .and_then(|b| b.first())
                        .and_then(|b| b.host_port.parse().ok())
                        .unwrap_or(port);
                    (role, host_port)
                })
                .collect();
        }
        None => {
            let networks = c.network_settings.networks.unwrap_or_default();
            let preferred = config
                .network
                .as_ref()
                .and_then(|n| networks.get(n))
                .map(|n| n.ip_address.clone())
                .filter(|ip| !ip.is_empty());
            let any = networks
                .values()
                .map(|n| n.ip_address.clone())
                .find(|ip| !ip.is_empty());
            info.address = preferred
                .or(any)
                .unwrap_or(c.network_settings.ip_address);
            info.ports = container_ports;
        }
    }
    info
}

fn map_command_error(container: &str, stderr: &str) -> RuntimeError {
    let lowered = stderr.to_lowercase();
    if lowered.contains("no such container") || lowered.contains("no such object") {
        RuntimeError::ContainerNotFound(container.to_string())
    } else if stderr.contains("Cannot connect to the Docker daemon") {
        RuntimeError::Unavailable(stderr.trim().to_string())
    } else {
        RuntimeError::CommandFailed(stderr.trim().to_string())
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Container runtime backed by the docker CLI
pub struct DockerCli {
    config: DockerRuntimeConfig,
}

impl DockerCli {
    pub fn new(config: DockerRuntimeConfig) -> Self {
        Self { config }
    }

    async fn docker(&self, args: &[String]) -> RuntimeResult<String> {
        debug!("docker {:?}", args);
        let output = Command::new(&self.config.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                RuntimeError::Unavailable(format!("Failed to run {}: {}", self.config.binary, e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let target = args.last().map(String::as_str).unwrap_or_default();
            return Err(map_command_error(target, &stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn inspect_many(&self, ids: &[String]) -> RuntimeResult<Vec<ContainerInfo>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let json = self.docker(&generate_inspect_args(ids)).await?;
        parse_inspect(&json, &self.config)
    }

    async fn sidecars_of(&self, owner: &str) -> RuntimeResult<Vec<ContainerInfo>> {
        let ids = self
            .docker(&generate_ps_args(&format!("{}={}", LABEL_SIDECAR_OF, owner)))
            .await?;
        let ids: Vec<String> = ids.lines().map(String::from).collect();
        self.inspect_many(&ids).await
    }

    /// Resolve an id or name to the owning instance's container name
    async fn owner_name(&self, container_id: &str) -> RuntimeResult<String> {
        match self.inspect(container_id).await? {
            Some(info) => Ok(info.name),
            None => Err(RuntimeError::ContainerNotFound(container_id.to_string())),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn start(&self, spec: &ContainerSpec) -> RuntimeResult<ContainerInfo> {
        let id = self
            .docker(&generate_run_args(spec, &self.config))
            .await
            .map_err(|e| RuntimeError::StartFailed(e.to_string()))?;

        let mut sidecars = Vec::new();
        for sidecar in &spec.sidecars {
            match self
                .docker(&generate_sidecar_run_args(sidecar, spec, &self.config))
                .await
            {
                Ok(sidecar_id) => sidecars.push(SidecarInfo {
                    name: sidecar.name.clone(),
                    container_id: sidecar_id,
                    running: true,
                }),
                Err(e) => {
                    // Leave nothing half-started behind
                    let _ = self.docker(&generate_rm_args(&spec.name)).await;
                    for started in &sidecars {
                        let _ = self.docker(&generate_rm_args(&started.container_id)).await;
                    }
                    return Err(RuntimeError::StartFailed(format!(
                        "sidecar '{}' failed: {}",
                        sidecar.name, e
                    )));
                }
            }
        }

        let mut info = self
            .inspect(&id)
            .await?
            .ok_or_else(|| RuntimeError::StartFailed(format!("container {} vanished", id)))?;
        info.sidecars = sidecars;
        Ok(info)
    }

    async fn stop(&self, container_id: &str) -> RuntimeResult<()> {
        let owner = self.owner_name(container_id).await?;
        for sidecar in self.sidecars_of(&owner).await? {
            if let Err(e) = self
                .docker(&generate_stop_args(&sidecar.id, self.config.stop_timeout_secs))
                .await
            {
                warn!("Failed to stop sidecar {}: {}", sidecar.name, e);
            }
        }
        self.docker(&generate_stop_args(container_id, self.config.stop_timeout_secs))
            .await?;
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> RuntimeResult<()> {
        let owner = self.owner_name(container_id).await?;
        for sidecar in self.sidecars_of(&owner).await? {
            if let Err(e) = self.docker(&generate_rm_args(&sidecar.id)).await {
                warn!("Failed to remove sidecar {}: {}", sidecar.name, e);
            }
        }
        self.docker(&generate_rm_args(container_id)).await?;
        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> RuntimeResult<Option<ContainerInfo>> {
        match self.inspect_many(&[container_id.to_string()]).await {
            Ok(mut infos) => Ok(infos.pop()),
            Err(RuntimeError::ContainerNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_managed(&self) -> RuntimeResult<Vec<ContainerInfo>> {
        let ids = self
            .docker(&generate_ps_args(&format!("{}=true", LABEL_MANAGED)))
            .await?;
        let ids: Vec<String> = ids.lines().map(String::from).collect();
        let mut containers: Vec<ContainerInfo> = self
            .inspect_many(&ids)
            .await?
            .into_iter()
            .filter(|c| !c.is_sidecar())
            .collect();
        containers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(containers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ContainerSpec {
        let ports: BTreeMap<String, u16> = [("grpc".to_string(), 50051), ("http".to_string(), 8080)]
            .into_iter()
            .collect();
        ContainerSpec::for_instance("echo-ab12", "echo", "modules/echo:1.0", &ports, "host-a")
    }

    const INSPECT: &str = r#"[{
        "Id": "4f1c2d",
        "Name": "/echo-ab12",
        "Config": {
            "Image": "modules/echo:1.0",
            "Labels": {
                "io.modplane.managed": "true",
                "io.modplane.instance-id": "echo-ab12",
                "io.modplane.module": "echo",
                "io.modplane.port.grpc": "50051"
            }
        },
        "State": {"Running": true},
        "NetworkSettings": {
            "IPAddress": "",
            "Ports": {"50051/tcp": [{"HostIp": "0.0.0.0", "HostPort": "32771"}]},
            "Networks": {"modules": {"IPAddress": "172.20.0.7"}}
        }
    }]"#;

    #[test]
    fn test_run_args_carry_labels_and_env() {
        let config = DockerRuntimeConfig {
            network: Some("modules".to_string()),
            ..Default::default()
        };
        let args = generate_run_args(&spec(), &config);

        assert_eq!(&args[..4], &["run", "-d", "--name", "echo-ab12"]);
        assert!(args.contains(&"--network".to_string()));
        assert!(args.contains(&"io.modplane.module=echo".to_string()));
        assert!(args.contains(&"MODULE_NAME=echo".to_string()));
        // No publishing without an advertise host
        assert!(!args.contains(&"-p".to_string()));
        assert_eq!(args.last().unwrap(), "modules/echo:1.0");
    }

    #[test]
    fn test_run_args_publish_ports_when_advertising() {
        let config = DockerRuntimeConfig {
            advertise_host: Some("10.1.2.3".to_string()),
            ..Default::default()
        };
        let args = generate_run_args(&spec(), &config);
        let published: Vec<&String> = args
            .windows(2)
            .filter(|w| w[0] == "-p")
            .map(|w| &w[1])
            .collect();
        assert_eq!(published, vec!["50051", "8080"]);
    }

    #[test]
    fn test_sidecar_args_share_network_namespace() {
        let sidecar = SidecarSpec {
            name: sidecar_name("echo-ab12", "registrar"),
            image: "modules/registrar:1.0".to_string(),
            env: BTreeMap::new(),
        };
        let args = generate_sidecar_run_args(&sidecar, &spec(), &DockerRuntimeConfig::default());
        assert!(args.contains(&"container:echo-ab12".to_string()));
        assert!(args.contains(&"io.modplane.sidecar-of=echo-ab12".to_string()));
        assert_eq!(sidecar.name, "echo-ab12-registrar");
    }

    #[test]
    fn test_stop_and_rm_args() {
        assert_eq!(generate_stop_args("echo-ab12", 10), vec!["stop", "-t", "10", "echo-ab12"]);
        assert_eq!(generate_rm_args("echo-ab12"), vec!["rm", "-f", "echo-ab12"]);
        assert_eq!(
            generate_ps_args("io.modplane.managed=true"),
            vec!["ps", "--filter", "label=io.modplane.managed=true", "--format", "{{.ID}}"]
        );
    }

    #[test]
    fn test_parse_inspect_uses_network_address() {
        let config = DockerRuntimeConfig {
            network: Some("modules".to_string()),
            ..Default::default()
        };
        let infos = parse_inspect(INSPECT, &config).unwrap();
        let info = &infos[0];
        assert_eq!(info.name, "echo-ab12");
        assert_eq!(info.address, "172.20.0.7");
        assert_eq!(info.ports["grpc"], 50051);
        assert!(info.running);
        assert_eq!(info.instance_id(), "echo-ab12");
    }

    #[test]
    fn test_parse_inspect_uses_published_ports() {
        let config = DockerRuntimeConfig {
            advertise_host: Some("10.1.2.3".to_string()),
            ..Default::default()
        };
        let infos = parse_inspect(INSPECT, &config).unwrap();
        assert_eq!(infos[0].address, "10.1.2.3");
        assert_eq!(infos[0].ports["grpc"], 32771);
    }

    #[test]
    fn test_command_error_mapping() {
        assert!(matches!(
            map_command_error("x", "Error: No such container: x"),
            RuntimeError::ContainerNotFound(_)
        ));
        assert!(matches!(
            map_command_error("x", "Cannot connect to the Docker daemon at unix:///var/run/docker.sock"),
            RuntimeError::Unavailable(_)
        ));
        assert!(matches!(
            map_command_error("x", "conflict"),
            RuntimeError::CommandFailed(_)
        ));
    }
}
