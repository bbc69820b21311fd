//! Command implementations for the CLI
//!
//! SBIO pattern: Commands return Results, I/O is handled by caller

use std::path::Path;

use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use thiserror::Error;

use super::ServeArgs;
use crate::cluster::{Cluster, DEFAULT_CLUSTER};
use crate::config::{load_config_file, ConfigError, EngineConfig, RegistryBackend};
use crate::context::{Context, ContextError, ContextFile};
use crate::events::DeploymentEvent;
use crate::modules::{ModuleDescriptor, ModuleInstance};
use crate::pipeline::{
    validate_for_mode, PipelineDefinition, StaticValidationContext, StoredPipeline, ValidationMode,
    ValidationResult,
};
use crate::reconcile::OrphanRecord;
use crate::server::{Accepted, CleanupResponse, Dashboard, ResourceList};

/// Errors that can occur during command execution
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid pipeline file {path}: {reason}")]
    PipelineFile { path: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },
}

/// Result type for commands
pub type CommandResult<T> = Result<T, CommandError>;

// ============================================================================
// Context Commands (Pure business logic)
// ============================================================================

/// Info about a context for display
#[derive(Debug, Clone, PartialEq)]
pub struct ContextInfo {
    pub name: String,
    pub url: String,
    pub is_current: bool,
}

/// List all contexts, `local` first
pub fn context_list(file: &ContextFile) -> Vec<ContextInfo> {
    let current = file.current_name();
    file.names()
        .into_iter()
        .filter_map(|name| file.resolve(name).ok())
        .map(|ctx| ContextInfo {
            is_current: ctx.name == current,
            name: ctx.name,
            url: ctx.url,
        })
        .collect()
}

/// Get current context name and URL
pub fn context_current(file: &ContextFile) -> CommandResult<(String, String)> {
    let ctx = file.current()?;
    Ok((ctx.name, ctx.url))
}

pub fn context_use(file: &mut ContextFile, name: &str) -> CommandResult<()> {
    file.use_context(name)?;
    Ok(())
}

pub fn context_add(
    file: &mut ContextFile,
    name: &str,
    url: &str,
    token: Option<&str>,
    description: Option<&str>,
) -> CommandResult<()> {
    let mut ctx = Context::new(name, url.trim_end_matches('/'));
    if let Some(token) = token {
        ctx = ctx.with_token(token);
    }
    if let Some(description) = description {
        ctx = ctx.with_description(description);
    }
    file.add(ctx)?;
    Ok(())
}

pub fn context_delete(file: &mut ContextFile, name: &str) -> CommandResult<()> {
    file.remove(name)?;
    Ok(())
}

// ============================================================================
// Serve Commands
// ============================================================================

/// Load the engine config named by `serve` and apply its flag overrides
pub fn serve_config(args: &ServeArgs) -> CommandResult<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => load_config_file(path)?,
        None => EngineConfig::default(),
    };
    apply_serve_overrides(&mut config, args);
    Ok(config)
}

pub fn apply_serve_overrides(config: &mut EngineConfig, args: &ServeArgs) {
    if let Some(addr) = &args.bind_addr {
        config.server.bind_addr = addr.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(url) = &args.registry_url {
        config.registry.backend = RegistryBackend::Consul;
        config.registry.consul.url = url.trim_end_matches('/').to_string();
    }
}

// ============================================================================
// Validate Commands
// ============================================================================

/// Modules from the config catalog plus the default cluster
pub fn static_context(config: &EngineConfig) -> StaticValidationContext {
    config
        .modules
        .iter()
        .cloned()
        .fold(StaticValidationContext::new().with_cluster(DEFAULT_CLUSTER), |ctx, m| {
            ctx.with_module(m)
        })
}

/// Load a pipeline definition from YAML or JSON
pub fn load_pipeline_file(path: &Path) -> CommandResult<PipelineDefinition> {
    let content = std::fs::read_to_string(path)?;
    PipelineDefinition::from_yaml(&content).map_err(|e| CommandError::PipelineFile {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Validate a pipeline file against the catalog of an optional engine config
pub async fn validate_pipeline_file(
    path: &Path,
    mode: ValidationMode,
    config: Option<&Path>,
) -> CommandResult<ValidationResult> {
    let definition = load_pipeline_file(path)?;
    let config = match config {
        Some(config_path) => load_config_file(config_path)?,
        None => EngineConfig::default(),
    };
    let context = static_context(&config);
    Ok(validate_for_mode(&definition, mode, &context).await)
}

// ============================================================================
// Event stream parsing (Pure business logic)
// ============================================================================

/// Incremental parser for a `text/event-stream` body
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return the data payloads of every event it completes
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut completed = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    completed.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
            // event:, id: and comment lines carry nothing the payload lacks
        }

        completed
    }
}

/// Keep events of one module, or all when no filter is set
pub fn event_matches(event: &DeploymentEvent, module: Option<&str>) -> bool {
    module.map_or(true, |m| event.module_name == m)
}

// ============================================================================
// HTTP Client for the engine
// ============================================================================

/// Client for the engine API
pub struct EngineClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl EngineClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn from_context(context: &Context) -> Self {
        let client = Self::new(&context.url);
        match &context.token {
            Some(token) => client.with_token(token),
            None => client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.request(method, &url);
        if let Some(ref token) = self.token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }
        req
    }

    async fn send<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> CommandResult<T> {
        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            return Err(CommandError::Server {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }

        Ok(serde_json::from_str(&body)?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> CommandResult<T> {
        self.send(self.build_request(reqwest::Method::GET, path)).await
    }

    pub async fn list_modules(&self) -> CommandResult<Vec<ModuleDescriptor>> {
        let list: ResourceList<ModuleDescriptor> = self.get("/api/v1/module-management/available").await?;
        Ok(list.items)
    }

    pub async fn list_deployed(&self, module: Option<&str>) -> CommandResult<Vec<ModuleInstance>> {
        let path = match module {
            Some(m) => format!("/api/v1/module-management/{}/instances", m),
            None => "/api/v1/module-management/deployed".to_string(),
        };
        let list: ResourceList<ModuleInstance> = self.get(&path).await?;
        Ok(list.items)
    }

    pub async fn list_orphaned(&self) -> CommandResult<Vec<OrphanRecord>> {
        let list: ResourceList<OrphanRecord> = self.get("/api/v1/module-management/orphaned").await?;
        Ok(list.items)
    }

    pub async fn list_pipelines(&self) -> CommandResult<Vec<StoredPipeline>> {
        let list: ResourceList<StoredPipeline> = self.get("/api/v1/pipelines/definitions").await?;
        Ok(list.items)
    }

    pub async fn get_pipeline(&self, id: &str) -> CommandResult<StoredPipeline> {
        self.get(&format!("/api/v1/pipelines/definitions/{}", id)).await
    }

    pub async fn list_clusters(&self) -> CommandResult<Vec<Cluster>> {
        let list: ResourceList<Cluster> = self.get("/api/v1/clusters").await?;
        Ok(list.items)
    }

    pub async fn dashboard(&self) -> CommandResult<Dashboard> {
        self.get("/api/v1/module-discovery/dashboard").await
    }

    pub async fn deploy(&self, module: &str) -> CommandResult<Accepted> {
        let path = format!("/api/v1/module-management/{}/deploy", module);
        self.send(self.build_request(reqwest::Method::POST, &path)).await
    }

    pub async fn scale_up(&self, module: &str) -> CommandResult<Accepted> {
        let path = format!("/api/v1/module-management/{}/scale-up", module);
        self.send(self.build_request(reqwest::Method::POST, &path)).await
    }

    pub async fn undeploy(&self, module: &str, instance: Option<&str>) -> CommandResult<Accepted> {
        let path = match instance {
            Some(id) => format!("/api/v1/module-management/{}/instance/{}", module, id),
            None => format!("/api/v1/module-management/{}/undeploy", module),
        };
        self.send(self.build_request(reqwest::Method::DELETE, &path)).await
    }

    pub async fn cleanup_zombies(&self) -> CommandResult<usize> {
        let resp: CleanupResponse = self
            .send(self.build_request(reqwest::Method::POST, "/api/v1/modules/cleanup-zombies"))
            .await?;
        Ok(resp.removed)
    }

    /// Follow the deployment event stream until the server closes it
    pub async fn events(&self) -> CommandResult<impl Stream<Item = CommandResult<DeploymentEvent>>> {
        let resp = self
            .build_request(reqwest::Method::GET, "/api/v1/module-deployment/events")
            .header("Accept", "text/event-stream")
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await?;
            return Err(CommandError::Server {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }

        let mut decoder = SseDecoder::new();
        let events = resp
            .bytes_stream()
            .map(move |chunk| -> Vec<CommandResult<DeploymentEvent>> {
                match chunk {
                    Ok(bytes) => decoder
                        .push(&String::from_utf8_lossy(&bytes))
                        .into_iter()
                        .map(|data| serde_json::from_str(&data).map_err(CommandError::from))
                        .collect(),
                    Err(e) => vec![Err(CommandError::from(e))],
                }
            })
            .flat_map(futures::stream::iter);

        Ok(events)
    }
}

/// Pull the message out of an engine error body, or fall back to the raw text
pub fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}
