//! CLI contexts
//!
//! Named engine endpoints stored in `~/.modplane/config.yaml`, kubeconfig
//! style. The built-in `local` context points at an engine on this machine.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::DEFAULT_PORT;

/// Name of the built-in context
pub const LOCAL_CONTEXT: &str = "local";

/// Default context file location: ~/.modplane/config.yaml
pub fn default_context_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".modplane")
        .join("config.yaml")
}

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Context '{0}' not found")]
    ContextNotFound(String),

    #[error("Context '{0}' is built in and cannot be changed")]
    BuiltIn(String),

    #[error("Failed to parse context file: {0}")]
    ParseError(String),

    #[error("Failed to write context file: {0}")]
    WriteError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// One named engine endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub name: String,
    /// Engine API base URL, e.g. `http://10.0.0.5:38082`
    pub url: String,
    /// Sent as a bearer token when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Context {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            token: None,
            description: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }
}

/// The context file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextFile {
    #[serde(rename = "current-context")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_context: Option<String>,

    #[serde(default)]
    pub contexts: BTreeMap<String, Context>,

    #[serde(default)]
    pub local: LocalEndpoint,
}

/// Where the `local` context points
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEndpoint {
    #[serde(default = "default_local_host")]
    pub host: String,
    #[serde(default = "default_local_port")]
    pub port: u16,
}

fn default_local_host() -> String {
    "localhost".to_string()
}

fn default_local_port() -> u16 {
    DEFAULT_PORT
}

impl Default for LocalEndpoint {
    fn default() -> Self {
        Self {
            host: default_local_host(),
            port: default_local_port(),
        }
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

pub fn parse_context_file(content: &str) -> Result<ContextFile, ContextError> {
    if content.trim().is_empty() {
        return Ok(ContextFile::default());
    }
    serde_yaml::from_str(content).map_err(|e| ContextError::ParseError(e.to_string()))
}

pub fn serialize_context_file(file: &ContextFile) -> Result<String, ContextError> {
    serde_yaml::to_string(file).map_err(|e| ContextError::WriteError(e.to_string()))
}

impl ContextFile {
    /// Add or replace a context
    pub fn add(&mut self, context: Context) -> Result<(), ContextError> {
        if context.name == LOCAL_CONTEXT {
            return Err(ContextError::BuiltIn(context.name));
        }
        self.contexts.insert(context.name.clone(), context);
        Ok(())
    }

    /// Remove a context, falling back to `local` if it was current
    pub fn remove(&mut self, name: &str) -> Result<Context, ContextError> {
        let removed = self
            .contexts
            .remove(name)
            .ok_or_else(|| ContextError::ContextNotFound(name.to_string()))?;
        if self.current_context.as_deref() == Some(name) {
            self.current_context = None;
        }
        Ok(removed)
    }

    pub fn use_context(&mut self, name: &str) -> Result<(), ContextError> {
        if name != LOCAL_CONTEXT && !self.contexts.contains_key(name) {
            return Err(ContextError::ContextNotFound(name.to_string()));
        }
        self.current_context = Some(name.to_string());
        Ok(())
    }

    pub fn current_name(&self) -> &str {
        self.current_context.as_deref().unwrap_or(LOCAL_CONTEXT)
    }

    /// The active context, with `local` synthesized
    pub fn current(&self) -> Result<Context, ContextError> {
        self.resolve(self.current_name())
    }

    pub fn resolve(&self, name: &str) -> Result<Context, ContextError> {
        if name == LOCAL_CONTEXT {
            return Ok(Context::new(
                LOCAL_CONTEXT,
                format!("http://{}:{}", self.local.host, self.local.port),
            )
            .with_description("Engine on this machine"));
        }
        self.contexts
            .get(name)
            .cloned()
            .ok_or_else(|| ContextError::ContextNotFound(name.to_string()))
    }

    /// `local` first, then stored contexts by name
    pub fn names(&self) -> Vec<&str> {
        std::iter::once(LOCAL_CONTEXT)
            .chain(self.contexts.keys().map(String::as_str))
            .collect()
    }
}

// ============================================================================
// I/O boundary functions
// ============================================================================

/// Load the context file; a missing file is an empty one
pub fn load_context_file(path: &Path) -> Result<ContextFile, ContextError> {
    if !path.exists() {
        return Ok(ContextFile::default());
    }
    let content = std::fs::read_to_string(path)?;
    parse_context_file(&content)
}

pub fn save_context_file(file: &ContextFile, path: &Path) -> Result<(), ContextError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serialize_context_file(file)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_local() {
        let file = ContextFile::default();
        assert_eq!(file.current_name(), LOCAL_CONTEXT);
        assert_eq!(file.current().unwrap().url, "http://localhost:38082");
    }

    #[test]
    fn test_parse_context_file() {
        let yaml = r#"
current-context: staging
contexts:
  staging:
    name: staging
    url: http://10.0.0.5:38082
    token: secret
"#;
        let file = parse_context_file(yaml).unwrap();
        let current = file.current().unwrap();
        assert_eq!(current.url, "http://10.0.0.5:38082");
        assert_eq!(current.token.as_deref(), Some("secret"));
    }

    #[test]
    fn test_add_use_remove() {
        let mut file = ContextFile::default();
        file.add(Context::new("staging", "http://10.0.0.5:38082")).unwrap();
        file.use_context("staging").unwrap();
        assert_eq!(file.current_name(), "staging");
        assert_eq!(file.names(), vec!["local", "staging"]);

        file.remove("staging").unwrap();
        assert_eq!(file.current_name(), LOCAL_CONTEXT);
        assert!(matches!(file.remove("staging"), Err(ContextError::ContextNotFound(_))));
    }

    #[test]
    fn test_local_is_built_in() {
        let mut file = ContextFile::default();
        assert!(matches!(
            file.add(Context::new("local", "http://elsewhere")),
            Err(ContextError::BuiltIn(_))
        ));
        assert!(file.use_context("local").is_ok());
        assert!(matches!(file.use_context("missing"), Err(ContextError::ContextNotFound(_))));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");

        let mut file = ContextFile::default();
        file.add(Context::new("prod", "http://prod:38082").with_description("Production"))
            .unwrap();
        file.use_context("prod").unwrap();
        save_context_file(&file, &path).unwrap();

        let reloaded = load_context_file(&path).unwrap();
        assert_eq!(reloaded, file);
        assert!(serialize_context_file(&reloaded).unwrap().contains("current-context: prod"));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let file = load_context_file(Path::new("/nonexistent/modplane/config.yaml")).unwrap();
        assert_eq!(file, ContextFile::default());
    }
}
