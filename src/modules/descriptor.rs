//! Module descriptors and the capability table
//!
//! A module kind is a tagged variant ([`ModuleType`]) plus a static
//! capability lookup, so callers branch on data instead of dispatching
//! through per-type implementations.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::naming::is_valid_name;

/// Port role used for gRPC traffic and health probing
pub const GRPC_PORT_ROLE: &str = "grpc";

/// Port role used for HTTP health endpoints
pub const HTTP_PORT_ROLE: &str = "http";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModuleType {
    Processor,
    Connector,
    Sidecar,
    Registrar,
}

/// What a module kind can do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    /// May be bound to a pipeline step
    pub usable_as_step: bool,
    /// Deployed with a registry sidecar next to it
    pub needs_registry_sidecar: bool,
    /// Serves the module gRPC contract
    pub exposes_grpc: bool,
}

impl ModuleType {
    pub const ALL: [ModuleType; 4] = [
        ModuleType::Processor,
        ModuleType::Connector,
        ModuleType::Sidecar,
        ModuleType::Registrar,
    ];

    pub const fn capabilities(self) -> Capabilities {
        match self {
            ModuleType::Processor => Capabilities {
                usable_as_step: true,
                needs_registry_sidecar: true,
                exposes_grpc: true,
            },
            ModuleType::Connector => Capabilities {
                usable_as_step: true,
                needs_registry_sidecar: true,
                exposes_grpc: true,
            },
            ModuleType::Sidecar => Capabilities {
                usable_as_step: false,
                needs_registry_sidecar: false,
                exposes_grpc: false,
            },
            ModuleType::Registrar => Capabilities {
                usable_as_step: false,
                needs_registry_sidecar: false,
                exposes_grpc: true,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModuleType::Processor => "PROCESSOR",
            ModuleType::Connector => "CONNECTOR",
            ModuleType::Sidecar => "SIDECAR",
            ModuleType::Registrar => "REGISTRAR",
        }
    }
}

impl std::fmt::Display for ModuleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a deployable module kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleDescriptor {
    pub name: String,

    #[serde(rename = "type")]
    pub module_type: ModuleType,

    /// Container image reference
    pub image: String,

    /// Port role -> port number
    #[serde(default)]
    pub default_ports: BTreeMap<String, u16>,

    /// gRPC service names the module exposes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grpc_services: Vec<String>,

    /// JSON Schema for step `config` payloads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_schema: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>, module_type: ModuleType, image: impl Into<String>) -> Self {
        let mut default_ports = BTreeMap::new();
        default_ports.insert(GRPC_PORT_ROLE.to_string(), 50051);
        Self {
            name: name.into(),
            module_type,
            image: image.into(),
            default_ports,
            grpc_services: Vec::new(),
            config_schema: None,
            description: None,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.module_type.capabilities()
    }

    /// The port health probes and gRPC clients target
    pub fn grpc_port(&self) -> Option<u16> {
        self.default_ports
            .get(GRPC_PORT_ROLE)
            .or_else(|| self.default_ports.values().next())
            .copied()
    }

    pub fn validate(&self) -> Result<(), CatalogError> {
        if !is_valid_name(&self.name) {
            return Err(CatalogError::InvalidName(self.name.clone()));
        }
        if self.image.trim().is_empty() {
            return Err(CatalogError::InvalidDescriptor(format!(
                "module '{}' has no image",
                self.name
            )));
        }
        if self.default_ports.is_empty() {
            return Err(CatalogError::InvalidDescriptor(format!(
                "module '{}' declares no ports",
                self.name
            )));
        }
        if let Some(schema) = &self.config_schema {
            jsonschema::validator_for(schema).map_err(|e| {
                CatalogError::InvalidDescriptor(format!(
                    "module '{}' has an invalid config schema: {}",
                    self.name, e
                ))
            })?;
        }
        Ok(())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CatalogError {
    #[error("Invalid module name '{0}': must match ^[a-z0-9-]+$")]
    InvalidName(String),

    #[error("Invalid module descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Module '{0}' is already published with a different descriptor")]
    AlreadyPublished(String),
}

/// Published module descriptors, keyed by name
#[derive(Default)]
pub struct ModuleCatalog {
    descriptors: DashMap<String, ModuleDescriptor>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_descriptors(
        descriptors: impl IntoIterator<Item = ModuleDescriptor>,
    ) -> Result<Self, CatalogError> {
        let catalog = Self::new();
        for descriptor in descriptors {
            catalog.publish(descriptor)?;
        }
        Ok(catalog)
    }

    /// Publish a descriptor. Re-publishing an identical descriptor is a no-op;
    /// a different descriptor under an existing name is refused.
    pub fn publish(&self, descriptor: ModuleDescriptor) -> Result<(), CatalogError> {
        descriptor.validate()?;
        match self.descriptors.entry(descriptor.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                if existing.get() == &descriptor {
                    Ok(())
                } else {
                    Err(CatalogError::AlreadyPublished(descriptor.name))
                }
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(descriptor);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<ModuleDescriptor> {
        self.descriptors.get(name).map(|d| d.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.descriptors.contains_key(name)
    }

    /// All descriptors sorted by name
    pub fn list(&self) -> Vec<ModuleDescriptor> {
        let mut all: Vec<ModuleDescriptor> =
            self.descriptors.iter().map(|d| d.value().clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_capability_table() {
        assert!(ModuleType::Processor.capabilities().usable_as_step);
        assert!(ModuleType::Connector.capabilities().needs_registry_sidecar);
        assert!(!ModuleType::Sidecar.capabilities().usable_as_step);
        assert!(!ModuleType::Registrar.capabilities().usable_as_step);
        assert!(ModuleType::Registrar.capabilities().exposes_grpc);
    }

    #[test]
    fn test_descriptor_wire_format() {
        let json = json!({
            "name": "text-chunker",
            "type": "PROCESSOR",
            "image": "modules/chunker:2.1",
            "defaultPorts": {"grpc": 39100, "http": 39101}
        });
        let desc: ModuleDescriptor = serde_json::from_value(json).unwrap();
        assert_eq!(desc.module_type, ModuleType::Processor);
        assert_eq!(desc.grpc_port(), Some(39100));
        assert!(desc.validate().is_ok());
    }

    #[test]
    fn test_descriptor_rejects_bad_name() {
        let desc = ModuleDescriptor::new("Text_Chunker", ModuleType::Processor, "img");
        assert_eq!(
            desc.validate(),
            Err(CatalogError::InvalidName("Text_Chunker".to_string()))
        );
    }

    #[test]
    fn test_descriptor_rejects_invalid_schema() {
        let mut desc = ModuleDescriptor::new("echo", ModuleType::Processor, "modules/echo:1");
        desc.config_schema = Some(json!({"type": "not-a-type"}));
        assert!(matches!(
            desc.validate(),
            Err(CatalogError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn test_catalog_publish_is_immutable() {
        let catalog = ModuleCatalog::new();
        let desc = ModuleDescriptor::new("echo", ModuleType::Processor, "modules/echo:1");
        catalog.publish(desc.clone()).unwrap();
        // Identical re-publish is fine
        catalog.publish(desc.clone()).unwrap();

        let changed = ModuleDescriptor {
            image: "modules/echo:2".to_string(),
            ..desc
        };
        assert_eq!(
            catalog.publish(changed),
            Err(CatalogError::AlreadyPublished("echo".to_string()))
        );
        assert_eq!(catalog.get("echo").unwrap().image, "modules/echo:1");
    }

    #[test]
    fn test_catalog_list_sorted() {
        let catalog = ModuleCatalog::with_descriptors(vec![
            ModuleDescriptor::new("parser", ModuleType::Processor, "p"),
            ModuleDescriptor::new("echo", ModuleType::Processor, "e"),
        ])
        .unwrap();
        let names: Vec<String> = catalog.list().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["echo", "parser"]);
        assert_eq!(catalog.len(), 2);
    }
}
