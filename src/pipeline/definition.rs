//! Pipeline definitions
//!
//! A pipeline is a named graph of steps. Steps are keyed by name in the
//! wire format (`{"steps": {"parse": {...}, "chunk": {...}}}`); the map is
//! kept as an ordered list so that duplicate keys in a submitted document
//! survive parsing and can be reported by validation instead of silently
//! collapsing.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::validation::RuleSet;

/// One step: the module it runs, its configuration and its downstream steps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    /// Module name; need not exist while drafting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,

    /// Module-specific payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,

    /// Names of steps this step forwards to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
}

impl StepConfig {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: Some(module.into()),
            ..Default::default()
        }
    }

    pub fn with_outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = Some(config);
        self
    }

    /// Module name if one is set and non-blank
    pub fn module_name(&self) -> Option<&str> {
        self.module.as_deref().map(str::trim).filter(|m| !m.is_empty())
    }
}

/// Step name -> step, in declaration order, duplicates preserved
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepMap(Vec<(String, StepConfig)>);

impl StepMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step (an existing name is not replaced)
    pub fn push(&mut self, name: impl Into<String>, step: StepConfig) {
        self.0.push((name.into(), step));
    }

    pub fn with(mut self, name: impl Into<String>, step: StepConfig) -> Self {
        self.push(name, step);
        self
    }

    /// First step declared under `name`
    pub fn get(&self, name: &str) -> Option<&StepConfig> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StepConfig)> {
        self.0.iter().map(|(n, s)| (n.as_str(), s))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, StepConfig)> for StepMap {
    fn from_iter<I: IntoIterator<Item = (S, StepConfig)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(n, s)| (n.into(), s)).collect())
    }
}

impl Serialize for StepMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, step) in &self.0 {
            map.serialize_entry(name, step)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for StepMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct StepMapVisitor;

        impl<'de> Visitor<'de> for StepMapVisitor {
            type Value = StepMap;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of step name to step configuration")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<StepMap, A::Error> {
                let mut steps = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, step)) = access.next_entry::<String, StepConfig>()? {
                    steps.push((name, step));
                }
                Ok(StepMap(steps))
            }

            fn visit_unit<E: serde::de::Error>(self) -> Result<StepMap, E> {
                Ok(StepMap::new())
            }
        }

        deserializer.deserialize_any(StepMapVisitor)
    }
}

/// A named graph of steps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Unique, immutable after creation
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub steps: StepMap,

    /// Target cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
}

impl PipelineDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_step(mut self, name: impl Into<String>, step: StepConfig) -> Self {
        self.steps.push(name, step);
        self
    }

    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }

    /// Parse from YAML or JSON text (JSON is valid YAML)
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }
}

/// Validation strictness
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationMode {
    /// Lenient: structure and metadata only, drafts persist despite errors
    #[default]
    Design,
    /// Strict: every rule set, refused if any error remains
    Deploy,
}

impl ValidationMode {
    pub fn rule_sets(self) -> &'static [RuleSet] {
        match self {
            ValidationMode::Design => &[RuleSet::Structural, RuleSet::Metadata],
            ValidationMode::Deploy => &RuleSet::ALL,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ValidationMode::Design => "DESIGN",
            ValidationMode::Deploy => "DEPLOY",
        }
    }
}

impl fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValidationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DESIGN" => Ok(ValidationMode::Design),
            "DEPLOY" => Ok(ValidationMode::Deploy),
            other => Err(format!("unknown validation mode '{}' (DESIGN or DEPLOY)", other)),
        }
    }
}
