//! Multi-tier pipeline validation
//!
//! Rule sets run in a fixed order (STRUCTURAL, METADATA, STEPS, DEPLOYMENT).
//! Within a rule set each rule is evaluated for every step before the next
//! rule starts. Nothing short-circuits: every applicable rule runs and every
//! issue is collected. Live lookups go through a [`ValidationContext`], so
//! given the same definition and context the issues are always identical.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use thiserror::Error;

use super::definition::{PipelineDefinition, StepConfig, ValidationMode};
use crate::modules::ModuleDescriptor;
use crate::naming::is_valid_name;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleSet {
    Structural,
    Metadata,
    Steps,
    Deployment,
}

impl RuleSet {
    pub const ALL: [RuleSet; 4] = [
        RuleSet::Structural,
        RuleSet::Metadata,
        RuleSet::Steps,
        RuleSet::Deployment,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Error => "ERROR",
            Severity::Warning => "WARNING",
            Severity::Info => "INFO",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub rule_set: RuleSet,
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl ValidationIssue {
    pub fn new(rule_set: RuleSet, rule: &str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            rule_set,
            rule: rule.to_string(),
            severity,
            message: message.into(),
            step_name: None,
            step_index: None,
            field: None,
        }
    }

    pub fn at_step(mut self, name: &str, index: usize) -> Self {
        self.step_name = Some(name.to_string());
        self.step_index = Some(index);
        self
    }

    pub fn on_field(mut self, field: &str) -> Self {
        self.field = Some(field.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub errors: usize,
    pub warnings: usize,
    pub infos: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    /// No ERROR-severity issue
    pub valid: bool,
    pub issues: Vec<ValidationIssue>,
    pub summary: ValidationSummary,
    pub timestamp: DateTime<Utc>,
}

impl ValidationResult {
    pub fn from_issues(issues: Vec<ValidationIssue>) -> Self {
        let mut summary = ValidationSummary::default();
        for issue in &issues {
            match issue.severity {
                Severity::Error => summary.errors += 1,
                Severity::Warning => summary.warnings += 1,
                Severity::Info => summary.infos += 1,
            }
        }
        Self {
            valid: summary.errors == 0,
            issues,
            summary,
            timestamp: Utc::now(),
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.valid
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }

    pub fn issues_for<'a>(&'a self, rule: &'a str) -> impl Iterator<Item = &'a ValidationIssue> + 'a {
        self.issues.iter().filter(move |i| i.rule == rule)
    }

    /// Issues of one rule set
    pub fn in_rule_set(&self, rule_set: RuleSet) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(move |i| i.rule_set == rule_set)
    }
}

/// A live lookup that could not be answered
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct LookupError(pub String);

/// Live module and cluster knowledge consulted by STEPS and DEPLOYMENT rules
#[async_trait]
pub trait ValidationContext: Send + Sync {
    async fn lookup_module(&self, name: &str) -> Result<Option<ModuleDescriptor>, LookupError>;

    async fn cluster_exists(&self, name: &str) -> Result<bool, LookupError>;
}

/// Fixed module and cluster sets, for offline validation
#[derive(Debug, Clone, Default)]
pub struct StaticValidationContext {
    modules: HashMap<String, ModuleDescriptor>,
    clusters: HashSet<String>,
}

impl StaticValidationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(mut self, descriptor: ModuleDescriptor) -> Self {
        self.modules.insert(descriptor.name.clone(), descriptor);
        self
    }

    pub fn with_cluster(mut self, name: impl Into<String>) -> Self {
        self.clusters.insert(name.into());
        self
    }
}

#[async_trait]
impl ValidationContext for StaticValidationContext {
    async fn lookup_module(&self, name: &str) -> Result<Option<ModuleDescriptor>, LookupError> {
        Ok(self.modules.get(name).cloned())
    }

    async fn cluster_exists(&self, name: &str) -> Result<bool, LookupError> {
        Ok(self.clusters.contains(name))
    }
}

// ============================================================================
// Validator
// ============================================================================

/// Validate with the rule sets of a mode
pub async fn validate_for_mode(
    pipeline: &PipelineDefinition,
    mode: ValidationMode,
    context: &dyn ValidationContext,
) -> ValidationResult {
    validate(pipeline, mode.rule_sets(), mode, context).await
}

/// Run the requested rule sets. Rule sets always run in canonical order
/// regardless of how `rule_sets` is ordered. Cycle detection is part of
/// STRUCTURAL but only gates DEPLOY mode.
pub async fn validate(
    pipeline: &PipelineDefinition,
    rule_sets: &[RuleSet],
    mode: ValidationMode,
    context: &dyn ValidationContext,
) -> ValidationResult {
    let mut issues = Vec::new();
    for rule_set in RuleSet::ALL {
        if !rule_sets.contains(&rule_set) {
            continue;
        }
        match rule_set {
            RuleSet::Structural => structural_rules(pipeline, mode, &mut issues),
            RuleSet::Metadata => metadata_rules(pipeline, &mut issues),
            RuleSet::Steps => step_rules(pipeline, context, &mut issues).await,
            RuleSet::Deployment => deployment_rules(pipeline, context, &mut issues).await,
        }
    }
    ValidationResult::from_issues(issues)
}

fn structural_rules(pipeline: &PipelineDefinition, mode: ValidationMode, issues: &mut Vec<ValidationIssue>) {
    // atLeastOneStep
    if pipeline.steps.is_empty() {
        issues.push(
            ValidationIssue::new(
                RuleSet::Structural,
                "atLeastOneStep",
                Severity::Error,
                "Pipeline must have at least one step",
            )
            .on_field("steps"),
        );
    }

    // uniqueStepNames: one issue per duplicated name, in first-seen order
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    let mut first_seen = Vec::new();
    for name in pipeline.steps.names() {
        let count = counts.entry(name).or_insert(0);
        if *count == 0 {
            first_seen.push(name);
        }
        *count += 1;
    }
    for name in first_seen {
        let count = counts[name];
        if count > 1 {
            let mut issue = ValidationIssue::new(
                RuleSet::Structural,
                "uniqueStepNames",
                Severity::Error,
                format!("Step name '{}' is declared {} times", name, count),
            )
            .on_field("steps");
            issue.step_name = Some(name.to_string());
            issues.push(issue);
        }
    }

    // outputTargetsExist
    for (index, (name, step)) in pipeline.steps.iter().enumerate() {
        for target in &step.outputs {
            if !pipeline.steps.contains(target) {
                issues.push(
                    ValidationIssue::new(
                        RuleSet::Structural,
                        "outputTargetsExist",
                        Severity::Warning,
                        format!("Step '{}' outputs to unknown step '{}'", name, target),
                    )
                    .at_step(name, index)
                    .on_field("outputs"),
                );
            }
        }
    }

    // acyclicStepGraph
    if mode == ValidationMode::Deploy && !pipeline.steps.is_empty() {
        let order = execution_order(pipeline);
        if !order.is_acyclic() {
            issues.push(
                ValidationIssue::new(
                    RuleSet::Structural,
                    "acyclicStepGraph",
                    Severity::Error,
                    format!(
                        "Step graph has a cycle; steps in or downstream of it: {}",
                        order.unsorted.join(", ")
                    ),
                )
                .on_field("steps"),
            );
        }
    }
}

fn metadata_rules(pipeline: &PipelineDefinition, issues: &mut Vec<ValidationIssue>) {
    let name = pipeline.name.trim();
    if name.is_empty() {
        issues.push(
            ValidationIssue::new(RuleSet::Metadata, "nameRequired", Severity::Error, "Pipeline name is required")
                .on_field("name"),
        );
    } else if !is_valid_name(name) {
        issues.push(
            ValidationIssue::new(
                RuleSet::Metadata,
                "namePattern",
                Severity::Warning,
                format!("Pipeline name '{}' should match ^[a-z0-9-]+$", name),
            )
            .on_field("name"),
        );
    }

    let described = pipeline
        .description
        .as_deref()
        .is_some_and(|d| !d.trim().is_empty());
    if !described {
        issues.push(
            ValidationIssue::new(
                RuleSet::Metadata,
                "descriptionPresent",
                Severity::Info,
                "Pipeline has no description",
            )
            .on_field("description"),
        );
    }
}

async fn step_rules(
    pipeline: &PipelineDefinition,
    context: &dyn ValidationContext,
    issues: &mut Vec<ValidationIssue>,
) {
    let steps: Vec<(usize, &str, &StepConfig)> = pipeline
        .steps
        .iter()
        .enumerate()
        .map(|(i, (name, step))| (i, name, step))
        .collect();

    // moduleSpecified
    for &(index, name, step) in &steps {
        if step.module_name().is_none() {
            issues.push(
                ValidationIssue::new(
                    RuleSet::Steps,
                    "moduleSpecified",
                    Severity::Error,
                    format!("Step '{}' does not specify a module", name),
                )
                .at_step(name, index)
                .on_field("module"),
            );
        }
    }

    // configStructured
    for &(index, name, step) in &steps {
        if let Some(config) = &step.config {
            if !config.is_object() {
                issues.push(
                    ValidationIssue::new(
                        RuleSet::Steps,
                        "configStructured",
                        Severity::Error,
                        format!(
                            "Step '{}' config must be a key-value object, got {}",
                            name,
                            json_kind(config)
                        ),
                    )
                    .at_step(name, index)
                    .on_field("config"),
                );
            }
        }
    }

    // One lookup per distinct module name
    let mut lookups: ModuleLookups = BTreeMap::new();
    for &(_, _, step) in &steps {
        if let Some(module) = step.module_name() {
            if !lookups.contains_key(module) {
                let found = context.lookup_module(module).await;
                lookups.insert(module, found);
            }
        }
    }

    // moduleExists
    for &(index, name, step) in &steps {
        let Some(module) = step.module_name() else { continue };
        let message = match &lookups[module] {
            Ok(Some(_)) => continue,
            Ok(None) => format!("Step '{}' references unknown module '{}'", name, module),
            Err(e) => format!("Step '{}': could not look up module '{}': {}", name, module, e),
        };
        issues.push(
            ValidationIssue::new(RuleSet::Steps, "moduleExists", Severity::Error, message)
                .at_step(name, index)
                .on_field("module"),
        );
    }

    // moduleUsableAsStep
    for &(index, name, step) in &steps {
        let Some(descriptor) = resolved(&lookups, step) else { continue };
        if !descriptor.capabilities().usable_as_step {
            issues.push(
                ValidationIssue::new(
                    RuleSet::Steps,
                    "moduleUsableAsStep",
                    Severity::Error,
                    format!(
                        "Step '{}' uses module '{}' of type {}, which cannot run as a pipeline step",
                        name, descriptor.name, descriptor.module_type
                    ),
                )
                .at_step(name, index)
                .on_field("module"),
            );
        }
    }

    // configMatchesSchema
    for &(index, name, step) in &steps {
        let Some(descriptor) = resolved(&lookups, step) else { continue };
        let (Some(schema), Some(config)) = (&descriptor.config_schema, &step.config) else {
            continue;
        };
        if !config.is_object() {
            continue;
        }
        let Ok(validator) = jsonschema::validator_for(schema) else {
            continue;
        };
        for error in validator.iter_errors(config) {
            issues.push(
                ValidationIssue::new(
                    RuleSet::Steps,
                    "configMatchesSchema",
                    Severity::Error,
                    format!("Step '{}' config: {}", name, error),
                )
                .at_step(name, index)
                .on_field("config"),
            );
        }
    }
}

async fn deployment_rules(
    pipeline: &PipelineDefinition,
    context: &dyn ValidationContext,
    issues: &mut Vec<ValidationIssue>,
) {
    let Some(cluster) = pipeline.cluster.as_deref().map(str::trim).filter(|c| !c.is_empty()) else {
        return;
    };

    // targetClusterExists
    let message = match context.cluster_exists(cluster).await {
        Ok(true) => None,
        Ok(false) => Some(format!("Target cluster '{}' does not exist", cluster)),
        Err(e) => Some(format!("Could not look up target cluster '{}': {}", cluster, e)),
    };
    match message {
        Some(message) => {
            issues.push(
                ValidationIssue::new(RuleSet::Deployment, "targetClusterExists", Severity::Error, message)
                    .on_field("cluster"),
            );
        }
        None => {
            // clusterCapacity
            if let Some(issue) = cluster_capacity(pipeline, cluster) {
                issues.push(issue);
            }
        }
    }
}

type ModuleLookups<'a> = BTreeMap<&'a str, Result<Option<ModuleDescriptor>, LookupError>>;

/// The descriptor a step's module resolved to, if the lookup found one
fn resolved<'a>(lookups: &'a ModuleLookups<'_>, step: &StepConfig) -> Option<&'a ModuleDescriptor> {
    step.module_name()
        .and_then(|m| lookups.get(m))
        .and_then(|r| r.as_ref().ok())
        .and_then(Option::as_ref)
}

/// Capacity check for the target cluster. There is no capacity model yet,
/// so every existing cluster is accepted.
fn cluster_capacity(_pipeline: &PipelineDefinition, _cluster: &str) -> Option<ValidationIssue> {
    None
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ============================================================================
// Topological order
// ============================================================================

/// Deployment readiness order of a pipeline's steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOrder {
    /// Steps in an order where every step comes after all its upstreams
    pub order: Vec<String>,
    /// Steps the sort could not place: members of a cycle or downstream of one
    pub unsorted: Vec<String>,
}

impl ExecutionOrder {
    pub fn is_acyclic(&self) -> bool {
        self.unsorted.is_empty()
    }

    /// Every step exactly once: the sorted ones, then the rest
    pub fn all_steps(&self) -> impl Iterator<Item = &str> {
        self.order.iter().chain(self.unsorted.iter()).map(String::as_str)
    }
}

/// Kahn's algorithm over the step graph. Roots (no incoming edge) are
/// visited in declaration order; outputs naming unknown steps are ignored;
/// a step outputting to itself is a cycle. Steps the sort never reaches are
/// appended to `unsorted` in declaration order so none is dropped.
pub fn execution_order(pipeline: &PipelineDefinition) -> ExecutionOrder {
    // Distinct names in declaration order; duplicate declarations merge their outputs
    let mut nodes: Vec<&str> = Vec::new();
    let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
    for (name, step) in pipeline.steps.iter() {
        if !edges.contains_key(name) {
            nodes.push(name);
        }
        let targets = edges.entry(name).or_default();
        for target in &step.outputs {
            let target = target.as_str();
            if pipeline.steps.contains(target) && !targets.contains(&target) {
                targets.push(target);
            }
        }
    }

    let mut in_degree: HashMap<&str, usize> = nodes.iter().map(|n| (*n, 0)).collect();
    for targets in edges.values() {
        for target in targets {
            if let Some(d) = in_degree.get_mut(target) {
                *d += 1;
            }
        }
    }

    let mut queue: VecDeque<&str> = nodes.iter().copied().filter(|n| in_degree[n] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(node) = queue.pop_front() {
        order.push(node.to_string());
        for target in &edges[node] {
            if let Some(d) = in_degree.get_mut(target) {
                *d -= 1;
                if *d == 0 {
                    queue.push_back(target);
                }
            }
        }
    }

    let placed: HashSet<&str> = order.iter().map(String::as_str).collect();
    let unsorted = nodes
        .iter()
        .filter(|n| !placed.contains(*n))
        .map(|n| n.to_string())
        .collect();

    ExecutionOrder { order, unsorted }
}
