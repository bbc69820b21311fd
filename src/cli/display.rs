//! Display formatting for CLI output
//!
//! SBIO pattern: Pure functions that format data for display

use chrono::{DateTime, Utc};

use super::commands::ContextInfo;
use crate::cluster::Cluster;
use crate::events::DeploymentEvent;
use crate::modules::{ModuleDescriptor, ModuleInstance};
use crate::pipeline::{StoredPipeline, ValidationResult};
use crate::reconcile::OrphanRecord;
use crate::server::{Accepted, Dashboard, ServiceSummary};

// ============================================================================
// Table formatting helpers
// ============================================================================

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "No resources found.\n".to_string();
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let mut output = String::new();

    for (i, header) in headers.iter().enumerate() {
        if i > 0 {
            output.push_str("   ");
        }
        output.push_str(&format!(
            "{:width$}",
            header.to_uppercase(),
            width = widths[i]
        ));
    }
    output.push('\n');

    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i > 0 {
                output.push_str("   ");
            }
            if i < widths.len() {
                output.push_str(&format!("{:width$}", cell, width = widths[i]));
            } else {
                output.push_str(cell);
            }
        }
        output.push('\n');
    }

    output
}

/// Human readable age like `5m` or `3d`
pub fn format_age(since: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - since).num_seconds().max(0);
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86400)
    }
}

fn or_dash(value: Option<&str>) -> String {
    value.unwrap_or("-").to_string()
}

// ============================================================================
// Context display
// ============================================================================

pub fn format_context_list(contexts: &[ContextInfo]) -> String {
    let headers = &["", "NAME", "URL"];
    let rows: Vec<Vec<String>> = contexts
        .iter()
        .map(|ctx| {
            vec![
                if ctx.is_current { "*" } else { " " }.to_string(),
                ctx.name.clone(),
                ctx.url.clone(),
            ]
        })
        .collect();

    format_table(headers, rows)
}

pub fn format_current_context(name: &str, url: &str) -> String {
    format!("Current context: {} ({})\n", name, url)
}

// ============================================================================
// Module display
// ============================================================================

pub fn format_module_list(modules: &[ModuleDescriptor]) -> String {
    let headers = &["NAME", "TYPE", "IMAGE", "GRPC SERVICES"];
    let rows = modules
        .iter()
        .map(|m| {
            vec![
                m.name.clone(),
                m.module_type.as_str().to_string(),
                m.image.clone(),
                if m.grpc_services.is_empty() {
                    "-".to_string()
                } else {
                    m.grpc_services.join(",")
                },
            ]
        })
        .collect();

    format_table(headers, rows)
}

pub fn format_instance_list(instances: &[ModuleInstance], now: DateTime<Utc>) -> String {
    let headers = &["INSTANCE", "MODULE", "STATE", "ADDRESS", "HEALTHY", "ENABLED", "AGE"];
    let rows = instances
        .iter()
        .map(|i| {
            vec![
                i.instance_id.clone(),
                i.module_name.clone(),
                i.state.to_string(),
                format!("{}:{}", i.address, i.port),
                yes_no(i.healthy),
                yes_no(i.enabled),
                format_age(i.created_at, now),
            ]
        })
        .collect();

    format_table(headers, rows)
}

pub fn format_orphan_list(orphans: &[OrphanRecord]) -> String {
    let headers = &["CONTAINER", "NAME", "INSTANCE", "MODULE", "IMAGE"];
    let rows = orphans
        .iter()
        .map(|o| {
            vec![
                short_id(&o.container_id),
                o.container_name.clone(),
                o.instance_id.clone(),
                or_dash(o.module_name.as_deref()),
                o.image.clone(),
            ]
        })
        .collect();

    format_table(headers, rows)
}

pub fn format_accepted(accepted: &Accepted) -> String {
    let mut output = format!("{}\n", accepted.message);
    for id in &accepted.instance_ids {
        output.push_str(&format!("  {}\n", id));
    }
    output
}

fn yes_no(flag: bool) -> String {
    if flag { "yes" } else { "no" }.to_string()
}

/// Docker-style 12 character container id
fn short_id(id: &str) -> String {
    id.chars().take(12).collect()
}

// ============================================================================
// Pipeline display
// ============================================================================

pub fn format_pipeline_list(pipelines: &[StoredPipeline]) -> String {
    let headers = &["NAME", "STEPS", "CLUSTER", "VALID", "ERRORS", "WARNINGS"];
    let rows = pipelines
        .iter()
        .map(|p| {
            let status = &p.validation_status;
            vec![
                p.definition.name.clone(),
                p.definition.steps.len().to_string(),
                or_dash(p.definition.cluster.as_deref()),
                yes_no(status.valid),
                status.summary.errors.to_string(),
                status.summary.warnings.to_string(),
            ]
        })
        .collect();

    format_table(headers, rows)
}

pub fn format_pipeline_detail(pipeline: &StoredPipeline) -> String {
    let def = &pipeline.definition;
    let mut output = String::new();

    output.push_str(&format!("Name:        {}\n", def.name));
    if let Some(desc) = &def.description {
        output.push_str(&format!("Description: {}\n", desc));
    }
    output.push_str(&format!("Cluster:     {}\n", or_dash(def.cluster.as_deref())));

    output.push_str("Steps:\n");
    for (name, step) in def.steps.iter() {
        let module = step.module_name().unwrap_or("<none>");
        if step.outputs.is_empty() {
            output.push_str(&format!("  {} ({})\n", name, module));
        } else {
            output.push_str(&format!("  {} ({}) -> {}\n", name, module, step.outputs.join(", ")));
        }
    }

    output.push('\n');
    output.push_str(&format_validation(&pipeline.validation_status));
    output
}

pub fn format_validation(result: &ValidationResult) -> String {
    let mut output = String::new();
    output.push_str(&format!(
        "Validation: {} ({} errors, {} warnings, {} infos)\n",
        if result.valid { "VALID" } else { "INVALID" },
        result.summary.errors,
        result.summary.warnings,
        result.summary.infos
    ));

    for issue in &result.issues {
        let location = match (&issue.step_name, &issue.field) {
            (Some(step), Some(field)) => format!(" [{}.{}]", step, field),
            (Some(step), None) => format!(" [{}]", step),
            (None, Some(field)) => format!(" [{}]", field),
            (None, None) => String::new(),
        };
        output.push_str(&format!(
            "  {:<7} {}{}: {}\n",
            issue.severity.to_string(),
            issue.rule,
            location,
            issue.message
        ));
    }

    output
}

// ============================================================================
// Cluster and dashboard display
// ============================================================================

pub fn format_cluster_list(clusters: &[Cluster]) -> String {
    let headers = &["NAME", "DESCRIPTION", "CREATED"];
    let rows = clusters
        .iter()
        .map(|c| {
            vec![
                c.name.clone(),
                or_dash(c.description.as_deref()),
                c.created_at
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect();

    format_table(headers, rows)
}

fn service_rows(services: &[ServiceSummary]) -> Vec<Vec<String>> {
    services
        .iter()
        .map(|s| {
            vec![
                s.name.clone(),
                format!("{}/{}", s.healthy_instances, s.instances.len()),
                if s.grpc_services.is_empty() {
                    "-".to_string()
                } else {
                    s.grpc_services.join(",")
                },
            ]
        })
        .collect()
}

pub fn format_dashboard(dashboard: &Dashboard) -> String {
    let stats = &dashboard.statistics;
    let mut output = format!(
        "Modules: {} ({} healthy)   Base services: {}   Zombies: {}\n\n",
        stats.total_modules, stats.healthy_modules, stats.total_base_services, stats.zombie_count
    );

    let headers = &["SERVICE", "HEALTHY", "GRPC SERVICES"];
    output.push_str("Module services:\n");
    output.push_str(&format_table(headers, service_rows(&dashboard.module_services)));
    output.push_str("\nBase services:\n");
    output.push_str(&format_table(headers, service_rows(&dashboard.base_services)));
    output
}

// ============================================================================
// Event display
// ============================================================================

pub fn format_event(event: &DeploymentEvent) -> String {
    let mut line = format!(
        "{} #{:<4} {:<20} {:<16} {}",
        event.timestamp.format("%H:%M:%S"),
        event.sequence,
        event.kind.as_str(),
        event.instance_id.as_deref().unwrap_or(&event.module_name),
        event.message
    );
    if let Some(reason) = &event.reason {
        line.push_str(&format!(" ({})", reason));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DeploymentEventKind;
    use crate::modules::{DeploymentState, ModuleType};
    use crate::pipeline::{PipelineDefinition, RuleSet, Severity, StepConfig, ValidationIssue};
    use chrono::Duration;

    #[test]
    fn test_format_table_empty() {
        assert_eq!(format_table(&["NAME"], vec![]), "No resources found.\n");
    }

    #[test]
    fn test_format_table_alignment() {
        let out = format_table(
            &["name", "type"],
            vec![vec!["echo".into(), "PROCESSOR".into()], vec!["registrar".into(), "REGISTRAR".into()]],
        );
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "NAME        TYPE     ");
        assert!(lines[1].starts_with("echo        PROCESSOR"));
        assert!(lines[2].starts_with("registrar   REGISTRAR"));
    }

    #[test]
    fn test_format_age() {
        let now = Utc::now();
        assert_eq!(format_age(now - Duration::seconds(42), now), "42s");
        assert_eq!(format_age(now - Duration::minutes(5), now), "5m");
        assert_eq!(format_age(now - Duration::hours(3), now), "3h");
        assert_eq!(format_age(now - Duration::days(2), now), "2d");
        assert_eq!(format_age(now + Duration::seconds(5), now), "0s");
    }

    #[test]
    fn test_format_context_list() {
        let out = format_context_list(&[
            ContextInfo {
                name: "local".into(),
                url: "http://localhost:38082".into(),
                is_current: true,
            },
            ContextInfo {
                name: "prod".into(),
                url: "http://prod:38082".into(),
                is_current: false,
            },
        ]);
        assert!(out.contains("*   local"));
        assert!(out.contains("prod"));
    }

    #[test]
    fn test_format_module_list() {
        let mut echo = ModuleDescriptor::new("echo", ModuleType::Processor, "modplane/echo:1");
        echo.grpc_services = vec!["ai.modplane.PipeStepProcessor".into()];
        let out = format_module_list(&[echo]);
        assert!(out.contains("PROCESSOR"));
        assert!(out.contains("ai.modplane.PipeStepProcessor"));
    }

    #[test]
    fn test_format_instance_list() {
        let now = Utc::now();
        let instance = ModuleInstance {
            instance_id: "echo-1a2b3c".into(),
            module_name: "echo".into(),
            state: DeploymentState::Active,
            address: "10.0.0.7".into(),
            port: 50051,
            container_id: None,
            healthy: true,
            registered: true,
            enabled: true,
            grpc_services: Default::default(),
            sidecars: vec![],
            adopted: false,
            failure_reason: None,
            created_at: now - Duration::minutes(10),
            updated_at: now,
        };
        let out = format_instance_list(&[instance], now);
        assert!(out.contains("echo-1a2b3c"));
        assert!(out.contains("ACTIVE"));
        assert!(out.contains("10.0.0.7:50051"));
        assert!(out.contains("10m"));
    }

    #[test]
    fn test_format_validation_locations() {
        let result = ValidationResult::from_issues(vec![
            ValidationIssue::new(RuleSet::Steps, "moduleExists", Severity::Error, "Module 'ghost' not found")
                .at_step("a", 0)
                .on_field("module"),
            ValidationIssue::new(RuleSet::Metadata, "descriptionPresent", Severity::Info, "No description"),
        ]);
        let out = format_validation(&result);
        assert!(out.starts_with("Validation: INVALID (1 errors, 0 warnings, 1 infos)"));
        assert!(out.contains("ERROR   moduleExists [a.module]: Module 'ghost' not found"));
        assert!(out.contains("INFO    descriptionPresent: No description"));
    }

    #[test]
    fn test_format_pipeline_detail() {
        let def = PipelineDefinition::new("p1")
            .with_step("a", StepConfig::new("echo").with_outputs(["b"]))
            .with_step("b", StepConfig::new("echo"));
        let stored = StoredPipeline {
            definition: def,
            validation_status: ValidationResult::from_issues(vec![]),
        };
        let out = format_pipeline_detail(&stored);
        assert!(out.contains("a (echo) -> b"));
        assert!(out.contains("b (echo)\n"));
        assert!(out.contains("Validation: VALID"));
    }

    #[test]
    fn test_format_event_with_reason() {
        let event = DeploymentEvent::failed("echo", "echo-1", "health timeout");
        let out = format_event(&event);
        assert!(out.contains(DeploymentEventKind::DeploymentFailed.as_str()));
        assert!(out.contains("echo-1"));
        assert!(out.contains("(health timeout)"));
    }
}
