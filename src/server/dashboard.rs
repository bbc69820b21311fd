//! Module discovery dashboard
//!
//! Splits the registry catalog into base services (infrastructure the engine
//! does not manage) and module services, with counts for the dashboard header.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::registry::ServiceInstance;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dashboard {
    pub base_services: Vec<ServiceSummary>,
    pub module_services: Vec<ServiceSummary>,
    pub statistics: DashboardStatistics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSummary {
    pub name: String,
    pub instances: Vec<ServiceEndpoint>,
    pub healthy_instances: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grpc_services: Vec<String>,
}

impl ServiceSummary {
    pub fn is_healthy(&self) -> bool {
        self.healthy_instances > 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub healthy: bool,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardStatistics {
    pub total_base_services: usize,
    pub total_modules: usize,
    /// Modules with at least one healthy, enabled instance
    pub healthy_modules: usize,
    pub zombie_count: usize,
}

/// Group advertised instances by service. A service is a module service when
/// any of its instances carries the engine's module tag or its name is in
/// the catalog.
pub fn summarize(advertised: &[ServiceInstance], catalog: &HashSet<String>, zombie_count: usize) -> Dashboard {
    let mut grouped: BTreeMap<&str, Vec<&ServiceInstance>> = BTreeMap::new();
    for instance in advertised {
        grouped.entry(instance.service.as_str()).or_default().push(instance);
    }

    let mut base_services = Vec::new();
    let mut module_services = Vec::new();
    for (name, instances) in grouped {
        let is_module = catalog.contains(name) || instances.iter().any(|i| i.is_module());
        let grpc_services: BTreeSet<String> = instances.iter().flat_map(|i| i.grpc_services()).collect();
        let summary = ServiceSummary {
            name: name.to_string(),
            healthy_instances: instances.iter().filter(|i| i.is_eligible()).count(),
            instances: instances
                .iter()
                .map(|i| ServiceEndpoint {
                    id: i.id.clone(),
                    address: i.address.clone(),
                    port: i.port,
                    healthy: i.healthy,
                    enabled: i.enabled,
                })
                .collect(),
            grpc_services: grpc_services.into_iter().collect(),
        };
        if is_module {
            module_services.push(summary);
        } else {
            base_services.push(summary);
        }
    }

    let statistics = DashboardStatistics {
        total_base_services: base_services.len(),
        total_modules: module_services.len(),
        healthy_modules: module_services.iter().filter(|s| s.is_healthy()).count(),
        zombie_count,
    };

    Dashboard {
        base_services,
        module_services,
        statistics,
    }
}
