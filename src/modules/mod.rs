//! Processing modules: descriptors, instances, health probing and the
//! lifecycle manager that drives them.

pub mod descriptor;
pub mod health;
pub mod instance;
pub mod lifecycle;

pub use descriptor::{Capabilities, CatalogError, ModuleCatalog, ModuleDescriptor, ModuleType};
pub use health::{
    probe_from_config, HealthConfig, HealthPolicy, HealthProbe, HealthProbeResult, ProbeKind,
    ProbeTarget, StaticProbe,
};
pub use instance::{DeploymentState, ModuleInstance, Sidecar};
pub use lifecycle::{
    Collaborators, LifecycleConfig, LifecycleError, LifecycleManager, RegistrationRecord,
    REGISTRATION_PREFIX,
};
