//! # Clusters
//!
//! Deployment targets referenced by pipeline definitions. A pipeline's
//! `cluster` is checked against this store by the DEPLOYMENT rule set.
//!
//! ```text
//!   PipelineStore ──validate──▶ EngineValidationContext ──▶ ModuleCatalog
//!                                                     └──▶ ClusterStore ──▶ KV
//! ```

pub mod context;
pub mod store;

pub use context::EngineValidationContext;
pub use store::{
    cluster_key, Cluster, ClusterError, ClusterRequest, ClusterResult, ClusterStore,
    CLUSTER_PREFIX, DEFAULT_CLUSTER,
};
