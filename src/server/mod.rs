//! HTTP API server: shared state, routes and the discovery dashboard

pub mod api;
pub mod dashboard;
pub mod resources;
pub mod state;

pub use api::{create_router, Accepted, CleanupResponse, ResolvedService};
pub use dashboard::{summarize, Dashboard, DashboardStatistics, ServiceSummary};
pub use resources::{OperationStatus, ResourceList};
pub use state::{collaborators_from_config, spawn_pipeline_follower, AppState, BackgroundTasks};
