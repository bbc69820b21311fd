//! modplane: control plane for processing modules
//!
//! Deploys module containers and tracks them through their lifecycle,
//! keeps the service registry in step with what actually runs, caches
//! gRPC channels to registered modules, and stores and validates the
//! pipeline definitions that wire modules together.

pub mod cli;
pub mod cluster;
pub mod config;
pub mod connections;
pub mod context;
pub mod error;
pub mod events;
pub mod metrics;
pub mod modules;
pub mod naming;
pub mod pipeline;
pub mod reconcile;
pub mod registry;
pub mod runtime;
pub mod server;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use server::{create_router, AppState};
