//! CLI module for modplane
//!
//! Provides kubectl-like subcommands:
//! - `modplane serve` - Run the engine API server
//! - `modplane validate` - Validate a pipeline definition offline
//! - `modplane get` - List resources (modules, deployed, orphaned, pipelines, clusters, dashboard)
//! - `modplane deploy` / `scale-up` / `undeploy` - Module lifecycle against the current context
//! - `modplane cleanup-zombies` - Deregister zombie registrations
//! - `modplane events` - Follow deployment events
//! - `modplane context` - Manage contexts

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use crate::pipeline::ValidationMode;

mod commands;
mod display;

pub use commands::*;
pub use display::*;

#[derive(Parser, Debug)]
#[command(name = "modplane")]
#[command(about = "Control plane for processing modules and pipelines")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to the context file (default: ~/.modplane/config.yaml)
    #[arg(long, global = true, env = "MODPLANE_CONTEXTS")]
    pub contexts: Option<PathBuf>,

    /// Use this context instead of the current one
    #[arg(long, global = true)]
    pub context: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the engine API server
    Serve(ServeArgs),

    /// Validate a pipeline definition file without a running engine
    Validate(ValidateArgs),

    /// Get/list resources
    Get(GetArgs),

    /// Deploy a new instance of a module
    Deploy(ModuleArgs),

    /// Add one more instance of a module
    #[command(name = "scale-up")]
    ScaleUp(ModuleArgs),

    /// Undeploy a module's instances, or a single instance
    Undeploy(UndeployArgs),

    /// Deregister registrations no tracked instance owns
    #[command(name = "cleanup-zombies")]
    CleanupZombies,

    /// Follow the deployment event stream
    Events(EventsArgs),

    /// Manage engine contexts
    #[command(visible_alias = "ctx")]
    Context(ContextArgs),
}

/// Arguments for the serve command
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Engine config file (YAML or JSON)
    #[arg(short, long, value_name = "FILE", env = "MODPLANE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the bind address
    #[arg(long, value_name = "ADDR", env = "MODPLANE_BIND_ADDR")]
    pub bind_addr: Option<String>,

    /// Override the API port
    #[arg(short, long, value_name = "PORT", env = "MODPLANE_PORT")]
    pub port: Option<u16>,

    /// Override the Consul URL (switches the registry backend to consul)
    #[arg(long, value_name = "URL", env = "MODPLANE_REGISTRY_URL")]
    pub registry_url: Option<String>,

    /// Path to a .env file loaded before the config
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,
}

/// Arguments for the validate command
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Pipeline definition (YAML or JSON)
    pub file: PathBuf,

    /// Validation mode
    #[arg(long, default_value = "DEPLOY")]
    pub mode: ValidationMode,

    /// Engine config whose module catalog the steps are checked against
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

/// Arguments for the get command
#[derive(Parser, Debug)]
pub struct GetArgs {
    #[command(subcommand)]
    pub resource: GetResource,

    /// Print the raw JSON response
    #[arg(short, long, global = true)]
    pub output_json: bool,
}

#[derive(Subcommand, Debug)]
pub enum GetResource {
    /// Modules available in the catalog
    #[command(visible_alias = "available")]
    Modules,

    /// Deployed instances, optionally of one module
    #[command(visible_alias = "instances")]
    Deployed {
        /// Module name
        module: Option<String>,
    },

    /// Engine-labelled containers nothing tracks
    Orphaned,

    /// Pipeline definitions, or one by id
    #[command(visible_alias = "pipeline")]
    Pipelines {
        /// Pipeline id
        id: Option<String>,
    },

    /// Clusters
    #[command(visible_alias = "cluster")]
    Clusters,

    /// Registry dashboard
    Dashboard,
}

/// A module name argument
#[derive(Parser, Debug)]
pub struct ModuleArgs {
    /// Module name
    pub module: String,
}

/// Arguments for the undeploy command
#[derive(Parser, Debug)]
pub struct UndeployArgs {
    /// Module name
    pub module: String,

    /// Only this instance
    #[arg(long, value_name = "ID")]
    pub instance: Option<String>,
}

/// Arguments for the events command
#[derive(Parser, Debug)]
pub struct EventsArgs {
    /// Only show events for this module
    #[arg(long)]
    pub module: Option<String>,
}

/// Arguments for the context command
#[derive(Parser, Debug)]
pub struct ContextArgs {
    #[command(subcommand)]
    pub action: ContextAction,
}

#[derive(Subcommand, Debug)]
pub enum ContextAction {
    /// List all contexts
    List,

    /// Show current context
    Current,

    /// Switch to a context
    Use {
        /// Context name
        name: String,
    },

    /// Add a new context
    Add {
        /// Context name
        name: String,

        /// Engine URL
        #[arg(long)]
        url: String,

        /// Bearer token for authentication
        #[arg(long)]
        token: Option<String>,

        /// Free-form description
        #[arg(long)]
        description: Option<String>,
    },

    /// Delete a context
    Delete {
        /// Context name
        name: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serve_overrides() {
        let cli = Cli::parse_from([
            "modplane",
            "serve",
            "--config",
            "engine.yaml",
            "--port",
            "9000",
            "--registry-url",
            "http://consul:8500",
        ]);
        match cli.command {
            Commands::Serve(args) => {
                assert_eq!(args.config, Some(PathBuf::from("engine.yaml")));
                assert_eq!(args.port, Some(9000));
                assert_eq!(args.registry_url.as_deref(), Some("http://consul:8500"));
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_parse_validate_mode() {
        let cli = Cli::parse_from(["modplane", "validate", "p.yaml"]);
        match cli.command {
            Commands::Validate(args) => assert_eq!(args.mode, ValidationMode::Deploy),
            _ => panic!("Expected Validate command"),
        }

        let cli = Cli::parse_from(["modplane", "validate", "p.yaml", "--mode", "design"]);
        match cli.command {
            Commands::Validate(args) => assert_eq!(args.mode, ValidationMode::Design),
            _ => panic!("Expected Validate command"),
        }
    }

    #[test]
    fn test_parse_get_deployed_for_module() {
        let cli = Cli::parse_from(["modplane", "get", "deployed", "echo"]);
        match cli.command {
            Commands::Get(args) => match args.resource {
                GetResource::Deployed { module } => assert_eq!(module.as_deref(), Some("echo")),
                _ => panic!("Expected Deployed resource"),
            },
            _ => panic!("Expected Get command"),
        }
    }

    #[test]
    fn test_parse_get_alias() {
        let cli = Cli::parse_from(["modplane", "get", "available"]);
        match cli.command {
            Commands::Get(args) => assert!(matches!(args.resource, GetResource::Modules)),
            _ => panic!("Expected Get command"),
        }
    }

    #[test]
    fn test_parse_undeploy_instance() {
        let cli = Cli::parse_from(["modplane", "undeploy", "echo", "--instance", "echo-1a2b"]);
        match cli.command {
            Commands::Undeploy(args) => {
                assert_eq!(args.module, "echo");
                assert_eq!(args.instance.as_deref(), Some("echo-1a2b"));
            }
            _ => panic!("Expected Undeploy command"),
        }
    }

    #[test]
    fn test_parse_scale_up_and_cleanup() {
        let cli = Cli::parse_from(["modplane", "scale-up", "echo"]);
        assert!(matches!(cli.command, Commands::ScaleUp(ModuleArgs { ref module }) if module == "echo"));

        let cli = Cli::parse_from(["modplane", "cleanup-zombies"]);
        assert!(matches!(cli.command, Commands::CleanupZombies));
    }

    #[test]
    fn test_parse_context_add() {
        let cli = Cli::parse_from([
            "modplane",
            "context",
            "add",
            "staging",
            "--url",
            "http://10.0.0.5:38082",
            "--token",
            "secret",
        ]);
        match cli.command {
            Commands::Context(args) => match args.action {
                ContextAction::Add { name, url, token, .. } => {
                    assert_eq!(name, "staging");
                    assert_eq!(url, "http://10.0.0.5:38082");
                    assert_eq!(token.as_deref(), Some("secret"));
                }
                _ => panic!("Expected Add action"),
            },
            _ => panic!("Expected Context command"),
        }
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::parse_from(["modplane", "-vv", "get", "clusters", "--context", "staging"]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.context.as_deref(), Some("staging"));
    }
}
