use std::path::Path;

use anyhow::{bail, Context as _};
use chrono::Utc;
use clap::Parser;
use futures::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use modplane::cli::*;
use modplane::context::{default_context_path, load_context_file, save_context_file, Context};
use modplane::server::{create_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let contexts_path = cli.contexts.clone().unwrap_or_else(default_context_path);

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Validate(args) => validate(args).await,
        Commands::Context(args) => context(args.action, &contexts_path),
        Commands::Get(args) => {
            let client = client(&contexts_path, cli.context.as_deref())?;
            get(&client, args).await
        }
        Commands::Deploy(args) => {
            let client = client(&contexts_path, cli.context.as_deref())?;
            print!("{}", format_accepted(&client.deploy(&args.module).await?));
            Ok(())
        }
        Commands::ScaleUp(args) => {
            let client = client(&contexts_path, cli.context.as_deref())?;
            print!("{}", format_accepted(&client.scale_up(&args.module).await?));
            Ok(())
        }
        Commands::Undeploy(args) => {
            let client = client(&contexts_path, cli.context.as_deref())?;
            let accepted = client.undeploy(&args.module, args.instance.as_deref()).await?;
            print!("{}", format_accepted(&accepted));
            Ok(())
        }
        Commands::CleanupZombies => {
            let client = client(&contexts_path, cli.context.as_deref())?;
            let removed = client.cleanup_zombies().await?;
            println!("Removed {} zombie registration(s)", removed);
            Ok(())
        }
        Commands::Events(args) => {
            let client = client(&contexts_path, cli.context.as_deref())?;
            follow_events(&client, args.module.as_deref()).await
        }
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    // Before the config so MODPLANE_* variables in the file are visible
    match &args.env_file {
        Some(env_file) => {
            dotenvy::from_path(env_file)
                .with_context(|| format!("Failed to load env file {}", env_file.display()))?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    let config = serve_config(&args)?;
    let state = AppState::from_config(&config)?;
    let background = state.spawn_background(&config);

    info!(
        "Loaded {} module descriptor(s), engine id {}",
        state.catalog.len(),
        config.runtime.engine_id
    );

    let addr = config.server.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Engine API listening on {}", addr);
    info!("Endpoints:");
    info!("  GET  /health                                - Liveness");
    info!("  GET  /api/v1/module-discovery/dashboard     - Registry dashboard");
    info!("  *    /api/v1/module-management/...          - Module lifecycle");
    info!("  *    /api/v1/pipelines/definitions/...      - Pipeline definitions");
    info!("  GET  /api/v1/module-deployment/events       - Deployment events (SSE)");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    background.shutdown();
    info!("Engine stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

async fn validate(args: ValidateArgs) -> anyhow::Result<()> {
    let result = validate_pipeline_file(&args.file, args.mode, args.config.as_deref()).await?;
    print!("{}", format_validation(&result));
    if !result.valid {
        bail!("{} is not valid in {} mode", args.file.display(), args.mode);
    }
    Ok(())
}

fn client(contexts_path: &Path, name: Option<&str>) -> anyhow::Result<EngineClient> {
    let file = load_context_file(contexts_path)?;
    let context: Context = match name {
        Some(name) => file.resolve(name)?,
        None => file.current()?,
    };
    Ok(EngineClient::from_context(&context))
}

fn context(action: ContextAction, path: &Path) -> anyhow::Result<()> {
    let mut file = load_context_file(path)?;

    match action {
        ContextAction::List => print!("{}", format_context_list(&context_list(&file))),
        ContextAction::Current => {
            let (name, url) = context_current(&file)?;
            print!("{}", format_current_context(&name, &url));
        }
        ContextAction::Use { name } => {
            context_use(&mut file, &name)?;
            save_context_file(&file, path)?;
            println!("Switched to context \"{}\"", name);
        }
        ContextAction::Add {
            name,
            url,
            token,
            description,
        } => {
            context_add(&mut file, &name, &url, token.as_deref(), description.as_deref())?;
            save_context_file(&file, path)?;
            println!("Context \"{}\" added", name);
        }
        ContextAction::Delete { name } => {
            context_delete(&mut file, &name)?;
            save_context_file(&file, path)?;
            println!("Context \"{}\" deleted", name);
        }
    }

    Ok(())
}

async fn get(client: &EngineClient, args: GetArgs) -> anyhow::Result<()> {
    let json = args.output_json;
    let output = match args.resource {
        GetResource::Modules => {
            let modules = client.list_modules().await?;
            render(json, &modules, || format_module_list(&modules))?
        }
        GetResource::Deployed { module } => {
            let instances = client.list_deployed(module.as_deref()).await?;
            render(json, &instances, || format_instance_list(&instances, Utc::now()))?
        }
        GetResource::Orphaned => {
            let orphans = client.list_orphaned().await?;
            render(json, &orphans, || format_orphan_list(&orphans))?
        }
        GetResource::Pipelines { id: Some(id) } => {
            let pipeline = client.get_pipeline(&id).await?;
            render(json, &pipeline, || format_pipeline_detail(&pipeline))?
        }
        GetResource::Pipelines { id: None } => {
            let pipelines = client.list_pipelines().await?;
            render(json, &pipelines, || format_pipeline_list(&pipelines))?
        }
        GetResource::Clusters => {
            let clusters = client.list_clusters().await?;
            render(json, &clusters, || format_cluster_list(&clusters))?
        }
        GetResource::Dashboard => {
            let dashboard = client.dashboard().await?;
            render(json, &dashboard, || format_dashboard(&dashboard))?
        }
    };
    print!("{}", output);
    Ok(())
}

fn render<T: serde::Serialize>(
    json: bool,
    value: &T,
    table: impl FnOnce() -> String,
) -> anyhow::Result<String> {
    if json {
        Ok(format!("{}\n", serde_json::to_string_pretty(value)?))
    } else {
        Ok(table())
    }
}

async fn follow_events(client: &EngineClient, module: Option<&str>) -> anyhow::Result<()> {
    let events = client.events().await?;
    futures::pin_mut!(events);

    eprintln!("Following deployment events from {} (Ctrl-C to stop)", client.base_url());
    while let Some(event) = events.next().await {
        match event {
            Ok(event) if event_matches(&event, module) => println!("{}", format_event(&event)),
            Ok(_) => {}
            Err(e) => warn!("Skipping event: {}", e),
        }
    }

    eprintln!("Event stream closed by the engine");
    Ok(())
}
