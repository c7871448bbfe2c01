//! Calypso CLI - semantic index service from the command line.
//!
//! `calypso serve` runs the HTTP service; `register`, `stats`, and `gc` are
//! operator conveniences against the same store.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

/// Calypso: workspace-scoped semantic index cache and query service.
#[derive(Parser)]
#[command(name = "calypso")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to a YAML settings file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP service
    Serve {
        /// Override the bind host
        #[arg(long)]
        host: Option<String>,

        /// Override the bind port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Register a workspace from its manifest
    Register {
        /// Workspace identifier (must match the manifest)
        workspace_id: String,

        /// Workspace root directory
        root: PathBuf,

        /// Manifest path (defaults to <root>/workspace.yaml)
        #[arg(long)]
        manifest: Option<PathBuf>,
    },

    /// Show store statistics
    Stats,

    /// Run one context GC sweep and exit
    Gc,
}

fn main() -> ExitCode {
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
        .with_target(false)
        .init();

    let result = run(cli);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {e}", "error".red().bold());
            let mut source = std::error::Error::source(&e);
            while let Some(cause) = source {
                eprintln!("  {}: {cause}", "caused by".dimmed());
                source = std::error::Error::source(cause);
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> calypso::Result<()> {
    let mut settings = calypso::Settings::load(cli.config.as_deref())?;

    let runtime = tokio::runtime::Runtime::new()?;
    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                settings.host = host;
            }
            if let Some(port) = port {
                settings.port = port;
            }
            runtime.block_on(serve(settings))
        }
        Commands::Register {
            workspace_id,
            root,
            manifest,
        } => {
            let state = calypso::build_app_state(settings)?;
            let manifest_path = manifest
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            let repos = state.orchestrator.register_workspace(
                &workspace_id,
                &root.to_string_lossy(),
                &manifest_path,
            )?;
            println!(
                "registered workspace {} with {} repos: {}",
                workspace_id.bold(),
                repos.len(),
                repos.join(", ")
            );
            Ok(())
        }
        Commands::Stats => {
            let state = calypso::build_app_state(settings)?;
            println!("tracked files:   {}", state.store.count_tracked_files(None)?);
            println!("symbols:         {}", state.store.count_symbols(None)?);
            println!("active contexts: {}", state.store.count_active_contexts()?);
            println!("index queue:     {}", state.store.index_queue_depth()?);
            println!("sync queue:      {}", state.store.sync_queue_depth()?);
            println!("store size:      {} bytes", state.store.disk_usage_bytes());
            Ok(())
        }
        Commands::Gc => {
            let state = calypso::build_app_state(settings)?;
            let expired = runtime.block_on(async { state.contexts.gc_once().await })?;
            println!("expired {} contexts", expired.len());
            Ok(())
        }
    }
}

async fn serve(settings: calypso::Settings) -> calypso::Result<()> {
    let addr = format!("{}:{}", settings.host, settings.port);
    let state = calypso::build_app_state(settings)?;

    // Background machinery: context GC and the sync worker pool.
    let _gc = std::sync::Arc::clone(&state.contexts).spawn_gc_task();
    let _workers = std::sync::Arc::clone(&state.sync).spawn_workers();

    let app = calypso::router(std::sync::Arc::clone(&state));
    tracing::info!(addr = %addr, "calypso listening");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .await
        .map_err(|e| calypso::Error::Internal(format!("server error: {e}")))?;
    Ok(())
}
