//! # Folio CLI
//!
//! Command-line interface for Folio, a local offline-first semantic search
//! engine over folders of documents.
//!
//! | Command | Description |
//! |---------|-------------|
//! | `folio init` | Create the data directory, registry and default container |
//! | `folio container list\|create\|delete\|use` | Manage containers |
//! | `folio path add\|remove DIR` | Register or unregister folders |
//! | `folio index` | Bring a container's index up to date |
//! | `folio rebuild` | Re-extract and re-embed every tracked file |
//! | `folio search "<query>"` | Semantic search |
//! | `folio status` | Container statistics |
//! | `folio reset` | Drop a container's index and start empty |
//! | `folio watch` | Index, then follow filesystem changes |
//! | `folio serve` | HTTP tool server |
//!
//! ```bash
//! folio init
//! folio container create notes --description "personal notes"
//! folio path add ~/notes --container notes
//! folio index --container notes
//! folio search "quarterly planning" --container notes -k 5
//! ```
//!
//! Logs go to stderr (`RUST_LOG`, default `folio=info`); command output
//! goes to stdout.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use folio::config;
use folio::container::ContainerManager;
use folio::progress::ProgressMode;
use folio::watch::ContainerWatcher;
use folio::{search, server, stats};
use folio_core::reconcile::DeltaMode;
use folio_core::search::{SearchMode, SearchOptions};

/// Folio — local semantic search over your folders.
///
/// All commands accept `--config` pointing to a TOML file. A missing file
/// means built-in defaults.
#[derive(Parser)]
#[command(
    name = "folio",
    about = "Folio — local, offline-first semantic search over folders of documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/folio.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory, registry and default container.
    ///
    /// Idempotent.
    Init,

    /// Manage containers.
    Container {
        #[command(subcommand)]
        action: ContainerAction,
    },

    /// Manage the folders a container indexes.
    Path {
        #[command(subcommand)]
        action: PathAction,
    },

    /// Bring a container's index up to date with its folders.
    ///
    /// Only new, changed and deleted files are processed.
    Index {
        /// Container (defaults to the active one).
        #[arg(long)]
        container: Option<String>,

        /// Emit progress as JSON lines on stderr.
        #[arg(long)]
        json_progress: bool,
    },

    /// Re-extract and re-embed every tracked file.
    ///
    /// Runs through the same delta path as `index`, so an interrupted
    /// rebuild leaves a usable index.
    Rebuild {
        #[arg(long)]
        container: Option<String>,

        #[arg(long)]
        json_progress: bool,
    },

    /// Search a container.
    Search {
        /// The search query.
        query: String,

        #[arg(long)]
        container: Option<String>,

        /// Maximum number of results (defaults to `retrieval.default_k`).
        #[arg(short, long)]
        k: Option<usize>,

        /// Return several matching chunks per document.
        #[arg(long)]
        multi_chunk: bool,

        /// Only documents under this folder.
        #[arg(long)]
        prefix: Option<PathBuf>,

        /// semantic, keyword, or hybrid (defaults to `retrieval.mode`).
        #[arg(long)]
        mode: Option<SearchMode>,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show a container's statistics.
    Status {
        #[arg(long)]
        container: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Drop a container's index and recreate it empty.
    ///
    /// Needed before switching to an embedding model with other dimensions.
    Reset {
        #[arg(long)]
        container: Option<String>,
    },

    /// Index a container, then keep it updated as files change.
    Watch {
        #[arg(long)]
        container: Option<String>,
    },

    /// Serve the tool API over HTTP on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum ContainerAction {
    /// List containers. The active one is marked with `*`.
    List,
    /// Create a container.
    Create {
        name: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Delete a container and its index. `Default` cannot be deleted.
    Delete { name: String },
    /// Make a container the default for commands without `--container`.
    Use { name: String },
}

#[derive(Subcommand)]
enum PathAction {
    /// Register a folder.
    Add {
        dir: PathBuf,
        #[arg(long)]
        container: Option<String>,
    },
    /// Unregister a folder and drop its documents.
    Remove {
        dir: PathBuf,
        #[arg(long)]
        container: Option<String>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("folio=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    let progress = match &cli.command {
        Commands::Index { json_progress, .. } | Commands::Rebuild { json_progress, .. } => {
            if *json_progress {
                ProgressMode::Json
            } else {
                ProgressMode::default_for_tty()
            }
        }
        Commands::Watch { .. } => ProgressMode::default_for_tty(),
        _ => ProgressMode::Off,
    };
    let manager = Arc::new(ContainerManager::from_config(cfg)?.with_progress(progress.reporter()));

    match cli.command {
        Commands::Init => {
            manager.init().await?;
            println!(
                "Initialized {} (active container: {})",
                manager.config().data.dir.display(),
                manager.active().await
            );
        }
        Commands::Container { action } => match action {
            ContainerAction::List => {
                let containers = manager.list().await;
                stats::print_containers(&containers, &manager.active().await);
            }
            ContainerAction::Create { name, description } => {
                manager.create(&name, &description).await?;
                println!("Created container '{}'.", name);
            }
            ContainerAction::Delete { name } => {
                manager.delete(&name).await?;
                println!("Deleted container '{}'.", name);
            }
            ContainerAction::Use { name } => {
                manager.set_active(&name).await?;
                println!("Active container: {}", name);
            }
        },
        Commands::Path { action } => match action {
            PathAction::Add { dir, container } => {
                let container = manager.resolve(container.as_deref()).await;
                let root = manager.add_path(&container, &dir).await?;
                println!("Added {} to '{}'.", root.display(), container);
            }
            PathAction::Remove { dir, container } => {
                let container = manager.resolve(container.as_deref()).await;
                let removed = manager.remove_path(&container, &dir).await?;
                println!(
                    "Removed {} from '{}' ({} documents dropped).",
                    dir.display(),
                    container,
                    removed
                );
            }
        },
        Commands::Index { container, .. } => {
            let container = manager.resolve(container.as_deref()).await;
            let report = manager.index(&container, DeltaMode::Incremental).await?;
            stats::print_report(&report);
        }
        Commands::Rebuild { container, .. } => {
            let container = manager.resolve(container.as_deref()).await;
            let report = manager.index(&container, DeltaMode::Rebuild).await?;
            stats::print_report(&report);
        }
        Commands::Search {
            query,
            container,
            k,
            multi_chunk,
            prefix,
            mode,
            json,
        } => {
            let opts = SearchOptions {
                mode: mode.unwrap_or(manager.config().retrieval.mode),
                multi_chunk,
                prefix,
            };
            search::run_search(&manager, container.as_deref(), &query, k, opts, json).await?;
        }
        Commands::Status { container, json } => {
            let container = manager.resolve(container.as_deref()).await;
            let status = manager.status(&container).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                stats::print_status(&status);
            }
        }
        Commands::Reset { container } => {
            let container = manager.resolve(container.as_deref()).await;
            manager.reset(&container).await?;
            println!("Reset index of '{}'.", container);
        }
        Commands::Watch { container } => {
            let container = manager.resolve(container.as_deref()).await;
            let report = manager.index(&container, DeltaMode::Incremental).await?;
            stats::print_report(&report);

            let debounce = Duration::from_millis(manager.config().watch.debounce_ms);
            let watcher = ContainerWatcher::start(manager.clone(), &container, debounce).await?;
            println!(
                "Watching {} folder(s) of '{}'. Press Ctrl-C to stop.",
                watcher.roots.len(),
                container
            );
            tokio::signal::ctrl_c().await?;
            manager.stop(&container);
            watcher.shutdown().await;
        }
        Commands::Serve => {
            server::run_server(manager).await?;
        }
    }

    Ok(())
}
