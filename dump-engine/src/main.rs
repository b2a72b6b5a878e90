//! tego-dump - command-line front end for the dump engine.
//!
//! Data comes from a JSON repository snapshot (`--fixture`).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dump_engine::{config::Config, utils, DumpEvent, DumpRequest, DumpService, MemoryRepository};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Storage root (overrides config)
    #[arg(short, long, value_name = "DIR")]
    storage: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Dump the selected groups into a new archive
    Dump {
        /// Repository snapshot to dump
        #[arg(short, long, value_name = "FILE")]
        fixture: PathBuf,

        /// Group to include (repeatable); `required` is always included
        #[arg(short, long = "group")]
        groups: Vec<String>,

        /// Sub-app whose backup directory receives the archive
        #[arg(short, long)]
        app: Option<String>,

        /// User to push progress to
        #[arg(short, long)]
        user: Option<String>,

        /// Archive name, generated when omitted
        #[arg(long)]
        file_name: Option<String>,
    },

    /// Print the status of one backup file as JSON
    Status {
        file: String,

        #[arg(short, long)]
        app: Option<String>,
    },

    /// List backup files, newest first
    List {
        #[arg(short, long)]
        app: Option<String>,

        /// Include dumps still in progress
        #[arg(long)]
        all: bool,
    },

    /// Print the dumpable collections grouped by dump group
    Collections {
        #[arg(short, long, value_name = "FILE")]
        fixture: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        Config::from_file(config_path).with_context(|| format!("loading {}", config_path.display()))?
    } else {
        Config::default()
    };
    if let Some(root) = args.storage {
        config.storage.root = root;
    }

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::debug!("tego-dump v{}, storage {}", env!("CARGO_PKG_VERSION"), config.storage.root.display());

    match args.command {
        Command::Dump {
            fixture,
            groups,
            app,
            user,
            file_name,
        } => {
            let service = service_for(&config, &fixture)?;
            let mut events = service.engine().events().subscribe();
            let printer = tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    if let DumpEvent::Progress { percent, current_step, .. } = &event {
                        eprintln!("[{:>3}%] {}", percent, current_step);
                    }
                    if matches!(event, DumpEvent::Completed { .. } | DumpEvent::Failed { .. }) {
                        break;
                    }
                }
            });

            let result = service
                .run(DumpRequest {
                    groups,
                    file_name,
                    app_name: app,
                    user_id: user,
                })
                .await;
            // Closing the event channel lets the printer finish even if the dump never started
            drop(service);
            let _ = printer.await;

            let output = result?;
            println!("{}", output.file_path.display());
        }
        Command::Status { file, app } => {
            let service = service_for_storage(&config)?;
            match service.status(&file, app.as_deref()).await? {
                Some(status) => println!("{}", serde_json::to_string_pretty(&status)?),
                None => anyhow::bail!("no backup named {}", file),
            }
        }
        Command::List { app, all } => {
            let service = service_for_storage(&config)?;
            for path in service.list(app.as_deref(), all).await? {
                println!("{}", path.display());
            }
        }
        Command::Collections { fixture } => {
            let service = service_for(&config, &fixture)?;
            let grouped = service.engine().dumpable_collections_grouped().await?;
            println!("{}", serde_json::to_string_pretty(&grouped)?);
        }
    }

    Ok(())
}

fn service_for(config: &Config, fixture: &Path) -> Result<DumpService> {
    let repo = MemoryRepository::from_json_file(fixture)
        .with_context(|| format!("loading fixture {}", fixture.display()))?;
    DumpService::from_config(config, Arc::new(repo))
}

/// Status and listing only touch the backup directory
fn service_for_storage(config: &Config) -> Result<DumpService> {
    DumpService::from_config(config, Arc::new(MemoryRepository::new("none")))
}
