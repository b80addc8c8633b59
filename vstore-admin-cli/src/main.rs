//! VStore Administration CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vstore_core::{
    ObjSizes, ReadRequest, Store, StoreConfig, StoreRegistry, TransactionParams,
};

#[derive(Parser, Debug)]
#[command(name = "vstore-admin")]
#[command(author = "VStore Contributors")]
#[command(version = "0.1.0")]
#[command(about = "VStore user store administration tool")]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = "vstore.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a user's store
    Init {
        #[arg(short, long)]
        user: String,
        /// Quota in bytes
        #[arg(short, long)]
        quota: Option<u64>,
    },

    /// Print the status record of an object (the root object by default)
    Status {
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        obj: Option<String>,
    },

    /// List non-root objects and their states
    List {
        #[arg(short, long)]
        user: String,
    },

    /// Store a file as a new version of an object
    Put {
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        obj: Option<String>,
        #[arg(short, long)]
        file: PathBuf,
        /// File holding the version header
        #[arg(long)]
        header_file: Option<PathBuf>,
        #[arg(short = 'v', long)]
        obj_version: u64,
        /// Create the object
        #[arg(long)]
        new: bool,
    },

    /// Write an object version to stdout
    Cat {
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        obj: Option<String>,
        /// Archived version to read instead of the current one
        #[arg(short = 'v', long)]
        obj_version: Option<u64>,
        /// Emit the header before the segment bytes
        #[arg(long)]
        header: bool,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long)]
        limit: Option<u64>,
    },

    /// Retain the current version of an object as archived
    Archive {
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        obj: Option<String>,
    },

    /// Delete the current version, or one archived version, of an object
    Delete {
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        obj: Option<String>,
        /// Archived version to delete instead of the current one
        #[arg(short = 'v', long)]
        obj_version: Option<u64>,
    },

    /// Cancel transactions abandoned for longer than the configured age
    ReleaseStale {
        #[arg(short, long)]
        user: String,
        /// Override the configured age, in seconds
        #[arg(long)]
        max_age_secs: Option<u64>,
    },

    /// Set a user's quota in bytes
    SetQuota {
        #[arg(short, long)]
        user: String,
        bytes: u64,
    },

    /// Show a user's free and used space
    Space {
        #[arg(short, long)]
        user: String,
    },
}

fn init_logging(debug: bool, config: &StoreConfig) -> Result<()> {
    let env_filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(
            config
                .log_level
                .parse()
                .with_context(|| format!("Invalid log level {:?}", config.log_level))?,
        )
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = StoreConfig::load(&cli.config)
        .await
        .with_context(|| format!("Failed to load {:?}", cli.config))?;
    init_logging(cli.debug, &config)?;

    let registry = StoreRegistry::new(&config);
    run(cli.command, &config, &registry).await
}

async fn run(command: Commands, config: &StoreConfig, registry: &StoreRegistry) -> Result<()> {
    match command {
        Commands::Init { user, quota } => {
            let store = registry.store(&user).await?;
            if let Some(quota) = quota {
                store.set_quota(quota).await?;
            }
            println!("Store for {} ready at {}", user, store.path().display());
        }

        Commands::Status { user, obj } => {
            let store = registry.store(&user).await?;
            let status = store.status(obj.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Commands::List { user } => {
            let store = registry.store(&user).await?;
            for id in store.list_objects().await? {
                match store.status(Some(&id)).await {
                    Ok(status) => println!(
                        "{}\t{:?}\t{:?}",
                        id, status.state, status.current_version
                    ),
                    Err(e) => println!("{}\t<{}>", id, e),
                }
            }
        }

        Commands::Put { user, obj, file, header_file, obj_version, new } => {
            let store = registry.store(&user).await?;
            let segs = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {:?}", file))?;
            let header = match &header_file {
                Some(path) => tokio::fs::read(path)
                    .await
                    .with_context(|| format!("Failed to read {:?}", path))?,
                None => Vec::new(),
            };
            let params = TransactionParams {
                version: obj_version,
                is_new_obj: new,
                sizes: ObjSizes {
                    header: header.len() as u64,
                    segments: Some(segs.len() as u64),
                },
                diff: None,
            };
            let version = store.save_obj(obj.as_deref(), &params, &header, &segs).await?;
            info!("Stored {} bytes as version {}", segs.len(), version);
            println!("{}", version);
        }

        Commands::Cat { user, obj, obj_version, header, offset, limit } => {
            let store = registry.store(&user).await?;
            let req = ReadRequest { header, segs_offset: offset, segs_limit: limit };
            cat(&store, obj.as_deref(), obj_version, req).await?;
        }

        Commands::Archive { user, obj } => {
            let store = registry.store(&user).await?;
            let version = store.archive_current_version(obj.as_deref()).await?;
            println!("Archived version {}", version);
        }

        Commands::Delete { user, obj, obj_version } => {
            let store = registry.store(&user).await?;
            store.delete_obj(obj.as_deref(), obj_version).await?;
            println!("Deleted");
        }

        Commands::ReleaseStale { user, max_age_secs } => {
            let store = registry.store(&user).await?;
            let max_age = max_age_secs
                .map(std::time::Duration::from_secs)
                .unwrap_or_else(|| config.stale_transaction_age());
            let cancelled = store.cancel_stale_transactions(max_age).await?;
            for obj in &cancelled {
                println!("Cancelled transaction on {}", obj.as_deref().unwrap_or("<root>"));
            }
            println!("{} stale transaction(s) cancelled", cancelled.len());
        }

        Commands::SetQuota { user, bytes } => {
            let store = registry.store(&user).await?;
            store.set_quota(bytes).await?;
            println!("Quota of {} set to {} bytes", user, bytes);
        }

        Commands::Space { user } => {
            let store = registry.store(&user).await?;
            let space = store.space_info().await?;
            println!("free: {}\nused: {}", space.free, space.used);
        }
    }

    Ok(())
}

async fn cat(
    store: &Arc<Store>,
    obj: Option<&str>,
    version: Option<u64>,
    req: ReadRequest,
) -> Result<()> {
    let reader = match version {
        Some(version) => store.get_archived_obj_version(obj, version, req).await?,
        None => store.get_current_obj(obj, req).await?,
    };
    let mut out = tokio::io::stdout();
    if let Some(header) = &reader.header {
        out.write_all(header).await?;
    }
    let mut segs = Box::pin(reader.segs.into_stream());
    while let Some(chunk) = segs.next().await {
        out.write_all(&chunk?).await?;
    }
    out.flush().await?;
    Ok(())
}
