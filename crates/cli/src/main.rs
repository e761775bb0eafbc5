//! Offline inspection and maintenance CLI for roster stores.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use roster_core::config::{AppConfig, StoreConfig};
use roster_core::{Origin, RegistrationId, ResourceId};
use roster_metadata::MetadataStore;
use roster_metadata::repos::{MetaRepo, RegistrationRepo, ResourceIdRepo};
use roster_storage::BlobCache;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "rosterctl")]
#[command(about = "Inspect and maintain a roster registration store")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "ROSTER_CONFIG", default_value = "roster.toml")]
    config: PathBuf,

    /// Store root directory (overrides store.path from the config)
    #[arg(long)]
    path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List origins with at least one stored registration
    Origins,
    /// List stored registrations
    Registrations {
        /// Only registrations of this origin
        #[arg(long)]
        origin: Option<String>,
    },
    /// Show one registration with its resources
    Show {
        /// Registration id
        id: u64,
        /// Origin the registration is stored under (looked up when omitted)
        #[arg(long)]
        origin: Option<String>,
    },
    /// Show the next unused registration, version and resource ids
    Ids,
    /// List tracked resource ids
    Resources {
        #[arg(value_enum)]
        set: ResourceSet,
    },
    /// Remove the bodies of all purgeable resources
    Purge,
    /// Delete everything stored for the given origins
    DeleteOrigin {
        #[arg(required = true, num_args = 1..)]
        origins: Vec<String>,
    },
    /// Delete the database and every resource body
    Destroy {
        /// Confirm the deletion
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ResourceSet {
    Uncommitted,
    Purgeable,
}

/// The two halves of an opened store.
struct Store {
    metadata: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobCache>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(&cli.config, cli.path.as_deref())?;
    let store = open_store(&config)?;

    match cli.command {
        Commands::Origins => handle_origins(&store).await,
        Commands::Registrations { origin } => handle_registrations(&store, origin.as_deref()).await,
        Commands::Show { id, origin } => {
            handle_show(&store, RegistrationId::new(id), origin.as_deref()).await
        }
        Commands::Ids => {
            let ids = store
                .metadata
                .get_next_available_ids()
                .await
                .context("failed to read id counters")?;
            print_json(&ids)
        }
        Commands::Resources { set } => handle_resources(&store, set).await,
        Commands::Purge => handle_purge(&store).await,
        Commands::DeleteOrigin { origins } => handle_delete_origins(&store, &origins).await,
        Commands::Destroy { yes } => handle_destroy(&store, yes).await,
    }
}

fn load_config(config_path: &Path, path_override: Option<&Path>) -> Result<StoreConfig> {
    let mut figment = Figment::new();
    if config_path.exists() {
        tracing::debug!(config_path = %config_path.display(), "Loading configuration from file");
        figment = figment.merge(Toml::file(config_path));
    }

    let mut config: AppConfig = figment
        .merge(Env::prefixed("ROSTER_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    if let Some(path) = path_override {
        config.store.path = Some(path.to_path_buf());
    }
    if config.store.is_in_memory() {
        anyhow::bail!(
            "No store path configured.\n\n\
             Provide one via:\n  \
             1. Flag: rosterctl --path /path/to/store <command>\n  \
             2. Config file: [store] path = \"/path/to/store\"\n  \
             3. Environment: ROSTER_STORE__PATH=/path/to/store"
        );
    }
    config
        .store
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .context("invalid store configuration")?;
    Ok(config.store)
}

fn open_store(config: &StoreConfig) -> Result<Store> {
    let metadata = roster_metadata::from_config(&config.metadata_config());
    let blobs = roster_storage::from_config(&config.blob_cache_config())
        .context("failed to initialize blob cache")?;
    Ok(Store { metadata, blobs })
}

fn parse_origin(input: &str) -> Result<Origin> {
    Origin::parse(input).with_context(|| format!("invalid origin: {input}"))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn handle_origins(store: &Store) -> Result<()> {
    let origins = store
        .metadata
        .get_origins_with_registrations()
        .await
        .context("failed to read origins")?;
    for origin in origins {
        println!("{origin}");
    }
    Ok(())
}

async fn handle_registrations(store: &Store, origin: Option<&str>) -> Result<()> {
    let registrations = match origin {
        Some(origin) => {
            let origin = parse_origin(origin)?;
            store
                .metadata
                .get_registrations_for_origin(&origin, false)
                .await
                .context("failed to read registrations")?
                .into_iter()
                .map(|stored| stored.data)
                .collect()
        }
        None => store
            .metadata
            .get_all_registrations()
            .await
            .context("failed to read registrations")?,
    };
    print_json(&registrations)
}

async fn handle_show(store: &Store, id: RegistrationId, origin: Option<&str>) -> Result<()> {
    let origin = match origin {
        Some(origin) => parse_origin(origin)?,
        None => store
            .metadata
            .read_registration_origin(id)
            .await
            .with_context(|| format!("registration {id} not found"))?,
    };
    let stored = store
        .metadata
        .read_registration(id, &origin)
        .await
        .with_context(|| format!("failed to read registration {id} of {origin}"))?;
    print_json(&stored)
}

async fn handle_resources(store: &Store, set: ResourceSet) -> Result<()> {
    let ids = match set {
        ResourceSet::Uncommitted => store.metadata.get_uncommitted_resource_ids().await,
        ResourceSet::Purgeable => store.metadata.get_purgeable_resource_ids().await,
    }
    .context("failed to read resource ids")?;
    print_json(&ids)
}

async fn handle_purge(store: &Store) -> Result<()> {
    let ids: Vec<ResourceId> = store
        .metadata
        .get_purgeable_resource_ids()
        .await
        .context("failed to read purgeable resources")?
        .into_iter()
        .collect();
    if ids.is_empty() {
        println!("Nothing to purge");
        return Ok(());
    }

    store.blobs.init().await.context("failed to open blob cache")?;
    let mut purged = Vec::with_capacity(ids.len());
    for id in ids {
        match store.blobs.doom(id).await {
            Ok(()) => purged.push(id),
            Err(e) => tracing::warn!(resource_id = %id, error = %e, "Failed to purge resource"),
        }
    }
    store
        .metadata
        .clear_purgeable_resource_ids(&purged)
        .await
        .context("failed to clear purgeable resources")?;
    println!("Purged {} resource(s)", purged.len());
    Ok(())
}

async fn handle_delete_origins(store: &Store, origins: &[String]) -> Result<()> {
    let origins = origins
        .iter()
        .map(|o| parse_origin(o))
        .collect::<Result<Vec<_>>>()?;
    let purgeable = store
        .metadata
        .delete_all_data_for_origins(&origins)
        .await
        .context("failed to delete origins")?;
    tracing::info!(
        origins = origins.len(),
        purgeable = purgeable.len(),
        "Deleted origin data"
    );
    println!(
        "Deleted {} origin(s); {} resource(s) now purgeable",
        origins.len(),
        purgeable.len()
    );
    Ok(())
}

async fn handle_destroy(store: &Store, yes: bool) -> Result<()> {
    if !yes {
        anyhow::bail!("Refusing to destroy the store without --yes");
    }
    store
        .metadata
        .destroy_database()
        .await
        .context("failed to delete database")?;
    store
        .blobs
        .destroy()
        .await
        .context("failed to delete blob cache")?;
    println!("Store destroyed");
    Ok(())
}
