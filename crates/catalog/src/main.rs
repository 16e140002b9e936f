//! vmcatalog command line.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vmcatalog_catalog::PrlctlHypervisor;
use vmcatalog_catalog::cache::ALL_VERSIONS;
use vmcatalog_catalog::sync::{
    DeleteRequest, ImportRequest, ImportVmRequest, PullRequest, PushMetadataRequest, PushRequest,
};
use vmcatalog_core::config::AppConfig;

/// Publish, pull and cache virtual machine images.
#[derive(Parser, Debug)]
#[command(name = "vmcatalog")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "VMCATALOG_CONFIG",
        default_value = "config/vmcatalog.toml"
    )]
    config: String,

    /// prlctl executable used to register pulled machines
    #[arg(long, env = "VMCATALOG_PRLCTL", default_value = "prlctl")]
    prlctl: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pack a local VM folder and publish it
    Push(PushArgs),
    /// Update roles, claims and tags of a published manifest
    PushMetadata(PushMetadataArgs),
    /// Download a manifest into a new registered VM
    Pull(PullArgs),
    /// Adopt a published .meta/.pdpack pair into the local store
    Import(ImportArgs),
    /// Adopt a bare pack file into the local store
    ImportVm(ImportVmArgs),
    /// Delete manifests from their backend and the local store
    Delete(DeleteArgs),
    /// Inspect and prune the local cache
    #[command(subcommand)]
    Cache(CacheCommand),
}

#[derive(Args, Debug)]
struct Identity {
    #[arg(long)]
    catalog_id: String,
    #[arg(long, default_value = "latest")]
    version: String,
    #[arg(long)]
    architecture: String,
}

#[derive(Args, Debug)]
struct Access {
    #[arg(long = "role")]
    roles: Vec<String>,
    #[arg(long = "claim")]
    claims: Vec<String>,
    #[arg(long = "tag")]
    tags: Vec<String>,
}

#[derive(Args, Debug)]
struct PushArgs {
    #[command(flatten)]
    identity: Identity,
    /// VM bundle folder (`*.pvm` or `*.macvm`)
    #[arg(long)]
    local_path: PathBuf,
    #[arg(long, env = "VMCATALOG_CONNECTION")]
    connection: String,
    #[arg(long, default_value = "")]
    description: String,
    #[command(flatten)]
    access: Access,
}

#[derive(Args, Debug)]
struct PushMetadataArgs {
    #[command(flatten)]
    identity: Identity,
    #[arg(long, env = "VMCATALOG_CONNECTION")]
    connection: String,
    #[command(flatten)]
    access: Access,
}

#[derive(Args, Debug)]
struct PullArgs {
    #[command(flatten)]
    identity: Identity,
    #[arg(long)]
    machine_name: String,
    /// Folder the VM bundle is created in
    #[arg(long)]
    path: PathBuf,
    /// Remote catalog connection; the local store is used without one
    #[arg(long, env = "VMCATALOG_CONNECTION")]
    connection: Option<String>,
    #[arg(long)]
    owner: Option<String>,
}

#[derive(Args, Debug)]
struct ImportArgs {
    #[command(flatten)]
    identity: Identity,
    #[arg(long, env = "VMCATALOG_CONNECTION")]
    connection: String,
}

#[derive(Args, Debug)]
struct ImportVmArgs {
    #[command(flatten)]
    identity: Identity,
    #[arg(long, env = "VMCATALOG_CONNECTION")]
    connection: String,
    /// Remote path of the pack file
    #[arg(long)]
    machine_remote_path: String,
    /// `pvm` or `macvm`
    #[arg(long = "type", default_value = "pvm")]
    vm_type: String,
    #[arg(long)]
    compressed: bool,
    /// Regenerate metadata that already exists
    #[arg(long)]
    force: bool,
    #[arg(long, default_value = "")]
    description: String,
    #[command(flatten)]
    access: Access,
}

#[derive(Args, Debug)]
struct DeleteArgs {
    #[arg(long)]
    catalog_id: String,
    #[arg(long)]
    version: Option<String>,
    #[arg(long)]
    architecture: Option<String>,
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    /// List cached entries, oldest first
    List,
    /// Remove cached entries of a catalog
    Remove {
        #[arg(long)]
        catalog_id: String,
        #[arg(long, default_value = ALL_VERSIONS)]
        version: String,
    },
    /// Delete everything in the cache folder
    Clear,
}

fn load_config(path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if std::path::Path::new(path).exists() {
        tracing::debug!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {path}, using defaults");
    }
    figment
        .merge(Env::prefixed("VMCATALOG_").split("__"))
        .extract()
        .context("failed to load configuration")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
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

    let config = load_config(&cli.config)?;
    let hypervisor = Arc::new(PrlctlHypervisor::new(&cli.prlctl));
    let service = vmcatalog_catalog::from_config(&config, hypervisor)
        .await
        .context("failed to initialize catalog service")?;

    match cli.command {
        Command::Push(args) => {
            let request = PushRequest {
                catalog_id: args.identity.catalog_id,
                version: args.identity.version,
                architecture: args.identity.architecture,
                local_path: args.local_path,
                connection: args.connection,
                description: args.description,
                required_roles: args.access.roles,
                required_claims: args.access.claims,
                tags: args.access.tags,
            };
            print_json(&service.push(&request).await?)?;
        }
        Command::PushMetadata(args) => {
            let request = PushMetadataRequest {
                catalog_id: args.identity.catalog_id,
                version: args.identity.version,
                architecture: args.identity.architecture,
                connection: args.connection,
                required_roles: args.access.roles,
                required_claims: args.access.claims,
                tags: args.access.tags,
            };
            print_json(&service.push_metadata(&request).await?)?;
        }
        Command::Pull(args) => {
            let request = PullRequest {
                catalog_id: args.identity.catalog_id,
                version: args.identity.version,
                architecture: args.identity.architecture,
                machine_name: args.machine_name,
                path: args.path,
                connection: args.connection,
                owner: args.owner,
            };
            print_json(&service.pull(&request).await?)?;
        }
        Command::Import(args) => {
            let request = ImportRequest {
                catalog_id: args.identity.catalog_id,
                version: args.identity.version,
                architecture: args.identity.architecture,
                connection: args.connection,
            };
            print_json(&service.import(&request).await?)?;
        }
        Command::ImportVm(args) => {
            let request = ImportVmRequest {
                catalog_id: args.identity.catalog_id,
                version: args.identity.version,
                architecture: args.identity.architecture,
                connection: args.connection,
                machine_remote_path: args.machine_remote_path,
                vm_type: args.vm_type,
                is_compressed: args.compressed,
                force: args.force,
                description: args.description,
                required_roles: args.access.roles,
                required_claims: args.access.claims,
                tags: args.access.tags,
            };
            print_json(&service.import_vm(&request).await?)?;
        }
        Command::Delete(args) => {
            let request = DeleteRequest {
                catalog_id: args.catalog_id,
                version: args.version,
                architecture: args.architecture,
            };
            print_json(&service.delete(&request).await?)?;
        }
        Command::Cache(CacheCommand::List) => {
            print_json(&service.cache().get_all_cache_items().await?)?;
        }
        Command::Cache(CacheCommand::Remove {
            catalog_id,
            version,
        }) => {
            service
                .cache()
                .remove_cache_item(&catalog_id, &version)
                .await?;
        }
        Command::Cache(CacheCommand::Clear) => {
            service.cache().clear_all().await?;
        }
    }
    Ok(())
}
