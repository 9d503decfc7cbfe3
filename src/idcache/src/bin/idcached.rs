//! Identity cache daemon and query tool
//!
//! Runs the identity service over a JSON-seeded directory:
//! - `resolve`: resolve one key and print the identity as JSON
//! - `is-member`: answer a transitive membership question
//! - `serve`: keep the cache alive with periodic sweeps until Ctrl+C

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use idcache::{Config, IdentityService, KeyType, ResolveFlags, StaticDirectory};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Identity cache CLI
#[derive(Parser)]
#[command(name = "idcached")]
#[command(about = "Identity and group membership cache")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "IDCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory seed (overrides config)
    #[arg(short, long, env = "IDCACHE_SEED")]
    seed: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve one identity
    Resolve {
        /// Key type (uid, gid, guid, sid, name, kerberos, x509dn)
        #[arg(short = 't', long, default_value = "name")]
        key_type: KeyType,

        /// Resolve on behalf of the kernel (short TTL, temporary ids)
        #[arg(long)]
        kernel: bool,

        key: String,
    },

    /// Check whether a user is a (transitive) member of a group
    IsMember {
        #[arg(short, long)]
        user: String,

        #[arg(short, long)]
        group: String,
    },

    /// Run periodic sweeps until interrupted
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(seed) = cli.seed {
        config.daemon.seed_path = Some(seed);
    }

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { config.daemon.log_level.as_str() };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{},idcache={}", log_level, log_level).into()),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let directory = match &config.daemon.seed_path {
        Some(path) => {
            let directory = StaticDirectory::load(path)?;
            info!("Loaded directory seed from {:?}", path);
            directory
        }
        None => {
            warn!("No directory seed configured; every lookup will miss");
            StaticDirectory::new()
        }
    };

    let service = IdentityService::new(config, Arc::new(directory));

    match cli.command {
        Command::Resolve { key_type, kernel, key } => {
            let flags = if kernel { ResolveFlags::KERNEL } else { ResolveFlags::empty() };
            let record = service
                .resolve_identity(key_type, &key, flags)
                .await
                .with_context(|| format!("Failed to resolve {} {}", key_type, key))?;
            println!("{}", serde_json::to_string_pretty(&record.identity())?);
        }
        Command::IsMember { user, group } => {
            let subject = service
                .resolve_identity(KeyType::Name, &user, ResolveFlags::empty())
                .await
                .with_context(|| format!("Failed to resolve user {}", user))?;
            let member = service
                .is_member(&subject, KeyType::Name, &group, ResolveFlags::empty())
                .await?;
            println!("{}", member);
        }
        Command::Serve => serve(service).await?,
    }

    Ok(())
}

async fn serve(service: IdentityService) -> Result<()> {
    info!("Starting idcached v{}", idcache::VERSION);

    let interval = service.config().daemon.sweep_interval();
    let sweeper = service.spawn_sweeper(interval);
    let mut invalidations = service.subscribe();

    let mut report = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received shutdown signal (Ctrl+C)");
                break;
            }
            _ = report.tick() => {
                let stats = service.stats();
                info!(
                    "{} entries, hit rate {:.1}%, {} directory lookups, {} evictions",
                    stats.entries,
                    stats.hit_rate() * 100.0,
                    stats.directory_lookups,
                    stats.evictions
                );
            }
            event = invalidations.recv() => match event {
                Ok(event) => info!("Invalidated {:?} at {}", event.kinds, event.at),
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} invalidation events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    }

    sweeper.abort();
    info!("idcached stopped");
    Ok(())
}
