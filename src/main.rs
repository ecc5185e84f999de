use std::path::PathBuf;
use clap::{Parser, Subcommand};
use anyhow::{bail, Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use edu_cache::{CacheConfig, CacheManager, ContextTuple, HttpVerb};

#[derive(Parser)]
#[command(name = "edu-cache")]
#[command(about = "Inspect and maintain the dashboard response cache", long_about = None)]
struct Cli {
    /// Storage directory (default: EDU_CACHE_DIR or the platform cache dir)
    #[arg(short, long)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show entry counts, size and storage tier
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove entries older than the default TTL
    Sweep,

    /// Remove cached entries (all of them unless narrowed)
    Clear {
        /// Only entries cached for this user
        #[arg(short, long, conflicts_with = "tenant")]
        user: Option<String>,

        /// Only entries cached for this institute
        #[arg(short, long)]
        tenant: Option<String>,
    },

    /// Apply the invalidation rules for a mutation
    Invalidate {
        /// HTTP verb of the mutation (POST, PUT, PATCH, DELETE)
        verb: String,

        /// Mutated endpoint, e.g. /institute-classes/12
        endpoint: String,

        /// Narrow to entries cached for this user
        #[arg(short, long)]
        user: Option<String>,

        /// Narrow to entries cached for this institute
        #[arg(short, long)]
        tenant: Option<String>,
    },

    /// List the invalidation rule table
    Rules,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "edu_cache=info".into())
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = CacheConfig::from_env().context("invalid cache configuration")?;
    if let Some(dir) = cli.dir {
        config.storage_dir = Some(dir);
    }

    match cli.command {
        Commands::Rules => {
            for rule in config.invalidation_rules.rules() {
                let verbs: Vec<String> = rule.verbs.iter().map(|v| v.to_string()).collect();
                println!(
                    "{:<28} {:<24} -> {}",
                    rule.endpoint_prefix,
                    verbs.join(","),
                    rule.affects.join(", ")
                );
            }
        }

        Commands::Stats { json } => {
            let cache = open_cache(config)?;
            let diagnostics = cache.get_cache_stats().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&diagnostics)?);
            } else {
                println!("{}", diagnostics);
            }
        }

        Commands::Sweep => {
            let cache = open_cache(config)?;
            let removed = cache.sweep_expired().await;
            println!("Removed {} expired entries", removed);
        }

        Commands::Clear { user, tenant } => {
            let cache = open_cache(config)?;
            let removed = match (user, tenant) {
                (Some(user), _) => cache.clear_user_cache(&user).await,
                (None, Some(tenant)) => cache.clear_tenant_cache(&tenant).await,
                (None, None) => cache.clear_all_cache().await,
            };
            println!("Removed {} entries", removed);
        }

        Commands::Invalidate { verb, endpoint, user, tenant } => {
            let verb: HttpVerb = verb.parse().map_err(anyhow::Error::msg)?;
            let cache = open_cache(config)?;

            let mut context = ContextTuple::new();
            if let Some(user) = user {
                context = context.user(user);
            }
            if let Some(tenant) = tenant {
                context = context.tenant(tenant);
            }

            let event = cache
                .invalidate_on_mutation(verb, &endpoint, Some(&context))
                .await;

            if event.prefixes.is_empty() {
                println!("{} does not invalidate anything", verb);
            } else {
                println!("Purged prefixes: {}", event.prefixes.join(", "));
                println!("Removed {} entries", event.removed);
            }
        }
    }

    Ok(())
}

/// Open the persistent cache; the CLI has nothing to inspect in memory
fn open_cache(config: CacheConfig) -> Result<CacheManager> {
    if config.storage_dir.is_none() {
        bail!("no storage directory; pass --dir or set EDU_CACHE_DIR");
    }
    let cache = CacheManager::new(config)?;
    if !cache.backend_kind().is_persistent() {
        bail!("persistent cache storage could not be opened");
    }
    Ok(cache)
}
