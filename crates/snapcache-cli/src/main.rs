//! snapcache - a command-line front end for the snap store.
//!
//! Catalogue reads go through a response cache kept in the user's cache
//! directory, so a store outage still answers with the last good data.
//! Publisher commands use macaroon credentials saved by `snapcache login`.

mod cli;
mod commands;

use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use snapcache_core::auth::SessionFile;
use snapcache_core::cache::ResponseCache;
use snapcache_core::{Config, StoreClient};

use cli::{Cli, Commands};
use commands::Context;

/// Subdirectory of the cache directory holding cached responses
const RESPONSES_DIR: &str = "responses";

/// Initialize the tracing subscriber for logging.
///
/// The returned guard flushes buffered log lines when dropped.
fn init_tracing() -> WorkerGuard {
    // RUST_LOG overrides the default level (e.g. RUST_LOG=snapcache_core=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer))
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let guard = init_tracing();

    let result = run().await;
    drop(guard);
    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load().context("Failed to load config")?;
    let cache_dir = config.cache_dir()?;
    debug!(cache_dir = %cache_dir.display(), api = %config.api_url, "Configuration loaded");

    let cache = if cli.no_disk_cache {
        ResponseCache::in_memory()
    } else {
        ResponseCache::persistent(cache_dir.join(RESPONSES_DIR))?
    };
    let ctx = Context {
        client: StoreClient::with_cache(config, Arc::new(cache))?,
        sessions: SessionFile::new(cache_dir),
    };

    match &cli.command {
        Commands::Details(args) => ctx.details(&args.names).await,
        Commands::Search(args) => ctx.search(args).await,
        Commands::Featured => ctx.featured().await,
        Commands::Promoted => ctx.promoted().await,
        Commands::Metrics(args) => ctx.metrics(args).await,
        Commands::Login(args) => {
            info!("Login requested");
            ctx.login(args).await
        }
        Commands::Logout => ctx.logout().await,
        Commands::Whoami => ctx.whoami(),
        Commands::Account(args) => ctx.account(args).await,
        Commands::Status(args) => ctx.status(&args.name).await,
        Commands::Metadata(args) => ctx.metadata(args).await,
    }
}
