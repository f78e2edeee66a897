// MoonPalace - debugging proxy for the Moonshot AI API
//
// Sits between a client and the chat-completion API, forwards every request
// and records each exchange in SQLite for later inspection.
//
// Architecture:
// - Proxy server (axum): forwards requests, relays and inspects responses
// - Detector: per-choice repeat detection over streamed text
// - Caching: automatic context caches keyed by conversation prefix
// - Storage: SQLite (r2d2 pool) holding requests and cache mappings
// - CLI: start the proxy or query the captured requests

mod caching;
mod cli;
mod config;
mod detector;
mod logging;
mod merge;
mod pool;
mod proxy;
mod startup;
mod storage;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use config::Config;
use storage::SqliteStore;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Precedence: flags > env > file > defaults
    let mut config = Config::from_env();
    if let Some(endpoint) = &cli.endpoint {
        config.endpoint = config::normalize_endpoint(endpoint);
    }

    if let Commands::Config { show, path } = cli.command {
        cli::handle_config(&config, show, path);
        return Ok(());
    }

    let store = SqliteStore::open(&config.db_path)?;
    let endpoint = config.endpoint.as_str();

    match cli.command {
        Commands::Start(args) => {
            args.apply(&mut config.start);

            // Guard keeps the file writer alive until the proxy stops
            let _file_guard = logging::init_tracing(&config.logging);
            tracing::debug!("Database: {}", config.db_path.display());

            proxy::start_proxy(config.proxy_settings(), config.start.port, Arc::new(store)).await
        }
        Commands::List(args) => cli::handle_list(&store, &args, endpoint),
        Commands::Inspect(args) => cli::handle_inspect(&store, &args, endpoint),
        Commands::Cleanup { before } => cli::handle_cleanup(&store, before.as_deref()),
        Commands::Export(args) => cli::handle_export(&store, &args, endpoint),
        Commands::Config { .. } => Ok(()),
    }
}
