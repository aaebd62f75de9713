//! conjure: operational CLI for the invalidation index.
//!
//! ```text
//! conjure gc --page-size 500 --wait-pages 50
//! conjure top --display 10 sets
//! conjure top keys --pages 100
//! conjure top table post
//! conjure tags --json
//! ```

mod args;
mod commands;
mod error;
mod format;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use conjure_core::ConjureConfig;
use conjure_storage::RedisStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use args::{Cli, Commands};
use error::{CliError, CliResult};

fn init_tracing(json: bool, verbose: u8) -> CliResult<()> {
    let default = match verbose {
        0 => "conjure_storage=info,conjure_cli=info,warn",
        1 => "conjure_storage=debug,conjure_cli=debug,info",
        _ => "conjure_storage=trace,conjure_cli=trace,info",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let registry = tracing_subscriber::registry().with(env_filter);

    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    result.map_err(|e| CliError::Logging(e.to_string()))
}

async fn run(cli: Cli) -> CliResult<()> {
    let mut config = ConjureConfig::from_env().with_clustered(cli.clustered);
    config.redis_url = match &cli.host {
        Some(host) => commands::override_host(&cli.redis_url, host)?,
        None => cli.redis_url.clone(),
    };

    let store = Arc::new(RedisStore::from_config(&config).await?);
    tracing::debug!(url = %config.redis_url, clustered = config.clustered, "Connected to store");

    match cli.command {
        Commands::Gc(args) => commands::gc(store, &config, args, cli.json).await,
        Commands::Top(args) => commands::top(store, config.clustered, args, cli.json).await,
        Commands::Tags(scan) => commands::tags(store, config.clustered, scan, cli.json).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(cli.json, cli.verbose) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
