mod cancel;
mod checkpoint;
mod cli;
mod config;
mod error;
mod history;
mod model;
mod operator;
mod rollback;

use std::io;
use std::process;

use clap::Parser;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use cancel::Cancellation;
use cli::Cli;
use config::Config;

fn main() {
    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };

    init_logging(cli.verbose, config.log.as_deref());

    let cancel = Cancellation::new();
    let handler = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\nInterrupted, stopping the current step...");
        handler.cancel();
    }) {
        warn!("could not install Ctrl-C handler: {e}");
    }

    if let Err(e) = cli::run(&cli, &config, &cancel) {
        eprintln!("Error: {e}");
        process::exit(e.exit_code());
    }
}

/// Log to stderr. `RUST_LOG` wins, then `--verbose`, then the config's `log`, then `warn`.
fn init_logging(verbose: bool, configured: Option<&str>) {
    let fallback = if verbose {
        "debug"
    } else {
        configured.unwrap_or("warn")
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_target(false),
        )
        .init();

    debug!(filter = fallback, "logging initialized");
}
