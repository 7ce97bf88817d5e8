mod archive;
mod catalog;
mod cli;
mod config;
mod error;
mod layout;
mod manifest;
mod orchestrator;
mod pipeline;
mod resolver;
mod source;
mod uninstall;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let action = cli::parse_args(&args)?;
    init_logging(action.verbosity());
    cli::execute(action)
}

/// Logs go to stderr so `--format json` output on stdout stays clean.
fn init_logging(verbosity: u8) {
    let default = match verbosity {
        0 => "modpack=info",
        1 => "modpack=debug",
        _ => "modpack=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
